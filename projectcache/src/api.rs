use crate::admission::Admission;
use crate::config::Listener as ListenerConfig;
use crate::service::ProjectCache;
use crate::types::ProjectKey;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::future::Future;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub fn router(cache: ProjectCache) -> Router {
    Router::new()
        .route("/api/admission/{public_key}", get(admission_handler))
        .route("/api/project/{public_key}", get(project_handler))
        .route("/health/ready", get(ready_handler))
        .route("/health/live", get(live_handler))
        .with_state(cache)
}

/// Serves the API until `shutdown` resolves.
pub async fn serve<F>(listener: &ListenerConfig, cache: ProjectCache, shutdown: F) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "serving admission api");

    axum::serve(listener, router(cache))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Serialize)]
struct AdmissionResponse {
    admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<u8>,
}

impl IntoResponse for AdmissionResponse {
    fn into_response(self) -> Response {
        let status = if self.admitted {
            StatusCode::OK
        } else {
            StatusCode::FORBIDDEN
        };
        (status, Json(self)).into_response()
    }
}

impl From<Admission> for AdmissionResponse {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Admitted(_) => AdmissionResponse {
                admitted: true,
                state: Some("configured"),
                reason: None,
                category: None,
            },
            Admission::AdmittedOptimistically => AdmissionResponse {
                admitted: true,
                state: Some("pending"),
                reason: None,
                category: None,
            },
            Admission::Rejected(reason) => AdmissionResponse {
                admitted: false,
                state: None,
                reason: Some(reason.as_str()),
                category: Some(reason.category().into()),
            },
        }
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

async fn admission_handler(
    State(cache): State<ProjectCache>,
    Path(public_key): Path<String>,
) -> AdmissionResponse {
    cache.check(&ProjectKey::new(public_key)).into()
}

async fn project_handler(
    State(cache): State<ProjectCache>,
    Path(public_key): Path<String>,
) -> Result<Json<JsonValue>, Response> {
    match cache.project_config(&ProjectKey::new(public_key)) {
        Some(config) => Ok(Json(config.document().clone())),
        None => {
            let body = Json(ApiErrorResponse {
                error_message: "project config is not available".into(),
            });
            Err((StatusCode::NOT_FOUND, body).into_response())
        }
    }
}

async fn ready_handler(State(cache): State<ProjectCache>) -> StatusCode {
    if cache.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn live_handler() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::TracingOutcomeSink;
    use crate::config::Cache as CacheConfig;
    use crate::coordinator::Sources;
    use crate::testutils::MockUpstream;
    use crate::upstream::{BackoffConfig, UpstreamClient};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn start_test_server(cache: ProjectCache) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router(cache)).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    }

    fn project_cache(upstream: Arc<MockUpstream>) -> ProjectCache {
        let sources = Sources {
            upstream: Arc::new(UpstreamClient::new(
                upstream,
                Duration::from_secs(5),
                BackoffConfig::default(),
            )),
            shared_cache: None,
            overrides: None,
        };
        let config = CacheConfig {
            batch_interval: Duration::from_millis(10),
            ..Default::default()
        };
        ProjectCache::start(config, sources, Arc::new(TracingOutcomeSink))
    }

    async fn get_json(url: &str) -> (reqwest::StatusCode, JsonValue) {
        let response = reqwest::get(url).await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_admission_endpoint() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.add_project("enabled", json!({"disabled": false, "slug": "a"}));
        upstream.add_project("disabled", json!({"disabled": true}));
        let base = start_test_server(project_cache(upstream)).await;

        for key in ["enabled", "disabled", "missing"] {
            let (status, body) = get_json(&format!("{base}/api/admission/{key}")).await;
            assert_eq!(status, reqwest::StatusCode::OK);
            assert_eq!(body, json!({"admitted": true, "state": "pending"}));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        let (status, body) = get_json(&format!("{base}/api/admission/enabled")).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body, json!({"admitted": true, "state": "configured"}));

        let (status, body) = get_json(&format!("{base}/api/admission/disabled")).await;
        assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
        assert_eq!(
            body,
            json!({"admitted": false, "reason": "project_id", "category": 3})
        );

        let (status, body) = get_json(&format!("{base}/api/admission/missing")).await;
        assert_eq!(status, reqwest::StatusCode::FORBIDDEN);
        assert_eq!(body["reason"], json!("project not found"));
    }

    #[tokio::test]
    async fn test_project_endpoint() {
        let upstream = Arc::new(MockUpstream::new());
        upstream.add_project("a", json!({"disabled": false, "slug": "a"}));
        let cache = project_cache(upstream);
        let base = start_test_server(cache.clone()).await;

        let (status, _) = get_json(&format!("{base}/api/project/a")).await;
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        cache.lookup(&"a".into());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (status, body) = get_json(&format!("{base}/api/project/a")).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(body, json!({"disabled": false, "slug": "a"}));
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let upstream = Arc::new(MockUpstream::new());
        let cache = project_cache(upstream.clone());
        let base = start_test_server(cache.clone()).await;

        let live = reqwest::get(format!("{base}/health/live")).await.unwrap();
        assert_eq!(live.status(), reqwest::StatusCode::OK);

        let ready = reqwest::get(format!("{base}/health/ready")).await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        cache.shutdown().await;
        upstream.set_global(json!({}));
        let config = CacheConfig {
            global_config_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let sources = Sources {
            upstream: Arc::new(UpstreamClient::new(
                upstream,
                Duration::from_secs(5),
                BackoffConfig::default(),
            )),
            shared_cache: None,
            overrides: None,
        };
        let cache = ProjectCache::start(config, sources, Arc::new(TracingOutcomeSink));
        let base = start_test_server(cache).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ready = reqwest::get(format!("{base}/health/ready")).await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serve_graceful_shutdown() {
        let upstream = Arc::new(MockUpstream::new());
        let listener = ListenerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve(&listener, project_cache(upstream), async {
                let _ = rx.await;
            })
            .await
        });

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
