use super::{ProjectConfigsRequest, ProjectConfigsResponse, UpstreamError, UpstreamTransport};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

const PROJECT_CONFIGS_PATH: &str = "api/0/relays/projectconfigs/";

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if let Some(status) = err.status() {
            UpstreamError::Status(status)
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HttpTransportError {
    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),
    #[error("could not build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Queries the project configs endpoint of an upstream over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpTransport {
    /// `timeout` bounds a single request, from connecting until the body is read.
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, HttpTransportError> {
        let mut base_url = base_url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut url = base_url.join(PROJECT_CONFIGS_PATH)?;
        url.query_pairs_mut().append_pair("version", "3");

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(HttpTransport { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(
        &self,
        request: &ProjectConfigsRequest,
    ) -> Result<ProjectConfigsResponse, UpstreamError> {
        let response = self.client.post(self.url.clone()).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProjectKey;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::{Value as JsonValue, json};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_test_server(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap()
    }

    #[test]
    fn test_endpoint_url() {
        let transport = HttpTransport::new(&Url::parse("http://sentry.internal:9000").unwrap(), TIMEOUT).unwrap();
        assert_eq!(
            transport.url().as_str(),
            "http://sentry.internal:9000/api/0/relays/projectconfigs/?version=3"
        );

        let transport =
            HttpTransport::new(&Url::parse("http://sentry.internal/prefix").unwrap(), TIMEOUT)
                .unwrap();
        assert_eq!(
            transport.url().as_str(),
            "http://sentry.internal/prefix/api/0/relays/projectconfigs/?version=3"
        );
    }

    #[tokio::test]
    async fn test_send_success() {
        let received = Arc::new(Mutex::new(None::<JsonValue>));
        let received_clone = received.clone();

        let router = Router::new().route(
            "/api/0/relays/projectconfigs/",
            post(move |Json(body): Json<JsonValue>| {
                let received = received_clone.clone();
                async move {
                    *received.lock().await = Some(body);
                    Json(json!({
                        "configs": {"key1": {"disabled": true}},
                        "unchanged": ["key2"],
                    }))
                }
            }),
        );
        let url = start_test_server(router).await;

        let transport = HttpTransport::new(&url, TIMEOUT).unwrap();
        let request = ProjectConfigsRequest::for_batch(&[
            ("key1".into(), None),
            ("key2".into(), Some("7".into())),
        ]);
        let response = transport.send(&request).await.unwrap();

        assert_eq!(response.unchanged, vec![ProjectKey::from("key2")]);
        assert_eq!(
            response.configs.get("key1"),
            Some(&Some(json!({"disabled": true})))
        );

        let body = received.lock().await.take().unwrap();
        assert_eq!(body["publicKeys"], json!(["key1", "key2"]));
        assert_eq!(body["revisions"], json!([null, "7"]));
    }

    #[tokio::test]
    async fn test_send_error_status() {
        let router = Router::new().route(
            "/api/0/relays/projectconfigs/",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "no") }),
        );
        let url = start_test_server(router).await;

        let transport = HttpTransport::new(&url, TIMEOUT).unwrap();
        let result = transport.send(&ProjectConfigsRequest::global()).await;
        match result {
            Err(err @ UpstreamError::Status(reqwest::StatusCode::INTERNAL_SERVER_ERROR)) => {
                assert!(err.is_retryable())
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_malformed_response() {
        let router = Router::new().route(
            "/api/0/relays/projectconfigs/",
            post(|| async { "definitely not json" }),
        );
        let url = start_test_server(router).await;

        let transport = HttpTransport::new(&url, TIMEOUT).unwrap();
        let result = transport.send(&ProjectConfigsRequest::global()).await;
        assert!(matches!(result, Err(UpstreamError::Decode(_))));
    }

    #[tokio::test]
    async fn test_send_connection_refused() {
        // Bind and drop a listener to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let transport = HttpTransport::new(&url, TIMEOUT).unwrap();
        let result = transport.send(&ProjectConfigsRequest::global()).await;
        match result {
            Err(err @ UpstreamError::Transport(_)) => assert!(err.is_retryable()),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let router = Router::new().route(
            "/api/0/relays/projectconfigs/",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Json(json!({}))
            }),
        );
        let url = start_test_server(router).await;

        let transport = HttpTransport::new(&url, Duration::from_millis(100)).unwrap();
        let result = transport.send(&ProjectConfigsRequest::global()).await;
        match result {
            Err(err @ UpstreamError::Timeout) => assert!(err.is_retryable()),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
