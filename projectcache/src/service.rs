use crate::admission::{Admission, AdmissionEvaluator, OutcomeSink};
use crate::cache::{CachePolicy, Decision, LocalCache};
use crate::config::{Cache as CacheConfig, Config};
use crate::coordinator::{Command, FetchCoordinator, GlobalConfig, Sources};
use crate::metrics_defs::{CACHE_LOOKUP, FETCH_SCHEDULED};
use crate::overrides::LocalOverrides;
use crate::shared_cache::SharedCacheAdapter;
use crate::types::{ProjectConfig, ProjectKey};
use crate::upstream::{BackoffConfig, HttpTransport, HttpTransportError, UpstreamClient};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use shared::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("could not set up upstream transport: {0}")]
    Upstream(#[from] HttpTransportError),
}

impl Sources {
    /// Builds the configured sources. A shared cache that cannot be reached at
    /// startup is left out and every lookup goes to the upstream.
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let transport = HttpTransport::new(&config.upstream.url, config.upstream.timeout)?;
        let upstream = UpstreamClient::new(
            Arc::new(transport),
            config.limits.query_timeout,
            BackoffConfig::from(&config.upstream),
        )
        .with_request_timeout(config.upstream.timeout);

        let shared_cache = match &config.shared_cache {
            Some(shared_cache) => match SharedCacheAdapter::from_config(shared_cache).await {
                Ok(adapter) => Some(Arc::new(adapter)),
                Err(err) => {
                    tracing::error!("could not connect to shared cache, continuing without it: {err}");
                    None
                }
            },
            None => None,
        };

        let overrides = config
            .overrides
            .as_ref()
            .map(|overrides| Arc::new(LocalOverrides::new(&overrides.path)));

        Ok(Sources {
            upstream: Arc::new(upstream),
            shared_cache,
            overrides,
        })
    }
}

struct ProjectCacheInner {
    cache: Arc<LocalCache>,
    global: Arc<GlobalConfig>,
    admission: AdmissionEvaluator,
    tx: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the project cache and its background fetch worker.
///
/// Reads never wait for I/O. A read that finds nothing usable schedules a
/// fetch and returns immediately.
#[derive(Clone)]
pub struct ProjectCache {
    inner: Arc<ProjectCacheInner>,
}

impl ProjectCache {
    /// Spawns the fetch worker. Must be called from within a tokio runtime.
    pub fn start(config: CacheConfig, sources: Sources, sink: Arc<dyn OutcomeSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let cache = Arc::new(LocalCache::new(CachePolicy::from(&config)));
        let global = Arc::new(GlobalConfig::default());

        let coordinator =
            FetchCoordinator::new(cache.clone(), Arc::new(sources), global.clone(), config);
        let handle = tokio::spawn(coordinator.run(rx));

        ProjectCache {
            inner: Arc::new(ProjectCacheInner {
                cache,
                global,
                admission: AdmissionEvaluator::new(sink),
                tx,
                handle: Mutex::new(Some(handle)),
            }),
        }
    }

    pub async fn from_config(config: &Config, sink: Arc<dyn OutcomeSink>) -> Result<Self, ServiceError> {
        let sources = Sources::from_config(config).await?;
        Ok(Self::start(config.cache.clone(), sources, sink))
    }

    /// Reads the cached state of a project, scheduling a fetch if needed.
    pub fn lookup(&self, key: &ProjectKey) -> Decision {
        let lookup = self.inner.cache.get(key, Instant::now());
        counter!(CACHE_LOOKUP, "result" => lookup.decision.as_str()).increment(1);

        if lookup.schedule_fetch {
            counter!(FETCH_SCHEDULED).increment(1);
            if self.inner.tx.send(Command::Fetch(key.clone())).is_err() {
                tracing::warn!(project_key = %key, "fetch coordinator is not running");
                self.inner.cache.fail(key);
            }
        }

        lookup.decision
    }

    /// Decides whether an item for the project is admitted.
    pub fn check(&self, key: &ProjectKey) -> Admission {
        let decision = self.lookup(key);
        self.inner.admission.evaluate(key, &decision)
    }

    /// The cached config of a project if it is currently usable.
    pub fn project_config(&self, key: &ProjectKey) -> Option<Arc<ProjectConfig>> {
        self.inner.cache.peek(key, Instant::now())
    }

    pub fn global_config(&self) -> Option<Arc<JsonValue>> {
        self.inner.global.get()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.global.is_ready()
    }

    /// Stops the fetch worker. In-flight fetches are aborted and their results
    /// are never applied.
    pub async fn shutdown(&self) {
        // The worker may already be gone
        let _ = self.inner.tx.send(Command::Shutdown);

        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::error!("fetch coordinator failed: {err}");
        }
    }
}
