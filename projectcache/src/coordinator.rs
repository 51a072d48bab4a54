//! Background worker that resolves scheduled fetches.
//!
//! Keys scheduled by cache reads are collected until the next batch tick and
//! then resolved in batches of at most `batch_size` keys. Every batch runs as
//! its own task. Each key is looked up in the local overrides first, then in
//! the shared cache, and finally in the upstream. Completions are applied to
//! the local cache from the worker loop only.
//!
//! Keys the upstream reports as pending are requeued until `query_timeout`
//! has passed since their first dispatch, then they fail like any other
//! unresolved fetch.

use crate::cache::LocalCache;
use crate::config::Cache as CacheConfig;
use crate::metrics_defs::{CACHE_EVICTIONS, CACHE_SIZE, FETCH_BATCH_SIZE, FETCH_RESULT, GLOBAL_CONFIG_FETCH};
use crate::overrides::LocalOverrides;
use crate::shared_cache::{SharedCacheAdapter, SharedLookup};
use crate::types::{ProjectConfig, ProjectKey};
use crate::upstream::{UpstreamClient, UpstreamOutcome};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use shared::{counter, gauge, histogram};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};

#[derive(Debug)]
pub enum Command {
    // Resolve the key in the next batch.
    Fetch(ProjectKey),
    // Abort in-flight batches and stop the worker.
    Shutdown,
}

/// The places a project config can be resolved from.
pub struct Sources {
    pub upstream: Arc<UpstreamClient>,
    pub shared_cache: Option<Arc<SharedCacheAdapter>>,
    pub overrides: Option<Arc<LocalOverrides>>,
}

/// The most recent global config, shared with readers.
#[derive(Default)]
pub struct GlobalConfig {
    config: RwLock<Option<Arc<JsonValue>>>,
    // Used by the readiness probe. Set once the first global config has loaded.
    ready: AtomicBool,
}

impl GlobalConfig {
    pub fn get(&self) -> Option<Arc<JsonValue>> {
        self.config.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn set(&self, config: JsonValue) {
        *self.config.write() = Some(Arc::new(config));
        self.ready.store(true, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Resolution {
    Config(Arc<ProjectConfig>),
    /// The revision that was sent is still current.
    Unchanged(Option<String>),
    NotFound,
    /// The upstream has not computed the config yet.
    Pending,
    Failed,
}

struct BatchResult {
    fetched_at: Instant,
    resolutions: Vec<(ProjectKey, Resolution)>,
}

pub(crate) struct FetchCoordinator {
    cache: Arc<LocalCache>,
    sources: Arc<Sources>,
    global: Arc<GlobalConfig>,
    config: CacheConfig,
}

impl FetchCoordinator {
    pub fn new(
        cache: Arc<LocalCache>,
        sources: Arc<Sources>,
        global: Arc<GlobalConfig>,
        config: CacheConfig,
    ) -> Self {
        FetchCoordinator {
            cache,
            sources,
            global,
            config,
        }
    }

    /// Runs until the Shutdown command is received or every sender is gone.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        if let Some(overrides) = &self.sources.overrides {
            self.reload_overrides(overrides).await;
        }

        let global_task = tokio::spawn(poll_global_config(
            self.sources.upstream.clone(),
            self.global.clone(),
            self.config.global_config_interval,
        ));

        let mut batch_tick = interval(self.config.batch_interval);
        batch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let start = Instant::now();
        let mut file_tick = interval_at(start + self.config.file_interval, self.config.file_interval);
        file_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut eviction_tick = interval_at(
            start + self.config.eviction_interval,
            self.config.eviction_interval,
        );
        eviction_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut queued = BTreeSet::new();
        let mut pending_since = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut task_keys = HashMap::new();

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Fetch(key)) => {
                        queued.insert(key);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = batch_tick.tick() => {
                    self.dispatch(&mut queued, &mut tasks, &mut task_keys);
                }
                Some(result) = tasks.join_next_with_id() => {
                    self.complete(result, &mut task_keys, &mut queued, &mut pending_since);
                }
                _ = file_tick.tick(), if self.sources.overrides.is_some() => {
                    if let Some(overrides) = &self.sources.overrides {
                        self.reload_overrides(overrides).await;
                    }
                }
                _ = eviction_tick.tick() => {
                    self.evict();
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "shutting down fetch coordinator");
        global_task.abort();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// Spawns one task per batch for every queued key.
    fn dispatch(
        &self,
        queued: &mut BTreeSet<ProjectKey>,
        tasks: &mut JoinSet<BatchResult>,
        task_keys: &mut HashMap<Id, Vec<ProjectKey>>,
    ) {
        if queued.is_empty() {
            return;
        }

        let fetched_at = Instant::now();
        let keys: Vec<ProjectKey> = std::mem::take(queued).into_iter().collect();

        for chunk in keys.chunks(self.config.batch_size) {
            let batch: Vec<(ProjectKey, Option<String>)> = chunk
                .iter()
                .map(|key| (key.clone(), self.cache.known_revision(key, fetched_at)))
                .collect();
            histogram!(FETCH_BATCH_SIZE).record(batch.len() as f64);

            let sources = self.sources.clone();
            let abort_handle = tasks.spawn(async move {
                BatchResult {
                    fetched_at,
                    resolutions: resolve_batch(&sources, batch).await,
                }
            });
            task_keys.insert(abort_handle.id(), chunk.to_vec());
        }
    }

    /// Applies the results of a finished batch to the cache.
    fn complete(
        &self,
        result: Result<(Id, BatchResult), JoinError>,
        task_keys: &mut HashMap<Id, Vec<ProjectKey>>,
        queued: &mut BTreeSet<ProjectKey>,
        pending_since: &mut HashMap<ProjectKey, Instant>,
    ) {
        let batch = match result {
            Ok((id, batch)) => {
                task_keys.remove(&id);
                batch
            }
            Err(err) => {
                tracing::error!("fetch task failed: {err}");
                for key in task_keys.remove(&err.id()).unwrap_or_default() {
                    pending_since.remove(&key);
                    self.cache.fail(&key);
                }
                return;
            }
        };

        let fetched_at = batch.fetched_at;
        let query_timeout = self.sources.upstream.query_timeout();
        for (key, resolution) in batch.resolutions {
            if !matches!(resolution, Resolution::Pending) {
                pending_since.remove(&key);
            }

            match resolution {
                Resolution::Config(config) => {
                    self.cache.put(&key, config, fetched_at);
                }
                Resolution::Unchanged(revision) => {
                    if !self.cache.refresh(&key, revision.as_deref(), fetched_at) {
                        tracing::debug!(project_key = %key, "unchanged response does not match cached revision");
                    }
                }
                Resolution::NotFound => {
                    self.cache.put_missing(&key, fetched_at);
                }
                // Stays in flight and goes out with the next batch
                Resolution::Pending => {
                    let since = *pending_since.entry(key.clone()).or_insert(fetched_at);
                    if since.elapsed() < query_timeout {
                        queued.insert(key);
                    } else {
                        tracing::warn!(project_key = %key, "project config still pending after query timeout");
                        record_result("upstream", "pending_expired");
                        pending_since.remove(&key);
                        self.cache.fail(&key);
                    }
                }
                Resolution::Failed => self.cache.fail(&key),
            }
        }
    }

    async fn reload_overrides(&self, overrides: &LocalOverrides) {
        match overrides.reload().await {
            Ok(changes) => {
                let now = Instant::now();
                for (key, config) in changes.updated {
                    self.cache.apply_override(&key, config, now);
                }
                // Back to a miss, the next read fetches from the other sources
                for key in changes.removed {
                    self.cache.invalidate(&key);
                }
            }
            Err(err) => tracing::error!("failed to reload project config overrides: {err}"),
        }
    }

    fn evict(&self) {
        let evicted = self.cache.evict_expired(Instant::now());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired project configs");
        }
        counter!(CACHE_EVICTIONS).increment(evicted as u64);
        gauge!(CACHE_SIZE).set(self.cache.len() as f64);
    }
}

/// Resolves every key of a batch to exactly one resolution.
async fn resolve_batch(
    sources: &Sources,
    batch: Vec<(ProjectKey, Option<String>)>,
) -> Vec<(ProjectKey, Resolution)> {
    let mut resolutions = Vec::with_capacity(batch.len());
    let mut remaining = Vec::with_capacity(batch.len());

    for (key, revision) in batch {
        if let Some(config) = sources.overrides.as_ref().and_then(|o| o.get(&key)) {
            record_result("override", "config");
            resolutions.push((key, Resolution::Config(config)));
            continue;
        }

        if let Some(shared_cache) = &sources.shared_cache {
            match shared_cache.lookup(&key, revision.as_deref()).await {
                Ok(SharedLookup::Hit(config)) => {
                    record_result("shared_cache", "config");
                    resolutions.push((key, Resolution::Config(Arc::new(config))));
                    continue;
                }
                Ok(SharedLookup::Unchanged) => {
                    record_result("shared_cache", "unchanged");
                    resolutions.push((key, Resolution::Unchanged(revision)));
                    continue;
                }
                Ok(SharedLookup::Miss) => {}
                Err(err) => {
                    tracing::warn!(project_key = %key, "shared cache lookup failed: {err}");
                }
            }
        }

        remaining.push((key, revision));
    }

    if remaining.is_empty() {
        return resolutions;
    }

    match sources.upstream.fetch(&remaining).await {
        Ok(mut outcomes) => {
            for (key, revision) in remaining {
                let resolution = match outcomes.remove(&key) {
                    Some(UpstreamOutcome::Config(config)) => Resolution::Config(Arc::new(config)),
                    Some(UpstreamOutcome::Unchanged) => Resolution::Unchanged(revision),
                    Some(UpstreamOutcome::NotFound) | None => Resolution::NotFound,
                    Some(UpstreamOutcome::Pending) => Resolution::Pending,
                    Some(UpstreamOutcome::Invalid(reason)) => {
                        tracing::error!(project_key = %key, "upstream returned an invalid project config: {reason}");
                        Resolution::Failed
                    }
                };
                record_result("upstream", resolution_tag(&resolution));
                resolutions.push((key, resolution));
            }
        }
        Err(err) => {
            tracing::error!(keys = remaining.len(), "failed to fetch project configs: {err}");
            for (key, _) in remaining {
                record_result("upstream", "failed");
                resolutions.push((key, Resolution::Failed));
            }
        }
    }

    resolutions
}

fn resolution_tag(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Config(_) => "config",
        Resolution::Unchanged(_) => "unchanged",
        Resolution::NotFound => "not_found",
        Resolution::Pending => "pending",
        Resolution::Failed => "failed",
    }
}

fn record_result(source: &'static str, result: &'static str) {
    counter!(FETCH_RESULT, "source" => source, "result" => result).increment(1);
}

/// Fetches the global config on a fixed cadence until aborted.
async fn poll_global_config(upstream: Arc<UpstreamClient>, global: Arc<GlobalConfig>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let result = match upstream.fetch_global().await {
            Ok(Some(config)) => {
                global.set(config);
                "ready"
            }
            Ok(None) => {
                tracing::debug!("global config is not available yet");
                "pending"
            }
            Err(err) => {
                tracing::error!("failed to fetch global config: {err}");
                "failed"
            }
        };
        counter!(GLOBAL_CONFIG_FETCH, "result" => result).increment(1);
    }
}
