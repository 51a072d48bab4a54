use crate::shared_cache::{SharedCacheBackend, SharedCacheError};
use crate::types::ProjectKey;
use crate::upstream::{
    ProjectConfigsRequest, ProjectConfigsResponse, UpstreamError, UpstreamTransport,
};
use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, Snapshotter};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct MockState {
    projects: HashMap<ProjectKey, JsonValue>,
    pending: HashSet<ProjectKey>,
    failures: VecDeque<UpstreamError>,
    hangs: VecDeque<Duration>,
    fail_always: Option<StatusCode>,
    global: Option<JsonValue>,
    delay: Duration,
    requests: Vec<ProjectConfigsRequest>,
}

/// In-process upstream that answers project config queries from a map.
///
/// A project whose document carries a `rev` equal to the revision sent in a
/// query is reported as unchanged.
#[derive(Default)]
pub struct MockUpstream {
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, key: &str, document: JsonValue) {
        self.state.lock().projects.insert(key.into(), document);
    }

    pub fn remove_project(&self, key: &str) {
        self.state.lock().projects.remove(key);
    }

    pub fn set_pending(&self, key: &str, pending: bool) {
        let mut state = self.state.lock();
        if pending {
            state.pending.insert(key.into());
        } else {
            state.pending.remove(key);
        }
    }

    pub fn set_global(&self, global: JsonValue) {
        self.state.lock().global = Some(global);
    }

    /// Fails the next query with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, err: UpstreamError) {
        self.state.lock().failures.push_back(err);
    }

    /// Stalls the next query for `duration` before answering.
    pub fn hang_next(&self, duration: Duration) {
        self.state.lock().hangs.push_back(duration);
    }

    pub fn fail_always(&self, status: StatusCode) {
        self.state.lock().fail_always = Some(status);
    }

    pub fn recover(&self) {
        self.state.lock().fail_always = None;
    }

    /// Delays every answer by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<ProjectConfigsRequest> {
        self.state.lock().requests.clone()
    }

    /// Total number of keys requested over all project queries.
    pub fn requested_keys(&self) -> Vec<ProjectKey> {
        self.state
            .lock()
            .requests
            .iter()
            .flat_map(|request| request.public_keys.iter().cloned())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &ProjectConfigsRequest) -> ProjectConfigsResponse {
        let state = self.state.lock();
        let mut response = ProjectConfigsResponse::default();

        if request.global {
            response.global = state.global.clone();
        }

        for key in &request.public_keys {
            if state.pending.contains(key) {
                response.pending.push(key.clone());
                continue;
            }
            match state.projects.get(key) {
                Some(document) => {
                    let current = document.get("rev").and_then(JsonValue::as_str);
                    if current.is_some() && current == request.revision(key) {
                        response.unchanged.push(key.clone());
                    } else {
                        response.configs.insert(key.clone(), Some(document.clone()));
                    }
                }
                None => {
                    response.configs.insert(key.clone(), None);
                }
            }
        }

        response
    }
}

#[async_trait]
impl UpstreamTransport for MockUpstream {
    async fn send(
        &self,
        request: &ProjectConfigsRequest,
    ) -> Result<ProjectConfigsResponse, UpstreamError> {
        let (failure, wait) = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            let failure = match state.fail_always {
                Some(status) => Some(UpstreamError::Status(status)),
                None => state.failures.pop_front(),
            };
            let wait = state.hangs.pop_front().unwrap_or(state.delay);
            (failure, wait)
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match failure {
            Some(err) => Err(err),
            None => Ok(self.respond(request)),
        }
    }
}

/// Shared cache backend that keeps raw payloads in memory, with optional TTLs.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.entries
            .lock()
            .insert(key.to_string(), (value.into(), None));
    }

    pub fn insert_with_ttl(&self, key: &str, value: impl Into<Vec<u8>>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .insert(key.to_string(), (value.into(), Some(expires_at)));
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedCacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SharedCacheError::Backend("connection reset".into()));
        }
        let entries = self.entries.lock();
        Ok(entries.get(key).and_then(|(value, expires_at)| match expires_at {
            Some(expires_at) if *expires_at <= Instant::now() => None,
            _ => Some(value.clone()),
        }))
    }
}

/// Total of a counter over every label set that contains `labels`.
pub fn counter_total(snapshotter: &Snapshotter, name: &str, labels: &[(&str, &str)]) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, ..)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .filter(|(key, ..)| {
            labels.iter().all(|(name, value)| {
                key.key()
                    .labels()
                    .any(|label| label.key() == *name && label.value() == *value)
            })
        })
        .map(|(.., value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
        .sum()
}
