//! In-memory project config cache.
//!
//! Every project key maps to a slot holding the last known state of the
//! project and whether a fetch for it is currently in flight. Reads never
//! perform I/O: a read that finds no usable state returns
//! [`Decision::Unknown`] and, if no fetch is in flight yet, marks the slot as
//! pending and tells the caller to schedule one.
//!
//! Freshness is derived purely from the time a state was fetched:
//!
//! ```text
//! fetched_at          + project_expiry         + project_grace_period
//!     |------ fresh ------|-------- stale --------|------ expired ------>
//! ```
//!
//! A "not found" answer is remembered for `miss_expiry`.

use crate::config::Cache as CacheConfig;
use crate::types::{ProjectConfig, ProjectKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub project_expiry: Duration,
    pub project_grace_period: Duration,
    pub miss_expiry: Duration,
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        CachePolicy {
            project_expiry: config.project_expiry,
            project_grace_period: config.project_grace_period,
            miss_expiry: config.miss_expiry,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl CachePolicy {
    pub fn classify(&self, fetched_at: Instant, now: Instant) -> Freshness {
        let age = now.saturating_duration_since(fetched_at);
        if age < self.project_expiry {
            Freshness::Fresh
        } else if age < self.project_expiry + self.project_grace_period {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    fn is_miss_expired(&self, checked_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(checked_at) >= self.miss_expiry
    }
}

/// The outcome of a cache read.
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    UseFresh(Arc<ProjectConfig>),
    /// Usable but past its expiry. A revalidation is scheduled or already in flight.
    UseStale(Arc<ProjectConfig>),
    /// The project is known not to exist.
    NotFound,
    /// No usable state. A fetch is scheduled or already in flight.
    Unknown,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::UseFresh(_) => "fresh",
            Decision::UseStale(_) => "stale",
            Decision::NotFound => "not_found",
            Decision::Unknown => "unknown",
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct Lookup {
    pub decision: Decision,
    /// Set for exactly one reader when the key transitions into the pending
    /// state. That reader must hand the key to the fetch coordinator.
    pub schedule_fetch: bool,
}

#[derive(Clone, Debug, Default)]
enum State {
    #[default]
    Empty,
    Missing {
        checked_at: Instant,
    },
    Loaded {
        config: Arc<ProjectConfig>,
        fetched_at: Instant,
    },
}

impl State {
    fn updated_at(&self) -> Option<Instant> {
        match self {
            State::Empty => None,
            State::Missing { checked_at } => Some(*checked_at),
            State::Loaded { fetched_at, .. } => Some(*fetched_at),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: State,
    in_flight: bool,
}

pub struct LocalCache {
    policy: CachePolicy,
    slots: RwLock<HashMap<ProjectKey, Slot>>,
}

impl LocalCache {
    pub fn new(policy: CachePolicy) -> Self {
        LocalCache {
            policy,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Looks up a project key.
    ///
    /// The fast path only takes the read lock. The write lock is taken when
    /// the key needs a fetch, so that concurrent misses for the same key
    /// produce exactly one `schedule_fetch`.
    pub fn get(&self, key: &ProjectKey, now: Instant) -> Lookup {
        {
            let slots = self.slots.read();
            let (decision, wants_fetch) = self.evaluate(slots.get(key), now);
            if !wants_fetch {
                return Lookup {
                    decision,
                    schedule_fetch: false,
                };
            }
        }

        let mut slots = self.slots.write();
        let slot = slots.entry(key.clone()).or_default();
        let (decision, wants_fetch) = self.evaluate(Some(slot), now);
        if wants_fetch {
            slot.in_flight = true;
        }

        Lookup {
            decision,
            schedule_fetch: wants_fetch,
        }
    }

    /// Returns the config if it is currently usable, without scheduling anything.
    pub fn peek(&self, key: &ProjectKey, now: Instant) -> Option<Arc<ProjectConfig>> {
        match self.evaluate(self.slots.read().get(key), now).0 {
            Decision::UseFresh(config) | Decision::UseStale(config) => Some(config),
            Decision::NotFound | Decision::Unknown => None,
        }
    }

    /// The revision of a usable cached config, sent along with the next query
    /// so the source can answer "unchanged".
    pub fn known_revision(&self, key: &ProjectKey, now: Instant) -> Option<String> {
        self.peek(key, now)
            .and_then(|config| config.revision().map(String::from))
    }

    /// Completes a fetch with a new config.
    ///
    /// Returns `false` if a newer state was already present, in which case the
    /// completion is discarded.
    pub fn put(&self, key: &ProjectKey, config: Arc<ProjectConfig>, fetched_at: Instant) -> bool {
        self.complete(key, fetched_at, |state| {
            *state = State::Loaded { config, fetched_at };
            true
        })
    }

    /// Completes a fetch whose source reported the config as unchanged.
    ///
    /// Only the timestamp is refreshed. Returns `false` if there is no config
    /// to keep, or it carries a different revision than the one that was sent.
    pub fn refresh(&self, key: &ProjectKey, revision: Option<&str>, fetched_at: Instant) -> bool {
        self.complete(key, fetched_at, |state| match state {
            State::Loaded {
                config,
                fetched_at: previous,
            } if config.revision() == revision => {
                *previous = fetched_at;
                true
            }
            _ => false,
        })
    }

    /// Completes a fetch whose source reported that the project does not exist.
    pub fn put_missing(&self, key: &ProjectKey, checked_at: Instant) -> bool {
        self.complete(key, checked_at, |state| {
            *state = State::Missing { checked_at };
            true
        })
    }

    /// Completes a failed fetch. Existing state is kept and served as long as
    /// its age allows.
    pub fn fail(&self, key: &ProjectKey) {
        if let Some(slot) = self.slots.write().get_mut(key) {
            slot.in_flight = false;
        }
    }

    /// Installs a config from a local override file.
    ///
    /// Overrides are authoritative: they replace any state regardless of age
    /// and leave a fetch in flight untouched.
    pub fn apply_override(&self, key: &ProjectKey, config: Arc<ProjectConfig>, now: Instant) {
        let mut slots = self.slots.write();
        let slot = slots.entry(key.clone()).or_default();
        slot.state = State::Loaded {
            config,
            fetched_at: now,
        };
    }

    /// Forgets the cached state of a key. A fetch in flight stays in flight.
    pub fn invalidate(&self, key: &ProjectKey) {
        if let Some(slot) = self.slots.write().get_mut(key) {
            slot.state = State::Empty;
        }
    }

    /// Removes every entry past its usable lifetime that has no fetch in
    /// flight. Returns the number of removed entries.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| {
            if slot.in_flight {
                return true;
            }
            match &slot.state {
                State::Empty => false,
                State::Missing { checked_at } => !self.policy.is_miss_expired(*checked_at, now),
                State::Loaded { fetched_at, .. } => {
                    self.policy.classify(*fetched_at, now) != Freshness::Expired
                }
            }
        });
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn complete<F>(&self, key: &ProjectKey, at: Instant, apply: F) -> bool
    where
        F: FnOnce(&mut State) -> bool,
    {
        let mut slots = self.slots.write();
        let slot = slots.entry(key.clone()).or_default();
        slot.in_flight = false;

        if let Some(updated_at) = slot.state.updated_at()
            && updated_at > at
        {
            tracing::debug!(project_key = %key, "discarding outdated fetch result");
            return false;
        }

        apply(&mut slot.state)
    }

    /// Returns the decision for a slot and whether a fetch must be scheduled.
    fn evaluate(&self, slot: Option<&Slot>, now: Instant) -> (Decision, bool) {
        let Some(slot) = slot else {
            return (Decision::Unknown, true);
        };

        let (decision, needs_fetch) = match &slot.state {
            State::Empty => (Decision::Unknown, true),
            State::Missing { checked_at } => {
                if self.policy.is_miss_expired(*checked_at, now) {
                    (Decision::Unknown, true)
                } else {
                    (Decision::NotFound, false)
                }
            }
            State::Loaded { config, fetched_at } => match self.policy.classify(*fetched_at, now) {
                Freshness::Fresh => (Decision::UseFresh(config.clone()), false),
                Freshness::Stale => (Decision::UseStale(config.clone()), true),
                Freshness::Expired => (Decision::Unknown, true),
            },
        };

        (decision, needs_fetch && !slot.in_flight)
    }
}
