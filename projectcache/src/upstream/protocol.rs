//! Protocol types for the project configs endpoint (v3).
//!
//! # Request
//!
//! ```json
//! {
//!   "publicKeys": ["key1", "key2"],
//!   "revisions": ["123", null],
//!   "fullConfig": true,
//!   "noCache": false,
//!   "global": false
//! }
//! ```
//!
//! `revisions` is positional: the n-th entry is the last known revision of the
//! n-th public key, or `null`. It is omitted when no key has a revision.
//!
//! # Response
//!
//! ```json
//! {
//!   "configs": {"key1": {"disabled": false, "rev": "124", ...}},
//!   "unchanged": ["key2"],
//!   "pending": ["key3"],
//!   "global": {...},
//!   "global_status": "ready"
//! }
//! ```
//!
//! A key that maps to `null` or does not appear in any of the lists does not
//! exist upstream.

use crate::types::{ProjectConfig, ProjectKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfigsRequest {
    pub public_keys: Vec<ProjectKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<Vec<Option<String>>>,

    #[serde(default)]
    pub full_config: bool,

    #[serde(default)]
    pub no_cache: bool,

    #[serde(default)]
    pub global: bool,
}

impl ProjectConfigsRequest {
    /// Builds a query for a batch of keys with their last known revisions.
    pub fn for_batch(batch: &[(ProjectKey, Option<String>)]) -> Self {
        let public_keys = batch.iter().map(|(key, _)| key.clone()).collect();

        let revisions = batch
            .iter()
            .any(|(_, revision)| revision.is_some())
            .then(|| batch.iter().map(|(_, revision)| revision.clone()).collect());

        ProjectConfigsRequest {
            public_keys,
            revisions,
            full_config: true,
            no_cache: false,
            global: false,
        }
    }

    /// Builds a query for the global config only.
    pub fn global() -> Self {
        ProjectConfigsRequest {
            public_keys: Vec::new(),
            revisions: None,
            full_config: true,
            no_cache: false,
            global: true,
        }
    }

    /// The revision sent for a key, if any.
    pub fn revision(&self, key: &ProjectKey) -> Option<&str> {
        let index = self.public_keys.iter().position(|k| k == key)?;
        self.revisions.as_ref()?.get(index)?.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalStatus {
    Ready,
    Pending,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfigsResponse {
    #[serde(default)]
    pub configs: HashMap<ProjectKey, Option<JsonValue>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<ProjectKey>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unchanged: Vec<ProjectKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_status: Option<GlobalStatus>,
}

/// Resolution of a single key in an upstream response.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOutcome {
    Config(ProjectConfig),
    /// The revision sent in the request is still current.
    Unchanged,
    NotFound,
    /// The upstream is still computing the config. Ask again later.
    Pending,
    /// The upstream returned something that is not a project config.
    Invalid(String),
}

impl ProjectConfigsResponse {
    /// Resolves every requested key to exactly one outcome.
    pub fn into_outcomes(mut self, requested: &[ProjectKey]) -> HashMap<ProjectKey, UpstreamOutcome> {
        let pending: HashSet<ProjectKey> = self.pending.drain(..).collect();
        let unchanged: HashSet<ProjectKey> = self.unchanged.drain(..).collect();

        requested
            .iter()
            .map(|key| {
                let outcome = match self.configs.remove(key) {
                    Some(Some(document)) => match ProjectConfig::from_value(document) {
                        Ok(config) => UpstreamOutcome::Config(config),
                        Err(err) => UpstreamOutcome::Invalid(err.to_string()),
                    },
                    Some(None) => UpstreamOutcome::NotFound,
                    None if unchanged.contains(key) => UpstreamOutcome::Unchanged,
                    None if pending.contains(key) => UpstreamOutcome::Pending,
                    None => UpstreamOutcome::NotFound,
                };
                (key.clone(), outcome)
            })
            .collect()
    }
}
