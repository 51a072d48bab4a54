//! Project configs read from a local directory.
//!
//! Every `*.json` file in the directory holds one project config. The config
//! applies to the keys listed in its `publicKeys` array, or to the file stem if
//! it lists none. An override takes precedence over every network source.

use crate::metrics_defs::{OVERRIDES_CHANGED, OVERRIDES_RELOAD};
use crate::types::{ProjectConfig, ProjectKey};
use parking_lot::RwLock;
use shared::counter;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum OverrideError {
    #[error("could not read override directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Snapshot = HashMap<ProjectKey, Arc<ProjectConfig>>;

/// Difference between two consecutive scans.
#[derive(Debug, Default)]
pub struct OverrideChanges {
    /// Keys whose config was added or changed.
    pub updated: Vec<(ProjectKey, Arc<ProjectConfig>)>,
    /// Keys that no longer have an override.
    pub removed: Vec<ProjectKey>,
}

impl OverrideChanges {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

pub struct LocalOverrides {
    dir: PathBuf,
    snapshot: RwLock<Snapshot>,
}

impl LocalOverrides {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LocalOverrides {
            dir: dir.into(),
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, key: &ProjectKey) -> Option<Arc<ProjectConfig>> {
        self.snapshot.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rescans the directory and replaces the snapshot.
    ///
    /// Returns the keys whose config was added or changed by this scan, and
    /// the keys whose file disappeared or turned invalid.
    pub async fn reload(&self) -> Result<OverrideChanges, OverrideError> {
        counter!(OVERRIDES_RELOAD).increment(1);
        let next = self.scan().await?;

        let changes = {
            let previous = self.snapshot.read();
            OverrideChanges {
                updated: next
                    .iter()
                    .filter(|(key, config)| previous.get(*key) != Some(*config))
                    .map(|(key, config)| (key.clone(), config.clone()))
                    .collect(),
                removed: previous
                    .keys()
                    .filter(|key| !next.contains_key(*key))
                    .cloned()
                    .collect(),
            }
        };

        *self.snapshot.write() = next;

        if !changes.is_empty() {
            tracing::info!(
                updated = changes.updated.len(),
                removed = changes.removed.len(),
                "loaded project config overrides"
            );
            counter!(OVERRIDES_CHANGED)
                .increment((changes.updated.len() + changes.removed.len()) as u64);
        }
        Ok(changes)
    }

    async fn scan(&self) -> Result<Snapshot, OverrideError> {
        let io_err = |source: io::Error| OverrideError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.dir.display(), "override directory does not exist");
                return Ok(HashMap::new());
            }
            Err(err) => return Err(io_err(err)),
        };

        let mut snapshot = HashMap::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let config = match tokio::fs::read(&path).await {
                Ok(bytes) => ProjectConfig::from_slice(&bytes),
                Err(err) => {
                    tracing::warn!(path = %path.display(), "could not read override file: {err}");
                    continue;
                }
            };
            let config = match config {
                Ok(config) => Arc::new(config),
                Err(err) => {
                    tracing::warn!(path = %path.display(), "skipping invalid override file: {err}");
                    continue;
                }
            };

            let mut keys = config.public_keys();
            if keys.is_empty() {
                keys.push(ProjectKey::from(stem));
            }
            for key in keys {
                snapshot.insert(key, config.clone());
            }
        }

        Ok(snapshot)
    }
}
