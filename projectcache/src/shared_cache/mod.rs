//! Read path to project configs stored in a distributed cache.
//!
//! Entries are laid out as
//!
//! ```text
//! {prefix}:{public_key}      -> config payload (plain JSON, zstd, or gzip)
//! {prefix}:{public_key}.rev  -> revision of the stored payload
//! ```
//!
//! The cache is populated by other components and is only ever read here.

mod codec;
mod redis;

pub use codec::{CodecError, Compression, decode};
pub use redis::RedisBackend;

use crate::config::SharedCache as SharedCacheConfig;
use crate::metrics_defs::SHARED_CACHE_RESULT;
use crate::types::{DocumentError, ProjectConfig, ProjectKey};
use async_trait::async_trait;
use shared::counter;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SharedCacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("could not decompress payload: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid payload: {0}")]
    Document(#[from] DocumentError),

    #[error("revision is not valid UTF-8")]
    InvalidRevision,
}

#[async_trait]
pub trait SharedCacheBackend: Send + Sync {
    /// Returns the raw value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError>;
}

/// Result of consulting the shared cache for a key.
#[derive(Debug, PartialEq)]
pub enum SharedLookup {
    Hit(ProjectConfig),
    /// The stored revision equals the one already held locally.
    Unchanged,
    Miss,
}

impl SharedLookup {
    fn as_str(&self) -> &'static str {
        match self {
            SharedLookup::Hit(_) => "hit",
            SharedLookup::Unchanged => "unchanged",
            SharedLookup::Miss => "miss",
        }
    }
}

pub struct SharedCacheAdapter {
    backend: Arc<dyn SharedCacheBackend>,
    prefix: String,
}

impl SharedCacheAdapter {
    pub fn new(backend: Arc<dyn SharedCacheBackend>, prefix: impl Into<String>) -> Self {
        SharedCacheAdapter {
            backend,
            prefix: prefix.into(),
        }
    }

    pub async fn from_config(config: &SharedCacheConfig) -> Result<Self, SharedCacheError> {
        let backend = RedisBackend::connect(&config.url).await?;
        Ok(Self::new(Arc::new(backend), config.prefix.clone()))
    }

    fn payload_key(&self, key: &ProjectKey) -> String {
        format!("{}:{}", self.prefix, key)
    }

    fn revision_key(&self, key: &ProjectKey) -> String {
        format!("{}:{}.rev", self.prefix, key)
    }

    /// Reads and decodes the stored config of a project.
    pub async fn get(&self, key: &ProjectKey) -> Result<Option<ProjectConfig>, SharedCacheError> {
        let Some(payload) = self.backend.get(&self.payload_key(key)).await? else {
            return Ok(None);
        };
        let payload = decode(payload)?;
        Ok(Some(ProjectConfig::from_slice(&payload)?))
    }

    /// Reads the revision of the stored config without fetching the payload.
    pub async fn get_revision(&self, key: &ProjectKey) -> Result<Option<String>, SharedCacheError> {
        let Some(raw) = self.backend.get(&self.revision_key(key)).await? else {
            return Ok(None);
        };
        let revision = String::from_utf8(raw).map_err(|_| SharedCacheError::InvalidRevision)?;
        Ok(Some(revision.trim().to_owned()))
    }

    /// Resolves a key against the shared cache.
    ///
    /// When `known_revision` is given, the revision entry is checked first and
    /// the payload is only read if it differs.
    pub async fn lookup(
        &self,
        key: &ProjectKey,
        known_revision: Option<&str>,
    ) -> Result<SharedLookup, SharedCacheError> {
        let result = self.resolve(key, known_revision).await;
        let tag = match &result {
            Ok(lookup) => lookup.as_str(),
            Err(_) => "error",
        };
        counter!(SHARED_CACHE_RESULT, "result" => tag).increment(1);
        result
    }

    async fn resolve(
        &self,
        key: &ProjectKey,
        known_revision: Option<&str>,
    ) -> Result<SharedLookup, SharedCacheError> {
        if let Some(known) = known_revision
            && self.get_revision(key).await?.as_deref() == Some(known)
        {
            return Ok(SharedLookup::Unchanged);
        }

        Ok(match self.get(key).await? {
            Some(config) => SharedLookup::Hit(config),
            None => SharedLookup::Miss,
        })
    }
}
