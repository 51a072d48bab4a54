use super::{SharedCacheBackend, SharedCacheError};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

/// Reads shared cache entries from Redis.
///
/// The connection manager reconnects transparently, so a failed read only
/// affects the keys of that read.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, SharedCacheError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(RedisBackend { connection })
    }
}

#[async_trait]
impl SharedCacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SharedCacheError> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = connection.get(key).await?;
        Ok(value)
    }
}
