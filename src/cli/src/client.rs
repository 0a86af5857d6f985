//! Store client for talking to Panqueue queues over Redis.

use anyhow::{Context, Result};
use panqueue_core::jobs::{ConnectionOptions, JobQueue, RedisStore, StoreConnection};
use std::sync::Arc;

/// Connected Redis store shared by every command.
pub struct QueueClient {
    connection: StoreConnection,
    store: Arc<RedisStore>,
}

impl QueueClient {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = StoreConnection::new(ConnectionOptions::from(url));
        connection
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {}", connection.options().redacted()))?;

        let store = RedisStore::from_connection(&connection)?;
        Ok(Self {
            connection,
            store: Arc::new(store),
        })
    }

    /// Server URL with credentials removed.
    pub fn url(&self) -> String {
        self.connection.options().redacted()
    }

    /// Bind a queue id to the shared store.
    pub fn queue(&self, queue_id: &str) -> Result<JobQueue> {
        JobQueue::new(self.store.clone(), queue_id)
            .with_context(|| format!("Invalid queue id: {:?}", queue_id))
    }

    pub async fn close(self) -> Result<()> {
        self.connection.disconnect().await?;
        Ok(())
    }
}
