//! Store connection lifecycle.
//!
//! [`StoreConnection`] owns at most one client created by a [`ClientFactory`]:
//!
//! - `connect()` is idempotent; concurrent callers share one factory call
//! - `client()` fails with `NotConnected` until `connect()` has succeeded
//! - `disconnect()` is safe to call at any time
//! - `duplicate()` yields an independently connected instance, used for
//!   subscription traffic so it never blocks command traffic

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, QueueError, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6379;

// ═══════════════════════════════════════════════════════════════════════════════
// Connection Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Discrete connection parameters. Missing values fall back to
/// `localhost:6379`, database 0, no TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub db: Option<i64>,
    pub tls: Option<bool>,
}

/// Redis connection configuration: either a URL or discrete parameters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionOptions {
    Url(String),
    Params(ConnectionParams),
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::Params(ConnectionParams::default())
    }
}

impl From<&str> for ConnectionOptions {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for ConnectionOptions {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl ConnectionOptions {
    /// Build a `redis://` (or `rediss://`) URL.
    pub fn to_url(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Params(params) => {
                let scheme = if params.tls.unwrap_or(false) { "rediss" } else { "redis" };
                let host = params.host.as_deref().unwrap_or(DEFAULT_HOST);
                let port = params.port.unwrap_or(DEFAULT_PORT);
                let auth = params
                    .password
                    .as_deref()
                    .map(|pw| format!(":{}@", urlencoding::encode(pw)))
                    .unwrap_or_default();
                let db = params.db.map(|db| format!("/{}", db)).unwrap_or_default();
                format!("{}://{}{}:{}{}", scheme, auth, host, port, db)
            }
        }
    }

    /// URL safe for logs.
    pub fn redacted(&self) -> String {
        redact_url(&self.to_url())
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionOptions").field(&self.redacted()).finish()
    }
}

/// Replace any credentials in a URL with `***`.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            if !parsed.username().is_empty() {
                let _ = parsed.set_username("***");
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client Factory
// ═══════════════════════════════════════════════════════════════════════════════

/// Creates and closes the underlying store clients.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;

    async fn create(&self, options: &ConnectionOptions) -> Result<Self::Client>;

    async fn close(&self, client: Self::Client) -> Result<()> {
        drop(client);
        Ok(())
    }
}

/// A connected Redis client.
///
/// `manager` multiplexes command traffic and reconnects on its own. `client`
/// is kept for opening dedicated pub/sub connections.
#[derive(Clone)]
pub struct RedisHandle {
    pub client: redis::Client,
    pub manager: ConnectionManager,
}

impl fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisHandle").finish_non_exhaustive()
    }
}

/// Factory for [`RedisHandle`]s.
#[derive(Debug, Clone)]
pub struct RedisClientFactory {
    pub connect_timeout: Duration,
}

impl Default for RedisClientFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ClientFactory for RedisClientFactory {
    type Client = RedisHandle;

    async fn create(&self, options: &ConnectionOptions) -> Result<RedisHandle> {
        let client = redis::Client::open(options.to_url()).map_err(|e| {
            QueueError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid Redis connection options",
                e.to_string(),
            )
        })?;

        let mut manager = tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new(client.clone()),
        )
        .await??;

        let _: String = redis::cmd("PING").query_async(&mut manager).await?;

        info!(url = %options.redacted(), "Connected to Redis");
        Ok(RedisHandle { client, manager })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Connection
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection lifecycle wrapper around a [`ClientFactory`].
pub struct StoreConnection<F: ClientFactory = RedisClientFactory> {
    options: ConnectionOptions,
    factory: Arc<F>,
    client: RwLock<Option<F::Client>>,
    /// Serializes connect and disconnect.
    gate: Mutex<()>,
}

impl StoreConnection<RedisClientFactory> {
    pub fn new(options: impl Into<ConnectionOptions>) -> Self {
        Self::with_factory(options, RedisClientFactory::default())
    }
}

impl<F: ClientFactory> StoreConnection<F> {
    pub fn with_factory(options: impl Into<ConnectionOptions>, factory: F) -> Self {
        Self::with_shared_factory(options.into(), Arc::new(factory))
    }

    fn with_shared_factory(options: ConnectionOptions, factory: Arc<F>) -> Self {
        Self {
            options,
            factory,
            client: RwLock::new(None),
            gate: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.client.read().is_some()
    }

    /// Connect. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let _gate = self.gate.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        debug!(url = %self.options.redacted(), "Connecting to store");
        let client = self.factory.create(&self.options).await.map_err(|e| {
            warn!(url = %self.options.redacted(), error = %e, "Store connection failed");
            e
        })?;
        *self.client.write() = Some(client);
        Ok(())
    }

    /// The connected client.
    pub fn client(&self) -> Result<F::Client> {
        self.client
            .read()
            .as_ref()
            .cloned()
            .ok_or_else(QueueError::not_connected)
    }

    /// Disconnect. Safe to call when not connected.
    pub async fn disconnect(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        let client = self.client.write().take();
        if let Some(client) = client {
            self.factory.close(client).await?;
            debug!(url = %self.options.redacted(), "Disconnected from store");
        }
        Ok(())
    }

    /// A new, separately connected instance with the same options.
    pub async fn duplicate(&self) -> Result<Self> {
        let dup = Self::with_shared_factory(self.options.clone(), self.factory.clone());
        dup.connect().await?;
        Ok(dup)
    }
}

impl<F: ClientFactory> fmt::Debug for StoreConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConnection")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}
