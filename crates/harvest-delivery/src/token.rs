//! Data token acquisition.
//!
//! Every harvest request carries a data token pair issued by the collector's
//! connect endpoint in exchange for the application license key. Tokens are
//! cached, persisted across restarts through a [`TokenCache`], and only
//! regenerated when stale or after an auth failure.

use crate::{DeliveryError, DeliveryResult, DeviceDescriptor};
use async_trait::async_trait;
use harvest_config_and_utils::SharedClock;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a generated token is reused before a new one is requested.
pub const TOKEN_VALIDITY: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Timeout for connect requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Pair of identifiers issued by the connect endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataToken([i64; 2]);

impl DataToken {
    pub fn new(account: i64, application: i64) -> Self {
        Self([account, application])
    }

    pub fn pair(&self) -> [i64; 2] {
        self.0
    }

    /// Value of the `Authorization: Bearer` header.
    pub fn bearer(&self) -> String {
        format!("{},{}", self.0[0], self.0[1])
    }
}

/// Source of data tokens for the delivery client.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current token, generating one if none is cached or it is stale.
    async fn token(&self) -> DeliveryResult<DataToken>;

    /// Discard the cached token and generate a new one.
    async fn refresh(&self) -> DeliveryResult<DataToken>;
}

/// Fixed token, for tests and offline setups.
#[derive(Debug)]
pub struct StaticTokenProvider {
    token: DataToken,
    refreshes: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn new(token: DataToken) -> Self {
        Self {
            token,
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Number of refresh calls seen so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> DeliveryResult<DataToken> {
        Ok(self.token)
    }

    async fn refresh(&self) -> DeliveryResult<DataToken> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(self.token)
    }
}

#[derive(Debug, Deserialize)]
struct ConnectResponse {
    data_token: Vec<i64>,
}

/// A token together with the time it was issued, as kept by a [`TokenCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub account: i64,
    pub application: i64,
    /// Milliseconds since the epoch.
    pub issued_at: i64,
}

impl CachedToken {
    pub fn new(token: DataToken, issued_at: i64) -> Self {
        let [account, application] = token.pair();
        Self {
            account,
            application,
            issued_at,
        }
    }

    pub fn token(&self) -> DataToken {
        DataToken::new(self.account, self.application)
    }
}

/// Persistent home for the last generated token.
pub trait TokenCache: Send + Sync {
    /// The stored token, if any. Unreadable contents read as none.
    fn load(&self) -> Option<CachedToken>;

    fn save(&self, token: &CachedToken) -> DeliveryResult<()>;

    fn clear(&self) -> DeliveryResult<()>;
}

/// JSON file holding a single token, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileTokenCache {
    path: PathBuf,
}

impl FileTokenCache {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl TokenCache for FileTokenCache {
    fn load(&self) -> Option<CachedToken> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Token file unreadable");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Token file corrupt, ignoring");
                None
            }
        }
    }

    fn save(&self, token: &CachedToken) -> DeliveryResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec(token)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> DeliveryResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Token cache that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenCache {
    token: RwLock<Option<CachedToken>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenCache for MemoryTokenCache {
    fn load(&self) -> Option<CachedToken> {
        *self.token.read()
    }

    fn save(&self, token: &CachedToken) -> DeliveryResult<()> {
        *self.token.write() = Some(*token);
        Ok(())
    }

    fn clear(&self) -> DeliveryResult<()> {
        *self.token.write() = None;
        Ok(())
    }
}

/// Token provider backed by the collector's connect endpoint.
pub struct ConnectTokenManager {
    http_client: Client,
    connect_url: String,
    license_key: String,
    descriptor: DeviceDescriptor,
    user_agent: String,
    validity: Duration,
    clock: SharedClock,
    cached: RwLock<Option<CachedToken>>,
    cache: Arc<dyn TokenCache>,
    generation: tokio::sync::Mutex<()>,
}

impl ConnectTokenManager {
    /// Build a manager that keeps its token in memory only.
    pub fn new(
        connect_url: String,
        license_key: String,
        descriptor: DeviceDescriptor,
        user_agent: String,
        clock: SharedClock,
    ) -> DeliveryResult<Self> {
        Self::with_cache(
            connect_url,
            license_key,
            descriptor,
            user_agent,
            clock,
            Arc::new(MemoryTokenCache::new()),
        )
    }

    /// Build a manager seeded from, and saving to, `cache`.
    pub fn with_cache(
        connect_url: String,
        license_key: String,
        descriptor: DeviceDescriptor,
        user_agent: String,
        clock: SharedClock,
        cache: Arc<dyn TokenCache>,
    ) -> DeliveryResult<Self> {
        let http_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()?;

        Ok(Self {
            http_client,
            connect_url,
            license_key,
            descriptor,
            user_agent,
            validity: TOKEN_VALIDITY,
            clock,
            cached: RwLock::new(cache.load()),
            cache,
            generation: tokio::sync::Mutex::new(()),
        })
    }

    /// Override the cache lifetime.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    fn cached_if_fresh(&self) -> Option<DataToken> {
        let cached = (*self.cached.read())?;
        let age = self.clock.now_millis().saturating_sub(cached.issued_at);
        if age >= 0 && (age as u128) < self.validity.as_millis() {
            Some(cached.token())
        } else {
            None
        }
    }

    async fn generate(&self) -> DeliveryResult<DataToken> {
        if self.license_key.is_empty() {
            return Err(DeliveryError::Token("application token is not configured".into()));
        }

        debug!(url = %self.connect_url, "Requesting data token");

        let response = self
            .http_client
            .post(&self.connect_url)
            .header("Content-Type", "application/json; charset=utf-8")
            .header("Accept", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("X-App-License-Key", &self.license_key)
            .json(&self.descriptor.connect_payload())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Token(format!(
                "connect failed with HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: ConnectResponse = response.json().await?;
        let token = match parsed.data_token.as_slice() {
            [account, application, ..] => DataToken::new(*account, *application),
            other => {
                return Err(DeliveryError::Token(format!(
                    "data_token has {} elements, expected 2",
                    other.len()
                )))
            }
        };

        let cached = CachedToken::new(token, self.clock.now_millis());
        *self.cached.write() = Some(cached);
        if let Err(e) = self.cache.save(&cached) {
            warn!(error = %e, "Failed to persist data token");
        }
        info!("Data token generated");
        Ok(token)
    }

    /// Drop the token from memory and from the cache.
    fn forget(&self) {
        *self.cached.write() = None;
        if let Err(e) = self.cache.clear() {
            warn!(error = %e, "Failed to clear persisted data token");
        }
    }
}

#[async_trait]
impl TokenProvider for ConnectTokenManager {
    async fn token(&self) -> DeliveryResult<DataToken> {
        if let Some(token) = self.cached_if_fresh() {
            return Ok(token);
        }

        let _guard = self.generation.lock().await;
        // Another caller may have generated one while we waited.
        if let Some(token) = self.cached_if_fresh() {
            return Ok(token);
        }
        self.generate().await
    }

    async fn refresh(&self) -> DeliveryResult<DataToken> {
        let _guard = self.generation.lock().await;
        match self.generate().await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(error = %e, "Data token refresh failed");
                self.forget();
                Err(e)
            }
        }
    }
}
