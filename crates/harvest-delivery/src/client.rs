//! HTTP delivery client for the collector.

use crate::{
    build_payload, encode_body, join_path, CircuitBreaker, CircuitState, DataToken,
    DeliveryError, DeliveryResult, DeviceDescriptor, RegionEndpoints, RegionTable, TokenProvider,
    DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD, EVENTS_PATH, GZIP_THRESHOLD,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_config_and_utils::{Event, Profile, SharedClock, AGENT_NAME, AGENT_VERSION};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backoff applied after a 429 whose `Retry-After` is missing or unreadable.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Anything that can deliver a batch of events.
///
/// Delivery is all-or-nothing: `send` reports a single success flag for the
/// whole batch.
#[async_trait]
pub trait EventSender: Send + Sync {
    /// Deliver a batch. `endpoint_tag` names the harvest path for diagnostics.
    async fn send(&self, batch: &[Event], endpoint_tag: &str) -> bool;

    /// Remaining server-requested backoff, if the collector asked us to wait.
    fn backoff_remaining(&self) -> Option<Duration> {
        None
    }

    /// Current endpoint failover state, if the sender tracks one.
    fn circuit_state(&self) -> Option<CircuitState> {
        None
    }
}

/// Delivery client configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Region code used to pick collector hosts.
    pub region: String,
    /// Full events URL that replaces regional host selection.
    pub endpoint_override: Option<String>,
    /// Immediate attempts per send, rotating endpoints between attempts.
    pub max_attempts: u32,
    /// Batches with more events than this are gzip-compressed.
    pub gzip_threshold: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
    /// Consecutive failures before switching to backup hosts.
    pub failure_threshold: u32,
    /// Quiet period before returning to primary hosts.
    pub cooldown: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            region: crate::DEFAULT_REGION.to_string(),
            endpoint_override: None,
            max_attempts: 3,
            gzip_threshold: GZIP_THRESHOLD,
            connect_timeout: Duration::from_secs(8),
            read_timeout: Duration::from_secs(12),
            user_agent: format!("{}/{}", AGENT_NAME, AGENT_VERSION),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl DeliveryConfig {
    /// Defaults with the profile's network timeouts.
    pub fn from_profile(profile: &Profile, region: &str, endpoint_override: Option<String>) -> Self {
        Self {
            region: region.to_string(),
            endpoint_override,
            connect_timeout: profile.connect_timeout,
            read_timeout: profile.read_timeout,
            ..Self::default()
        }
    }
}

/// Point-in-time delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub requests: u64,
    pub delivered_batches: u64,
    pub delivered_events: u64,
    pub failed_batches: u64,
    pub rate_limited: u64,
    pub auth_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    delivered_batches: AtomicU64,
    delivered_events: AtomicU64,
    failed_batches: AtomicU64,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
}

/// Collector client with endpoint failover.
pub struct HttpDeliveryClient {
    config: DeliveryConfig,
    http_client: Client,
    endpoints: RegionEndpoints,
    tokens: Arc<dyn TokenProvider>,
    descriptor: DeviceDescriptor,
    circuit: CircuitBreaker,
    clock: SharedClock,
    rate_limited_until: Mutex<Option<i64>>,
    counters: Counters,
}

impl HttpDeliveryClient {
    /// Create a client. Fails if the region cannot be resolved or the HTTP
    /// client cannot be built.
    pub fn new(
        config: DeliveryConfig,
        regions: &RegionTable,
        tokens: Arc<dyn TokenProvider>,
        descriptor: DeviceDescriptor,
        clock: SharedClock,
    ) -> DeliveryResult<Self> {
        let endpoints = match &config.endpoint_override {
            Some(url) => {
                url::Url::parse(url)?;
                RegionEndpoints::new(vec![url.clone()], Vec::new())
            }
            None => regions
                .resolve(&config.region)
                .cloned()
                .ok_or_else(|| DeliveryError::Config(format!("no endpoints for region {}", config.region)))?,
        };

        let http_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.connect_timeout + config.read_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        let circuit = CircuitBreaker::new(config.failure_threshold, config.cooldown, clock.clone());

        Ok(Self {
            config,
            http_client,
            endpoints,
            tokens,
            descriptor,
            circuit,
            clock,
            rate_limited_until: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Deliver a batch, trying up to `max_attempts` endpoints back to back.
    ///
    /// - 2xx: delivered
    /// - 5xx / transport error: counted against the circuit, next endpoint tried immediately
    /// - 429: backoff window recorded, returned without further attempts
    /// - 401 / 403: token refreshed for the next call, returned without further attempts
    /// - other 4xx: returned without further attempts
    pub async fn deliver(&self, batch: &[Event]) -> DeliveryResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        self.circuit.reset_if_cooled_down();

        if let Some(remaining) = self.backoff_remaining() {
            return Err(DeliveryError::RateLimited {
                retry_after: Some(remaining),
            });
        }

        let token = self.tokens.token().await?;
        let payload = build_payload(&token, &self.descriptor, batch);
        let body = encode_body(&payload, batch.len(), self.config.gzip_threshold)?;

        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let url = self.next_url()?;
            match self.try_deliver(&url, &token, &body.bytes, body.gzipped).await {
                Ok(()) => {
                    self.circuit.record_success();
                    debug!(
                        url = %url,
                        attempt = attempt,
                        events = batch.len(),
                        gzipped = body.gzipped,
                        "Batch delivered"
                    );
                    return Ok(());
                }
                Err(e) if e.is_endpoint_failure() => {
                    self.circuit.record_failure(&self.endpoints);
                    warn!(
                        url = %url,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Delivery attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(DeliveryError::RateLimited { retry_after }) => {
                    let wait = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
                    let until = self
                        .clock
                        .now_millis()
                        .saturating_add(i64::try_from(wait.as_millis()).unwrap_or(i64::MAX));
                    *self.rate_limited_until.lock() = Some(until);
                    self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    warn!(url = %url, wait_secs = wait.as_secs(), "Collector rate limited");
                    return Err(DeliveryError::RateLimited { retry_after });
                }
                Err(e @ DeliveryError::Unauthorized { .. }) => {
                    self.counters.auth_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(url = %url, error = %e, "Collector rejected token, refreshing");
                    if let Err(refresh_err) = self.tokens.refresh().await {
                        warn!(error = %refresh_err, "Token refresh after auth failure failed");
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(DeliveryError::Server { status: 0 }))
    }

    fn next_url(&self) -> DeliveryResult<String> {
        if let Some(url) = &self.config.endpoint_override {
            return Ok(url.clone());
        }
        self.circuit
            .select(&self.endpoints)
            .map(|base| join_path(base, EVENTS_PATH))
            .ok_or_else(|| DeliveryError::Config("endpoint list is empty".to_string()))
    }

    /// One POST to one URL.
    async fn try_deliver(
        &self,
        url: &str,
        token: &DataToken,
        body: &[u8],
        gzipped: bool,
    ) -> DeliveryResult<()> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json; charset=utf-8")
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {}", token.bearer()))
            .body(body.to_vec());
        if gzipped {
            request = request
                .header("Content-Encoding", "gzip")
                .header("Accept-Encoding", "gzip");
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(DeliveryError::RateLimited {
                retry_after: parse_retry_after(response.headers(), Utc::now()),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DeliveryError::Unauthorized {
                status: status.as_u16(),
            }),
            s if s.is_server_error() => Err(DeliveryError::Server { status: s.as_u16() }),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(DeliveryError::Client {
                    status: s.as_u16(),
                    body,
                })
            }
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        let c = &self.counters;
        DeliveryStats {
            requests: c.requests.load(Ordering::Relaxed),
            delivered_batches: c.delivered_batches.load(Ordering::Relaxed),
            delivered_events: c.delivered_events.load(Ordering::Relaxed),
            failed_batches: c.failed_batches.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            auth_failures: c.auth_failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EventSender for HttpDeliveryClient {
    async fn send(&self, batch: &[Event], endpoint_tag: &str) -> bool {
        match self.deliver(batch).await {
            Ok(()) => {
                if !batch.is_empty() {
                    self.counters.delivered_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .delivered_events
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    info!(endpoint = endpoint_tag, events = batch.len(), "Harvest delivered");
                }
                true
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                warn!(
                    endpoint = endpoint_tag,
                    events = batch.len(),
                    error = %e,
                    "Harvest delivery failed"
                );
                false
            }
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        let mut until = self.rate_limited_until.lock();
        let deadline = (*until)?;
        let remaining = deadline.saturating_sub(self.clock.now_millis());
        if remaining <= 0 {
            *until = None;
            return None;
        }
        Some(Duration::from_millis(remaining as u64))
    }

    fn circuit_state(&self) -> Option<CircuitState> {
        Some(self.circuit.snapshot())
    }
}

/// Parse a `Retry-After` header given as delta-seconds or an RFC 2822 date.
///
/// Missing header yields `None`; an unreadable value yields [`DEFAULT_RETRY_AFTER`].
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().unwrap_or_default().trim();

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date_time) = DateTime::parse_from_rfc2822(raw) {
        let wait = date_time.with_timezone(&Utc) - now;
        return Some(wait.to_std().unwrap_or(Duration::ZERO));
    }

    Some(DEFAULT_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticTokenProvider;
    use harvest_config_and_utils::{AppIdentity, DeviceIdentity, ManualClock};
    use reqwest::header::HeaderValue;
    use serde_json::Map;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    /// Compares the raw `Authorization` value; the stock header matcher
    /// splits on commas, which the bearer format contains.
    struct AuthorizationIs(&'static str);

    impl Match for AuthorizationIs {
        fn matches(&self, request: &Request) -> bool {
            request
                .headers
                .get("Authorization")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value == self.0)
        }
    }

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| Event::new("CONTENT_HEARTBEAT", Map::new(), i as i64))
            .collect()
    }

    fn client_for(
        endpoints: RegionEndpoints,
        tokens: Arc<StaticTokenProvider>,
        clock: &ManualClock,
    ) -> HttpDeliveryClient {
        HttpDeliveryClient::new(
            DeliveryConfig::default(),
            &RegionTable::single("US", endpoints),
            tokens,
            DeviceDescriptor::new(AppIdentity::default(), DeviceIdentity::default()),
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    fn single_host(server: &MockServer) -> RegionEndpoints {
        RegionEndpoints::new(vec![server.uri()], Vec::new())
    }

    fn static_tokens() -> Arc<StaticTokenProvider> {
        Arc::new(StaticTokenProvider::new(DataToken::new(12, 34)))
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(EVENTS_PATH))
            .and(AuthorizationIs("Bearer 12,34"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let clock = ManualClock::default();
        let client = client_for(single_host(&server), static_tokens(), &clock);

        assert!(client.send(&events(3), "ondemand").await);
        let stats = client.stats();
        assert_eq!(stats.delivered_batches, 1);
        assert_eq!(stats.delivered_events, 3);
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let clock = ManualClock::default();
        let client = client_for(single_host(&server), static_tokens(), &clock);
        assert!(client.send(&[], "live").await);
    }

    #[tokio::test]
    async fn test_large_batch_is_gzip_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Content-Encoding", "gzip"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let clock = ManualClock::default();
        let client = client_for(single_host(&server), static_tokens(), &clock);
        assert!(client.send(&events(11), "ondemand").await);
    }

    #[tokio::test]
    async fn test_server_errors_fail_over_to_backup() {
        let primary = MockServer::start().await;
        let backup = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&primary)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&backup)
            .await;

        let clock = ManualClock::default();
        let client = client_for(
            RegionEndpoints::new(vec![primary.uri()], vec![backup.uri()]),
            static_tokens(),
            &clock,
        );

        assert!(!client.send(&events(1), "ondemand").await);
        let state = client.circuit_state().unwrap();
        assert!(state.using_backup_domains);
        assert_eq!(state.consecutive_failures, 3);

        assert!(client.send(&events(1), "ondemand").await);
        assert_eq!(client.circuit_state().unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_circuit_resets_to_primary_after_cooldown() {
        let primary = MockServer::start().await;
        let backup = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .mount(&primary)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&primary)
            .await;

        let clock = ManualClock::default();
        let client = client_for(
            RegionEndpoints::new(vec![primary.uri()], vec![backup.uri()]),
            static_tokens(),
            &clock,
        );

        assert!(!client.send(&events(1), "ondemand").await);
        assert!(client.circuit_state().unwrap().using_backup_domains);

        clock.advance(DEFAULT_COOLDOWN + Duration::from_secs(1));
        assert!(client.send(&events(1), "ondemand").await);

        let state = client.circuit_state().unwrap();
        assert!(!state.using_backup_domains);
        assert_eq!(state.primary_index, 0);
    }

    #[tokio::test]
    async fn test_rate_limited_records_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "120"))
            .expect(1)
            .mount(&server)
            .await;

        let clock = ManualClock::default();
        let client = client_for(single_host(&server), static_tokens(), &clock);

        let err = client.deliver(&events(1)).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(120)
        ));
        assert_eq!(client.backoff_remaining(), Some(Duration::from_secs(120)));

        // Refused locally while the window is open.
        assert!(!client.send(&events(1), "ondemand").await);

        clock.advance(Duration::from_secs(120));
        assert_eq!(client.backoff_remaining(), None);
        assert_eq!(client.stats().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_token_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let clock = ManualClock::default();
        let tokens = static_tokens();
        let client = client_for(single_host(&server), tokens.clone(), &clock);

        let err = client.deliver(&events(1)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Unauthorized { status: 401 }));
        assert_eq!(tokens.refresh_count(), 1);
        assert_eq!(client.circuit_state().unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
            .expect(1)
            .mount(&server)
            .await;

        let clock = ManualClock::default();
        let client = client_for(single_host(&server), static_tokens(), &clock);

        let err = client.deliver(&events(1)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Client { status: 400, ref body } if body == "bad payload"));
    }

    #[tokio::test]
    async fn test_endpoint_override_bypasses_region_table() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/custom/ingest"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let clock = ManualClock::default();
        let config = DeliveryConfig {
            endpoint_override: Some(format!("{}/custom/ingest", server.uri())),
            ..DeliveryConfig::default()
        };
        let client = HttpDeliveryClient::new(
            config,
            &RegionTable::new("US"),
            static_tokens(),
            DeviceDescriptor::new(AppIdentity::default(), DeviceIdentity::default()),
            Arc::new(clock),
        )
        .unwrap();

        assert!(client.send(&events(2), "live").await);
    }

    #[test]
    fn test_unknown_region_without_fallback_fails() {
        let clock = ManualClock::default();
        let result = HttpDeliveryClient::new(
            DeliveryConfig::default(),
            &RegionTable::new("US"),
            static_tokens(),
            DeviceDescriptor::new(AppIdentity::default(), DeviceIdentity::default()),
            Arc::new(clock),
        );
        assert!(matches!(result, Err(DeliveryError::Config(_))));
    }

    #[test]
    fn test_retry_after_parsing() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers, now), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers, now), Some(DEFAULT_RETRY_AFTER));

        let future = (now + chrono::Duration::seconds(90)).to_rfc2822();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&future).unwrap());
        let parsed = parse_retry_after(&headers, now).unwrap();
        assert!(parsed <= Duration::from_secs(90) && parsed >= Duration::from_secs(89));

        let past = (now - chrono::Duration::seconds(90)).to_rfc2822();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&past).unwrap());
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::ZERO));
    }
}
