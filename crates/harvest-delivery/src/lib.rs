//! Collector delivery for the harvest pipeline.
//!
//! This crate provides:
//! - HttpDeliveryClient: batch POSTs with gzip, token auth and bounded immediate retries
//! - CircuitBreaker: primary/backup endpoint failover with a cooldown reset
//! - RegionTable: per-region collector host lists
//! - TokenProvider / ConnectTokenManager: data token acquisition and caching
//! - TokenCache / FileTokenCache: the last issued token, kept across restarts
//! - EventSender: the seam the pipeline delivers through

mod circuit;
mod client;
mod error;
mod payload;
mod region;
mod token;

pub use circuit::{CircuitBreaker, CircuitState, DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD};
pub use client::{
    parse_retry_after, DeliveryConfig, DeliveryStats, EventSender, HttpDeliveryClient,
    DEFAULT_RETRY_AFTER,
};
pub use error::{DeliveryError, DeliveryResult};
pub use payload::{build_payload, encode_body, DeviceDescriptor, EncodedBody, GZIP_THRESHOLD};
pub use region::{join_path, RegionEndpoints, RegionTable, CONNECT_PATH, DEFAULT_REGION, EVENTS_PATH};
pub use token::{
    CachedToken, ConnectTokenManager, DataToken, FileTokenCache, MemoryTokenCache,
    StaticTokenProvider, TokenCache, TokenProvider, TOKEN_VALIDITY,
};
