//! Regional collector endpoint table.

use std::collections::HashMap;

/// Path of the event ingestion endpoint on every collector host.
pub const EVENTS_PATH: &str = "/mobile/v1/events";

/// Path of the token connect endpoint.
pub const CONNECT_PATH: &str = "/mobile/v5/connect";

/// Region used when a code is unknown.
pub const DEFAULT_REGION: &str = "US";

/// Ordered collector base URLs for one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEndpoints {
    /// Round-robined during normal operation.
    pub primary: Vec<String>,
    /// Round-robined while the circuit is open.
    pub backup: Vec<String>,
}

impl RegionEndpoints {
    pub fn new(primary: Vec<String>, backup: Vec<String>) -> Self {
        Self { primary, backup }
    }
}

/// Region code to endpoint lists.
#[derive(Debug, Clone)]
pub struct RegionTable {
    regions: HashMap<String, RegionEndpoints>,
    default_region: String,
}

impl RegionTable {
    /// Empty table with the given fallback region.
    pub fn new(default_region: &str) -> Self {
        Self {
            regions: HashMap::new(),
            default_region: default_region.to_ascii_uppercase(),
        }
    }

    /// Table with a single region that is also the fallback.
    pub fn single(region: &str, endpoints: RegionEndpoints) -> Self {
        Self::new(region).with_region(region, endpoints)
    }

    /// Add or replace a region.
    pub fn with_region(mut self, code: &str, endpoints: RegionEndpoints) -> Self {
        self.regions.insert(code.to_ascii_uppercase(), endpoints);
        self
    }

    /// Endpoints for a region code; unknown codes fall back to the default region.
    ///
    /// Returns `None` only when the fallback region itself is missing.
    pub fn resolve(&self, code: &str) -> Option<&RegionEndpoints> {
        self.regions
            .get(&code.to_ascii_uppercase())
            .or_else(|| self.regions.get(&self.default_region))
    }

    /// Token connect URL for a region: first primary host plus the connect path.
    pub fn connect_url(&self, code: &str) -> Option<String> {
        self.resolve(code)
            .and_then(|endpoints| endpoints.primary.first())
            .map(|base| join_path(base, CONNECT_PATH))
    }
}

impl Default for RegionTable {
    fn default() -> Self {
        let backup = vec![
            "https://mobile-collector-backup.newrelic.com".to_string(),
            "https://mobile-collector-fallback.newrelic.com".to_string(),
        ];

        Self::new(DEFAULT_REGION)
            .with_region(
                "US",
                RegionEndpoints::new(
                    vec![
                        "https://mobile-collector.newrelic.com".to_string(),
                        "https://mobile-collector-01.newrelic.com".to_string(),
                        "https://mobile-collector-02.newrelic.com".to_string(),
                    ],
                    backup.clone(),
                ),
            )
            .with_region(
                "EU",
                RegionEndpoints::new(
                    vec!["https://mobile-collector.eu.newrelic.com".to_string()],
                    backup,
                ),
            )
    }
}

/// Append a path to a base URL without doubling the slash.
pub fn join_path(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
