//! Configuration for every part of the client.
//!
//! Every section has defaults so a configuration file only needs to list what it changes:
//!
//! ```hcl
//! hub {
//!   url = "https://tech-test.raintor.com/Hub"
//! }
//! cache {
//!   precision = 4
//!   ttl_secs  = 300
//! }
//! ```
//!
use std::time::Duration;

use clap::{crate_name, crate_version};
use serde::Deserialize;

use crate::ReconnectPolicy;

/// Default hub endpoint
pub const DEF_HUB: &str = "https://tech-test.raintor.com/Hub";
/// Default reverse geocoding service
pub const DEF_GEOCODER: &str = "https://nominatim.openstreetmap.org";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub hub: HubConfig,
    pub reconnect: ReconnectPolicy,
    pub geocoder: GeocoderConfig,
    pub cache: CacheConfig,
    pub emitter: EmitterConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Hub URL, `http(s)` or `ws(s)`
    pub url: String,
    /// Bound on establishing one transport, handshake included
    pub connect_timeout_ms: u64,
    /// Bound on waiting for the hub to acknowledge a send
    pub invoke_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: DEF_HUB.to_owned(),
            connect_timeout_ms: 15_000,
            invoke_timeout_ms: 10_000,
        }
    }
}

impl HubConfig {
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,
    /// Per request bound, enforced by the HTTP client
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: DEF_GEOCODER.to_owned(),
            timeout_ms: 10_000,
            user_agent: format!("{}/{}", crate_name!(), crate_version!()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Decimal places kept in the cache key
    pub precision: u32,
    /// Maximum number of cached places (and of cached failures)
    pub capacity: u64,
    /// How long a resolved place stays valid
    pub ttl_secs: u64,
    /// How long a failure is remembered before trying again
    pub negative_ttl_secs: u64,
    /// Hard bound on one lookup, whatever the geocoder does
    pub lookup_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            precision: 4,
            capacity: 1_024,
            ttl_secs: 300,
            negative_ttl_secs: 30,
            lookup_timeout_ms: 10_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmitterConfig {
    pub interval_ms: u64,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(DEF_HUB, cfg.hub.url);
        assert_eq!(4, cfg.cache.precision);
        assert_eq!(300, cfg.cache.ttl_secs);
        assert_eq!(5_000, cfg.emitter.interval_ms);
        assert_eq!(4, cfg.reconnect.max_attempts);
        assert!(cfg.geocoder.user_agent.starts_with("geoshare-client/"));
    }

    #[test]
    fn test_partial_json() {
        let cfg: ClientConfig =
            serde_json::from_str(r#"{"cache": {"precision": 3}, "hub": {"url": "ws://localhost/Hub"}}"#)
                .unwrap();
        assert_eq!(3, cfg.cache.precision);
        assert_eq!(1_024, cfg.cache.capacity);
        assert_eq!("ws://localhost/Hub", cfg.hub.url);
        assert_eq!(15_000, cfg.hub.connect_timeout_ms);
    }
}
