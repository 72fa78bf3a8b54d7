//! `geosharectl` configuration file.
//!
//! ```hcl
//! version = 1
//!
//! hub {
//!   url = "https://tech-test.raintor.com/Hub"
//! }
//! emitter {
//!   interval_ms = 5000
//! }
//! ```
//!
//! Every block is optional.
//!
use std::path::Path;

use eyre::Result;
use serde::Deserialize;
use tracing::debug;

use geoshare_client::{
    CacheConfig, ClientConfig, EmitterConfig, GeocoderConfig, HubConfig, ReconnectPolicy,
};
use geoshare_common::{ConfigFile, Versioned};

/// Current version
pub const CVERSION: usize = 1;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub version: usize,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: CVERSION,
            hub: HubConfig::default(),
            reconnect: ReconnectPolicy::default(),
            geocoder: GeocoderConfig::default(),
            cache: CacheConfig::default(),
            emitter: EmitterConfig::default(),
        }
    }
}

impl Versioned for Config {
    const VERSION: usize = CVERSION;

    fn version(&self) -> usize {
        self.version
    }
}

impl Config {
    /// Load the given file, or the default one if present, or use defaults.
    ///
    #[tracing::instrument]
    pub fn load(fname: Option<&Path>) -> Result<Config> {
        let cfg = ConfigFile::<Config>::load(fname)?.into_inner();
        debug!("config = {cfg:?}");
        Ok(cfg)
    }
}

impl From<Config> for ClientConfig {
    fn from(cfg: Config) -> Self {
        ClientConfig {
            hub: cfg.hub,
            reconnect: cfg.reconnect,
            geocoder: cfg.geocoder,
            cache: cfg.cache,
            emitter: cfg.emitter,
        }
    }
}
