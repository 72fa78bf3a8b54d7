//! Real-time coordinate stream client.
//!
//! A sender publishes its position on a hub, receivers get every position published by the
//! others and turn the latest one into a place name through a reverse geocoder.
//!
//! The pieces, leaves first:
//!
//! - `GeoLookupCache` caches reverse lookups per rounded coordinate and merges concurrent
//!   identical requests,
//! - `ReverseResolvePipeline` resolves the current coordinate and drops results for
//!   coordinates that are not current anymore,
//! - `ChannelConnection` owns the connection to the hub and its state machine,
//! - `CoordinateStreamClient` puts all of these together,
//! - `PeriodicEmitter` publishes our own position at a fixed cadence.
//!
//! Hub transports (`SignalRConnector`, `MemoryHub`) and geocoders (`NominatimGeocoder`) are
//! behind the `HubConnector` and `ReverseGeocoder` traits.
//!

use clap::{crate_name, crate_version};

// Re-export these modules for a shorter import path.
//
pub use cache::*;
pub use config::*;
pub use connection::*;
pub use emitter::*;
pub use error::*;
pub use geocode::*;
pub use hub::*;
pub use location::*;
pub use pipeline::*;
pub use reconnect::*;
pub use state::*;
pub use stats::*;
pub use stream::*;

mod cache;
mod config;
mod connection;
mod emitter;
mod error;
mod geocode;
mod hub;
mod location;
mod pipeline;
mod reconnect;
mod state;
mod stats;
mod stream;

const NAME: &str = crate_name!();
const VERSION: &str = crate_version!();

pub fn version() -> String {
    format!("{}/{}", NAME, VERSION)
}
