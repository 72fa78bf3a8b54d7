//! Reverse geocoding seam.
//!
//! Anything able to turn a latitude/longitude pair into a `Place` can back the lookup cache.
//! The only implementation shipped is `NominatimGeocoder`.
//!
use std::fmt::Debug;

use async_trait::async_trait;

use crate::{LookupError, Place};

mod nominatim;

pub use nominatim::*;

#[async_trait]
pub trait ReverseGeocoder: Debug + Send + Sync {
    /// Describe what is at this spot.
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<Place, LookupError>;
}
