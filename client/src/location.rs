//! Location related module
//!
//! - `Coordinate` is what travels through the hub, one new value per send or receive.
//! - `Place` is what the reverse geocoder tells us about a spot.
//! - `ResolvedLocation` ties both together for the consumers.
//! - `Resolution` is the consumer-visible state of the resolve pipeline.
//!
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoordinateError, LookupError};

/// One geographic sample.
///
/// Fields are private so a `Coordinate` is always within range and never changes after
/// creation.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
    /// Who emitted it (the hub `userName`)
    source_id: String,
    captured_at: DateTime<Utc>,
}

/// Unchecked form, only used on the way in.
///
#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
    source_id: String,
    captured_at: DateTime<Utc>,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = CoordinateError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Coordinate::at(raw.latitude, raw.longitude, &raw.source_id, raw.captured_at)
    }
}

impl Coordinate {
    /// Create a new sample timestamped now.
    ///
    pub fn new(latitude: f64, longitude: f64, source_id: &str) -> Result<Self, CoordinateError> {
        Self::at(latitude, longitude, source_id, Utc::now())
    }

    /// Create a new sample with an explicit capture time.
    ///
    pub fn at(
        latitude: f64,
        longitude: f64,
        source_id: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, CoordinateError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::Latitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::Longitude(longitude));
        }
        Ok(Coordinate {
            latitude,
            longitude,
            source_id: source_id.to_owned(),
            captured_at,
        })
    }

    #[inline]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[inline]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    #[inline]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    #[inline]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Key of the cache cell this coordinate falls into.
    ///
    pub fn cell(&self, precision: u32) -> CellKey {
        CellKey::new(self.latitude, self.longitude, precision)
    }
}

impl Display for Coordinate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Coordinates rounded to `precision` decimal places, stored as scaled integers so they can
/// be hashed.  4 places is roughly 11m at the equator.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CellKey {
    lat: i64,
    lon: i64,
}

impl CellKey {
    pub fn new(latitude: f64, longitude: f64, precision: u32) -> Self {
        let scale = 10f64.powi(precision as i32);
        CellKey {
            lat: (latitude * scale).round() as i64,
            lon: (longitude * scale).round() as i64,
        }
    }
}

/// What the reverse geocoder knows about a spot.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub display_name: String,
    pub category: Option<String>,
    pub address_type: Option<String>,
}

/// A coordinate together with its place description.
///
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolvedLocation {
    pub coordinate: Coordinate,
    pub display_name: String,
    pub category: Option<String>,
    pub address_type: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedLocation {
    pub fn new(coordinate: Coordinate, place: Place, resolved_at: DateTime<Utc>) -> Self {
        ResolvedLocation {
            coordinate,
            display_name: place.display_name,
            category: place.category,
            address_type: place.address_type,
            resolved_at,
        }
    }

    /// "category / type" the way the receiver displays it, if we have either.
    ///
    pub fn kind(&self) -> Option<String> {
        match (&self.category, &self.address_type) {
            (Some(c), Some(t)) => Some(format!("{c} / {t}")),
            (Some(c), None) => Some(c.clone()),
            (None, Some(t)) => Some(t.clone()),
            (None, None) => None,
        }
    }
}

/// Consumer-visible state of the latest resolution.
///
/// `Failed` is terminal for its coordinate and distinct from `Pending`, it also carries the
/// last good location so a display can keep showing it.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Resolution {
    /// Nothing submitted yet
    #[default]
    Idle,
    /// Lookup in progress for this coordinate
    Pending { coordinate: Coordinate },
    /// Latest coordinate resolved
    Resolved(ResolvedLocation),
    /// Latest coordinate could not be resolved
    Failed {
        coordinate: Coordinate,
        reason: LookupError,
        last_good: Option<ResolvedLocation>,
    },
}

impl Resolution {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Resolution::Pending { .. })
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self, Resolution::Resolved(_) | Resolution::Failed { .. })
    }

    /// Coordinate this state refers to.
    ///
    pub fn coordinate(&self) -> Option<&Coordinate> {
        match self {
            Resolution::Idle => None,
            Resolution::Pending { coordinate } => Some(coordinate),
            Resolution::Resolved(loc) => Some(&loc.coordinate),
            Resolution::Failed { coordinate, .. } => Some(coordinate),
        }
    }

    pub fn location(&self) -> Option<&ResolvedLocation> {
        match self {
            Resolution::Resolved(loc) => Some(loc),
            _ => None,
        }
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Idle => write!(f, "Waiting for update..."),
            Resolution::Pending { .. } => write!(f, "Fetching..."),
            Resolution::Resolved(loc) => write!(f, "{}", loc.display_name),
            Resolution::Failed { reason, .. } => write!(f, "Failed to fetch: {reason}"),
        }
    }
}
