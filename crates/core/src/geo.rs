//! Coarse spatial bucketing of coordinates.
//!
//! Vehicle topics carry the position as a *geohash head* (`"<latInt>;<lonInt>"`,
//! integer degrees, ~111 km resolution) followed by digit groups that refine it.
//! Group `k` is the `k`-th fractional digit of the latitude followed by the `k`-th
//! fractional digit of the longitude, so three groups narrow a cell down to
//! roughly 110 m.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult, TopicError};

/// Number of fractional digits kept per axis.
const FRACTION_DIGITS: usize = 6;

/// Maximum number of digit groups a live filter may pin.
pub const MAX_PRECISION: u8 = 3;

/// Integer-degree spatial bucket, formatted as `"lat;lon"`.
///
/// Two coordinates fall into the same cell iff their truncated integer degrees match.
/// Negative values keep their sign (`-33.86, 151.2` → `"-33;151"`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GeoCell {
    lat: i64,
    lon: i64,
}

impl GeoCell {
    pub fn new(lat: i64, lon: i64) -> Self {
        Self { lat, lon }
    }

    /// Bucket a coordinate pair.
    ///
    /// Values are rounded to six decimals before truncation so the cell always agrees
    /// with the digit groups of [`GeoHash`]. Non-finite input saturates instead of
    /// failing; callers validate coordinates first (see [`ClientCoordinates::validate`]).
    pub fn from_coordinates(latitude: f64, longitude: f64) -> Self {
        let (lat, _) = split_degrees(latitude);
        let (lon, _) = split_degrees(longitude);
        Self { lat, lon }
    }
}

impl fmt::Display for GeoCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.lat, self.lon)
    }
}

impl FromStr for GeoCell {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TopicError::InvalidGeohashHead(s.to_string());
        let (lat, lon) = s.split_once(';').ok_or_else(invalid)?;
        let lat = lat.parse().map_err(|_| invalid())?;
        let lon = lon.parse().map_err(|_| invalid())?;
        Ok(Self { lat, lon })
    }
}

/// A [`GeoCell`] plus the fractional digits that refine it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoHash {
    cell: GeoCell,
    lat_digits: [u8; FRACTION_DIGITS],
    lon_digits: [u8; FRACTION_DIGITS],
}

impl GeoHash {
    pub fn from_coordinates(latitude: f64, longitude: f64) -> Self {
        let (lat, lat_digits) = split_degrees(latitude);
        let (lon, lon_digits) = split_degrees(longitude);
        Self {
            cell: GeoCell { lat, lon },
            lat_digits,
            lon_digits,
        }
    }

    pub fn cell(&self) -> GeoCell {
        self.cell
    }

    /// Digit group `index` (0-based) as it appears in a topic segment, e.g. `"19"`.
    ///
    /// Returns `None` past the sixth fractional digit.
    pub fn group(&self, index: usize) -> Option<String> {
        let lat = self.lat_digits.get(index)?;
        let lon = self.lon_digits.get(index)?;
        Some(format!("{lat}{lon}"))
    }
}

/// Coordinates supplied by a live client during the handshake.
///
/// Wire form: `{"latitude": 60.17, "longitude": 24.94}` with an optional
/// `"precision"` (0-3) selecting how many digit groups the live filter pins.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCoordinates {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub precision: u8,
}

impl ClientCoordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            precision: 0,
        }
    }

    pub fn with_precision(mut self, precision: u8) -> Self {
        self.precision = precision;
        self
    }

    /// Reject coordinates that cannot name a place on Earth.
    pub fn validate(&self) -> DomainResult<()> {
        validate_coordinate("latitude", self.latitude, 90.0)?;
        validate_coordinate("longitude", self.longitude, 180.0)?;
        if self.precision > MAX_PRECISION {
            return Err(DomainError::validation(format!(
                "precision must be between 0 and {MAX_PRECISION}, got {}",
                self.precision
            )));
        }
        Ok(())
    }

    pub fn geo_hash(&self) -> GeoHash {
        GeoHash::from_coordinates(self.latitude, self.longitude)
    }
}

/// Check that a coordinate is finite and within `[-limit, limit]`.
pub fn validate_coordinate(name: &str, value: f64, limit: f64) -> DomainResult<()> {
    if !value.is_finite() {
        return Err(DomainError::validation(format!("{name} must be a finite number")));
    }
    if value.abs() > limit {
        return Err(DomainError::validation(format!(
            "{name} must be between -{limit} and {limit}, got {value}"
        )));
    }
    Ok(())
}

/// Split a coordinate into signed integer degrees and six fractional digits.
fn split_degrees(value: f64) -> (i64, [u8; FRACTION_DIGITS]) {
    // `as` saturates on overflow and maps NaN to zero.
    let micro = (value.abs() * 1_000_000.0).round() as u64;
    let whole = (micro / 1_000_000) as i64;
    let mut fraction = micro % 1_000_000;

    let mut digits = [0u8; FRACTION_DIGITS];
    for slot in digits.iter_mut().rev() {
        *slot = (fraction % 10) as u8;
        fraction /= 10;
    }

    let whole = if value.is_sign_negative() { -whole } else { whole };
    (whole, digits)
}
