//! Topic codec: vehicle topics in, geographic subscription filters out.
//!
//! Topic grammar (20 `/`-separated segments, the first one empty):
//!
//! ```text
//! /<feedFormat>/<type>/<feedId>/<agencyId>/<agencyName>/<mode>/<routeId>/<directionId>
//!  /<tripHeadsign>/<tripId>/<nextStop>/<startTime>/<vehicleId>/<geoHead>
//!  /<geoFirst>/<geoSecond>/<geoThird>/<shortName>/<color>
//! ```
//!
//! Filters follow MQTT wildcard rules: `+` matches exactly one level, `#` matches
//! all remaining levels and may only appear last.

use core::fmt;
use core::str::FromStr;

use crate::error::TopicError;
use crate::geo::{GeoCell, GeoHash, MAX_PRECISION};
use crate::vehicle::VehicleEvent;

pub const SEGMENT_DELIMITER: char = '/';

/// Segments in a valid vehicle topic, counting the empty leading one.
pub const SEGMENT_COUNT: usize = 20;

/// Position of the geohash head (`"lat;lon"`) in a vehicle topic.
pub const GEOHASH_HEAD_INDEX: usize = 14;

/// Digit groups following the geohash head.
pub const GEOHASH_DIGIT_GROUPS: usize = 3;

const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";

/// Levels in an encoded live filter: every topic level up to the last digit group,
/// then `#` for the rest.
pub const FILTER_LEVEL_COUNT: usize = GEOHASH_HEAD_INDEX + GEOHASH_DIGIT_GROUPS + 2;

/// Build the live filter for everything inside the cell containing `(lat, lon)`.
///
/// `+` everywhere except the cell literal, then a trailing `#`.
pub fn encode(latitude: f64, longitude: f64) -> TopicFilter {
    encode_cell(GeoCell::from_coordinates(latitude, longitude))
}

pub fn encode_cell(cell: GeoCell) -> TopicFilter {
    build_filter(cell.to_string(), Vec::new())
}

/// Like [`encode_cell`], additionally pinning the first `precision` digit groups.
///
/// Precision is clamped to the number of digit groups a topic carries.
pub fn encode_with_precision(hash: &GeoHash, precision: u8) -> TopicFilter {
    let pinned = usize::from(precision.min(MAX_PRECISION)).min(GEOHASH_DIGIT_GROUPS);
    let groups = (0..pinned).filter_map(|i| hash.group(i)).collect();
    build_filter(hash.cell().to_string(), groups)
}

fn build_filter(head: String, pinned: Vec<String>) -> TopicFilter {
    let wildcard = || SINGLE_LEVEL_WILDCARD.to_string();
    let unpinned = GEOHASH_DIGIT_GROUPS.saturating_sub(pinned.len());

    let mut levels: Vec<String> = Vec::with_capacity(FILTER_LEVEL_COUNT);
    levels.push(String::new());
    levels.extend(std::iter::repeat_with(wildcard).take(GEOHASH_HEAD_INDEX - 1));
    levels.push(head);
    levels.extend(pinned);
    levels.extend(std::iter::repeat_with(wildcard).take(unpinned));
    levels.push(MULTI_LEVEL_WILDCARD.to_string());
    TopicFilter(levels.join("/"))
}

/// Decode a vehicle topic.
///
/// Succeeds iff the topic has exactly [`SEGMENT_COUNT`] segments; each segment is
/// copied verbatim into its field.
pub fn decode(topic: &str) -> Result<VehicleEvent, TopicError> {
    let segments: Vec<&str> = topic.split(SEGMENT_DELIMITER).collect();
    let found = segments.len();

    let [
        _,
        feed_format,
        message_type,
        feed_id,
        agency_id,
        agency_name,
        mode,
        route_id,
        direction_id,
        trip_headsign,
        trip_id,
        next_stop,
        start_time,
        vehicle_id,
        geohash_head,
        geohash_first,
        geohash_second,
        geohash_third,
        short_name,
        color,
    ]: [&str; SEGMENT_COUNT] = segments.try_into().map_err(|_| TopicError::Malformed {
        expected: SEGMENT_COUNT,
        found,
    })?;

    Ok(VehicleEvent {
        feed_format: feed_format.to_string(),
        message_type: message_type.to_string(),
        feed_id: feed_id.to_string(),
        agency_id: agency_id.to_string(),
        agency_name: agency_name.to_string(),
        mode: mode.to_string(),
        route_id: route_id.to_string(),
        direction_id: direction_id.to_string(),
        trip_headsign: trip_headsign.to_string(),
        trip_id: trip_id.to_string(),
        next_stop: next_stop.to_string(),
        start_time: start_time.to_string(),
        vehicle_id: vehicle_id.to_string(),
        geohash_head: geohash_head.to_string(),
        geohash_first: geohash_first.to_string(),
        geohash_second: geohash_second.to_string(),
        geohash_third: geohash_third.to_string(),
        short_name: short_name.to_string(),
        color: color.to_string(),
    })
}

impl VehicleEvent {
    /// Rebuild the topic this event was decoded from.
    pub fn to_topic(&self) -> String {
        [
            "",
            &self.feed_format,
            &self.message_type,
            &self.feed_id,
            &self.agency_id,
            &self.agency_name,
            &self.mode,
            &self.route_id,
            &self.direction_id,
            &self.trip_headsign,
            &self.trip_id,
            &self.next_stop,
            &self.start_time,
            &self.vehicle_id,
            &self.geohash_head,
            &self.geohash_first,
            &self.geohash_second,
            &self.geohash_third,
            &self.short_name,
            &self.color,
        ]
        .join("/")
    }
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(raw: impl Into<String>) -> Result<Self, TopicError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(invalid(raw, "filter is empty"));
        }

        let level_count = raw.split(SEGMENT_DELIMITER).count();
        for (idx, level) in raw.split(SEGMENT_DELIMITER).enumerate() {
            if level.contains(MULTI_LEVEL_WILDCARD) {
                if level != MULTI_LEVEL_WILDCARD {
                    return Err(invalid(raw, "'#' must occupy a whole level"));
                }
                if idx + 1 != level_count {
                    return Err(invalid(raw, "'#' must be the last level"));
                }
            }
            if level.contains(SINGLE_LEVEL_WILDCARD) && level != SINGLE_LEVEL_WILDCARD {
                return Err(invalid(raw, "'+' must occupy a whole level"));
            }
        }

        Ok(Self(raw))
    }

    /// Filter matching every topic.
    pub fn all() -> Self {
        Self(MULTI_LEVEL_WILDCARD.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// MQTT topic matching.
    ///
    /// Topics starting with `$` are reserved and never matched by a leading wildcard.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$')
            && (self.0.starts_with(SINGLE_LEVEL_WILDCARD) || self.0.starts_with(MULTI_LEVEL_WILDCARD))
        {
            return false;
        }

        let mut filter_levels = self.0.split(SEGMENT_DELIMITER);
        let mut topic_levels = topic.split(SEGMENT_DELIMITER);

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                (Some(MULTI_LEVEL_WILDCARD), _) => return true,
                (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
                (Some(expected), Some(actual)) if expected == actual => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

fn invalid(filter: String, reason: &'static str) -> TopicError {
    TopicError::InvalidFilter { filter, reason }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicFilter {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TopicFilter {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}
