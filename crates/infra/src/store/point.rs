use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use geobus_core::VehicleEvent;

/// Measurement every vehicle position is written under.
pub const MEASUREMENT: &str = "vehicle_position";

/// Identifying and categorical attributes, stored as indexed tags.
pub const TAG_KEYS: [&str; 10] = [
    "vehicle_id",
    "mode",
    "route_id",
    "trip_id",
    "trip_headsign",
    "next_stop",
    "geohash_head",
    "geohash_first",
    "geohash_second",
    "geohash_third",
];

/// Remaining attributes, stored as string fields.
pub const FIELD_KEYS: [&str; 9] = [
    "feed_format",
    "message_type",
    "feed_id",
    "agency_id",
    "agency_name",
    "direction_id",
    "start_time",
    "short_name",
    "color",
];

/// One stored point: a vehicle event split into tags and fields, stamped at ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPoint {
    pub measurement: &'static str,
    pub tags: BTreeMap<&'static str, String>,
    pub fields: BTreeMap<&'static str, String>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryPoint {
    pub fn from_event(event: &VehicleEvent, timestamp: DateTime<Utc>) -> Self {
        let pick = |keys: &[&'static str]| {
            keys.iter()
                .map(|k| (*k, attribute(event, k).unwrap_or_default().to_string()))
                .collect::<BTreeMap<_, _>>()
        };

        Self {
            measurement: MEASUREMENT,
            tags: pick(&TAG_KEYS[..]),
            fields: pick(&FIELD_KEYS[..]),
            timestamp,
        }
    }

    pub fn tag(&self, key: TagKey) -> Option<&str> {
        self.tags.get(key.as_str()).map(String::as_str)
    }

    pub fn to_event(&self) -> VehicleEvent {
        event_from_pairs(
            self.tags
                .iter()
                .chain(self.fields.iter())
                .map(|(k, v)| (*k, v.as_str())),
        )
    }
}

/// Rebuild an event from `(column, value)` pairs; unknown columns are ignored and
/// missing ones stay empty.
pub fn event_from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> VehicleEvent {
    let mut event = VehicleEvent::default();
    for (key, value) in pairs {
        let slot = match key {
            "feed_format" => &mut event.feed_format,
            "message_type" => &mut event.message_type,
            "feed_id" => &mut event.feed_id,
            "agency_id" => &mut event.agency_id,
            "agency_name" => &mut event.agency_name,
            "mode" => &mut event.mode,
            "route_id" => &mut event.route_id,
            "direction_id" => &mut event.direction_id,
            "trip_headsign" => &mut event.trip_headsign,
            "trip_id" => &mut event.trip_id,
            "next_stop" => &mut event.next_stop,
            "start_time" => &mut event.start_time,
            "vehicle_id" => &mut event.vehicle_id,
            "geohash_head" => &mut event.geohash_head,
            "geohash_first" => &mut event.geohash_first,
            "geohash_second" => &mut event.geohash_second,
            "geohash_third" => &mut event.geohash_third,
            "short_name" => &mut event.short_name,
            "color" => &mut event.color,
            _ => continue,
        };
        *slot = value.to_string();
    }
    event
}

fn attribute<'a>(event: &'a VehicleEvent, key: &str) -> Option<&'a str> {
    let value = match key {
        "feed_format" => &event.feed_format,
        "message_type" => &event.message_type,
        "feed_id" => &event.feed_id,
        "agency_id" => &event.agency_id,
        "agency_name" => &event.agency_name,
        "mode" => &event.mode,
        "route_id" => &event.route_id,
        "direction_id" => &event.direction_id,
        "trip_headsign" => &event.trip_headsign,
        "trip_id" => &event.trip_id,
        "next_stop" => &event.next_stop,
        "start_time" => &event.start_time,
        "vehicle_id" => &event.vehicle_id,
        "geohash_head" => &event.geohash_head,
        "geohash_first" => &event.geohash_first,
        "geohash_second" => &event.geohash_second,
        "geohash_third" => &event.geohash_third,
        "short_name" => &event.short_name,
        "color" => &event.color,
        _ => return None,
    };
    Some(value.as_str())
}

/// Tags a range query can filter on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TagKey {
    GeohashHead,
    NextStop,
    VehicleId,
}

impl TagKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeohashHead => "geohash_head",
            Self::NextStop => "next_stop",
            Self::VehicleId => "vehicle_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: TagKey,
    pub value: String,
}

/// Points of [`MEASUREMENT`] written within `window` of now whose tag equals a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub window: Duration,
    pub tag: TagFilter,
}

impl RangeQuery {
    pub fn tag_equals(key: TagKey, value: impl Into<String>, window: Duration) -> Self {
        Self {
            window,
            tag: TagFilter {
                key,
                value: value.into(),
            },
        }
    }
}
