//! Normalized vehicle-position record.

use serde::{Deserialize, Serialize};

/// One vehicle-position update, decoded from a broker topic.
///
/// All attributes are opaque strings exactly as they appeared in the topic; no
/// semantic validation happens at decode time.
///
/// Serialized with camelCase keys. The PascalCase keys of older feed clients
/// (`VehicleID`, `Type`, `GeohashFirstDeg`, ...) are accepted on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VehicleEvent {
    #[serde(alias = "FeedFormat")]
    pub feed_format: String,
    #[serde(alias = "Type")]
    pub message_type: String,
    #[serde(alias = "FeedID")]
    pub feed_id: String,
    #[serde(alias = "AgencyID")]
    pub agency_id: String,
    #[serde(alias = "AgencyName")]
    pub agency_name: String,
    #[serde(alias = "Mode")]
    pub mode: String,
    #[serde(alias = "RouteID")]
    pub route_id: String,
    #[serde(alias = "DirectionID")]
    pub direction_id: String,
    #[serde(alias = "TripHeadsign")]
    pub trip_headsign: String,
    #[serde(alias = "TripID")]
    pub trip_id: String,
    #[serde(alias = "NextStop")]
    pub next_stop: String,
    #[serde(alias = "StartTime")]
    pub start_time: String,
    #[serde(alias = "VehicleID")]
    pub vehicle_id: String,
    #[serde(alias = "GeohashHead")]
    pub geohash_head: String,
    #[serde(alias = "GeohashFirstDeg")]
    pub geohash_first: String,
    #[serde(alias = "GeohashSecondDeg")]
    pub geohash_second: String,
    #[serde(alias = "GeohashThirdDeg")]
    pub geohash_third: String,
    #[serde(alias = "ShortName")]
    pub short_name: String,
    #[serde(alias = "Color")]
    pub color: String,
}

/// Stop-keyed filter accepted by the stop lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRef {
    #[serde(alias = "NextStop", alias = "next_stop")]
    pub next_stop: String,
}

impl StopRef {
    pub fn new(next_stop: impl Into<String>) -> Self {
        Self {
            next_stop: next_stop.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_keys() {
        let event = VehicleEvent {
            vehicle_id: "Bus42".to_string(),
            geohash_head: "60;24".to_string(),
            ..Default::default()
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["vehicleId"], "Bus42");
        assert_eq!(json["geohashHead"], "60;24");
        assert_eq!(json["messageType"], "");
    }

    #[test]
    fn accepts_legacy_pascal_case_keys() {
        let legacy = r#"{
            "FeedFormat": "gtfsrt", "Type": "vp", "FeedID": "fi", "AgencyID": "HSL",
            "VehicleID": "Bus42", "NextStop": "StopA", "GeohashHead": "60;24",
            "GeohashFirstDeg": "19", "GeohashSecondDeg": "63", "GeohashThirdDeg": "98",
            "ShortName": "1", "Color": "red"
        }"#;
        let event: VehicleEvent = serde_json::from_str(legacy).unwrap();
        assert_eq!(event.message_type, "vp");
        assert_eq!(event.feed_id, "fi");
        assert_eq!(event.vehicle_id, "Bus42");
        assert_eq!(event.geohash_first, "19");
        assert_eq!(event.geohash_third, "98");
        assert_eq!(event.mode, "");

        let current = serde_json::to_string(&event).unwrap();
        assert_eq!(serde_json::from_str::<VehicleEvent>(&current).unwrap(), event);
    }

    #[test]
    fn stop_refs_accept_legacy_key_spelling() {
        let stops: Vec<StopRef> =
            serde_json::from_str(r#"[{"nextStop":"stop1"},{"NextStop":"stop2"}]"#).unwrap();
        assert_eq!(stops, vec![StopRef::new("stop1"), StopRef::new("stop2")]);
    }
}
