//! Provider payload parsers.
//!
//! Each external API has its own JSON shape. Parsing is lenient per entry:
//! an entry that cannot produce a valid [`RawTrackRecord`] is skipped and
//! counted, while a payload whose envelope is unreadable is an error.

use serde_json::{Map, Value};

use crate::types::{EntityClass, RawTrackRecord, Result, TrackError, TrackFields};

/// Wire format of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    AdsbExchange,
    Flightradar24,
    MarineTraffic,
    VesselFinder,
    Chinaports,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::AdsbExchange => "adsbexchange",
            SourceFormat::Flightradar24 => "flightradar24",
            SourceFormat::MarineTraffic => "marinetraffic",
            SourceFormat::VesselFinder => "vesselfinder",
            SourceFormat::Chinaports => "chinaports",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "adsbexchange" | "adsbx" => Some(SourceFormat::AdsbExchange),
            "flightradar24" | "fr24" => Some(SourceFormat::Flightradar24),
            "marinetraffic" | "marinetrafficv2" => Some(SourceFormat::MarineTraffic),
            "vesselfinder" => Some(SourceFormat::VesselFinder),
            "chinaports" => Some(SourceFormat::Chinaports),
            _ => None,
        }
    }

    /// Entity class carried by this format.
    pub fn class(&self) -> EntityClass {
        match self {
            SourceFormat::AdsbExchange | SourceFormat::Flightradar24 => EntityClass::Aircraft,
            _ => EntityClass::Vessel,
        }
    }

    /// Baseline report quality of the provider.
    pub fn default_quality(&self) -> f64 {
        match self {
            SourceFormat::AdsbExchange => 0.95,
            SourceFormat::Flightradar24 => 0.80,
            SourceFormat::MarineTraffic => 0.92,
            SourceFormat::VesselFinder => 0.88,
            SourceFormat::Chinaports => 0.85,
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one payload parse.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<RawTrackRecord>,
    pub skipped: usize,
}

/// Identity of the adapter that produced a payload.
#[derive(Debug, Clone)]
pub struct PayloadOrigin<'a> {
    pub source: &'a str,
    pub format: SourceFormat,
    pub quality: f64,
    pub received_at: f64,
}

/// Parse a provider response body into raw records.
pub fn parse_payload(origin: &PayloadOrigin<'_>, body: &str) -> Result<ParsedBatch> {
    let root: Value = serde_json::from_str(body).map_err(|e| TrackError::Payload {
        format: origin.format.to_string(),
        reason: e.to_string(),
    })?;

    let entries: Vec<(Option<String>, &Value)> = match origin.format {
        SourceFormat::AdsbExchange => list_under(&root, &["aircraft", "flights", "ac"], origin)?,
        SourceFormat::Flightradar24 => {
            let data = root.get("data").unwrap_or(&root);
            let map = data.as_object().ok_or_else(|| envelope_error(origin, "data is not an object"))?;
            map.iter()
                .filter(|(_, v)| v.is_array())
                .map(|(k, v)| (Some(k.clone()), v))
                .collect()
        }
        SourceFormat::MarineTraffic | SourceFormat::VesselFinder | SourceFormat::Chinaports => {
            list_under(&root, &["vessels", "data"], origin)?
        }
    };

    let mut batch = ParsedBatch::default();
    for (key, entry) in entries {
        let parsed = match origin.format {
            SourceFormat::AdsbExchange => entry.as_object().and_then(|o| adsbx_entry(o, origin)),
            SourceFormat::Flightradar24 => entry
                .as_array()
                .and_then(|a| fr24_entry(key.as_deref(), a, origin)),
            SourceFormat::MarineTraffic => entry.as_object().and_then(|o| marinetraffic_entry(o, origin)),
            SourceFormat::VesselFinder => entry.as_object().and_then(|o| vesselfinder_entry(o, origin)),
            SourceFormat::Chinaports => entry.as_object().and_then(|o| chinaports_entry(o, origin)),
        };
        match parsed {
            Some(record) => batch.records.push(record),
            None => batch.skipped += 1,
        }
    }
    Ok(batch)
}

fn envelope_error(origin: &PayloadOrigin<'_>, reason: &str) -> TrackError {
    TrackError::Payload {
        format: origin.format.to_string(),
        reason: reason.to_string(),
    }
}

fn list_under<'v>(
    root: &'v Value,
    keys: &[&str],
    origin: &PayloadOrigin<'_>,
) -> Result<Vec<(Option<String>, &'v Value)>> {
    if let Some(arr) = root.as_array() {
        return Ok(arr.iter().map(|v| (None, v)).collect());
    }
    for key in keys {
        if let Some(arr) = root.get(*key).and_then(Value::as_array) {
            return Ok(arr.iter().map(|v| (None, v)).collect());
        }
    }
    Err(envelope_error(origin, &format!("expected one of {keys:?}")))
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

fn boolean(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First non-null value among alias keys.
fn first<'v>(obj: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Value> {
    keys.iter().filter_map(|k| obj.get(*k)).find(|v| !v.is_null())
}

fn str_of(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first(obj, keys).and_then(text)
}

fn f64_of(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    first(obj, keys).and_then(number)
}

fn i32_of(obj: &Map<String, Value>, keys: &[&str]) -> Option<i32> {
    f64_of(obj, keys).map(|f| f.round() as i32)
}

fn build(id: Option<String>, class: EntityClass, fields: TrackFields, origin: &PayloadOrigin<'_>) -> Option<RawTrackRecord> {
    let id = id?;
    RawTrackRecord::new(&id, class, origin.source, fields, origin.quality, origin.received_at).ok()
}

// ---------------------------------------------------------------------------
// Aircraft formats
// ---------------------------------------------------------------------------

fn adsbx_entry(obj: &Map<String, Value>, origin: &PayloadOrigin<'_>) -> Option<RawTrackRecord> {
    // alt_baro is the string "ground" for surface targets
    let on_ground = obj
        .get("alt_baro")
        .and_then(Value::as_str)
        .map(|s| s.eq_ignore_ascii_case("ground"));
    let altitude_ft = if on_ground == Some(true) {
        Some(0)
    } else {
        i32_of(obj, &["alt_baro", "alt_geom", "altitude"])
    };
    let emergency = str_of(obj, &["emergency"]).and_then(|e| adsbx_emergency_squawk(&e));
    let fields = TrackFields {
        lat: f64_of(obj, &["lat", "latitude"]),
        lon: f64_of(obj, &["lon", "longitude"]),
        altitude_ft,
        speed_kts: f64_of(obj, &["gs", "speed", "tas"]),
        course_deg: f64_of(obj, &["track"]),
        heading_deg: f64_of(obj, &["true_heading", "mag_heading", "track"]),
        vertical_rate_fpm: i32_of(obj, &["baro_rate", "geom_rate"]),
        status: str_of(obj, &["squawk"]).or(emergency),
        callsign: str_of(obj, &["flight", "callsign"]),
        registration: str_of(obj, &["r", "registration"]),
        kind: str_of(obj, &["t", "type", "category"]),
        on_ground: on_ground.or_else(|| first(obj, &["on_ground", "ground"]).and_then(boolean)),
        ..Default::default()
    };
    let seen = f64_of(obj, &["seen_pos", "seen"]);
    build(str_of(obj, &["hex", "icao"]), EntityClass::Aircraft, fields, origin)
        .map(|r| r.with_provider_ts(seen.map(|s| origin.received_at - s)))
}

/// Map the ADS-B Exchange `emergency` field onto the matching squawk.
fn adsbx_emergency_squawk(emergency: &str) -> Option<String> {
    let code = match emergency.to_ascii_lowercase().as_str() {
        "general" | "lifeguard" | "minfuel" | "downed" => "7700",
        "nordo" => "7600",
        "unlawful" => "7500",
        _ => return None,
    };
    Some(code.to_string())
}

mod fr24_index {
    pub const HEX: usize = 0;
    pub const LAT: usize = 1;
    pub const LON: usize = 2;
    pub const HEADING: usize = 3;
    pub const ALTITUDE: usize = 4;
    pub const SPEED: usize = 5;
    pub const SQUAWK: usize = 6;
    pub const TYPE: usize = 8;
    pub const REGISTRATION: usize = 9;
    pub const TIMESTAMP: usize = 10;
    pub const DESTINATION: usize = 12;
    pub const ON_GROUND: usize = 14;
    pub const VERTICAL_RATE: usize = 15;
    pub const CALLSIGN: usize = 16;
}

fn fr24_entry(key: Option<&str>, arr: &[Value], origin: &PayloadOrigin<'_>) -> Option<RawTrackRecord> {
    use fr24_index::*;
    let at = |i: usize| arr.get(i).filter(|v| !v.is_null());
    let heading = at(HEADING).and_then(number);
    let fields = TrackFields {
        lat: at(LAT).and_then(number),
        lon: at(LON).and_then(number),
        altitude_ft: at(ALTITUDE).and_then(number).map(|f| f.round() as i32),
        speed_kts: at(SPEED).and_then(number),
        course_deg: heading,
        heading_deg: heading,
        vertical_rate_fpm: at(VERTICAL_RATE).and_then(number).map(|f| f.round() as i32),
        status: at(SQUAWK).and_then(text),
        callsign: at(CALLSIGN).and_then(text),
        registration: at(REGISTRATION).and_then(text),
        kind: at(TYPE).and_then(text),
        destination: at(DESTINATION).and_then(text),
        on_ground: at(ON_GROUND).and_then(boolean),
        ..Default::default()
    };
    let id = at(HEX).and_then(text).or_else(|| key.map(str::to_string));
    build(id, EntityClass::Aircraft, fields, origin)
        .map(|r| r.with_provider_ts(at(TIMESTAMP).and_then(number)))
}

// ---------------------------------------------------------------------------
// Vessel formats
// ---------------------------------------------------------------------------

fn marinetraffic_entry(obj: &Map<String, Value>, origin: &PayloadOrigin<'_>) -> Option<RawTrackRecord> {
    let fields = TrackFields {
        lat: f64_of(obj, &["lat", "LAT"]),
        lon: f64_of(obj, &["lon", "LON"]),
        speed_kts: f64_of(obj, &["speed", "SPEED"]),
        course_deg: f64_of(obj, &["course", "COURSE"]),
        heading_deg: f64_of(obj, &["heading", "HEADING"]),
        status: str_of(obj, &["status", "STATUS", "navStatus"]),
        callsign: str_of(obj, &["callsign", "CALLSIGN"]),
        kind: str_of(obj, &["shiptype", "SHIPTYPE", "shipType"]),
        name: str_of(obj, &["shipname", "SHIPNAME", "shipName"]),
        imo: str_of(obj, &["imo", "IMO"]),
        destination: str_of(obj, &["destination", "DESTINATION"]),
        ..Default::default()
    };
    build(str_of(obj, &["mmsi", "MMSI"]), EntityClass::Vessel, fields, origin)
        .map(|r| r.with_provider_ts(f64_of(obj, &["timestamp", "TIMESTAMP"])))
}

fn vesselfinder_entry(obj: &Map<String, Value>, origin: &PayloadOrigin<'_>) -> Option<RawTrackRecord> {
    let fields = TrackFields {
        lat: f64_of(obj, &["latitude", "lat"]),
        lon: f64_of(obj, &["longitude", "lng", "lon"]),
        speed_kts: f64_of(obj, &["speed", "sog"]),
        course_deg: f64_of(obj, &["course", "cog"]),
        heading_deg: f64_of(obj, &["heading", "hdg"]),
        status: str_of(obj, &["navStatus", "navstat"]),
        callsign: str_of(obj, &["callsign", "call"]),
        kind: str_of(obj, &["vesselType", "type"]),
        name: str_of(obj, &["vesselName", "name"]),
        imo: str_of(obj, &["imo", "IMO"]),
        destination: str_of(obj, &["destination", "dest"]),
        ..Default::default()
    };
    build(str_of(obj, &["mmsi", "MMSI"]), EntityClass::Vessel, fields, origin)
}

fn chinaports_entry(obj: &Map<String, Value>, origin: &PayloadOrigin<'_>) -> Option<RawTrackRecord> {
    let mut fields = TrackFields {
        lat: f64_of(obj, &["lat"]),
        lon: f64_of(obj, &["lon"]),
        speed_kts: f64_of(obj, &["speed"]),
        course_deg: f64_of(obj, &["course"]),
        heading_deg: f64_of(obj, &["heading"]),
        status: str_of(obj, &["navStatus"]),
        callsign: str_of(obj, &["callsign"]),
        kind: str_of(obj, &["vesselType"]),
        name: str_of(obj, &["vesselName"]),
        imo: str_of(obj, &["imo"]),
        destination: str_of(obj, &["destination"]),
        ..Default::default()
    };
    if obj.get("securityAlert").and_then(boolean) == Some(true) {
        fields.status = Some("security alert".into());
    }
    build(str_of(obj, &["mmsi"]), EntityClass::Vessel, fields, origin)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(format: SourceFormat) -> PayloadOrigin<'static> {
        PayloadOrigin {
            source: format.as_str(),
            format,
            quality: format.default_quality(),
            received_at: 1_700_000_000.0,
        }
    }

    #[test]
    fn test_adsbexchange_payload() {
        let body = r#"{"aircraft":[
            {"hex":"7c1b72","flight":"VN123 ","lat":11.676549,"lon":109.199291,
             "alt_baro":35000,"gs":450.5,"track":92.1,"baro_rate":-64,"squawk":"7700","seen_pos":1.5},
            {"hex":"abc001","alt_baro":"ground","lat":10.8,"lon":106.6},
            {"flight":"NOHEX"}
        ]}"#;
        let batch = parse_payload(&origin(SourceFormat::AdsbExchange), body).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.skipped, 1);

        let r = &batch.records[0];
        assert_eq!(r.entity_id, "7C1B72");
        assert_eq!(r.class, EntityClass::Aircraft);
        assert_eq!(r.fields.callsign.as_deref(), Some("VN123"));
        assert_eq!(r.fields.altitude_ft, Some(35000));
        assert_eq!(r.fields.speed_kts, Some(450.5));
        assert!(r.is_emergency());
        assert_eq!(r.provider_ts, Some(1_700_000_000.0 - 1.5));
        assert_eq!(r.quality, 0.95);

        let ground = &batch.records[1];
        assert_eq!(ground.fields.on_ground, Some(true));
        assert_eq!(ground.fields.altitude_ft, Some(0));
    }

    #[test]
    fn test_adsbexchange_emergency_field_without_squawk() {
        let body = r#"{"aircraft":[{"hex":"a1b2c3","lat":12.0,"lon":105.0,"emergency":"nordo"}]}"#;
        let batch = parse_payload(&origin(SourceFormat::AdsbExchange), body).unwrap();
        assert_eq!(batch.records[0].fields.status.as_deref(), Some("7600"));
        assert!(batch.records[0].is_emergency());
    }

    #[test]
    fn test_adsbexchange_flights_alias() {
        let body = r#"{"flights":[{"hex":"888123","lat":12.0,"lon":105.0}]}"#;
        let batch = parse_payload(&origin(SourceFormat::AdsbExchange), body).unwrap();
        assert_eq!(batch.records.len(), 1);
    }

    #[test]
    fn test_flightradar24_payload() {
        let body = r#"{"data":{
            "2f1a3b":["780a3b",11.5,108.2,270,32000,430,"1200","T-VVTS1","A321","VN-A321",1700000000,"SGN","HAN","VN244",0,0,"HVN244"],
            "bad":"not-an-array"
        },"full_count":1,"version":4,"stats":{}}"#;
        let batch = parse_payload(&origin(SourceFormat::Flightradar24), body).unwrap();
        assert_eq!(batch.records.len(), 1);
        let r = &batch.records[0];
        assert_eq!(r.entity_id, "780A3B");
        assert_eq!(r.fields.position(), Some((11.5, 108.2)));
        assert_eq!(r.fields.course_deg, Some(270.0));
        assert_eq!(r.fields.registration.as_deref(), Some("VN-A321"));
        assert_eq!(r.fields.destination.as_deref(), Some("HAN"));
        assert_eq!(r.fields.callsign.as_deref(), Some("HVN244"));
        assert_eq!(r.fields.on_ground, Some(false));
        assert_eq!(r.provider_ts, Some(1_700_000_000.0));
    }

    #[test]
    fn test_flightradar24_falls_back_to_key() {
        let body = r#"{"data":{"abc123":[null,11.5,108.2]}}"#;
        let batch = parse_payload(&origin(SourceFormat::Flightradar24), body).unwrap();
        assert_eq!(batch.records[0].entity_id, "ABC123");
    }

    #[test]
    fn test_marinetraffic_payload() {
        let body = r#"{"vessels":[{"mmsi":"574001230","lat":10.3,"lon":107.1,"speed":12.4,
            "course":45,"heading":44,"status":"Under way","shipname":"HAI PHONG 01","imo":"9123456"}]}"#;
        let batch = parse_payload(&origin(SourceFormat::MarineTraffic), body).unwrap();
        let r = &batch.records[0];
        assert_eq!(r.class, EntityClass::Vessel);
        assert_eq!(r.fields.name.as_deref(), Some("HAI PHONG 01"));
        assert_eq!(r.fields.course_deg, Some(45.0));
        assert!(!r.is_emergency());
    }

    #[test]
    fn test_vesselfinder_aliases() {
        let body = r#"{"vessels":[
            {"MMSI":574000001,"latitude":9.5,"lng":104.2,"sog":"8.5","cog":180,"navstat":"Distress","name":"SONG HAU"},
            {"mmsi":"574000002","lat":9.6,"lon":104.3,"speed":3.0,"vesselName":"MEKONG"}
        ]}"#;
        let batch = parse_payload(&origin(SourceFormat::VesselFinder), body).unwrap();
        assert_eq!(batch.records.len(), 2);
        let a = &batch.records[0];
        assert_eq!(a.entity_id, "574000001");
        assert_eq!(a.fields.position(), Some((9.5, 104.2)));
        assert_eq!(a.fields.speed_kts, Some(8.5));
        assert!(a.is_emergency());
        assert_eq!(batch.records[1].fields.name.as_deref(), Some("MEKONG"));
    }

    #[test]
    fn test_chinaports_security_alert() {
        let body = r#"{"vessels":[{"mmsi":"413000111","lat":18.2,"lon":109.5,"navStatus":"Moored","securityAlert":true}]}"#;
        let batch = parse_payload(&origin(SourceFormat::Chinaports), body).unwrap();
        assert!(batch.records[0].is_emergency());
    }

    #[test]
    fn test_invalid_coordinates_skipped() {
        let body = r#"{"vessels":[{"mmsi":"1","lat":95.0,"lon":10.0},{"mmsi":"2","lat":5.0,"lon":10.0}]}"#;
        let batch = parse_payload(&origin(SourceFormat::Chinaports), body).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn test_malformed_envelope_is_error() {
        assert!(parse_payload(&origin(SourceFormat::MarineTraffic), "not json").is_err());
        assert!(parse_payload(&origin(SourceFormat::MarineTraffic), r#"{"ships":[]}"#).is_err());
        assert!(parse_payload(&origin(SourceFormat::Flightradar24), r#"{"data":[1,2]}"#).is_err());
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(SourceFormat::parse("FR24"), Some(SourceFormat::Flightradar24));
        assert_eq!(SourceFormat::parse("marinetraffic-v2"), Some(SourceFormat::MarineTraffic));
        assert_eq!(SourceFormat::parse("adsb_exchange"), Some(SourceFormat::AdsbExchange));
        assert_eq!(SourceFormat::parse("unknown"), None);
        assert_eq!(SourceFormat::Chinaports.class(), EntityClass::Vessel);
    }
}
