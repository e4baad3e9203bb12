//! Shared types, error enum, and track records for track-core.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by track-core.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("entity id must not be empty")]
    EmptyEntityId,
    #[error("invalid latitude: {0}")]
    InvalidLatitude(f64),
    #[error("invalid longitude: {0}")]
    InvalidLongitude(f64),
    #[error("invalid quality: {0}")]
    InvalidQuality(f64),
    #[error("invalid bounding box: {0}")]
    InvalidArea(String),
    #[error("fusion failed for {entity_id}: {reason}")]
    FusionFailed { entity_id: String, reason: String },
    #[error("state error: {0}")]
    State(String),
    #[error("payload parse error ({format}): {reason}")]
    Payload { format: String, reason: String },
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TrackError>;

/// Current wall-clock time as epoch seconds.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Entity class
// ---------------------------------------------------------------------------

/// Kind of tracked entity. Aircraft are keyed by ICAO hex, vessels by MMSI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityClass {
    Aircraft,
    Vessel,
}

impl EntityClass {
    pub const ALL: [EntityClass; 2] = [EntityClass::Aircraft, EntityClass::Vessel];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Aircraft => "aircraft",
            EntityClass::Vessel => "vessel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aircraft" | "flight" | "flights" => Some(EntityClass::Aircraft),
            "vessel" | "vessels" | "ship" | "ships" => Some(EntityClass::Vessel),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Emergency classification
// ---------------------------------------------------------------------------

/// Transponder codes that always force a durable write.
pub const EMERGENCY_SQUAWKS: [&str; 3] = ["7500", "7600", "7700"];

/// Navigation status fragments that mark a vessel in distress.
pub const VESSEL_DISTRESS_MARKERS: [&str; 4] = ["distress", "emergency", "security", "piracy"];

/// Emergency squawk lookup.
pub fn emergency_squawk(squawk: &str) -> Option<&'static str> {
    match squawk.trim() {
        "7500" => Some("Hijack"),
        "7600" => Some("Radio failure"),
        "7700" => Some("Emergency"),
        _ => None,
    }
}

/// True if a status code signals an emergency for the given class.
pub fn is_emergency_status(class: EntityClass, status: &str) -> bool {
    match class {
        EntityClass::Aircraft => emergency_squawk(status).is_some(),
        EntityClass::Vessel => {
            let lower = status.to_ascii_lowercase();
            VESSEL_DISTRESS_MARKERS.iter().any(|m| lower.contains(m))
        }
    }
}

// ---------------------------------------------------------------------------
// Track fields
// ---------------------------------------------------------------------------

/// Every optional dimension a provider may report for an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackFields {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub altitude_ft: Option<i32>,
    pub speed_kts: Option<f64>,
    pub course_deg: Option<f64>,
    pub heading_deg: Option<f64>,
    pub vertical_rate_fpm: Option<i32>,
    /// Squawk for aircraft, navigation status for vessels.
    pub status: Option<String>,
    pub callsign: Option<String>,
    pub registration: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub imo: Option<String>,
    pub destination: Option<String>,
    pub on_ground: Option<bool>,
}

macro_rules! fill_missing {
    ($dst:ident, $src:ident, $($field:ident),+) => {
        $(
            if $dst.$field.is_none() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

impl TrackFields {
    /// Latitude and longitude, only when both are present and in range.
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if valid_lat(lat) && valid_lon(lon) => Some((lat, lon)),
            _ => None,
        }
    }

    /// Fill every absent field from `other`. Present fields are never touched.
    ///
    /// Latitude and longitude move as a pair so a fused position is never
    /// stitched together from two different reports.
    pub fn fill_from(&mut self, other: &TrackFields) {
        if self.position().is_none() {
            if let Some((lat, lon)) = other.position() {
                self.lat = Some(lat);
                self.lon = Some(lon);
            }
        }
        let dst = self;
        let src = other;
        fill_missing!(
            dst,
            src,
            altitude_ft,
            speed_kts,
            course_deg,
            heading_deg,
            vertical_rate_fpm,
            status,
            callsign,
            registration,
            kind,
            name,
            imo,
            destination,
            on_ground
        );
    }

    pub fn is_emergency(&self, class: EntityClass) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| is_emergency_status(class, s))
    }
}

pub fn valid_lat(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

pub fn valid_lon(lon: f64) -> bool {
    lon.is_finite() && (-180.0..=180.0).contains(&lon)
}

// ---------------------------------------------------------------------------
// Raw records
// ---------------------------------------------------------------------------

/// One normalized report from one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrackRecord {
    pub entity_id: String,
    pub class: EntityClass,
    pub source: String,
    pub fields: TrackFields,
    pub quality: f64,
    /// Timestamp reported by the provider, when it sends one.
    pub provider_ts: Option<f64>,
    /// When the adapter received the payload.
    pub received_at: f64,
    pub response_ms: Option<u64>,
}

impl RawTrackRecord {
    /// Build a validated record. The entity id is trimmed and upper-cased and
    /// quality is clamped to [0, 1].
    pub fn new(
        entity_id: &str,
        class: EntityClass,
        source: &str,
        fields: TrackFields,
        quality: f64,
        received_at: f64,
    ) -> Result<Self> {
        if !quality.is_finite() {
            return Err(TrackError::InvalidQuality(quality));
        }
        let record = RawTrackRecord {
            entity_id: normalize_entity_id(entity_id),
            class,
            source: source.to_string(),
            fields,
            quality: quality.clamp(0.0, 1.0),
            provider_ts: None,
            received_at,
            response_ms: None,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn with_provider_ts(mut self, ts: Option<f64>) -> Self {
        self.provider_ts = ts;
        self
    }

    pub fn with_response_ms(mut self, ms: u64) -> Self {
        self.response_ms = Some(ms);
        self
    }

    /// Bring a record decoded from JSON to the canonical id form.
    pub fn normalized(mut self) -> Self {
        self.entity_id = normalize_entity_id(&self.entity_id);
        self
    }

    /// Check the record invariants. Used again by consumers because records
    /// also arrive over the raw channel as JSON.
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(TrackError::EmptyEntityId);
        }
        if let Some(lat) = self.fields.lat {
            if !valid_lat(lat) {
                return Err(TrackError::InvalidLatitude(lat));
            }
        }
        if let Some(lon) = self.fields.lon {
            if !valid_lon(lon) {
                return Err(TrackError::InvalidLongitude(lon));
            }
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(TrackError::InvalidQuality(self.quality));
        }
        Ok(())
    }

    pub fn is_emergency(&self) -> bool {
        self.fields.is_emergency(self.class)
    }

    /// Seconds since receipt.
    pub fn age(&self, now: f64) -> f64 {
        now - self.received_at
    }
}

/// Canonical form of an entity key shared by every provider.
pub fn normalize_entity_id(id: &str) -> String {
    id.trim().to_ascii_uppercase()
}

// ---------------------------------------------------------------------------
// Fused records
// ---------------------------------------------------------------------------

/// The authoritative track for one entity after one fusion pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedTrackRecord {
    pub entity_id: String,
    pub class: EntityClass,
    pub fields: TrackFields,
    pub quality: f64,
    pub sources: BTreeSet<String>,
    /// Source of the highest-ranked contributing record.
    pub primary_source: String,
    pub fused_at: f64,
}

impl FusedTrackRecord {
    /// Wrap a single raw record, used when fusion is disabled.
    pub fn from_raw(raw: &RawTrackRecord, fused_at: f64) -> Self {
        FusedTrackRecord {
            entity_id: raw.entity_id.clone(),
            class: raw.class,
            fields: raw.fields.clone(),
            quality: raw.quality,
            sources: BTreeSet::from([raw.source.clone()]),
            primary_source: raw.source.clone(),
            fused_at,
        }
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        self.fields.position()
    }

    pub fn is_emergency(&self) -> bool {
        self.fields.is_emergency(self.class)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
