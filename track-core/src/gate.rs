//! Storage-decision gate and per-entity last-known state.
//!
//! The gate compares a non-duplicate fused record with the entity's last
//! persisted snapshot and decides between a durable write and a cache-only
//! update. Anything that goes wrong while deciding results in a write.

use dashmap::DashMap;
use serde::Serialize;

use crate::config::{FusionConfig, StorageConfig};
use crate::geo::{course_delta, haversine_km, BoundingBox};
use crate::types::{EntityClass, FusedTrackRecord, Result, TrackError};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistReason {
    FirstSighting,
    Emergency,
    ForceSave,
    Moved,
    Altitude,
    Speed,
    Course,
    EvaluationError(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Persist(PersistReason),
    CacheOnly,
}

impl GateDecision {
    pub fn should_persist(&self) -> bool {
        matches!(self, GateDecision::Persist(_))
    }
}

/// Last durable write for an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSnapshot {
    pub record: FusedTrackRecord,
    pub persisted_at: f64,
}

/// Outcome of [`StateStore::apply_tracked`].
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub decision: GateDecision,
    /// Snapshot replaced by a persist decision.
    pub previous: Option<PersistedSnapshot>,
}

pub struct StorageGate {
    pub config: StorageConfig,
}

impl StorageGate {
    pub fn new(config: StorageConfig) -> Self {
        StorageGate { config }
    }

    /// Decide for `record`. Evaluation errors fall back to a durable write.
    pub fn decide(&self, record: &FusedTrackRecord, last: Option<&PersistedSnapshot>, now: f64) -> GateDecision {
        match self.evaluate(record, last, now) {
            Ok(decision) => decision,
            Err(e) => GateDecision::Persist(PersistReason::EvaluationError(e.to_string())),
        }
    }

    fn evaluate(&self, record: &FusedTrackRecord, last: Option<&PersistedSnapshot>, now: f64) -> Result<GateDecision> {
        let Some(last) = last else {
            return Ok(GateDecision::Persist(PersistReason::FirstSighting));
        };
        if record.is_emergency() {
            return Ok(GateDecision::Persist(PersistReason::Emergency));
        }
        if last.record.class != record.class {
            return Err(TrackError::State(format!(
                "{} changed class from {} to {}",
                record.entity_id, last.record.class, record.class
            )));
        }
        if !now.is_finite() || !last.persisted_at.is_finite() {
            return Err(TrackError::State("non-finite timestamp".into()));
        }
        if now - last.persisted_at >= self.config.force_save_secs {
            return Ok(GateDecision::Persist(PersistReason::ForceSave));
        }

        let prev = &last.record.fields;
        let cur = &record.fields;

        let moved = significant(prev.position(), cur.position(), |a, b| {
            haversine_km(a.0, a.1, b.0, b.1) * 1000.0 > self.config.distance_m
        });
        if moved {
            return Ok(GateDecision::Persist(PersistReason::Moved));
        }

        let altitude = significant(prev.altitude_ft, cur.altitude_ft, |a, b| {
            a.abs_diff(b) as f64 > self.config.altitude_ft
        });
        if altitude {
            return Ok(GateDecision::Persist(PersistReason::Altitude));
        }

        let speed = significant(finite(prev.speed_kts)?, finite(cur.speed_kts)?, |a, b| {
            (a - b).abs() > self.config.speed_kts
        });
        if speed {
            return Ok(GateDecision::Persist(PersistReason::Speed));
        }

        let course = significant(finite(prev.course_deg)?, finite(cur.course_deg)?, |a, b| {
            course_delta(a, b) > self.config.course_deg
        });
        if course {
            return Ok(GateDecision::Persist(PersistReason::Course));
        }

        Ok(GateDecision::CacheOnly)
    }
}

/// A value appearing or disappearing is significant; two absent values are not.
fn significant<T>(prev: Option<T>, cur: Option<T>, exceeds: impl Fn(T, T) -> bool) -> bool {
    match (prev, cur) {
        (None, None) => false,
        (Some(a), Some(b)) => exceeds(a, b),
        _ => true,
    }
}

fn finite(v: Option<f64>) -> Result<Option<f64>> {
    match v {
        Some(x) if !x.is_finite() => Err(TrackError::State(format!("non-finite value {x}"))),
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------------
// Entity state store
// ---------------------------------------------------------------------------

/// Everything remembered about one entity between fusion passes.
#[derive(Debug, Clone)]
pub struct EntityLastKnownState {
    pub class: EntityClass,
    pub last_fused: Option<FusedTrackRecord>,
    pub last_persisted: Option<PersistedSnapshot>,
    pub last_seen: f64,
}

/// Concurrent map of entity id to last-known state. Each decision runs under
/// the entity's entry so concurrent updates to one entity are serialized.
#[derive(Default)]
pub struct StateStore {
    entities: DashMap<String, EntityLastKnownState>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::default()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id)
    }

    /// Install a durable snapshot loaded from persistence for an entity not
    /// yet in memory. Existing state wins.
    pub fn seed(&self, entity_id: &str, class: EntityClass, snapshot: Option<FusedTrackRecord>, now: f64) {
        self.entities
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityLastKnownState {
                class,
                last_persisted: snapshot.map(|record| PersistedSnapshot {
                    persisted_at: record.fused_at,
                    record,
                }),
                last_fused: None,
                last_seen: now,
            });
    }

    /// Run the gate for `record` and record the outcome.
    pub fn apply(&self, gate: &StorageGate, record: &FusedTrackRecord, now: f64) -> GateDecision {
        self.apply_tracked(gate, record, now).decision
    }

    /// Like [`StateStore::apply`], but also hands back the snapshot a persist
    /// replaced so a failed durable write can be undone with
    /// [`StateStore::revert_persist`].
    pub fn apply_tracked(&self, gate: &StorageGate, record: &FusedTrackRecord, now: f64) -> Applied {
        let mut entry = self
            .entities
            .entry(record.entity_id.clone())
            .or_insert_with(|| EntityLastKnownState {
                class: record.class,
                last_fused: None,
                last_persisted: None,
                last_seen: now,
            });
        let state = entry.value_mut();

        let decision = gate.decide(record, state.last_persisted.as_ref(), now);
        let previous = if decision.should_persist() {
            state.last_persisted.replace(PersistedSnapshot {
                record: record.clone(),
                persisted_at: now,
            })
        } else {
            None
        };
        state.last_fused = Some(record.clone());
        state.last_seen = now;
        state.class = record.class;
        Applied { decision, previous }
    }

    /// Restore `previous` as the last persisted snapshot after the durable
    /// write of `record` failed. A newer persist for the entity is left alone.
    /// Returns whether anything was restored.
    pub fn revert_persist(
        &self,
        record: &FusedTrackRecord,
        persisted_at: f64,
        previous: Option<PersistedSnapshot>,
    ) -> bool {
        let Some(mut state) = self.entities.get_mut(&record.entity_id) else {
            return false;
        };
        let ours = state
            .last_persisted
            .as_ref()
            .is_some_and(|s| s.persisted_at == persisted_at && s.record == *record);
        if ours {
            state.last_persisted = previous;
        }
        ours
    }

    /// Latest fused record per entity whose position lies inside `bbox`.
    pub fn latest_in(&self, bbox: &BoundingBox) -> Vec<FusedTrackRecord> {
        let mut out: Vec<FusedTrackRecord> = self
            .entities
            .iter()
            .filter_map(|e| e.value().last_fused.clone())
            .filter(|r| r.position().is_some_and(|(lat, lon)| bbox.contains(lat, lon)))
            .collect();
        out.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        out
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityLastKnownState> {
        self.entities.get(entity_id).map(|e| e.value().clone())
    }

    /// Remove entities not seen within their class inactivity timeout.
    pub fn purge_inactive(&self, fusion: &FusionConfig, now: f64) -> usize {
        let before = self.entities.len();
        self.entities
            .retain(|_, s| now - s.last_seen <= fusion.timing(s.class).inactivity_secs);
        before.saturating_sub(self.entities.len())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Tracked entity count per class.
    pub fn count_by_class(&self, class: EntityClass) -> usize {
        self.entities.iter().filter(|e| e.value().class == class).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{RawTrackRecord, TrackFields};

    fn gate() -> StorageGate {
        StorageGate::new(Config::default().storage)
    }

    fn record(id: &str, class: EntityClass, fields: TrackFields) -> FusedTrackRecord {
        let raw = RawTrackRecord::new(id, class, "src", fields, 0.9, 0.0).unwrap();
        FusedTrackRecord::from_raw(&raw, 0.0)
    }

    fn aircraft(lat: f64, lon: f64, alt: i32, speed: f64, course: f64) -> FusedTrackRecord {
        record(
            "7C1B72",
            EntityClass::Aircraft,
            TrackFields {
                lat: Some(lat),
                lon: Some(lon),
                altitude_ft: Some(alt),
                speed_kts: Some(speed),
                course_deg: Some(course),
                ..Default::default()
            },
        )
    }

    fn snapshot(r: FusedTrackRecord, at: f64) -> PersistedSnapshot {
        PersistedSnapshot {
            record: r,
            persisted_at: at,
        }
    }

    #[test]
    fn test_first_sighting_persists() {
        let d = gate().decide(&aircraft(10.0, 100.0, 1000, 200.0, 90.0), None, 0.0);
        assert_eq!(d, GateDecision::Persist(PersistReason::FirstSighting));
    }

    #[test]
    fn test_unchanged_is_cache_only() {
        let base = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        let last = snapshot(base.clone(), 100.0);
        assert_eq!(gate().decide(&base, Some(&last), 110.0), GateDecision::CacheOnly);
    }

    #[test]
    fn test_force_save_after_interval() {
        let base = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        let last = snapshot(base.clone(), 100.0);
        assert_eq!(
            gate().decide(&base, Some(&last), 160.0),
            GateDecision::Persist(PersistReason::ForceSave)
        );
    }

    #[test]
    fn test_emergency_always_persists() {
        let mut r = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        r.fields.status = Some("7700".into());
        let last = snapshot(r.clone(), 100.0);
        assert_eq!(
            gate().decide(&r, Some(&last), 105.0),
            GateDecision::Persist(PersistReason::Emergency)
        );
    }

    #[test]
    fn test_distance_threshold() {
        let last = snapshot(aircraft(10.0, 100.0, 1000, 200.0, 90.0), 100.0);
        // ~111 m north
        let far = aircraft(10.001, 100.0, 1000, 200.0, 90.0);
        assert_eq!(gate().decide(&far, Some(&last), 101.0), GateDecision::Persist(PersistReason::Moved));
        // ~55 m north
        let near = aircraft(10.0005, 100.0, 1000, 200.0, 90.0);
        assert_eq!(gate().decide(&near, Some(&last), 101.0), GateDecision::CacheOnly);
    }

    #[test]
    fn test_dimension_thresholds() {
        let last = snapshot(aircraft(10.0, 100.0, 1000, 200.0, 90.0), 100.0);
        let g = gate();
        assert_eq!(
            g.decide(&aircraft(10.0, 100.0, 1501, 200.0, 90.0), Some(&last), 101.0),
            GateDecision::Persist(PersistReason::Altitude)
        );
        assert_eq!(g.decide(&aircraft(10.0, 100.0, 1500, 200.0, 90.0), Some(&last), 101.0), GateDecision::CacheOnly);
        assert_eq!(
            g.decide(&aircraft(10.0, 100.0, 1000, 211.0, 90.0), Some(&last), 101.0),
            GateDecision::Persist(PersistReason::Speed)
        );
        assert_eq!(
            g.decide(&aircraft(10.0, 100.0, 1000, 200.0, 121.0), Some(&last), 101.0),
            GateDecision::Persist(PersistReason::Course)
        );
    }

    #[test]
    fn test_course_wraparound_not_significant() {
        let last = snapshot(aircraft(10.0, 100.0, 1000, 200.0, 350.0), 100.0);
        let r = aircraft(10.0, 100.0, 1000, 200.0, 10.0);
        assert_eq!(gate().decide(&r, Some(&last), 101.0), GateDecision::CacheOnly);
    }

    #[test]
    fn test_missing_value_is_significant() {
        let last = snapshot(aircraft(10.0, 100.0, 1000, 200.0, 90.0), 100.0);
        let mut r = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        r.fields.speed_kts = None;
        assert_eq!(gate().decide(&r, Some(&last), 101.0), GateDecision::Persist(PersistReason::Speed));
    }

    #[test]
    fn test_vessel_without_altitude() {
        let v = |speed: f64| {
            record(
                "574001230",
                EntityClass::Vessel,
                TrackFields {
                    lat: Some(10.0),
                    lon: Some(106.0),
                    speed_kts: Some(speed),
                    course_deg: Some(45.0),
                    ..Default::default()
                },
            )
        };
        let last = snapshot(v(12.0), 100.0);
        assert_eq!(gate().decide(&v(14.0), Some(&last), 110.0), GateDecision::CacheOnly);
        assert_eq!(
            gate().decide(&v(23.0), Some(&last), 110.0),
            GateDecision::Persist(PersistReason::Speed)
        );
    }

    #[test]
    fn test_evaluation_error_persists() {
        let last = snapshot(aircraft(10.0, 100.0, 1000, 200.0, 90.0), 100.0);
        let mut r = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        r.fields.speed_kts = Some(f64::NAN);
        assert!(matches!(
            gate().decide(&r, Some(&last), 101.0),
            GateDecision::Persist(PersistReason::EvaluationError(_))
        ));
    }

    #[test]
    fn test_state_store_tracks_last_persisted() {
        let store = StateStore::new();
        let g = gate();
        let r = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        assert!(store.apply(&g, &r, 100.0).should_persist());
        assert_eq!(store.apply(&g, &r, 110.0), GateDecision::CacheOnly);
        // force save measured from the last persist at t=100
        assert!(store.apply(&g, &r, 160.0).should_persist());

        let state = store.get("7C1B72").unwrap();
        assert_eq!(state.last_persisted.unwrap().persisted_at, 160.0);
        assert_eq!(state.last_seen, 160.0);
    }

    #[test]
    fn test_revert_restores_previous_snapshot() {
        let store = StateStore::new();
        let g = gate();
        let first = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        store.apply(&g, &first, 100.0);

        let moved = aircraft(10.01, 100.0, 1000, 200.0, 90.0);
        let applied = store.apply_tracked(&g, &moved, 110.0);
        assert_eq!(applied.decision, GateDecision::Persist(PersistReason::Moved));
        assert_eq!(applied.previous.as_ref().unwrap().persisted_at, 100.0);

        assert!(store.revert_persist(&moved, 110.0, applied.previous));
        let state = store.get("7C1B72").unwrap();
        assert_eq!(state.last_persisted.unwrap().persisted_at, 100.0);
        // the cache still reflects the newest record
        assert_eq!(state.last_fused.unwrap(), moved);
        assert_eq!(store.apply(&g, &moved, 115.0), GateDecision::Persist(PersistReason::Moved));
    }

    #[test]
    fn test_revert_skips_newer_persist() {
        let store = StateStore::new();
        let g = gate();
        let first = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        let applied = store.apply_tracked(&g, &first, 100.0);
        assert!(applied.previous.is_none());
        let moved = aircraft(10.01, 100.0, 1000, 200.0, 90.0);
        store.apply(&g, &moved, 105.0);

        assert!(!store.revert_persist(&first, 100.0, applied.previous));
        assert_eq!(store.get("7C1B72").unwrap().last_persisted.unwrap().persisted_at, 105.0);
    }

    #[test]
    fn test_extreme_altitudes_do_not_overflow() {
        let last = snapshot(aircraft(10.0, 100.0, i32::MAX, 200.0, 90.0), 100.0);
        let r = aircraft(10.0, 100.0, i32::MIN, 200.0, 90.0);
        assert_eq!(gate().decide(&r, Some(&last), 101.0), GateDecision::Persist(PersistReason::Altitude));
    }

    #[test]
    fn test_emergency_repeat_persisted() {
        let store = StateStore::new();
        let g = gate();
        let mut r = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        r.entity_id = "ABC123".into();
        r.fields.status = Some("7700".into());
        assert!(store.apply(&g, &r, 100.0).should_persist());
        assert_eq!(store.apply(&g, &r, 105.0), GateDecision::Persist(PersistReason::Emergency));
    }

    #[test]
    fn test_seed_from_durable_snapshot() {
        let store = StateStore::new();
        let mut prior = aircraft(10.0, 100.0, 1000, 200.0, 90.0);
        prior.fused_at = 95.0;
        store.seed("7C1B72", EntityClass::Aircraft, Some(prior.clone()), 100.0);
        assert_eq!(store.apply(&gate(), &prior, 100.0), GateDecision::CacheOnly);
    }

    #[test]
    fn test_purge_inactive_per_class() {
        let store = StateStore::new();
        let g = gate();
        store.apply(&g, &aircraft(10.0, 100.0, 1000, 200.0, 90.0), 0.0);
        store.apply(
            &g,
            &record("574001230", EntityClass::Vessel, TrackFields { lat: Some(10.0), lon: Some(106.0), ..Default::default() }),
            0.0,
        );
        let fusion = Config::default().fusion;
        // aircraft timeout 300 s, vessel 600 s
        assert_eq!(store.purge_inactive(&fusion, 400.0), 1);
        assert_eq!(store.count_by_class(EntityClass::Vessel), 1);
        assert_eq!(store.purge_inactive(&fusion, 700.0), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_latest_in_box() {
        let store = StateStore::new();
        let g = gate();
        store.apply(&g, &aircraft(11.68, 109.20, 1000, 200.0, 90.0), 0.0);
        let mut outside = aircraft(30.0, 109.20, 1000, 200.0, 90.0);
        outside.entity_id = "OUT1".into();
        store.apply(&g, &outside, 0.0);
        let bbox = BoundingBox::new(8.5, 23.5, 102.0, 109.5).unwrap();
        let inside = store.latest_in(&bbox);
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].entity_id, "7C1B72");
    }
}
