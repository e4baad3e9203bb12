//! Near-duplicate suppression for fused records.
//!
//! One cache entry per entity holds the last accepted fused record. A new
//! record inside the time window whose position lies within the distance
//! threshold of the cached one is a duplicate. Read-compare-write happens
//! under the entity's map entry, so concurrent checks on one entity are
//! serialized.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::DedupConfig;
use crate::geo::haversine_km;
use crate::types::FusedTrackRecord;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DedupVerdict {
    Accepted,
    Duplicate { distance_km: f64 },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupVerdict::Duplicate { .. })
    }
}

struct CachedFix {
    record: FusedTrackRecord,
    cached_at: f64,
}

pub struct Deduplicator {
    cache: DashMap<String, CachedFix>,
    pub window_secs: f64,
    pub distance_km: f64,
    pub emergency_bypass: bool,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Deduplicator {
            cache: DashMap::new(),
            window_secs: config.window_secs,
            distance_km: config.distance_km,
            emergency_bypass: config.emergency_bypass,
        }
    }

    /// Classify `record` and update the cache when it is accepted.
    /// A duplicate leaves the cache untouched.
    pub fn check(&self, record: &FusedTrackRecord, now: f64) -> DedupVerdict {
        match self.cache.entry(record.entity_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(CachedFix {
                    record: record.clone(),
                    cached_at: now,
                });
                DedupVerdict::Accepted
            }
            Entry::Occupied(mut slot) => {
                let cached = slot.get();
                let expired = now - cached.cached_at > self.window_secs;
                let bypass = self.emergency_bypass && record.is_emergency();
                let distance = match (cached.record.position(), record.position()) {
                    (Some((lat1, lon1)), Some((lat2, lon2))) => Some(haversine_km(lat1, lon1, lat2, lon2)),
                    _ => None,
                };

                match distance {
                    Some(d) if !expired && !bypass && d < self.distance_km => {
                        DedupVerdict::Duplicate { distance_km: d }
                    }
                    _ => {
                        slot.insert(CachedFix {
                            record: record.clone(),
                            cached_at: now,
                        });
                        DedupVerdict::Accepted
                    }
                }
            }
        }
    }

    /// Drop entries older than the window. Returns count removed.
    pub fn purge_stale(&self, now: f64) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, fix| now - fix.cached_at <= self.window_secs);
        before.saturating_sub(self.cache.len())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{EntityClass, RawTrackRecord, TrackFields};

    fn fused(id: &str, lat: Option<f64>, lon: Option<f64>, status: Option<&str>) -> FusedTrackRecord {
        let fields = TrackFields {
            lat,
            lon,
            status: status.map(str::to_string),
            ..Default::default()
        };
        let raw = RawTrackRecord::new(id, EntityClass::Aircraft, "adsbexchange", fields, 0.9, 0.0).unwrap();
        FusedTrackRecord::from_raw(&raw, 0.0)
    }

    fn dedup() -> Deduplicator {
        Deduplicator::new(&Config::default().dedup)
    }

    #[test]
    fn test_first_record_accepted() {
        let d = dedup();
        let r = fused("7C1B72", Some(11.676549), Some(109.199291), None);
        assert_eq!(d.check(&r, 100.0), DedupVerdict::Accepted);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_tiny_move_within_window_is_duplicate() {
        let d = dedup();
        d.check(&fused("7C1B72", Some(11.676549), Some(109.199291), None), 100.0);
        let v = d.check(&fused("7C1B72", Some(11.676550), Some(109.199292), None), 110.0);
        assert!(v.is_duplicate());
    }

    #[test]
    fn test_duplicate_leaves_cache_untouched() {
        let d = dedup();
        d.check(&fused("A1", Some(10.0), Some(100.0), None), 100.0);
        assert!(d.check(&fused("A1", Some(10.0), Some(100.0), None), 125.0).is_duplicate());
        // still measured from the original insert at t=100, so expired at t=131
        assert_eq!(d.check(&fused("A1", Some(10.0), Some(100.0), None), 131.0), DedupVerdict::Accepted);
    }

    #[test]
    fn test_outside_window_accepted() {
        let d = dedup();
        d.check(&fused("A1", Some(10.0), Some(100.0), None), 100.0);
        assert_eq!(d.check(&fused("A1", Some(10.0), Some(100.0), None), 140.0), DedupVerdict::Accepted);
    }

    #[test]
    fn test_real_move_accepted() {
        let d = dedup();
        d.check(&fused("A1", Some(10.0), Some(100.0), None), 100.0);
        assert_eq!(d.check(&fused("A1", Some(10.01), Some(100.0), None), 101.0), DedupVerdict::Accepted);
    }

    #[test]
    fn test_missing_position_fails_open() {
        let d = dedup();
        d.check(&fused("A1", Some(10.0), Some(100.0), None), 100.0);
        assert_eq!(d.check(&fused("A1", None, None, None), 101.0), DedupVerdict::Accepted);
        assert_eq!(d.check(&fused("A1", Some(10.0), Some(100.0), None), 102.0), DedupVerdict::Accepted);
    }

    #[test]
    fn test_emergency_bypass() {
        let d = dedup();
        d.check(&fused("ABC123", Some(10.0), Some(100.0), Some("7700")), 100.0);
        assert_eq!(
            d.check(&fused("ABC123", Some(10.0), Some(100.0), Some("7700")), 105.0),
            DedupVerdict::Accepted
        );

        let mut strict = dedup();
        strict.emergency_bypass = false;
        strict.check(&fused("ABC123", Some(10.0), Some(100.0), Some("7700")), 100.0);
        assert!(strict
            .check(&fused("ABC123", Some(10.0), Some(100.0), Some("7700")), 105.0)
            .is_duplicate());
    }

    #[test]
    fn test_purge_stale() {
        let d = dedup();
        d.check(&fused("A1", Some(10.0), Some(100.0), None), 100.0);
        d.check(&fused("B2", Some(10.0), Some(100.0), None), 120.0);
        assert_eq!(d.purge_stale(140.0), 1);
        assert_eq!(d.len(), 1);
    }
}
