//! Multi-source track fusion.
//!
//! All raw records buffered for one entity during a fusion window are merged
//! into a single [`FusedTrackRecord`]:
//!
//! 1. Sort by source priority (lower rank first), then newest receipt first.
//! 2. The top record is the base; absent fields are filled from the next
//!    record in sorted order that carries them.
//! 3. Positions received inside the freshness window are averaged when two
//!    or more qualify.
//! 4. Quality is the base quality plus a multi-source agreement bonus, with
//!    a penalty when the base record is stale.
//!
//! Records for different entities never interact, so a failure on one entity
//! only skips that entity for the pass.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::config::{FusionConfig, SourceConfig, UNKNOWN_SOURCE_PRIORITY};
use crate::types::{FusedTrackRecord, RawTrackRecord, Result, TrackError};

/// Bonus per distinct contributing source.
pub const SOURCE_AGREEMENT_STEP: f64 = 0.05;
/// Upper bound of the agreement bonus.
pub const SOURCE_AGREEMENT_CAP: f64 = 0.2;
/// Multiplier applied when the base record is older than the staleness threshold.
pub const STALE_PENALTY: f64 = 0.8;

// ---------------------------------------------------------------------------
// Source priority table
// ---------------------------------------------------------------------------

/// Immutable map from source name to rank. Lower is more trusted.
#[derive(Debug, Clone)]
pub struct SourcePriorityTable {
    ranks: HashMap<String, u32>,
}

impl SourcePriorityTable {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        SourcePriorityTable {
            ranks: entries.into_iter().map(|(s, r)| (s.into(), r)).collect(),
        }
    }

    pub fn from_sources(sources: &[SourceConfig]) -> Self {
        Self::new(sources.iter().map(|s| (s.name.clone(), s.priority)))
    }

    pub fn rank(&self, source: &str) -> u32 {
        self.ranks
            .get(source)
            .copied()
            .unwrap_or(UNKNOWN_SOURCE_PRIORITY)
    }
}

impl Default for SourcePriorityTable {
    fn default() -> Self {
        Self::new([
            ("flightradar24", 1),
            ("adsbexchange", 2),
            ("marinetraffic", 1),
            ("vesselfinder", 2),
        ])
    }
}

// ---------------------------------------------------------------------------
// Fusion engine
// ---------------------------------------------------------------------------

/// Result of fusing one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FusionOutcome {
    Fused(FusedTrackRecord),
    /// Quality fell below the configured minimum.
    Filtered { entity_id: String, quality: f64 },
    Failed { entity_id: String, reason: String },
}

impl FusionOutcome {
    pub fn entity_id(&self) -> &str {
        match self {
            FusionOutcome::Fused(r) => &r.entity_id,
            FusionOutcome::Filtered { entity_id, .. } | FusionOutcome::Failed { entity_id, .. } => {
                entity_id
            }
        }
    }
}

pub struct FusionEngine {
    pub priorities: SourcePriorityTable,
    pub config: FusionConfig,
}

impl FusionEngine {
    pub fn new(priorities: SourcePriorityTable, config: FusionConfig) -> Self {
        FusionEngine { priorities, config }
    }

    /// Fuse a drained buffer. Outcomes come back ordered by entity id.
    ///
    /// With fusion disabled every raw record passes through as its own
    /// fused record.
    pub fn fuse_batch(
        &self,
        batch: HashMap<String, Vec<RawTrackRecord>>,
        now: f64,
    ) -> Vec<FusionOutcome> {
        let mut entities: Vec<_> = batch.into_iter().filter(|(_, v)| !v.is_empty()).collect();
        entities.sort_by(|a, b| a.0.cmp(&b.0));

        if !self.config.enabled {
            return entities
                .into_iter()
                .flat_map(|(_, records)| records)
                .map(|r| FusionOutcome::Fused(FusedTrackRecord::from_raw(&r, now)))
                .collect();
        }

        entities
            .iter()
            .map(|(id, records)| self.fuse_entity(id, records, now))
            .collect()
    }

    /// Fuse every buffered record of one entity and apply the quality floor.
    pub fn fuse_entity(&self, entity_id: &str, records: &[RawTrackRecord], now: f64) -> FusionOutcome {
        match self.merge(entity_id, records, now) {
            Ok(fused) if fused.quality >= self.config.min_quality => FusionOutcome::Fused(fused),
            Ok(fused) => FusionOutcome::Filtered {
                entity_id: entity_id.to_string(),
                quality: fused.quality,
            },
            Err(e) => FusionOutcome::Failed {
                entity_id: entity_id.to_string(),
                reason: e.to_string(),
            },
        }
    }

    /// Merge without the quality floor.
    pub fn merge(&self, entity_id: &str, records: &[RawTrackRecord], now: f64) -> Result<FusedTrackRecord> {
        let fail = |reason: &str| TrackError::FusionFailed {
            entity_id: entity_id.to_string(),
            reason: reason.to_string(),
        };

        let mut sorted: Vec<&RawTrackRecord> = records.iter().collect();
        if sorted.is_empty() {
            return Err(fail("no records"));
        }
        if sorted.iter().any(|r| r.entity_id != entity_id) {
            return Err(fail("record keyed to another entity"));
        }
        let class = sorted[0].class;
        if sorted.iter().any(|r| r.class != class) {
            return Err(fail("mixed entity classes"));
        }

        sorted.sort_by(|a, b| self.compare(a, b));
        let base = sorted[0];
        let timing = self.config.timing(class);

        let mut fields = base.fields.clone();
        for r in &sorted[1..] {
            fields.fill_from(&r.fields);
        }

        let fresh: Vec<(f64, f64)> = sorted
            .iter()
            .filter(|r| r.age(now) < timing.freshness_secs)
            .filter_map(|r| r.fields.position())
            .collect();
        if fresh.len() >= 2 {
            let n = fresh.len() as f64;
            fields.lat = Some(fresh.iter().map(|p| p.0).sum::<f64>() / n);
            fields.lon = Some(fresh.iter().map(|p| p.1).sum::<f64>() / n);
        }

        let sources: BTreeSet<String> = sorted.iter().map(|r| r.source.clone()).collect();
        let mut quality = base.quality;
        if sources.len() > 1 {
            let bonus = (SOURCE_AGREEMENT_STEP * sources.len() as f64).min(SOURCE_AGREEMENT_CAP);
            quality = (quality + bonus).min(1.0);
        }
        if base.age(now) > timing.staleness_secs {
            quality *= STALE_PENALTY;
        }

        Ok(FusedTrackRecord {
            entity_id: entity_id.to_string(),
            class,
            fields,
            quality: quality.clamp(0.0, 1.0),
            sources,
            primary_source: base.source.clone(),
            fused_at: now,
        })
    }

    /// Rank ascending, then receipt time descending, then source name for a
    /// total order.
    fn compare(&self, a: &RawTrackRecord, b: &RawTrackRecord) -> Ordering {
        self.priorities
            .rank(&a.source)
            .cmp(&self.priorities.rank(&b.source))
            .then_with(|| b.received_at.total_cmp(&a.received_at))
            .then_with(|| a.source.cmp(&b.source))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
