//! Post-fusion pipeline: dedup, storage gate, fan-out, persistence.
//!
//! Every fused record runs the same sequence. A duplicate stops at the
//! deduplicator. Anything else gets a gate decision, is handed to the
//! notifier without waiting on storage, and then lands in SQLite: the current
//! row always, the history table only when the gate says so. Raw reports are
//! archived before fusion and linked to the fused record afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use track_core::config::{Config, RawArchiveConfig};
use track_core::dedup::{DedupVerdict, Deduplicator};
use track_core::fusion::FusionOutcome;
use track_core::gate::{GateDecision, PersistReason, StateStore, StorageGate};
use track_core::types::{FusedTrackRecord, RawTrackRecord};

use crate::db::TrackStore;
use crate::notifier::GeoNotifier;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub raw_received: AtomicU64,
    pub raw_invalid: AtomicU64,
    pub fused: AtomicU64,
    pub filtered: AtomicU64,
    pub fusion_failures: AtomicU64,
    pub duplicates: AtomicU64,
    pub persisted: AtomicU64,
    pub cache_only: AtomicU64,
    pub store_errors: AtomicU64,
    pub notifications_delivered: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub raw_archived: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub raw_received: u64,
    pub raw_invalid: u64,
    pub fused: u64,
    pub filtered: u64,
    pub fusion_failures: u64,
    pub duplicates: u64,
    pub persisted: u64,
    pub cache_only: u64,
    pub store_errors: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub raw_archived: u64,
}

impl PipelineStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            raw_received: get(&self.raw_received),
            raw_invalid: get(&self.raw_invalid),
            fused: get(&self.fused),
            filtered: get(&self.filtered),
            fusion_failures: get(&self.fusion_failures),
            duplicates: get(&self.duplicates),
            persisted: get(&self.persisted),
            cache_only: get(&self.cache_only),
            store_errors: get(&self.store_errors),
            notifications_delivered: get(&self.notifications_delivered),
            notifications_failed: get(&self.notifications_failed),
            raw_archived: get(&self.raw_archived),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// What happened to one fused record.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Duplicate,
    Persisted(PersistReason),
    /// The gate asked for a durable write and the store refused it. The
    /// entity's last persisted snapshot is rolled back, so the next update
    /// is evaluated against what actually reached storage.
    PersistFailed(PersistReason),
    Cached,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CleanupReport {
    pub entities: usize,
    pub dedup_entries: usize,
    pub raw_records: usize,
}

pub struct Pipeline {
    dedup: Deduplicator,
    gate: StorageGate,
    archive: RawArchiveConfig,
    pub state: Arc<StateStore>,
    store: Arc<dyn TrackStore>,
    notifier: Arc<GeoNotifier>,
    pub stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        state: Arc<StateStore>,
        store: Arc<dyn TrackStore>,
        notifier: Arc<GeoNotifier>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Pipeline {
            dedup: Deduplicator::new(&config.dedup),
            gate: StorageGate::new(config.storage.clone()),
            archive: config.raw_archive.clone(),
            state,
            store,
            notifier,
            stats,
        }
    }

    /// Archive the raw reports of one fusion pass. Failures are counted and
    /// never hold up fusion.
    pub async fn archive_raw(&self, records: &[RawTrackRecord]) -> usize {
        if !self.archive.enabled || records.is_empty() {
            return 0;
        }
        match self.store.archive_raw(records).await {
            Ok(n) => {
                self.stats.raw_archived.fetch_add(n as u64, Ordering::Relaxed);
                n
            }
            Err(e) => {
                PipelineStats::incr(&self.stats.store_errors);
                warn!(records = records.len(), error = %e, "raw archive write failed");
                0
            }
        }
    }

    /// Route one fusion pass. Filtered and failed entities are only counted.
    pub async fn handle_outcomes(&self, outcomes: Vec<FusionOutcome>, now: f64) -> usize {
        let mut accepted = 0;
        for outcome in outcomes {
            match outcome {
                FusionOutcome::Fused(record) => {
                    PipelineStats::incr(&self.stats.fused);
                    if self.process(record, now).await != Processed::Duplicate {
                        accepted += 1;
                    }
                }
                FusionOutcome::Filtered { entity_id, quality } => {
                    PipelineStats::incr(&self.stats.filtered);
                    debug!(entity = %entity_id, quality, "below quality floor");
                }
                FusionOutcome::Failed { entity_id, reason } => {
                    PipelineStats::incr(&self.stats.fusion_failures);
                    warn!(entity = %entity_id, %reason, "fusion failed, entity skipped this pass");
                }
            }
        }
        accepted
    }

    pub async fn process(&self, record: FusedTrackRecord, now: f64) -> Processed {
        if let DedupVerdict::Duplicate { distance_km } = self.dedup.check(&record, now) {
            PipelineStats::incr(&self.stats.duplicates);
            debug!(entity = %record.entity_id, distance_km, "duplicate dropped");
            return Processed::Duplicate;
        }

        if !self.state.contains(&record.entity_id) {
            self.seed(&record, now).await;
        }

        let applied = self.state.apply_tracked(&self.gate, &record, now);

        // Fan-out never waits on storage.
        self.notifier.publish(&record);

        if let Err(e) = self.store.upsert_current(&record).await {
            PipelineStats::incr(&self.stats.store_errors);
            warn!(entity = %record.entity_id, error = %e, "current-state write failed");
        }

        if self.archive.enabled {
            if let Err(e) = self.store.link_fused(&record).await {
                warn!(entity = %record.entity_id, error = %e, "raw link failed");
            }
        }

        match applied.decision {
            GateDecision::Persist(reason) => {
                match &reason {
                    PersistReason::EvaluationError(e) => {
                        warn!(entity = %record.entity_id, error = %e, "gate evaluation failed, persisting")
                    }
                    PersistReason::Emergency => {
                        info!(entity = %record.entity_id, status = ?record.fields.status, "emergency update")
                    }
                    other => debug!(entity = %record.entity_id, reason = ?other, "persist"),
                }
                match self.store.append_durable(&record).await {
                    Ok(()) => {
                        PipelineStats::incr(&self.stats.persisted);
                        Processed::Persisted(reason)
                    }
                    Err(e) => {
                        PipelineStats::incr(&self.stats.store_errors);
                        warn!(entity = %record.entity_id, error = %e, "durable write failed, snapshot rolled back");
                        self.state.revert_persist(&record, now, applied.previous);
                        Processed::PersistFailed(reason)
                    }
                }
            }
            GateDecision::CacheOnly => {
                PipelineStats::incr(&self.stats.cache_only);
                Processed::Cached
            }
        }
    }

    /// Load the last durable snapshot for an entity seen for the first time
    /// since startup. A lookup failure seeds nothing, so the gate persists.
    async fn seed(&self, record: &FusedTrackRecord, now: f64) {
        let snapshot = match self.store.get_last_snapshot(&record.entity_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(entity = %record.entity_id, error = %e, "snapshot lookup failed");
                None
            }
        };
        self.state.seed(&record.entity_id, record.class, snapshot, now);
    }

    /// Drop inactive entities, expired dedup entries and raw reports past
    /// retention.
    pub async fn cleanup(&self, config: &Config, now: f64) -> CleanupReport {
        CleanupReport {
            entities: self.state.purge_inactive(&config.fusion, now),
            dedup_entries: self.dedup.purge_stale(now),
            raw_records: self.purge_raw_archive(now).await,
        }
    }

    async fn purge_raw_archive(&self, now: f64) -> usize {
        if !self.archive.enabled {
            return 0;
        }
        match self.store.purge_raw(now - self.archive.retention_secs()).await {
            Ok(n) => {
                if n > 0 {
                    info!(records = n, "raw archive purged");
                }
                n
            }
            Err(e) => {
                PipelineStats::incr(&self.stats.store_errors);
                warn!(error = %e, "raw archive purge failed");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
