//! Per-class fusion buffer with timer and size triggers.
//!
//! Raw records accumulate keyed by entity id. A pass swaps the whole buffer
//! for an empty one under the lock, so a record is either in the drained
//! snapshot or in the new buffer, never both and never neither.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use track_core::config::FusionConfig;
use track_core::fusion::FusionEngine;
use track_core::types::{now, EntityClass, RawTrackRecord};

use crate::pipeline::Pipeline;

#[derive(Default)]
struct Buffer {
    by_entity: HashMap<String, Vec<RawTrackRecord>>,
    records: usize,
}

pub struct FusionAggregator {
    pub class: EntityClass,
    buffer: Mutex<Buffer>,
    max_batch: usize,
    interval: Duration,
    trigger: Notify,
}

impl FusionAggregator {
    pub fn new(class: EntityClass, config: &FusionConfig) -> Self {
        FusionAggregator {
            class,
            buffer: Mutex::new(Buffer::default()),
            max_batch: config.max_batch_size.max(1),
            interval: Duration::from_secs_f64(config.timing(class).fusion_interval_secs),
            trigger: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        // Buffer holds plain data; a panic mid-push leaves it usable.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buffer one record. Returns true when the size trigger fired.
    pub fn ingest(&self, record: RawTrackRecord) -> bool {
        let full = {
            let mut buf = self.lock();
            buf.by_entity
                .entry(record.entity_id.clone())
                .or_default()
                .push(record);
            buf.records += 1;
            buf.records >= self.max_batch
        };
        if full {
            self.trigger.notify_one();
        }
        full
    }

    /// Take the whole buffer, leaving an empty one behind.
    pub fn drain(&self) -> HashMap<String, Vec<RawTrackRecord>> {
        std::mem::take(&mut *self.lock()).by_entity
    }

    pub fn buffered(&self) -> usize {
        self.lock().records
    }

    /// Drain and fuse one pass. Returns the number of fusion outcomes.
    pub async fn flush(&self, engine: &FusionEngine, pipeline: &Pipeline, now: f64) -> usize {
        let batch = self.drain();
        if batch.is_empty() {
            return 0;
        }
        let raw: Vec<RawTrackRecord> = batch.values().flatten().cloned().collect();
        let records = raw.len();
        pipeline.archive_raw(&raw).await;
        let outcomes = engine.fuse_batch(batch, now);
        let count = outcomes.len();
        let accepted = pipeline.handle_outcomes(outcomes, now).await;
        debug!(class = %self.class, records, entities = count, accepted, "fusion pass");
        count
    }

    /// Run passes until cancelled, then flush whatever is left.
    pub async fn run(self: Arc<Self>, engine: Arc<FusionEngine>, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let n = self.flush(&engine, &pipeline, now()).await;
                    info!(class = %self.class, entities = n, "final fusion flush");
                    break;
                }
                _ = self.trigger.notified() => {
                    self.flush(&engine, &pipeline, now()).await;
                }
                _ = ticker.tick() => {
                    self.flush(&engine, &pipeline, now()).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
