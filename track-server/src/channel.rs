//! Raw channels between adapters and aggregators.
//!
//! One channel per (source, class), topic `raw.<class>.<source>`. Messages
//! carry the entity id as key and the JSON-encoded raw record as payload. A
//! single consumer per channel keeps per-key order, and it acknowledges a
//! message only once the record is buffered (or rejected).

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use track_core::types::{normalize_entity_id, EntityClass, RawTrackRecord};

use crate::aggregator::FusionAggregator;
use crate::pipeline::PipelineStats;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} closed")]
    Closed(String),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub fn topic(class: EntityClass, source: &str) -> String {
    format!("raw.{class}.{source}")
}

pub struct ChannelMessage {
    pub topic: String,
    pub key: String,
    pub payload: String,
    /// `true` once buffered, `false` when the consumer rejected the record.
    pub ack: oneshot::Sender<bool>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PublishReport {
    pub buffered: usize,
    pub rejected: usize,
}

#[derive(Clone)]
pub struct RawChannel {
    pub topic: String,
    tx: mpsc::Sender<ChannelMessage>,
}

impl RawChannel {
    pub fn new(source: &str, class: EntityClass, capacity: usize) -> (Self, mpsc::Receiver<ChannelMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let channel = RawChannel {
            topic: topic(class, source),
            tx,
        };
        (channel, rx)
    }

    pub async fn publish(&self, record: &RawTrackRecord) -> Result<oneshot::Receiver<bool>, ChannelError> {
        let (ack, acked) = oneshot::channel();
        let message = ChannelMessage {
            topic: self.topic.clone(),
            key: record.entity_id.clone(),
            payload: serde_json::to_string(record)?,
            ack,
        };
        self.tx
            .send(message)
            .await
            .map_err(|_| ChannelError::Closed(self.topic.clone()))?;
        Ok(acked)
    }

    /// Publish in order, then wait for every acknowledgement.
    pub async fn publish_batch(&self, records: Vec<RawTrackRecord>) -> Result<PublishReport, ChannelError> {
        let mut pending = Vec::with_capacity(records.len());
        for record in &records {
            pending.push(self.publish(record).await?);
        }
        let mut report = PublishReport::default();
        for acked in pending {
            match acked.await {
                Ok(true) => report.buffered += 1,
                Ok(false) => report.rejected += 1,
                Err(_) => return Err(ChannelError::Closed(self.topic.clone())),
            }
        }
        Ok(report)
    }
}

/// Decode, validate and buffer one message. Returns whether it was buffered.
pub fn accept(message: &ChannelMessage, aggregator: &FusionAggregator, stats: &PipelineStats) -> bool {
    let record = match serde_json::from_str::<RawTrackRecord>(&message.payload) {
        Ok(r) => r.normalized(),
        Err(e) => {
            PipelineStats::incr(&stats.raw_invalid);
            warn!(topic = %message.topic, key = %message.key, error = %e, "undecodable raw record");
            return false;
        }
    };
    let problem = if let Err(e) = record.validate() {
        Some(e.to_string())
    } else if record.entity_id != normalize_entity_id(&message.key) {
        Some(format!("key {} does not match entity {}", message.key, record.entity_id))
    } else if record.class != aggregator.class {
        Some(format!("{} record on {} channel", record.class, aggregator.class))
    } else {
        None
    };
    if let Some(reason) = problem {
        PipelineStats::incr(&stats.raw_invalid);
        warn!(topic = %message.topic, key = %message.key, %reason, "raw record dropped");
        return false;
    }

    PipelineStats::incr(&stats.raw_received);
    aggregator.ingest(record);
    true
}

/// Consume until cancelled, then buffer whatever is already queued.
pub async fn run_consumer(
    mut rx: mpsc::Receiver<ChannelMessage>,
    aggregator: Arc<FusionAggregator>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(m) => {
                    let ok = accept(&m, &aggregator, &stats);
                    let _ = m.ack.send(ok);
                }
                None => return,
            }
        }
    }

    rx.close();
    let mut drained = 0;
    while let Some(m) = rx.recv().await {
        let ok = accept(&m, &aggregator, &stats);
        let _ = m.ack.send(ok);
        drained += 1;
    }
    debug!(drained, "raw consumer stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
