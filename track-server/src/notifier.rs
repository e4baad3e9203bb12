//! Geo fan-out of accepted track updates to subscriber sessions.
//!
//! Each session owns a bounded queue. Delivery is `try_send`: a full or
//! closed queue is logged and counted, never retried, and never blocks the
//! pipeline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use track_core::config::NotifierConfig;
use track_core::gate::StateStore;
use track_core::geo::BoundingBox;
use track_core::subscription::{Confirmation, SubscriptionRegistry};
use track_core::types::{now, FusedTrackRecord, Result};

use crate::pipeline::PipelineStats;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TrackUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub record: FusedTrackRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaBatch {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub area_key: String,
    pub timestamp: f64,
    pub count: usize,
    pub updates: Vec<FusedTrackRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Update(TrackUpdate),
    Batch(AreaBatch),
}

impl OutboundMessage {
    pub fn update(record: FusedTrackRecord) -> Self {
        OutboundMessage::Update(TrackUpdate {
            kind: "track_update",
            record,
        })
    }

    pub fn batch(area_key: String, updates: Vec<FusedTrackRecord>, timestamp: f64) -> Self {
        OutboundMessage::Batch(AreaBatch {
            kind: "area_batch",
            area_key,
            timestamp,
            count: updates.len(),
            updates,
        })
    }
}

/// Receiving end handed to a newly connected subscriber.
pub struct SessionHandle {
    pub id: String,
    pub rx: mpsc::Receiver<Arc<OutboundMessage>>,
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

pub struct GeoNotifier {
    registry: SubscriptionRegistry,
    sessions: DashMap<String, mpsc::Sender<Arc<OutboundMessage>>>,
    state: Arc<StateStore>,
    config: NotifierConfig,
    stats: Arc<PipelineStats>,
}

impl GeoNotifier {
    pub fn new(config: NotifierConfig, state: Arc<StateStore>, stats: Arc<PipelineStats>) -> Self {
        GeoNotifier {
            registry: SubscriptionRegistry::new(),
            sessions: DashMap::new(),
            state,
            config,
            stats,
        }
    }

    pub fn connect(&self) -> SessionHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.session_buffer.max(1));
        self.sessions.insert(id.clone(), tx);
        debug!(session = %id, "session connected");
        SessionHandle { id, rx }
    }

    pub fn subscribe_entity(&self, session: &str, entity_id: &str) -> Result<Confirmation> {
        self.registry.subscribe_entity(session, entity_id)
    }

    /// Subscribe to a box and immediately send what is already inside it.
    pub fn subscribe_area(
        &self,
        session: &str,
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    ) -> Result<Confirmation> {
        let confirmation = self
            .registry
            .subscribe_area(session, min_lat, max_lat, min_lon, max_lon)?;
        let bbox = BoundingBox::from_area_key(&confirmation.key)?;
        let snapshot = self.state.latest_in(&bbox);
        let message = Arc::new(OutboundMessage::batch(confirmation.key.clone(), snapshot, now()));
        self.deliver(session, message);
        Ok(confirmation)
    }

    pub fn unsubscribe_entity(&self, session: &str, entity_id: &str) -> Confirmation {
        self.registry.unsubscribe_entity(session, entity_id)
    }

    pub fn unsubscribe_area(&self, session: &str, area_key: &str) -> Result<Confirmation> {
        self.registry.unsubscribe_area(session, area_key)
    }

    /// Drop the session and all of its subscriptions.
    pub fn disconnect(&self, session: &str) -> Vec<String> {
        self.sessions.remove(session);
        let removed = self.registry.disconnect(session);
        debug!(session, subscriptions = removed.len(), "session disconnected");
        removed
    }

    /// Fan out one accepted update. With batching on, area subscribers wait
    /// for the next batch and only entity subscribers are served now.
    pub fn publish(&self, record: &FusedTrackRecord) -> usize {
        let position = if self.config.batch_enabled {
            None
        } else {
            record.position()
        };
        let targets = self.registry.matching_sessions(&record.entity_id, position);
        if targets.is_empty() {
            return 0;
        }
        let message = Arc::new(OutboundMessage::update(record.clone()));
        targets
            .iter()
            .filter(|session| self.deliver(session, Arc::clone(&message)))
            .count()
    }

    /// One coalesced message per box with every entity currently inside it.
    pub fn flush_batches(&self, timestamp: f64) -> usize {
        let mut sent = 0;
        for area in self.registry.areas() {
            let updates = self.state.latest_in(&area.bbox);
            if updates.is_empty() {
                continue;
            }
            let message = Arc::new(OutboundMessage::batch(area.key.clone(), updates, timestamp));
            for session in &area.sessions {
                if self.deliver(session, Arc::clone(&message)) {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub async fn run_batches(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.batch_enabled {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(self.config.batch_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sent = self.flush_batches(now());
                    if sent > 0 {
                        debug!(sent, "area batches delivered");
                    }
                }
            }
        }
    }

    /// Disconnect sessions whose receiver has been dropped.
    pub fn cleanup_closed(&self) -> usize {
        let closed: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.value().is_closed())
            .map(|s| s.key().clone())
            .collect();
        for session in &closed {
            self.disconnect(session);
        }
        closed.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn area_count(&self) -> usize {
        self.registry.area_count()
    }

    fn deliver(&self, session: &str, message: Arc<OutboundMessage>) -> bool {
        let Some(tx) = self.sessions.get(session).map(|s| s.value().clone()) else {
            PipelineStats::incr(&self.stats.notifications_failed);
            debug!(session, "no live session for subscription");
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => {
                PipelineStats::incr(&self.stats.notifications_delivered);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                PipelineStats::incr(&self.stats.notifications_failed);
                warn!(session, "session queue full, update dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                PipelineStats::incr(&self.stats.notifications_failed);
                debug!(session, "session closed, update dropped");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use track_core::config::Config;
    use track_core::gate::StorageGate;
    use track_core::types::{EntityClass, RawTrackRecord, TrackFields};

    fn record(id: &str, lat: f64, lon: f64) -> FusedTrackRecord {
        let fields = TrackFields {
            lat: Some(lat),
            lon: Some(lon),
            ..Default::default()
        };
        let raw = RawTrackRecord::new(id, EntityClass::Aircraft, "adsbexchange", fields, 0.9, 0.0).unwrap();
        FusedTrackRecord::from_raw(&raw, 0.0)
    }

    fn notifier(config: NotifierConfig) -> (GeoNotifier, Arc<StateStore>) {
        let state = Arc::new(StateStore::new());
        let stats = Arc::new(PipelineStats::default());
        (GeoNotifier::new(config, state.clone(), stats), state)
    }

    fn payload(msg: &OutboundMessage) -> serde_json::Value {
        serde_json::to_value(msg).unwrap()
    }

    #[tokio::test]
    async fn test_area_delivery_inclusive() {
        let (n, _) = notifier(Config::default().notifier);
        let mut s = n.connect();
        n.subscribe_area(&s.id, 8.5, 23.5, 102.0, 109.5).unwrap();
        let initial = s.rx.try_recv().unwrap();
        assert_eq!(payload(&initial)["type"], "area_batch");
        assert_eq!(payload(&initial)["count"], 0);

        assert_eq!(n.publish(&record("IN1", 11.68, 109.20)), 1);
        assert_eq!(n.publish(&record("OUT1", 30.0, 109.20)), 0);

        let msg = s.rx.try_recv().unwrap();
        let json = payload(&msg);
        assert_eq!(json["type"], "track_update");
        assert_eq!(json["record"]["entity_id"], "IN1");
        assert!(s.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_gets_one_copy() {
        let (n, _) = notifier(Config::default().notifier);
        let mut s = n.connect();
        n.subscribe_entity(&s.id, "7C1B72").unwrap();
        n.subscribe_area(&s.id, 0.0, 30.0, 100.0, 110.0).unwrap();
        s.rx.try_recv().unwrap();

        assert_eq!(n.publish(&record("7C1B72", 11.0, 106.0)), 1);
        s.rx.try_recv().unwrap();
        assert!(s.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_initial_snapshot_contains_known_entities() {
        let (n, state) = notifier(Config::default().notifier);
        let gate = StorageGate::new(Config::default().storage);
        state.apply(&gate, &record("IN1", 11.68, 109.20), 0.0);
        state.apply(&gate, &record("OUT1", 30.0, 109.20), 0.0);

        let mut s = n.connect();
        n.subscribe_area(&s.id, 8.5, 23.5, 102.0, 109.5).unwrap();
        let json = payload(&s.rx.try_recv().unwrap());
        assert_eq!(json["count"], 1);
        assert_eq!(json["updates"][0]["entity_id"], "IN1");
    }

    #[tokio::test]
    async fn test_full_queue_is_dropped_not_blocking() {
        let mut config = Config::default().notifier;
        config.session_buffer = 1;
        let (n, _) = notifier(config);
        let s = n.connect();
        n.subscribe_entity(&s.id, "A1").unwrap();
        assert_eq!(n.publish(&record("A1", 10.0, 106.0)), 1);
        assert_eq!(n.publish(&record("A1", 10.1, 106.0)), 0);
        let snap = n.stats.snapshot();
        assert_eq!((snap.notifications_delivered, snap.notifications_failed), (1, 1));
    }

    #[tokio::test]
    async fn test_batch_mode_defers_area_updates() {
        let mut config = Config::default().notifier;
        config.batch_enabled = true;
        let (n, state) = notifier(config);
        let gate = StorageGate::new(Config::default().storage);

        let mut area = n.connect();
        let c = n.subscribe_area(&area.id, 8.5, 23.5, 102.0, 109.5).unwrap();
        area.rx.try_recv().unwrap();
        let mut watcher = n.connect();
        n.subscribe_entity(&watcher.id, "IN1").unwrap();

        let r = record("IN1", 11.68, 109.20);
        state.apply(&gate, &r, 0.0);
        assert_eq!(n.publish(&r), 1);
        assert!(watcher.rx.try_recv().is_ok());
        assert!(area.rx.try_recv().is_err());

        assert_eq!(n.flush_batches(5.0), 1);
        let json = payload(&area.rx.try_recv().unwrap());
        assert_eq!(json["area_key"], c.key);
        assert_eq!(json["count"], 1);
        assert_eq!(json["timestamp"], 5.0);
    }

    #[tokio::test]
    async fn test_cleanup_closed_sessions() {
        let (n, _) = notifier(Config::default().notifier);
        let s = n.connect();
        n.subscribe_entity(&s.id, "A1").unwrap();
        drop(s.rx);
        assert_eq!(n.cleanup_closed(), 1);
        assert_eq!(n.session_count(), 0);
        assert_eq!(n.publish(&record("A1", 10.0, 106.0)), 0);
    }

    #[tokio::test]
    async fn test_disconnect_returns_keys() {
        let (n, _) = notifier(Config::default().notifier);
        let s = n.connect();
        n.subscribe_entity(&s.id, "a1").unwrap();
        let removed = n.disconnect(&s.id);
        assert_eq!(removed, vec!["entity_A1".to_string()]);
        assert_eq!(n.session_count(), 0);
    }
}
