//! Entity and bounding-box subscription registry.
//!
//! Sessions subscribe either to one entity id or to a rectangular area. Many
//! sessions may share one area; the area entry is dropped when its last
//! session leaves. Keys are normalized (`entity_<ID>`,
//! `area_<minLat>_<maxLat>_<minLon>_<maxLon>`) and returned in every
//! confirmation.

use std::collections::{BTreeSet, HashSet};

use dashmap::DashMap;
use serde::Serialize;

use crate::geo::BoundingBox;
use crate::types::{normalize_entity_id, Result, TrackError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    Entity,
    Area,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

/// Reply to every subscribe/unsubscribe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    #[serde(rename = "type")]
    pub kind: SubscriptionKind,
    pub status: SubscriptionStatus,
    pub key: String,
}

pub fn entity_key(entity_id: &str) -> String {
    format!("entity_{}", normalize_entity_id(entity_id))
}

struct AreaEntry {
    bbox: BoundingBox,
    sessions: HashSet<String>,
}

/// A live area and the sessions watching it.
#[derive(Debug, Clone)]
pub struct AreaSubscribers {
    pub key: String,
    pub bbox: BoundingBox,
    pub sessions: Vec<String>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_entity: DashMap<String, HashSet<String>>,
    by_area: DashMap<String, AreaEntry>,
    by_session: DashMap<String, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    pub fn subscribe_entity(&self, session: &str, entity_id: &str) -> Result<Confirmation> {
        let id = normalize_entity_id(entity_id);
        if id.is_empty() {
            return Err(TrackError::EmptyEntityId);
        }
        self.by_entity
            .entry(id.clone())
            .or_default()
            .insert(session.to_string());
        let key = entity_key(&id);
        self.remember(session, &key);
        Ok(confirm(SubscriptionKind::Entity, SubscriptionStatus::Subscribed, key))
    }

    pub fn subscribe_area(
        &self,
        session: &str,
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    ) -> Result<Confirmation> {
        let bbox = BoundingBox::new(min_lat, max_lat, min_lon, max_lon)?;
        let key = bbox.area_key();
        self.by_area
            .entry(key.clone())
            .or_insert_with(|| AreaEntry {
                bbox,
                sessions: HashSet::new(),
            })
            .sessions
            .insert(session.to_string());
        self.remember(session, &key);
        Ok(confirm(SubscriptionKind::Area, SubscriptionStatus::Subscribed, key))
    }

    pub fn unsubscribe_entity(&self, session: &str, entity_id: &str) -> Confirmation {
        let id = normalize_entity_id(entity_id);
        let key = entity_key(&id);
        self.drop_entity_session(&id, session);
        self.forget(session, &key);
        confirm(SubscriptionKind::Entity, SubscriptionStatus::Unsubscribed, key)
    }

    /// The key is re-normalized, so `area_8.5_23.5_102_109.5` matches too.
    pub fn unsubscribe_area(&self, session: &str, area_key: &str) -> Result<Confirmation> {
        let key = BoundingBox::from_area_key(area_key)?.area_key();
        self.drop_area_session(&key, session);
        self.forget(session, &key);
        Ok(confirm(SubscriptionKind::Area, SubscriptionStatus::Unsubscribed, key))
    }

    /// Remove every subscription held by `session`. Returns the keys removed.
    pub fn disconnect(&self, session: &str) -> Vec<String> {
        let Some((_, keys)) = self.by_session.remove(session) else {
            return Vec::new();
        };
        let mut removed: Vec<String> = keys.into_iter().collect();
        removed.sort();
        for key in &removed {
            if let Some(id) = key.strip_prefix("entity_") {
                self.drop_entity_session(id, session);
            } else {
                self.drop_area_session(key, session);
            }
        }
        removed
    }

    /// Sessions that should receive an update for this entity at this
    /// position. Each session appears once even when several of its
    /// subscriptions match.
    pub fn matching_sessions(&self, entity_id: &str, position: Option<(f64, f64)>) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if let Some(sessions) = self.by_entity.get(entity_id) {
            out.extend(sessions.iter().cloned());
        }
        if let Some((lat, lon)) = position {
            for area in self.by_area.iter() {
                if area.bbox.contains(lat, lon) {
                    out.extend(area.sessions.iter().cloned());
                }
            }
        }
        out
    }

    pub fn areas(&self) -> Vec<AreaSubscribers> {
        let mut out: Vec<AreaSubscribers> = self
            .by_area
            .iter()
            .map(|a| {
                let mut sessions: Vec<String> = a.sessions.iter().cloned().collect();
                sessions.sort();
                AreaSubscribers {
                    key: a.key().clone(),
                    bbox: a.bbox,
                    sessions,
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn sessions(&self) -> Vec<String> {
        self.by_session.iter().map(|e| e.key().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }

    pub fn area_count(&self) -> usize {
        self.by_area.len()
    }

    pub fn entity_subscription_count(&self) -> usize {
        self.by_entity.len()
    }

    fn remember(&self, session: &str, key: &str) {
        self.by_session
            .entry(session.to_string())
            .or_default()
            .insert(key.to_string());
    }

    fn forget(&self, session: &str, key: &str) {
        if let Some(mut keys) = self.by_session.get_mut(session) {
            keys.remove(key);
        }
        self.by_session.remove_if(session, |_, keys| keys.is_empty());
    }

    fn drop_entity_session(&self, entity_id: &str, session: &str) {
        if let Some(mut sessions) = self.by_entity.get_mut(entity_id) {
            sessions.remove(session);
        }
        self.by_entity.remove_if(entity_id, |_, s| s.is_empty());
    }

    fn drop_area_session(&self, key: &str, session: &str) {
        if let Some(mut area) = self.by_area.get_mut(key) {
            area.sessions.remove(session);
        }
        self.by_area.remove_if(key, |_, a| a.sessions.is_empty());
    }
}

fn confirm(kind: SubscriptionKind, status: SubscriptionStatus, key: String) -> Confirmation {
    Confirmation { kind, status, key }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
