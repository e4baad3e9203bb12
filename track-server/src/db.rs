//! SQLite persistence with WAL mode: current-state, history and raw archive.
//!
//! `current_tracks` holds one row per entity and is overwritten on every
//! accepted update. `track_history` is append-only and only receives the
//! updates the storage gate marks for durable write. `raw_records` keeps
//! every provider report until retention expires, stamped with the
//! `fused_at` of the fused record it went into.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use track_core::types::{EntityClass, FusedTrackRecord, RawTrackRecord};

/// Raw reports received this long before a fused record are linked to it.
pub const LINK_LOOKBACK_SECS: f64 = 300.0;
/// Slack after `fused_at`, for reports stamped by a clock running ahead.
pub const LINK_LOOKAHEAD_SECS: f64 = 60.0;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS current_tracks (
    entity_id TEXT PRIMARY KEY,
    class TEXT NOT NULL,
    lat REAL,
    lon REAL,
    quality REAL NOT NULL,
    sources TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS track_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    class TEXT NOT NULL,
    lat REAL,
    lon REAL,
    altitude_ft INTEGER,
    speed_kts REAL,
    course_deg REAL,
    status TEXT,
    quality REAL NOT NULL,
    payload TEXT NOT NULL,
    fused_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS raw_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id TEXT NOT NULL,
    class TEXT NOT NULL,
    source TEXT NOT NULL,
    lat REAL,
    lon REAL,
    quality REAL NOT NULL,
    response_ms INTEGER,
    payload TEXT NOT NULL,
    received_at REAL NOT NULL,
    fused_at REAL
);

CREATE INDEX IF NOT EXISTS idx_raw_entity ON raw_records(entity_id, received_at);
CREATE INDEX IF NOT EXISTS idx_raw_received_at ON raw_records(received_at);
CREATE INDEX IF NOT EXISTS idx_history_entity ON track_history(entity_id, id);
CREATE INDEX IF NOT EXISTS idx_history_fused_at ON track_history(fused_at);
CREATE INDEX IF NOT EXISTS idx_current_class ON current_tracks(class);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("payload encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(String),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub current_aircraft: i64,
    pub current_vessels: i64,
    pub history_aircraft: i64,
    pub history_vessels: i64,
    pub raw_aircraft: i64,
    pub raw_vessels: i64,
}

/// One archived provider report.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedRaw {
    pub record: RawTrackRecord,
    /// `fused_at` of the fused record this report was linked to.
    pub fused_at: Option<f64>,
}

/// Durable track storage.
#[async_trait]
pub trait TrackStore: Send + Sync {
    /// Overwrite the entity's current row. Called for every accepted update.
    async fn upsert_current(&self, record: &FusedTrackRecord) -> Result<(), StoreError>;
    /// Append to history. Called only for persist decisions.
    async fn append_durable(&self, record: &FusedTrackRecord) -> Result<(), StoreError>;
    /// Most recent durable snapshot for an entity.
    async fn get_last_snapshot(&self, entity_id: &str) -> Result<Option<FusedTrackRecord>, StoreError>;
    /// Archive raw provider reports. Returns the number stored.
    async fn archive_raw(&self, records: &[RawTrackRecord]) -> Result<usize, StoreError>;
    /// Stamp the unlinked raw reports behind `record` with its `fused_at`.
    async fn link_fused(&self, record: &FusedTrackRecord) -> Result<usize, StoreError>;
    /// Delete raw reports received before `cutoff`.
    async fn purge_raw(&self, cutoff: f64) -> Result<usize, StoreError>;
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite database for fused tracks. One connection behind a mutex; every
/// call runs on the blocking pool.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)?
        };

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory database (for testing).
    #[cfg(test)]
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn count(conn: &Connection, table: &str, class: EntityClass) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE class = ?1");
        Ok(conn.query_row(&sql, params![class.as_str()], |r| r.get(0))?)
    }

    /// History rows for one entity, oldest first.
    pub async fn history(&self, entity_id: &str) -> Result<Vec<FusedTrackRecord>, StoreError> {
        let id = entity_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT payload FROM track_history WHERE entity_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![id], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for payload in rows {
                out.push(serde_json::from_str(&payload?)?);
            }
            Ok(out)
        })
        .await
    }

    /// Archived raw reports for one entity, oldest first.
    pub async fn raw_records(&self, entity_id: &str) -> Result<Vec<ArchivedRaw>, StoreError> {
        let id = entity_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload, fused_at FROM raw_records WHERE entity_id = ?1 ORDER BY received_at, id",
            )?;
            let rows = stmt.query_map(params![id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                let (payload, fused_at) = row?;
                out.push(ArchivedRaw {
                    record: serde_json::from_str(&payload)?,
                    fused_at,
                });
            }
            Ok(out)
        })
        .await
    }

    /// Every current row, ordered by entity id.
    pub async fn current(&self) -> Result<Vec<FusedTrackRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM current_tracks ORDER BY entity_id")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            let mut out = Vec::new();
            for payload in rows {
                out.push(serde_json::from_str(&payload?)?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl TrackStore for Database {
    async fn upsert_current(&self, record: &FusedTrackRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let sources = record.sources.iter().cloned().collect::<Vec<_>>().join(",");
        let r = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO current_tracks (entity_id, class, lat, lon, quality, sources, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    class = excluded.class,
                    lat = excluded.lat,
                    lon = excluded.lon,
                    quality = excluded.quality,
                    sources = excluded.sources,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![
                    r.entity_id,
                    r.class.as_str(),
                    r.fields.lat,
                    r.fields.lon,
                    r.quality,
                    sources,
                    payload,
                    r.fused_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_durable(&self, record: &FusedTrackRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let r = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO track_history
                    (entity_id, class, lat, lon, altitude_ft, speed_kts, course_deg, status, quality, payload, fused_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    r.entity_id,
                    r.class.as_str(),
                    r.fields.lat,
                    r.fields.lon,
                    r.fields.altitude_ft,
                    r.fields.speed_kts,
                    r.fields.course_deg,
                    r.fields.status,
                    r.quality,
                    payload,
                    r.fused_at
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_last_snapshot(&self, entity_id: &str) -> Result<Option<FusedTrackRecord>, StoreError> {
        let id = entity_id.to_string();
        self.with_conn(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM track_history WHERE entity_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?;
            match payload {
                Some(p) => Ok(Some(serde_json::from_str(&p)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn archive_raw(&self, records: &[RawTrackRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows = records
            .iter()
            .map(|r| Ok((r.clone(), serde_json::to_string(r)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO raw_records
                        (entity_id, class, source, lat, lon, quality, response_ms, payload, received_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for (r, payload) in &rows {
                    stmt.execute(params![
                        r.entity_id,
                        r.class.as_str(),
                        r.source,
                        r.fields.lat,
                        r.fields.lon,
                        r.quality,
                        r.response_ms.map(|ms| ms as i64),
                        payload,
                        r.received_at
                    ])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
        .await
    }

    async fn link_fused(&self, record: &FusedTrackRecord) -> Result<usize, StoreError> {
        let id = record.entity_id.clone();
        let fused_at = record.fused_at;
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE raw_records SET fused_at = ?1
                 WHERE entity_id = ?2 AND fused_at IS NULL AND received_at BETWEEN ?3 AND ?4",
                params![
                    fused_at,
                    id,
                    fused_at - LINK_LOOKBACK_SECS,
                    fused_at + LINK_LOOKAHEAD_SECS
                ],
            )?;
            Ok(n)
        })
        .await
    }

    async fn purge_raw(&self, cutoff: f64) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM raw_records WHERE received_at < ?1", params![cutoff])?;
            Ok(n)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_conn(|conn| {
            Ok(StoreStats {
                current_aircraft: Self::count(conn, "current_tracks", EntityClass::Aircraft)?,
                current_vessels: Self::count(conn, "current_tracks", EntityClass::Vessel)?,
                history_aircraft: Self::count(conn, "track_history", EntityClass::Aircraft)?,
                history_vessels: Self::count(conn, "track_history", EntityClass::Vessel)?,
                raw_aircraft: Self::count(conn, "raw_records", EntityClass::Aircraft)?,
                raw_vessels: Self::count(conn, "raw_records", EntityClass::Vessel)?,
            })
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests)
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use track_core::types::{RawTrackRecord, TrackFields};

    fn fused(id: &str, class: EntityClass, lat: f64, fused_at: f64) -> FusedTrackRecord {
        let fields = TrackFields {
            lat: Some(lat),
            lon: Some(106.0),
            altitude_ft: Some(1200),
            status: Some("1200".into()),
            ..Default::default()
        };
        let raw = RawTrackRecord::new(id, class, "adsbexchange", fields, 0.9, fused_at).unwrap();
        FusedTrackRecord::from_raw(&raw, fused_at)
    }

    #[tokio::test]
    async fn test_upsert_current_overwrites() {
        let db = Database::open_memory().unwrap();
        db.upsert_current(&fused("A1", EntityClass::Aircraft, 10.0, 1.0)).await.unwrap();
        db.upsert_current(&fused("A1", EntityClass::Aircraft, 11.0, 2.0)).await.unwrap();
        let current = db.current().await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].fields.lat, Some(11.0));
    }

    #[tokio::test]
    async fn test_last_snapshot_is_latest_history_row() {
        let db = Database::open_memory().unwrap();
        assert!(db.get_last_snapshot("A1").await.unwrap().is_none());
        db.append_durable(&fused("A1", EntityClass::Aircraft, 10.0, 1.0)).await.unwrap();
        db.append_durable(&fused("A1", EntityClass::Aircraft, 12.0, 2.0)).await.unwrap();
        db.append_durable(&fused("B2", EntityClass::Aircraft, 13.0, 3.0)).await.unwrap();
        let last = db.get_last_snapshot("A1").await.unwrap().unwrap();
        assert_eq!(last.fields.lat, Some(12.0));
        assert_eq!(last.fused_at, 2.0);
        assert_eq!(db.history("A1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stats_by_class() {
        let db = Database::open_memory().unwrap();
        db.upsert_current(&fused("A1", EntityClass::Aircraft, 10.0, 1.0)).await.unwrap();
        db.upsert_current(&fused("574000001", EntityClass::Vessel, 10.0, 1.0)).await.unwrap();
        db.append_durable(&fused("574000001", EntityClass::Vessel, 10.0, 1.0)).await.unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                current_aircraft: 1,
                current_vessels: 1,
                history_aircraft: 0,
                history_vessels: 1,
                raw_aircraft: 0,
                raw_vessels: 0,
            }
        );
    }

    fn raw(id: &str, source: &str, received_at: f64) -> RawTrackRecord {
        let fields = TrackFields {
            lat: Some(10.0),
            lon: Some(106.0),
            ..Default::default()
        };
        RawTrackRecord::new(id, EntityClass::Aircraft, source, fields, 0.9, received_at)
            .unwrap()
            .with_response_ms(120)
    }

    #[tokio::test]
    async fn test_raw_archive_link_and_purge() {
        let db = Database::open_memory().unwrap();
        let stored = db
            .archive_raw(&[
                raw("A1", "adsbexchange", 100.0),
                raw("A1", "flightradar24", 102.0),
                raw("A1", "adsbexchange", 1000.0),
                raw("B2", "adsbexchange", 101.0),
            ])
            .await
            .unwrap();
        assert_eq!(stored, 4);
        assert_eq!(db.stats().await.unwrap().raw_aircraft, 4);

        // links only A1 reports inside the window behind fused_at
        assert_eq!(db.link_fused(&fused("A1", EntityClass::Aircraft, 10.0, 105.0)).await.unwrap(), 2);
        // already linked reports keep their first link
        assert_eq!(db.link_fused(&fused("A1", EntityClass::Aircraft, 10.0, 110.0)).await.unwrap(), 0);

        let archived = db.raw_records("A1").await.unwrap();
        assert_eq!(archived.len(), 3);
        assert_eq!(archived[0].fused_at, Some(105.0));
        assert_eq!(archived[1].record.source, "flightradar24");
        assert_eq!(archived[1].record.response_ms, Some(120));
        assert_eq!(archived[2].fused_at, None);

        assert_eq!(db.purge_raw(500.0).await.unwrap(), 3);
        assert_eq!(db.raw_records("A1").await.unwrap().len(), 1);
        assert!(db.raw_records("B2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_empty_batch() {
        let db = Database::open_memory().unwrap();
        assert_eq!(db.archive_raw(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_database_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracks.db");
        let path = path.to_str().unwrap().to_string();
        {
            let db = Database::open(&path).unwrap();
            db.append_durable(&fused("A1", EntityClass::Aircraft, 10.0, 1.0)).await.unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.get_last_snapshot("A1").await.unwrap().is_some());
    }
}
