use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::event::{decode_object_details, encode_object_details, InboundEvent};

/// A row to insert; `id` is assigned by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub timestamp: String,
    pub source_id: String,
    pub event_type: String,
    pub object_details: Option<String>,
    pub confidence: Option<f64>,
    pub zone: Option<String>,
    pub snapshot_path: Option<String>,
}

impl NewEvent {
    pub fn from_inbound(ev: &InboundEvent) -> Self {
        Self {
            timestamp: ev.timestamp.clone(),
            source_id: ev.source_id.clone(),
            event_type: ev.event_type.clone(),
            object_details: encode_object_details(&ev.object_details),
            confidence: ev.confidence(),
            zone: ev.zone.clone(),
            snapshot_path: ev.snapshot_path.clone(),
        }
    }
}

/// A stored row as served by the query API.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: String,
    pub source_id: String,
    pub event_type: String,
    pub object_details: serde_json::Value,
    pub confidence: Option<f64>,
    pub zone: Option<String>,
    pub snapshot_path: Option<String>,
}

pub trait EventStore {
    fn insert(&mut self, ev: &NewEvent) -> Result<i64>;

    /// Up to `limit` events, newest timestamp first.
    fn list_recent(&mut self, limit: usize) -> Result<Vec<StoredEvent>>;

    /// Returns whether a row was removed.
    fn delete(&mut self, id: i64) -> Result<bool>;

    /// Returns the number of rows removed; unknown ids are ignored.
    fn delete_many(&mut self, ids: &[i64]) -> Result<usize>;
}

pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open event store {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp TEXT NOT NULL,
              source_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              object_details TEXT,
              confidence REAL,
              zone TEXT,
              snapshot_path TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
            "#,
        )?;
        Ok(())
    }
}

impl EventStore for SqliteEventStore {
    fn insert(&mut self, ev: &NewEvent) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO events(timestamp, source_id, event_type, object_details, confidence, zone, snapshot_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                ev.timestamp,
                ev.source_id,
                ev.event_type,
                ev.object_details,
                ev.confidence,
                ev.zone,
                ev.snapshot_path
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_recent(&mut self, limit: usize) -> Result<Vec<StoredEvent>> {
        let limit = i64::try_from(limit).map_err(|_| anyhow!("limit exceeds i64 range"))?;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, timestamp, source_id, event_type, object_details, confidence, zone, snapshot_path
            FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let details: Option<String> = row.get(4)?;
            out.push(StoredEvent {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                source_id: row.get(2)?,
                event_type: row.get(3)?,
                object_details: decode_object_details(details.as_deref()),
                confidence: row.get(5)?,
                zone: row.get(6)?,
                snapshot_path: row.get(7)?,
            });
        }
        Ok(out)
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM events WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn delete_many(&mut self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM events WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }
}

/// Volatile store with the same ordering rules as the SQLite one.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    rows: Vec<StoredEvent>,
    next_id: i64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl EventStore for InMemoryEventStore {
    fn insert(&mut self, ev: &NewEvent) -> Result<i64> {
        self.next_id += 1;
        self.rows.push(StoredEvent {
            id: self.next_id,
            timestamp: ev.timestamp.clone(),
            source_id: ev.source_id.clone(),
            event_type: ev.event_type.clone(),
            object_details: decode_object_details(ev.object_details.as_deref()),
            confidence: ev.confidence,
            zone: ev.zone.clone(),
            snapshot_path: ev.snapshot_path.clone(),
        });
        Ok(self.next_id)
    }

    fn list_recent(&mut self, limit: usize) -> Result<Vec<StoredEvent>> {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let before = self.rows.len();
        self.rows.retain(|row| row.id != id);
        Ok(self.rows.len() < before)
    }

    fn delete_many(&mut self, ids: &[i64]) -> Result<usize> {
        let before = self.rows.len();
        self.rows.retain(|row| !ids.contains(&row.id));
        Ok(before - self.rows.len())
    }
}
