//! # Session Persistence
//!
//! Durable state that lets an active session survive a process restart.
//!
//! ## Layout
//!
//! Two records are kept per running session, both MessagePack-encoded and
//! stamped with [`SCHEMA_VERSION`]:
//!
//! 1. **Tracking flag** (`tracking/v1/employee/{employee_id}`):
//!    which session, if any, is active for the employee.
//! 2. **Snapshot** (`tracking/v1/session/{session_id}`):
//!    start time, start location, accepted route, running distance and the
//!    last accepted timestamp. Rewritten after every accepted sample.
//!
//! Both are deleted when the session stops. Records written under a different
//! schema version are ignored on load.
//!
//! Storage failures are reported to the caller, which logs them and carries on
//! with the in-memory session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;
use crate::session::{SessionId, SessionState, TrackingSession};
use crate::LocationSample;

pub const SCHEMA_VERSION: u32 = 1;

const KEY_PREFIX: &str = "tracking/v1";

/// Durable byte-oriented key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store. Survives a manager being dropped and recreated, which is
/// enough to simulate a restart in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(feature = "persistence")]
pub use self::sqlite::SqliteStore;

#[cfg(feature = "persistence")]
mod sqlite {
    use std::sync::Mutex;

    use rusqlite::{params, Connection, OptionalExtension};

    use super::KeyValueStore;
    use crate::error::{Result, TrackerError};

    /// SQLite-backed key-value store.
    pub struct SqliteStore {
        db: Mutex<Connection>,
    }

    impl SqliteStore {
        /// Open (or create) a store at the given database path.
        pub fn new(db_path: &str) -> Result<Self> {
            let db = Connection::open(db_path)?;
            Self::init_schema(&db)?;
            Ok(Self { db: Mutex::new(db) })
        }

        /// Create an in-memory database (for testing).
        pub fn in_memory() -> Result<Self> {
            Self::new(":memory:")
        }

        fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
                );
                "#,
            )
        }

        fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
            self.db.lock().map_err(|_| TrackerError::Internal {
                message: "sqlite connection lock poisoned".to_string(),
            })
        }
    }

    impl KeyValueStore for SqliteStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let db = self.conn()?;
            let value = db
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(value)
        }

        fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            let db = self.conn()?;
            db.execute(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
                 VALUES (?, ?, strftime('%s', 'now'))",
                params![key, value],
            )?;
            Ok(())
        }

        fn delete(&self, key: &str) -> Result<()> {
            let db = self.conn()?;
            db.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
            Ok(())
        }
    }
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrackingFlag {
    schema_version: u32,
    enabled: bool,
    session_id: SessionId,
}

/// Snapshot of an active session as written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub schema_version: u32,
    pub session_id: SessionId,
    pub employee_id: String,
    pub start_time: DateTime<Utc>,
    pub start_location: LocationSample,
    pub route: Vec<LocationSample>,
    pub total_distance_meters: f64,
    pub last_accepted: Option<DateTime<Utc>>,
}

impl PersistedSession {
    pub fn capture(session: &TrackingSession, last_accepted: Option<DateTime<Utc>>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: session.id.clone(),
            employee_id: session.employee_id.clone(),
            start_time: session.start_time,
            start_location: session.start_location.clone(),
            route: session.route.clone(),
            total_distance_meters: session.total_distance_meters,
            last_accepted,
        }
    }

    /// Rebuild the active session this snapshot was taken from.
    pub fn into_session(self) -> TrackingSession {
        TrackingSession {
            id: self.session_id,
            employee_id: self.employee_id,
            state: SessionState::Active,
            start_time: self.start_time,
            end_time: None,
            start_location: self.start_location,
            end_location: None,
            route: self.route,
            total_distance_meters: self.total_distance_meters,
            duration_seconds: None,
            stop_reason: None,
        }
    }
}

// ============================================================================
// Session Store
// ============================================================================

/// Typed persistence for tracking sessions on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn flag_key(employee_id: &str) -> String {
        format!("{}/employee/{}", KEY_PREFIX, employee_id)
    }

    pub fn snapshot_key(session_id: &SessionId) -> String {
        format!("{}/session/{}", KEY_PREFIX, session_id)
    }

    /// Record that `session` is the active session for its employee, and write
    /// its first snapshot.
    pub fn mark_active(&self, session: &TrackingSession) -> Result<()> {
        let flag = TrackingFlag {
            schema_version: SCHEMA_VERSION,
            enabled: true,
            session_id: session.id.clone(),
        };
        self.put(&Self::flag_key(&session.employee_id), &flag)?;
        self.save_snapshot(session, None)?;
        info!("[SessionStore] Marked {} active", session.id);
        Ok(())
    }

    pub fn save_snapshot(
        &self,
        session: &TrackingSession,
        last_accepted: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let snapshot = PersistedSession::capture(session, last_accepted);
        self.put(&Self::snapshot_key(&session.id), &snapshot)?;
        debug!(
            "[SessionStore] Saved {} ({} points, {:.1}m)",
            session.id,
            snapshot.route.len(),
            snapshot.total_distance_meters
        );
        Ok(())
    }

    /// Load the active session for an employee, if tracking was enabled.
    pub fn load_active(&self, employee_id: &str) -> Result<Option<PersistedSession>> {
        let Some(flag) = self.fetch::<TrackingFlag>(&Self::flag_key(employee_id))? else {
            return Ok(None);
        };
        if flag.schema_version != SCHEMA_VERSION {
            warn!(
                "[SessionStore] Ignoring tracking flag for {} with schema v{}",
                employee_id, flag.schema_version
            );
            return Ok(None);
        }
        if !flag.enabled {
            return Ok(None);
        }

        let Some(snapshot) =
            self.fetch::<PersistedSession>(&Self::snapshot_key(&flag.session_id))?
        else {
            warn!(
                "[SessionStore] Tracking flag for {} points at missing snapshot {}",
                employee_id, flag.session_id
            );
            return Ok(None);
        };
        if snapshot.schema_version != SCHEMA_VERSION || snapshot.employee_id != employee_id {
            warn!(
                "[SessionStore] Ignoring incompatible snapshot {}",
                flag.session_id
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// Remove every record kept for this employee's session, including the
    /// snapshot of any other session the tracking flag still points at.
    pub fn clear(&self, employee_id: &str, session_id: &SessionId) -> Result<()> {
        let flag_key = Self::flag_key(employee_id);
        match self.fetch::<TrackingFlag>(&flag_key) {
            Ok(Some(flag)) if flag.session_id != *session_id => {
                self.kv.delete(&Self::snapshot_key(&flag.session_id))?;
                debug!("[SessionStore] Cleared stale snapshot {}", flag.session_id);
            }
            Ok(_) => {}
            Err(e) => warn!("[SessionStore] Unreadable tracking flag for {}: {}", employee_id, e),
        }
        self.kv.delete(&Self::snapshot_key(session_id))?;
        self.kv.delete(&flag_key)?;
        info!("[SessionStore] Cleared {}", session_id);
        Ok(())
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.kv.set(key, &bytes)
    }

    fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
