use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::instrument;

use easel_core::events::SessionEvent;
use easel_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Per-session append lock so the sequence check and insert happen together.
#[derive(Default)]
struct SessionLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn get(&mut self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct EventRepo {
    db: Database,
    session_locks: Mutex<SessionLocks>,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            session_locks: Mutex::new(SessionLocks::default()),
        }
    }

    /// Append an event. Its sequence must exceed every stored sequence for the
    /// session; replays and reordering are rejected with `Conflict`.
    #[instrument(
        skip(self, event),
        fields(
            session_id = %event.session_id,
            event_type = event.event_type(),
            sequence = event.sequence
        )
    )]
    pub fn append(&self, event: &SessionEvent) -> Result<(), StoreError> {
        let lock = self.session_locks.lock().get(event.session_id.as_str());
        let _guard = lock.lock();

        let payload = serde_json::to_string(event)?;
        self.db.with_conn(|conn| {
            let max_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE session_id = ?1",
                [event.session_id.as_str()],
                |row| row.get(0),
            )?;
            if event.sequence as i64 <= max_seq {
                return Err(StoreError::Conflict(format!(
                    "sequence {} not after {max_seq} for session {}",
                    event.sequence, event.session_id
                )));
            }

            conn.execute(
                "INSERT INTO events (id, session_id, sequence, type, timestamp_ms, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    event.id.as_str(),
                    event.session_id.as_str(),
                    event.sequence as i64,
                    event.event_type(),
                    event.timestamp_ms,
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    /// All events of a session in sequence order.
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<SessionEvent>, StoreError> {
        self.list_since(session_id, 0)
    }

    /// Events with a sequence strictly greater than `after`.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_since(
        &self,
        session_id: &SessionId,
        after: u64,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM events
                 WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), after as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "events", "payload")?;
                out.push(row_helpers::parse_json(&raw, "events", "payload")?);
            }
            Ok(out)
        })
    }

    pub fn last_sequence(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let max: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(max as u64)
        })
    }
}
