use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use easel_core::ids::SessionId;
use easel_core::session::SessionState;
use easel_core::sink::SessionUpdate;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub state: SessionState,
    pub provider_model: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub actions_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

const COLUMNS: &str =
    "id, state, provider_model, message, error, actions_count, created_at, updated_at";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the session row if it does not exist yet.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn ensure(&self, id: &SessionId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO sessions (id, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![id.as_str(), SessionState::Created.as_str(), now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Most recently updated first.
    pub fn list(&self, limit: usize) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sessions ORDER BY updated_at DESC, id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_session(row)?);
            }
            Ok(out)
        })
    }

    /// Record a state change. Fields left as `None` keep their stored value.
    #[instrument(skip(self, update), fields(session_id = %id, state = %state))]
    pub fn update_state(
        &self,
        id: &SessionId,
        state: SessionState,
        update: &SessionUpdate,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET
                    state = ?2,
                    provider_model = COALESCE(?3, provider_model),
                    message = COALESCE(?4, message),
                    error = COALESCE(?5, error),
                    actions_count = COALESCE(?6, actions_count),
                    updated_at = ?7
                 WHERE id = ?1",
                rusqlite::params![
                    id.as_str(),
                    state.as_str(),
                    update.provider_model,
                    update.message,
                    update.error,
                    update.actions_count.map(|n| n as i64),
                    now,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let state: String = row_helpers::get(row, 1, "sessions", "state")?;
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        state: row_helpers::parse_str(&state, "sessions", "state")?,
        provider_model: row_helpers::get(row, 2, "sessions", "provider_model")?,
        message: row_helpers::get(row, 3, "sessions", "message")?,
        error: row_helpers::get(row, 4, "sessions", "error")?,
        actions_count: row_helpers::get(row, 5, "sessions", "actions_count")?,
        created_at: row_helpers::get(row, 6, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 7, "sessions", "updated_at")?,
    })
}
