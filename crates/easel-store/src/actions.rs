use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use easel_core::actions::{ActionDescriptor, ActionStatus};
use easel_core::ids::{ActionId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored action with its execution outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRow {
    pub session_id: SessionId,
    pub ordinal: i64,
    pub action: ActionDescriptor,
    pub result_message: Option<String>,
}

pub struct ActionRepo {
    db: Database,
}

impl ActionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append in emission order. Re-appending the same id is a conflict.
    #[instrument(
        skip(self, action),
        fields(
            session_id = %session_id,
            action_id = %action.id,
            action_type = %action.action_type
        )
    )]
    pub fn append(
        &self,
        session_id: &SessionId,
        action: &ActionDescriptor,
    ) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(&action.payload)?;
        self.db.with_conn(|conn| {
            let ordinal: i64 = conn.query_row(
                "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM actions WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO actions
                 (id, session_id, ordinal, type, description, payload, status,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                rusqlite::params![
                    action.id.as_str(),
                    session_id.as_str(),
                    ordinal,
                    action.action_type,
                    action.description,
                    payload,
                    action.status.as_str(),
                    now,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("action {} already stored", action.id))
                }
                other => other.into(),
            })?;
            Ok(ordinal)
        })
    }

    #[instrument(skip(self, message), fields(action_id = %action_id, status = status.as_str()))]
    pub fn update_status(
        &self,
        action_id: &ActionId,
        status: ActionStatus,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE actions
                 SET status = ?2, result_message = COALESCE(?3, result_message), updated_at = ?4
                 WHERE id = ?1",
                rusqlite::params![action_id.as_str(), status.as_str(), message, now],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("action {action_id}")));
            }
            Ok(())
        })
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<ActionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ordinal, type, description, payload, status, result_message
                 FROM actions WHERE session_id = ?1 ORDER BY ordinal ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row_helpers::get(row, 4, "actions", "payload")?;
                let status: String = row_helpers::get(row, 5, "actions", "status")?;
                out.push(ActionRow {
                    session_id: session_id.clone(),
                    ordinal: row_helpers::get(row, 1, "actions", "ordinal")?,
                    action: ActionDescriptor {
                        id: ActionId::from_raw(row_helpers::get::<String>(
                            row, 0, "actions", "id",
                        )?),
                        action_type: row_helpers::get(row, 2, "actions", "type")?,
                        description: row_helpers::get(row, 3, "actions", "description")?,
                        payload: row_helpers::parse_json(&payload, "actions", "payload")?,
                        status: row_helpers::parse_str(&status, "actions", "status")?,
                    },
                    result_message: row_helpers::get(row, 6, "actions", "result_message")?,
                });
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use serde_json::json;

    fn setup() -> (ActionRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let id = SessionId::new();
        SessionRepo::new(db.clone()).ensure(&id).unwrap();
        (ActionRepo::new(db), id)
    }

    #[test]
    fn append_assigns_ordinals_and_tracks_status() {
        let (repo, sid) = setup();
        let first = ActionDescriptor::new("create_shape", json!({"kind": "circle"}), "a circle");
        let second = ActionDescriptor::new("add_text", json!({"text": "hi"}), "");
        assert_eq!(repo.append(&sid, &first).unwrap(), 1);
        assert_eq!(repo.append(&sid, &second).unwrap(), 2);

        repo.update_status(&second.id, ActionStatus::Error, Some("Element not found"))
            .unwrap();

        let rows = repo.list(&sid).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action.payload, json!({"kind": "circle"}));
        assert_eq!(rows[0].action.status, ActionStatus::Pending);
        assert_eq!(rows[1].action.status, ActionStatus::Error);
        assert_eq!(rows[1].result_message.as_deref(), Some("Element not found"));
    }

    #[test]
    fn duplicate_id_is_conflict() {
        let (repo, sid) = setup();
        let action = ActionDescriptor::new("delete_element", json!({}), "");
        repo.append(&sid, &action).unwrap();
        assert!(matches!(repo.append(&sid, &action), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn status_of_unknown_action_is_not_found() {
        let (repo, _) = setup();
        let err = repo
            .update_status(&ActionId::new(), ActionStatus::Complete, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
