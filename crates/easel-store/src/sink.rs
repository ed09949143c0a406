use std::sync::Arc;

use async_trait::async_trait;

use easel_core::actions::{ActionDescriptor, ActionStatus};
use easel_core::events::{EventData, SessionEvent};
use easel_core::ids::{ActionId, SessionId};
use easel_core::session::SessionState;
use easel_core::sink::{SessionSink, SessionUpdate, SinkError};

use crate::actions::ActionRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::events::EventRepo;
use crate::sessions::SessionRepo;

struct Repos {
    sessions: SessionRepo,
    events: EventRepo,
    actions: ActionRepo,
}

/// SQLite-backed persistence hooks. Writes run on the blocking pool.
#[derive(Clone)]
pub struct SqliteSink {
    repos: Arc<Repos>,
}

impl SqliteSink {
    pub fn new(db: Database) -> Self {
        Self {
            repos: Arc::new(Repos {
                sessions: SessionRepo::new(db.clone()),
                events: EventRepo::new(db.clone()),
                actions: ActionRepo::new(db),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionRepo {
        &self.repos.sessions
    }

    pub fn events(&self) -> &EventRepo {
        &self.repos.events
    }

    pub fn actions(&self) -> &ActionRepo {
        &self.repos.actions
    }

    async fn blocking<F>(&self, f: F) -> Result<(), SinkError>
    where
        F: FnOnce(&Repos) -> Result<(), StoreError> + Send + 'static,
    {
        let repos = self.repos.clone();
        tokio::task::spawn_blocking(move || f(&repos))
            .await
            .map_err(|e| SinkError::Unavailable(format!("store task: {e}")))?
            .map_err(SinkError::from)
    }
}

#[async_trait]
impl SessionSink for SqliteSink {
    async fn append_event(&self, event: &SessionEvent) -> Result<(), SinkError> {
        let event = event.clone();
        self.blocking(move |repos| {
            if matches!(event.data, EventData::SessionStart { .. }) {
                repos.sessions.ensure(&event.session_id)?;
            }
            repos.events.append(&event)
        })
        .await
    }

    async fn append_action(
        &self,
        session_id: &SessionId,
        action: &ActionDescriptor,
    ) -> Result<(), SinkError> {
        let (session_id, action) = (session_id.clone(), action.clone());
        self.blocking(move |repos| repos.actions.append(&session_id, &action).map(|_| ()))
            .await
    }

    async fn update_session_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
        update: &SessionUpdate,
    ) -> Result<(), SinkError> {
        let (session_id, update) = (session_id.clone(), update.clone());
        self.blocking(move |repos| {
            repos.sessions.ensure(&session_id)?;
            repos.sessions.update_state(&session_id, state, &update)
        })
        .await
    }

    async fn update_action_status(
        &self,
        _session_id: &SessionId,
        action_id: &ActionId,
        status: ActionStatus,
        message: Option<&str>,
    ) -> Result<(), SinkError> {
        let action_id = action_id.clone();
        let message = message.map(str::to_string);
        self.blocking(move |repos| {
            repos
                .actions
                .update_status(&action_id, status, message.as_deref())
        })
        .await
    }
}
