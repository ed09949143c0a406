//! Session driver.
//!
//! One session is one request and one response stream. The runner walks the
//! pipeline snapshot, budget, prompt, gateway, parser, executor in strict
//! arrival order and publishes every step as a numbered event: to a
//! broadcast channel for live listeners, to a bounded log for replay and to
//! the persistence sink.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use easel_core::actions::{ActionDescriptor, ActionStatus};
use easel_core::clock::Clock;
use easel_core::errors::GatewayError;
use easel_core::events::{heartbeat_frame, EventData, SessionEvent};
use easel_core::ids::{ActionId, EventId, SessionId};
use easel_core::messages::{ConversationMessage, Role};
use easel_core::provider::{ModelRequest, TextStream};
use easel_core::session::{SessionError, SessionState};
use easel_core::sink::{SessionSink, SessionUpdate, SinkError};
use easel_llm::ModelGateway;

use crate::budget::{BudgetConfig, ContextBudgetManager};
use crate::error::EngineError;
use crate::executor::{ActionExecutor, ActionOutcome, Batch};
use crate::indexer::SceneIndexer;
use crate::parser::IncrementalParser;
use crate::prompt::{build_system_prompt, ImageAttachment};
use crate::scene::SceneHost;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// History messages considered for the prompt.
    pub history_window: usize,
    /// Events kept per session for replay.
    pub event_buffer: usize,
    /// Age after which a session is dropped from the registry.
    pub stale_after: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_window: 6,
            event_buffer: 100,
            stale_after: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Bounded replay buffer. The oldest events fall off once it is full.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: VecDeque<SessionEvent>,
    last_sequence: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
            last_sequence: 0,
        }
    }

    pub fn push(&mut self, event: SessionEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.last_sequence = event.sequence;
        self.events.push_back(event);
    }

    /// Buffered events with a sequence above `sequence`, oldest first.
    pub fn events_since(&self, sequence: u64) -> Vec<SessionEvent> {
        self.events
            .iter()
            .filter(|e| e.sequence > sequence)
            .cloned()
            .collect()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Live state of one session, shared between its runner and its listeners.
pub struct SessionHandle {
    id: SessionId,
    state: Mutex<SessionState>,
    log: Mutex<EventLog>,
    tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
    created_ms: i64,
    finished_ms: Mutex<Option<i64>>,
}

impl SessionHandle {
    pub fn new(event_buffer: usize, clock: Arc<dyn Clock>) -> Self {
        Self::with_id(SessionId::new(), event_buffer, clock)
    }

    pub fn with_id(id: SessionId, event_buffer: usize, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = broadcast::channel(event_buffer.max(1));
        Self {
            id,
            state: Mutex::new(SessionState::Created),
            log: Mutex::new(EventLog::new(event_buffer)),
            tx,
            cancel: CancellationToken::new(),
            created_ms: clock.now_ms(),
            clock,
            finished_ms: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    pub fn finished_ms(&self) -> Option<i64> {
        *self.finished_ms.lock()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the in-flight request. Actions already applied stay applied.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn events_since(&self, sequence: u64) -> Vec<SessionEvent> {
        self.log.lock().events_since(sequence)
    }

    pub fn last_sequence(&self) -> u64 {
        self.log.lock().last_sequence()
    }

    fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        self.state.lock().transition(next)?;
        if next.is_terminal() {
            *self.finished_ms.lock() = Some(self.clock.now_ms());
        }
        Ok(())
    }

    /// Number, log and broadcast an event.
    fn record(&self, data: EventData) -> SessionEvent {
        let event = {
            let mut log = self.log.lock();
            let event = SessionEvent {
                id: EventId::new(),
                session_id: self.id.clone(),
                timestamp_ms: self.clock.now_ms(),
                sequence: log.last_sequence() + 1,
                data,
            };
            log.push(event.clone());
            event
        };
        if self.tx.send(event.clone()).is_err() {
            debug!(session_id = %self.id, "no live listeners");
        }
        event
    }

    /// SSE frames: buffered events after `since`, then live events, with a
    /// heartbeat comment whenever nothing was sent for `heartbeat`. Ends
    /// after the terminal event.
    pub fn sse_frames(
        self: &Arc<Self>,
        since: u64,
        heartbeat: Duration,
    ) -> impl Stream<Item = String> + Send + 'static {
        let rx = self.tx.subscribe();
        let mut tail = Tail {
            handle: Arc::clone(self),
            rx,
            ticker: tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat),
            frames: VecDeque::new(),
            last: since,
            done: false,
        };
        tail.replay();

        futures::stream::unfold(tail, |mut t| async move {
            loop {
                if let Some(frame) = t.frames.pop_front() {
                    return Some((frame, t));
                }
                if t.done {
                    return None;
                }
                tokio::select! {
                    received = t.rx.recv() => match received {
                        Ok(event) => t.push(event),
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "listener lagged, replaying from log");
                            t.replay();
                        }
                        Err(RecvError::Closed) => return None,
                    },
                    _ = t.ticker.tick() => {
                        let frame = heartbeat_frame(t.handle.clock.now_ms());
                        return Some((frame, t));
                    }
                }
            }
        })
    }
}

struct Tail {
    handle: Arc<SessionHandle>,
    rx: broadcast::Receiver<SessionEvent>,
    ticker: tokio::time::Interval,
    frames: VecDeque<String>,
    last: u64,
    done: bool,
}

impl Tail {
    fn replay(&mut self) {
        for event in self.handle.events_since(self.last) {
            self.push(event);
        }
    }

    fn push(&mut self, event: SessionEvent) {
        if event.sequence <= self.last || self.done {
            return;
        }
        self.last = event.sequence;
        self.done = event.is_terminal();
        self.frames.push_back(event.to_sse());
        self.ticker.reset();
    }
}

/// Live sessions by id.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn create(&self) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(self.config.event_buffer, self.clock.clone()));
        self.sessions.insert(handle.id().clone(), Arc::clone(&handle));
        debug!(session_id = %handle.id(), "session created");
        handle
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|h| Arc::clone(h.value()))
    }

    pub fn cancel(&self, id: &SessionId) -> Result<(), EngineError> {
        let handle = self
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        handle.cancel();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions that finished more than `stale_after` ago, and cancel
    /// and drop unfinished ones created that long ago.
    pub fn cleanup_stale(&self) -> usize {
        let now = self.clock.now_ms();
        let limit = self.config.stale_after.as_millis() as i64;
        let before = self.sessions.len();
        self.sessions.retain(|_, handle| {
            let stale = match handle.finished_ms() {
                Some(finished) => now - finished > limit,
                None => now - handle.created_ms() > limit,
            };
            if stale && handle.finished_ms().is_none() {
                handle.cancel();
            }
            !stale
        });
        let removed = before - self.sessions.len();
        if removed > 0 {
            info!(removed, "stale sessions removed");
        }
        removed
    }
}

/// Everything recorded by a [`MemorySink`].
#[derive(Clone, Debug, Default)]
pub struct MemoryRecords {
    pub events: Vec<SessionEvent>,
    pub actions: Vec<(SessionId, ActionDescriptor)>,
    pub states: Vec<(SessionId, SessionState, SessionUpdate)>,
    pub statuses: Vec<(ActionId, ActionStatus, Option<String>)>,
}

/// Sink that keeps everything in memory, for tests and database-less runs.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<MemoryRecords>,
    unavailable: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every write fails.
    pub fn unavailable() -> Self {
        Self {
            records: Mutex::default(),
            unavailable: true,
        }
    }

    pub fn records(&self) -> MemoryRecords {
        self.records.lock().clone()
    }

    pub fn states(&self, session_id: &SessionId) -> Vec<SessionState> {
        self.records
            .lock()
            .states
            .iter()
            .filter(|(id, ..)| id == session_id)
            .map(|(_, state, _)| *state)
            .collect()
    }

    fn write(&self, f: impl FnOnce(&mut MemoryRecords)) -> Result<(), SinkError> {
        if self.unavailable {
            return Err(SinkError::Unavailable("memory sink disabled".into()));
        }
        f(&mut self.records.lock());
        Ok(())
    }
}

#[async_trait]
impl SessionSink for MemorySink {
    async fn append_event(&self, event: &SessionEvent) -> Result<(), SinkError> {
        self.write(|r| r.events.push(event.clone()))
    }

    async fn append_action(
        &self,
        session_id: &SessionId,
        action: &ActionDescriptor,
    ) -> Result<(), SinkError> {
        self.write(|r| r.actions.push((session_id.clone(), action.clone())))
    }

    async fn update_session_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
        update: &SessionUpdate,
    ) -> Result<(), SinkError> {
        self.write(|r| r.states.push((session_id.clone(), state, update.clone())))
    }

    async fn update_action_status(
        &self,
        _session_id: &SessionId,
        action_id: &ActionId,
        status: ActionStatus,
        message: Option<&str>,
    ) -> Result<(), SinkError> {
        self.write(|r| {
            r.statuses
                .push((action_id.clone(), status, message.map(str::to_string)))
        })
    }
}

/// What the user asked for, with the conversation so far.
#[derive(Clone, Debug, Default)]
pub struct SessionRequest {
    pub message: String,
    pub history: Vec<ConversationMessage>,
    pub attachments: Vec<ImageAttachment>,
}

impl SessionRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<ImageAttachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Final account of a session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: SessionId,
    pub state: SessionState,
    pub message: String,
    /// Executed actions with their final status.
    pub actions: Vec<ActionDescriptor>,
    pub outcomes: Vec<ActionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bookkeeping for one run: the handle, the sink and what has happened so far.
struct Run<'a> {
    handle: &'a SessionHandle,
    sink: &'a dyn SessionSink,
    report: SessionReport,
}

impl Run<'_> {
    async fn emit(&self, data: EventData) {
        let event = self.handle.record(data);
        if let Err(e) = self.sink.append_event(&event).await {
            warn!(
                session_id = %self.handle.id(),
                sequence = event.sequence,
                error = %e,
                "failed to persist event"
            );
        }
    }

    async fn enter(&self, state: SessionState, update: SessionUpdate) -> Result<(), SessionError> {
        self.handle.transition(state)?;
        if let Err(e) = self
            .sink
            .update_session_state(self.handle.id(), state, &update)
            .await
        {
            warn!(
                session_id = %self.handle.id(),
                state = %state,
                error = %e,
                "failed to persist session state"
            );
        }
        Ok(())
    }

    async fn action_status(
        &self,
        action_id: &ActionId,
        status: ActionStatus,
        message: Option<&str>,
    ) {
        if let Err(e) = self
            .sink
            .update_action_status(self.handle.id(), action_id, status, message)
            .await
        {
            warn!(action_id = %action_id, error = %e, "failed to persist action status");
        }
    }
}

/// Drives sessions end to end.
pub struct SessionRunner {
    gateway: Arc<ModelGateway>,
    executor: Arc<ActionExecutor>,
    indexer: SceneIndexer,
    budget: ContextBudgetManager,
    sink: Arc<dyn SessionSink>,
    config: SessionConfig,
}

impl SessionRunner {
    pub fn new(
        gateway: Arc<ModelGateway>,
        executor: Arc<ActionExecutor>,
        sink: Arc<dyn SessionSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            executor,
            indexer: SceneIndexer::new(clock),
            budget: ContextBudgetManager::default(),
            sink,
            config: SessionConfig::default(),
        }
    }

    pub fn with_budget(mut self, config: BudgetConfig) -> Self {
        self.budget = ContextBudgetManager::new(config);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run one session to a terminal state.
    ///
    /// Provider exhaustion, cancellation and stream failures end the session
    /// in `ERROR` and are reported through the `error` event and the returned
    /// report. `Err` is only returned for a handle that has already been run.
    #[instrument(skip_all, fields(session_id = %handle.id()))]
    pub async fn run(
        &self,
        handle: &SessionHandle,
        host: &mut dyn SceneHost,
        request: SessionRequest,
    ) -> Result<SessionReport, EngineError> {
        let mut run = Run {
            handle,
            sink: self.sink.as_ref(),
            report: SessionReport {
                session_id: handle.id().clone(),
                state: handle.state(),
                message: String::new(),
                actions: Vec::new(),
                outcomes: Vec::new(),
                provider_model: None,
                error: None,
            },
        };

        if handle.state() != SessionState::Created {
            return Err(SessionError::InvalidTransition {
                from: handle.state(),
                to: SessionState::Connecting,
            }
            .into());
        }
        run.emit(EventData::SessionStart {
            session_id: handle.id().clone(),
        })
        .await;
        run.enter(SessionState::Connecting, SessionUpdate::default()).await?;

        match self.drive(&mut run, host, &request).await {
            Ok(()) => {
                let actions_count = run.report.actions.len();
                let update = SessionUpdate {
                    provider_model: run.report.provider_model.clone(),
                    message: Some(run.report.message.clone()),
                    error: None,
                    actions_count: Some(actions_count),
                };
                run.enter(SessionState::Completed, update).await?;
                run.emit(EventData::Complete {
                    success: true,
                    provider_model: run.report.provider_model.clone(),
                    actions_count,
                })
                .await;
                info!(actions = actions_count, "session completed");
            }
            Err(e) => {
                let message = e.session_message();
                match &e {
                    EngineError::Gateway(GatewayError::Exhausted { attempts }) => {
                        error!(attempts, "all providers failed");
                    }
                    _ => warn!(error = %e, "session failed"),
                }
                run.enter(SessionState::Error, SessionUpdate::failed(&message))
                    .await?;
                run.emit(EventData::Error {
                    message: message.clone(),
                })
                .await;
                run.report.error = Some(message);
            }
        }

        run.report.state = handle.state();
        Ok(run.report)
    }

    async fn drive(
        &self,
        run: &mut Run<'_>,
        host: &mut dyn SceneHost,
        request: &SessionRequest,
    ) -> Result<(), EngineError> {
        let cancel = run.handle.cancel_token().clone();

        let snapshot = self.indexer.index(&*host);
        let keep_from = request
            .history
            .len()
            .saturating_sub(self.config.history_window);
        let history = &request.history[keep_from..];
        let ctx = self.budget.fit(&snapshot, history);
        debug!(
            tokens = ctx.total_tokens,
            pruned = ctx.was_pruned,
            elements = ctx.snapshot.count,
            "context fitted"
        );

        let prompt = build_system_prompt(&self.budget, &ctx, &request.attachments);
        let model_request = ModelRequest::new(prompt, request.message.clone());

        let active = self.gateway.open_stream(&model_request, &cancel).await?;
        let provider_model = active.provider_model();
        info!(provider_model = %provider_model, attempts = active.attempts, "response stream open");
        run.report.provider_model = Some(provider_model);

        let batch = self.executor.begin(host);
        let pumped = self.pump(run, host, &batch, active.stream, &cancel).await;
        self.executor.finish(host);
        pumped
    }

    /// Read fragments until the stream ends, executing each action as soon
    /// as it is complete.
    async fn pump(
        &self,
        run: &mut Run<'_>,
        host: &mut dyn SceneHost,
        batch: &Batch,
        mut stream: TextStream,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut parser = IncrementalParser::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = stream.next() => next,
            };
            let fragment = match next {
                None => break,
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => return Err(e.into()),
            };
            if fragment.is_empty() {
                continue;
            }

            if run.handle.state() == SessionState::Connecting {
                let update = SessionUpdate {
                    provider_model: run.report.provider_model.clone(),
                    ..SessionUpdate::default()
                };
                run.enter(SessionState::Streaming, update).await?;
            }
            run.emit(EventData::Chunk {
                text: fragment.clone(),
            })
            .await;

            let update = parser.feed(&fragment);
            if !update.message_delta.is_empty() {
                run.emit(EventData::Message {
                    content: update.message_delta,
                    is_partial: true,
                    role: Role::Assistant,
                })
                .await;
            }
            for action in update.actions {
                self.dispatch(run, host, batch, action).await;
            }
        }

        let finalized = parser.finish();
        if let Some(e) = &finalized.parse_error {
            debug!(error = %e, "final parse found no document");
        }
        for action in finalized.late_actions {
            self.dispatch(run, host, batch, action).await;
        }
        if !finalized.message.is_empty() {
            run.emit(EventData::Message {
                content: finalized.message.clone(),
                is_partial: false,
                role: Role::Assistant,
            })
            .await;
        }
        run.report.message = finalized.message;
        Ok(())
    }

    async fn dispatch(
        &self,
        run: &mut Run<'_>,
        host: &mut dyn SceneHost,
        batch: &Batch,
        action: ActionDescriptor,
    ) {
        run.emit(EventData::Action(action.clone())).await;
        if let Err(e) = run.sink.append_action(run.handle.id(), &action).await {
            warn!(action_id = %action.id, error = %e, "failed to persist action");
        }
        run.action_status(&action.id, ActionStatus::Running, None).await;

        let outcome = self.executor.execute_in(batch, host, &action).await;
        let status = if outcome.success {
            ActionStatus::Complete
        } else {
            ActionStatus::Error
        };
        run.action_status(&action.id, status, Some(&outcome.message)).await;

        let mut done = action;
        done.status = status;
        run.report.actions.push(done);
        run.report.outcomes.push(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::scene::InMemoryScene;
    use easel_core::clock::ManualClock;
    use easel_core::provider::Credential;
    use easel_llm::{InMemoryRateLimits, MockProvider, MockResponse, ProviderRoute, RateLimitStore};

    const DOC: &str = r##"{"message": "Added a red box and a title.", "actions": [
        {"type": "create_shape",
         "payload": {"shapeType": "rectangle",
                     "options": {"fill": "#ff0000", "position": "center"}},
         "description": "red box"},
        {"type": "add_text",
         "payload": {"text": "Hello", "position": "top-center"},
         "description": "title"}
    ]}"##;

    struct Fixture {
        provider: Arc<MockProvider>,
        sink: Arc<MemorySink>,
        limits: Arc<InMemoryRateLimits>,
        runner: SessionRunner,
        clock: Arc<ManualClock>,
    }

    fn fixture(responses: Vec<MockResponse>, sink: MemorySink) -> Fixture {
        fixture_with_keys(responses, sink, &["k1"])
    }

    fn fixture_with_keys(responses: Vec<MockResponse>, sink: MemorySink, keys: &[&str]) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let provider = Arc::new(MockProvider::new(responses));
        let route = ProviderRoute::new(
            provider.clone(),
            keys.iter().map(|k| Credential::new(*k, "secret")).collect(),
            vec!["m1".to_string()],
        );
        let limits = Arc::new(InMemoryRateLimits::new());
        let gateway = ModelGateway::new(vec![route], limits.clone(), clock.clone());
        let sink = Arc::new(sink);
        let runner = SessionRunner::new(
            Arc::new(gateway),
            Arc::new(ActionExecutor::new(ExecutorConfig::default())),
            sink.clone(),
            clock.clone(),
        );
        Fixture {
            provider,
            sink,
            limits,
            runner,
            clock,
        }
    }

    fn chunks(text: &str, size: usize) -> Vec<String> {
        text.chars()
            .collect::<Vec<_>>()
            .chunks(size)
            .map(|c| c.iter().collect())
            .collect()
    }

    fn types(events: &[SessionEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_type()).collect()
    }

    #[tokio::test]
    async fn streams_executes_and_completes() {
        let parts = chunks(DOC, 17);
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let f = fixture(vec![MockResponse::fragments(&refs)], MemorySink::new());
        let handle = SessionHandle::new(500, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(900.0, 1200.0);

        let report = f
            .runner
            .run(&handle, &mut scene, SessionRequest::new("a red box with a title"))
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.message, "Added a red box and a title.");
        assert_eq!(report.provider_model.as_deref(), Some("mock:m1"));
        assert_eq!(report.actions.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.success));
        assert!(report.actions.iter().all(|a| a.status == ActionStatus::Complete));
        assert_eq!(scene.objects().len(), 2);

        let events = handle.events_since(0);
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
        assert_eq!(events.first().unwrap().event_type(), "session_start");
        assert_eq!(events.last().unwrap().event_type(), "complete");
        assert_eq!(types(&events).iter().filter(|t| **t == "action").count(), 2);
        assert_eq!(types(&events).iter().filter(|t| **t == "chunk").count(), parts.len());

        let partial: String = events
            .iter()
            .filter_map(|e| match &e.data {
                EventData::Message { content, is_partial: true, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(partial, report.message);
        let finals: Vec<&SessionEvent> = events
            .iter()
            .filter(|e| matches!(e.data, EventData::Message { is_partial: false, .. }))
            .collect();
        assert_eq!(finals.len(), 1);

        match &events.last().unwrap().data {
            EventData::Complete {
                success,
                provider_model,
                actions_count,
            } => {
                assert!(success);
                assert_eq!(provider_model.as_deref(), Some("mock:m1"));
                assert_eq!(*actions_count, 2);
            }
            other => panic!("unexpected terminal event {other:?}"),
        }

        assert_eq!(
            f.sink.states(handle.id()),
            vec![SessionState::Connecting, SessionState::Streaming, SessionState::Completed]
        );
        let records = f.sink.records();
        assert_eq!(records.events.len(), events.len());
        assert_eq!(records.actions.len(), 2);
        assert_eq!(records.statuses.len(), 4);
        assert!(handle.finished_ms().is_some());
    }

    #[tokio::test]
    async fn exhaustion_ends_in_error() {
        let f = fixture(vec![MockResponse::rate_limited(None)], MemorySink::new());
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        let report = f.runner.run(&handle, &mut scene, SessionRequest::new("hi")).await.unwrap();

        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("all providers failed"));
        let events = handle.events_since(0);
        assert_eq!(types(&events), vec!["session_start", "error"]);
        match &events[1].data {
            EventData::Error { message } => assert_eq!(message, "all providers failed"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            f.sink.states(handle.id()),
            vec![SessionState::Connecting, SessionState::Error]
        );
    }

    #[tokio::test]
    async fn cancelled_before_dispatch() {
        let f = fixture(vec![MockResponse::text(DOC)], MemorySink::new());
        let handle = SessionHandle::new(100, f.clock.clone());
        handle.cancel();
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        let report = f.runner.run(&handle, &mut scene, SessionRequest::new("hi")).await.unwrap();

        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("cancelled"));
        assert_eq!(f.provider.call_count(), 0);
        assert!(scene.objects().is_empty());
    }

    #[tokio::test]
    async fn stream_failure_keeps_applied_actions() {
        let head = concat!(
            r#"{"message": "One box coming", "actions": ["#,
            r#"{"type": "create_shape", "payload": {"shapeType": "circle"}}, {"type": "add_te"#,
        );
        let f = fixture(
            vec![MockResponse::FailAfter(
                vec![head.to_string()],
                GatewayError::StreamInterrupted("connection reset".into()),
            )],
            MemorySink::new(),
        );
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        let report = f
            .runner
            .run(&handle, &mut scene, SessionRequest::new("circle"))
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Error);
        assert_eq!(report.error.as_deref(), Some("stream interrupted: connection reset"));
        assert_eq!(report.actions.len(), 1);
        assert_eq!(scene.objects().len(), 1);
        assert!(scene.objects()[0].selectable);
        assert_eq!(
            f.sink.states(handle.id()),
            vec![SessionState::Connecting, SessionState::Streaming, SessionState::Error]
        );
    }

    #[tokio::test]
    async fn stalled_stream_hands_over_to_the_next_key() {
        let f = fixture_with_keys(
            vec![
                MockResponse::FailAfter(
                    vec![],
                    GatewayError::StreamInterrupted("idle timeout".into()),
                ),
                MockResponse::Fragments(chunks(DOC, 17)),
            ],
            MemorySink::new(),
            &["k1", "k2"],
        );
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        let report = f
            .runner
            .run(&handle, &mut scene, SessionRequest::new("box and title"))
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.error, None);
        assert_eq!(report.actions.len(), 2);
        let keys: Vec<String> = f.provider.calls().into_iter().map(|c| c.credential).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
        assert_eq!(
            f.sink.states(handle.id()),
            vec![SessionState::Connecting, SessionState::Streaming, SessionState::Completed]
        );
    }

    #[tokio::test]
    async fn in_stream_rate_limit_is_remembered() {
        let f = fixture_with_keys(
            vec![
                MockResponse::FailAfter(
                    vec![],
                    GatewayError::RateLimited {
                        retry_after: Some(Duration::from_secs(30)),
                        message: "429 quota".into(),
                    },
                ),
                MockResponse::text(DOC),
            ],
            MemorySink::new(),
            &["k1", "k2"],
        );
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        let report = f
            .runner
            .run(&handle, &mut scene, SessionRequest::new("box and title"))
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(f.provider.call_count(), 2);
        assert_eq!(
            f.limits.expiry(&easel_llm::ratelimit::credential_key("mock", "k1")),
            Some(1_000 + 30_000)
        );
    }

    #[tokio::test]
    async fn failed_actions_do_not_fail_the_session() {
        let doc = r##"{"message": "ok", "actions": [
            {"type": "teleport_element", "payload": {}},
            {"type": "move_element",
             "payload": {"elementQuery": "the unicorn", "position": "top-left"}},
            {"type": "change_background", "payload": {"color": "#000000"}}
        ]}"##;
        let f = fixture(vec![MockResponse::text(doc)], MemorySink::new());
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        let report = f.runner.run(&handle, &mut scene, SessionRequest::new("go")).await.unwrap();

        assert_eq!(report.state, SessionState::Completed);
        let success: Vec<bool> = report.outcomes.iter().map(|o| o.success).collect();
        assert_eq!(success, vec![false, false, true]);
        let statuses: Vec<ActionStatus> = report.actions.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![ActionStatus::Error, ActionStatus::Error, ActionStatus::Complete]
        );
    }

    #[tokio::test]
    async fn broken_sink_is_not_fatal() {
        let f = fixture(vec![MockResponse::text(DOC)], MemorySink::unavailable());
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        let report = f.runner.run(&handle, &mut scene, SessionRequest::new("go")).await.unwrap();

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.actions.len(), 2);
        assert!(f.sink.records().events.is_empty());
    }

    #[tokio::test]
    async fn a_handle_runs_once() {
        let f = fixture(vec![MockResponse::text(DOC), MockResponse::text(DOC)], MemorySink::new());
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        f.runner.run(&handle, &mut scene, SessionRequest::new("go")).await.unwrap();
        let again = f.runner.run(&handle, &mut scene, SessionRequest::new("go")).await;
        assert!(matches!(again, Err(EngineError::Session(_))));
    }

    #[tokio::test]
    async fn prompt_carries_windowed_history() {
        let f = fixture(vec![MockResponse::text(DOC)], MemorySink::new());
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);
        let history: Vec<ConversationMessage> = (0..10)
            .map(|i| ConversationMessage::user(format!("note {i}")))
            .collect();

        f.runner
            .run(&handle, &mut scene, SessionRequest::new("make it pop").with_history(history))
            .await
            .unwrap();

        let calls = f.provider.calls();
        let request = &calls[0].request;
        assert_eq!(request.user_message, "make it pop");
        assert!(request.system_prompt.contains("User: note 9"));
        assert!(request.system_prompt.contains("User: note 4"));
        assert!(!request.system_prompt.contains("note 3"));
        assert!(request.system_prompt.contains("\"widthPx\":800"));
    }

    #[tokio::test]
    async fn live_listeners_see_every_event() {
        let f = fixture(vec![MockResponse::text(DOC)], MemorySink::new());
        let handle = SessionHandle::new(100, f.clock.clone());
        let mut rx = handle.subscribe();
        let mut scene = InMemoryScene::with_workspace(800.0, 600.0);

        f.runner.run(&handle, &mut scene, SessionRequest::new("go")).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen, handle.events_since(0));
    }

    #[test]
    fn event_log_is_bounded() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let handle = SessionHandle::new(3, clock);
        for i in 0..5 {
            handle.record(EventData::Chunk { text: i.to_string() });
        }
        let seqs: Vec<u64> = handle.events_since(0).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        let seqs: Vec<u64> = handle.events_since(4).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![5]);
        assert_eq!(handle.last_sequence(), 5);
    }

    #[test]
    fn registry_drops_stale_sessions() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = SessionRegistry::new(SessionConfig::default(), clock.clone());

        let finished = registry.create();
        finished.transition(SessionState::Connecting).unwrap();
        finished.transition(SessionState::Completed).unwrap();
        let abandoned = registry.create();
        clock.advance(Duration::from_secs(30 * 60));
        let fresh = registry.create();
        clock.advance(Duration::from_secs(40 * 60));

        assert_eq!(registry.cleanup_stale(), 2);
        assert!(registry.get(finished.id()).is_none());
        assert!(registry.get(abandoned.id()).is_none());
        assert!(abandoned.cancel_token().is_cancelled());
        assert!(registry.get(fresh.id()).is_some());

        assert!(matches!(
            registry.cancel(&SessionId::from_raw("sess_missing")),
            Err(EngineError::SessionNotFound(_))
        ));
        registry.cancel(fresh.id()).unwrap();
        assert!(fresh.cancel_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sse_frames_replay_then_follow_with_heartbeats() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let handle = Arc::new(SessionHandle::new(10, clock));
        handle.record(EventData::SessionStart {
            session_id: handle.id().clone(),
        });
        handle.record(EventData::Chunk { text: "{".into() });

        let mut frames = Box::pin(handle.sse_frames(1, Duration::from_secs(15)));
        let first = frames.next().await.unwrap();
        assert!(first.contains("event: chunk"));

        let beat = frames.next().await.unwrap();
        assert!(beat.starts_with(": heartbeat"));

        handle.record(EventData::Complete {
            success: true,
            provider_model: None,
            actions_count: 0,
        });
        let last = frames.next().await.unwrap();
        assert!(last.contains("event: complete"));
        assert!(frames.next().await.is_none());
    }
}
