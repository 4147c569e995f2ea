use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use remote_acp_error::RemoteAcpError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::connection::Connection;
use crate::frame::{self, methods};
use crate::handler::ClientHandler;

const UPDATE_HISTORY_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Closed,
}

/// How `session/request_permission` is answered for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Ask the session's handler.
    #[default]
    Default,
    /// Pick an allow option without asking.
    AllowAll,
    /// Pick a reject option without asking, or cancel when none is offered.
    RejectAll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub mcp_servers: Vec<Value>,
}

impl SessionConfig {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            permission_mode: PermissionMode::default(),
            mcp_servers: Vec::new(),
        }
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub(crate) fn new_session_params(&self) -> Value {
        json!({
            "cwd": self.cwd,
            "mcpServers": self.mcp_servers,
        })
    }
}

/// One `session/update` (or other session-scoped notification) payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub sequence: u64,
    pub session_id: String,
    pub method: String,
    pub update: Value,
}

impl SessionUpdate {
    /// The `sessionUpdate` discriminator, e.g. `agent_message_chunk`.
    pub fn kind(&self) -> Option<&str> {
        self.update.get("sessionUpdate").and_then(Value::as_str)
    }

    /// Text of a text content block carried by chunk updates.
    pub fn text(&self) -> Option<&str> {
        let content = self.update.get("content")?;
        if content.get("type").and_then(Value::as_str) != Some("text") {
            return None;
        }
        content.get("text").and_then(Value::as_str)
    }
}

/// A slash command advertised by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: String,
}

pub(crate) struct SessionInner {
    pub(crate) id: String,
    pub(crate) config: SessionConfig,
    pub(crate) handler: Arc<dyn ClientHandler>,
    created: Value,
    created_at_ms: i64,
    last_activity_ms: AtomicI64,
    state: watch::Sender<SessionState>,
    log: Mutex<UpdateLog>,
    available_commands: Mutex<Vec<AvailableCommand>>,
}

struct UpdateLog {
    next_sequence: u64,
    history: VecDeque<SessionUpdate>,
    /// One queue per live stream. Unbounded so a slow reader never skips
    /// updates; `None` once the session is closed.
    subscribers: Option<Vec<mpsc::UnboundedSender<SessionUpdate>>>,
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .field("cwd", &self.config.cwd)
            .finish()
    }
}

impl SessionInner {
    pub(crate) fn new(
        id: String,
        config: SessionConfig,
        handler: Arc<dyn ClientHandler>,
        created: Value,
    ) -> Self {
        let now = now_ms();
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id,
            config,
            handler,
            created,
            created_at_ms: now,
            last_activity_ms: AtomicI64::new(now),
            state,
            log: Mutex::new(UpdateLog {
                next_sequence: 1,
                history: VecDeque::with_capacity(UPDATE_HISTORY_SIZE),
                subscribers: Some(Vec::new()),
            }),
            available_commands: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn activate(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
    }

    /// Moves the session to `Closed`. Returns false if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if changed {
            // Dropping the senders ends every live update stream.
            lock(&self.log).subscribers = None;
            self.handler.on_session_closed(&self.id);
        }
        changed
    }

    /// Appends a notification to the history and fans it out to live
    /// subscribers. The handler is not invoked here.
    pub(crate) fn record(&self, method: &str, params: Value) -> Option<SessionUpdate> {
        self.touch();
        let update = match params {
            Value::Object(mut object) => object
                .remove("update")
                .unwrap_or(Value::Object(object)),
            other => other,
        };

        if update.get("sessionUpdate").and_then(Value::as_str) == Some("available_commands_update")
        {
            self.store_available_commands(&update);
        }

        let mut log = lock(&self.log);
        let log = &mut *log;
        let subscribers = log.subscribers.as_mut()?;
        let record = SessionUpdate {
            sequence: log.next_sequence,
            session_id: self.id.clone(),
            method: method.to_string(),
            update,
        };
        log.next_sequence += 1;
        // Streams that were dropped fall out here.
        subscribers.retain(|tx| tx.send(record.clone()).is_ok());
        log.history.push_back(record.clone());
        while log.history.len() > UPDATE_HISTORY_SIZE {
            log.history.pop_front();
        }
        Some(record)
    }

    pub(crate) fn notify_handler(&self, update: &SessionUpdate) {
        self.handler.on_session_update(&self.id, update);
    }

    fn store_available_commands(&self, update: &Value) {
        let commands = update
            .get("availableCommands")
            .cloned()
            .map(serde_json::from_value::<Vec<AvailableCommand>>);
        match commands {
            Some(Ok(commands)) => {
                tracing::info!(
                    session_id = %self.id,
                    count = commands.len(),
                    "agent advertised slash commands"
                );
                *lock(&self.available_commands) = commands;
            }
            Some(Err(err)) => {
                tracing::warn!(
                    session_id = %self.id,
                    error = %err,
                    "ignoring malformed available_commands_update"
                );
            }
            None => {}
        }
    }

    fn subscribe(&self) -> (Vec<SessionUpdate>, Option<mpsc::UnboundedReceiver<SessionUpdate>>) {
        // Snapshot and subscribe under one lock so nothing is missed or
        // delivered twice.
        let mut log = lock(&self.log);
        let replay = log.history.iter().cloned().collect();
        let receiver = log.subscribers.as_mut().map(|subscribers| {
            let (tx, rx) = mpsc::unbounded_channel();
            subscribers.push(tx);
            rx
        });
        (replay, receiver)
    }

    pub(crate) fn updates(&self) -> BoxStream<'static, SessionUpdate> {
        let (replay, receiver) = self.subscribe();
        let live = match receiver {
            Some(receiver) => UnboundedReceiverStream::new(receiver).boxed(),
            None => stream::empty().boxed(),
        };
        stream::iter(replay).chain(live).boxed()
    }
}

/// A logical conversation multiplexed over a shared [`Connection`].
///
/// Cloning is cheap; all clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    connection: Connection,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("connection_id", &self.connection.id())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(inner: Arc<SessionInner>, connection: Connection) -> Self {
        Self { inner, connection }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn created_at_ms(&self) -> i64 {
        self.inner.created_at_ms
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.inner.last_activity_ms.load(Ordering::Relaxed)
    }

    /// The full `session/new` result (modes, models, ...).
    pub fn created_response(&self) -> &Value {
        &self.inner.created
    }

    /// Sequence number of the newest recorded update, 0 before the first.
    pub fn last_update_sequence(&self) -> u64 {
        lock(&self.inner.log).next_sequence - 1
    }

    pub fn available_commands(&self) -> Vec<AvailableCommand> {
        lock(&self.inner.available_commands).clone()
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteAcpError> {
        self.call_with_timeout(method, params, self.connection.request_timeout())
            .await
    }

    /// Issues `method` with `sessionId` injected into `params`.
    ///
    /// Resolves with `SessionClosed` if the session closes while the call is
    /// in flight; the pending entry is removed in that case.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RemoteAcpError> {
        self.ensure_open()?;
        let params = frame::with_session_id(params, &self.inner.id)?;
        self.inner.touch();

        let mut state = self.inner.state.subscribe();
        // A connection failure resolves the request before it closes the
        // session, so the request branch goes first.
        tokio::select! {
            biased;
            result = self.connection.request(method, params, timeout) => {
                self.inner.touch();
                result
            }
            _ = state.wait_for(|state| *state == SessionState::Closed) => {
                tracing::debug!(
                    session_id = %self.inner.id,
                    method = method,
                    "call abandoned because the session closed"
                );
                Err(self.closed_error())
            }
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<(), RemoteAcpError> {
        self.ensure_open()?;
        let params = frame::with_session_id(params, &self.inner.id)?;
        self.inner.touch();
        self.connection.notify(method, params)
    }

    pub async fn prompt(&self, text: &str) -> Result<PromptResponse, RemoteAcpError> {
        let params = json!({
            "prompt": [{ "type": "text", "text": text }],
        });
        let result = self
            .call_with_timeout(
                methods::SESSION_PROMPT,
                params,
                self.connection.prompt_timeout(),
            )
            .await?;
        serde_json::from_value(result).map_err(|err| RemoteAcpError::Protocol {
            message: format!("invalid session/prompt response: {err}"),
        })
    }

    pub fn cancel(&self) -> Result<(), RemoteAcpError> {
        self.notify(methods::SESSION_CANCEL, json!({}))
    }

    pub async fn set_mode(&self, mode_id: &str) -> Result<(), RemoteAcpError> {
        self.call(methods::SESSION_SET_MODE, json!({ "modeId": mode_id }))
            .await
            .map(|_| ())
    }

    /// Buffered updates followed by live ones, in sequence order with no
    /// gaps however far the reader falls behind. Ends when the session
    /// closes.
    pub fn updates(&self) -> BoxStream<'static, SessionUpdate> {
        self.inner.updates()
    }

    /// Removes the session from its connection. Other sessions and the
    /// connection itself are unaffected.
    pub fn close(&self) {
        self.connection.remove_session(&self.inner.id);
        if self.inner.mark_closed() {
            tracing::info!(
                session_id = %self.inner.id,
                connection_id = self.connection.id(),
                "session closed"
            );
        }
    }

    fn ensure_open(&self) -> Result<(), RemoteAcpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> RemoteAcpError {
        RemoteAcpError::SessionClosed {
            session_id: self.inner.id.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::UnsupportedHandler;

    fn session(id: &str) -> SessionInner {
        SessionInner::new(
            id.to_string(),
            SessionConfig::new("/tmp"),
            Arc::new(UnsupportedHandler),
            json!({ "sessionId": id }),
        )
    }

    #[test]
    fn lifecycle_is_created_active_closed() {
        let inner = session("s1");
        assert_eq!(inner.state(), SessionState::Created);
        inner.activate();
        assert_eq!(inner.state(), SessionState::Active);
        assert!(inner.mark_closed());
        assert!(!inner.mark_closed());
        inner.activate();
        assert_eq!(inner.state(), SessionState::Closed);
    }

    #[test]
    fn record_unwraps_update_and_numbers_sequentially() {
        let inner = session("s1");
        let first = inner
            .record(
                methods::SESSION_UPDATE,
                json!({ "sessionId": "s1", "update": { "sessionUpdate": "agent_message_chunk", "content": { "type": "text", "text": "hi" } } }),
            )
            .expect("recorded");
        assert_eq!(first.sequence, 1);
        assert_eq!(first.kind(), Some("agent_message_chunk"));
        assert_eq!(first.text(), Some("hi"));

        let second = inner
            .record("_custom/ping", json!({ "sessionId": "s1", "n": 2 }))
            .expect("recorded");
        assert_eq!(second.sequence, 2);
        assert_eq!(second.update["n"], 2);
    }

    #[test]
    fn available_commands_are_tracked() {
        let inner = session("s1");
        inner.record(
            methods::SESSION_UPDATE,
            json!({
                "sessionId": "s1",
                "update": {
                    "sessionUpdate": "available_commands_update",
                    "availableCommands": [
                        { "name": "plan", "description": "Make a plan" },
                        { "name": "test", "description": "Run tests", "input": { "hint": "filter" } }
                    ]
                }
            }),
        );
        let commands = lock(&inner.available_commands).clone();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].name, "plan");
        assert_eq!(commands[1].input, Some(json!({ "hint": "filter" })));
    }

    #[test]
    fn closed_sessions_record_nothing() {
        let inner = session("s1");
        inner.mark_closed();
        assert!(inner
            .record(methods::SESSION_UPDATE, json!({ "sessionId": "s1" }))
            .is_none());
    }

    #[test]
    fn history_is_bounded() {
        let inner = session("s1");
        for n in 0..(UPDATE_HISTORY_SIZE + 10) {
            inner.record(methods::SESSION_UPDATE, json!({ "update": { "n": n } }));
        }
        let (replay, _) = inner.subscribe();
        assert_eq!(replay.len(), UPDATE_HISTORY_SIZE);
        assert_eq!(replay[0].sequence, 11);
    }

    #[tokio::test]
    async fn idle_subscribers_miss_nothing() {
        let inner = session("s1");
        let updates = inner.updates();
        let total = UPDATE_HISTORY_SIZE as u64 + 44;
        for n in 0..total {
            inner.record(methods::SESSION_UPDATE, json!({ "update": { "n": n } }));
        }
        inner.mark_closed();

        let sequences = updates
            .map(|update| update.sequence)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(sequences, (1..=total).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dropped_streams_are_pruned() {
        let inner = session("s1");
        drop(inner.updates());
        let _kept = inner.updates();
        inner.record(methods::SESSION_UPDATE, json!({ "update": {} }));
        let subscribers = lock(&inner.log).subscribers.as_ref().map(Vec::len);
        assert_eq!(subscribers, Some(1));
    }
}
