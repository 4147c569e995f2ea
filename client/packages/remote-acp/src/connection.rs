use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use remote_acp_error::RemoteAcpError;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::EndpointAddress;
use crate::config::ClientConfig;
use crate::dispatch;
use crate::frame::{self, methods};
use crate::pending::{PendingCalls, PendingGuard};
use crate::session::{now_ms, SessionInner};
use crate::transport::{Connector, Transport};

/// Notifications held for sessions whose `session/new` response has not been
/// processed yet.
const ORPHAN_BUFFER_SIZE: usize = 64;

/// Ids of sessions closed on this connection whose trailing notifications
/// are dropped rather than buffered.
const RECENTLY_CLOSED_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// What the agent reported in its `initialize` response.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentInfo {
    pub protocol_version: u64,
    pub agent_capabilities: Value,
    pub auth_methods: Vec<Value>,
    pub agent_info: Option<Value>,
}

impl AgentInfo {
    fn from_initialize(result: &Value) -> Result<Self, String> {
        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_u64)
            .ok_or_else(|| "initialize response has no protocolVersion".to_string())?;
        Ok(Self {
            protocol_version,
            agent_capabilities: result.get("agentCapabilities").cloned().unwrap_or(Value::Null),
            auth_methods: result
                .get("authMethods")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            agent_info: result.get("agentInfo").cloned(),
        })
    }
}

/// One transport to a remote ACP agent, shared by every session on it.
///
/// Cloning is cheap. The background reader and writer hold only weak
/// references, so dropping the last handle tears the connection down.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    id: u64,
    address: EndpointAddress,
    state: Mutex<ConnectionState>,
    failure: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingCalls,
    sessions: Mutex<HashMap<String, Arc<SessionInner>>>,
    orphans: Mutex<VecDeque<Orphan>>,
    recently_closed: Mutex<VecDeque<String>>,
    agent: Mutex<Option<AgentInfo>>,
    request_timeout: Option<Duration>,
    prompt_timeout: Option<Duration>,
    created_at_ms: i64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Orphan {
    session_id: String,
    method: String,
    params: Value,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address.to_string())
            .field("state", &self.state())
            .field("sessions", &lock(&self.inner.sessions).len())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl Connection {
    /// Opens the transport, starts the reader and writer, and completes the
    /// `initialize` handshake within `config.handshake_timeout`.
    pub(crate) async fn connect(
        id: u64,
        address: EndpointAddress,
        connector: &dyn Connector,
        config: &ClientConfig,
    ) -> Result<Self, RemoteAcpError> {
        let start = Instant::now();
        let connection = Self {
            inner: Arc::new(ConnectionInner::new(id, address, config)),
        };
        connection.inner.set_state(ConnectionState::Connecting);
        tracing::info!(
            connection_id = id,
            address = %connection.address(),
            "connecting to remote agent"
        );

        let transport = match connector.connect(connection.address()).await {
            Ok(transport) => transport,
            Err(err) => {
                connection.inner.fail(&err.to_string());
                return Err(err);
            }
        };
        connection.start(transport);

        let handshake = tokio::time::timeout(
            config.handshake_timeout,
            connection.request(methods::INITIALIZE, config.initialize_params(), None),
        )
        .await;
        let result = match handshake {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(connection.handshake_failed(err.to_string())),
            Err(_) => {
                return Err(connection.handshake_failed(format!(
                    "no initialize response within {}ms",
                    config.handshake_timeout.as_millis()
                )))
            }
        };
        let agent = AgentInfo::from_initialize(&result)
            .map_err(|message| connection.handshake_failed(message))?;

        tracing::info!(
            connection_id = id,
            address = %connection.address(),
            protocol_version = agent.protocol_version,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "connected to remote agent"
        );
        *lock(&connection.inner.agent) = Some(agent);
        connection.inner.set_state(ConnectionState::Connected);
        Ok(connection)
    }

    fn start(&self, transport: Transport) {
        let Transport {
            mut sink,
            mut stream,
        } = transport;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *lock(&self.inner.outbound) = Some(tx);
        let connection_id = self.inner.id;

        // Single writer: frames leave in enqueue order and never interleave.
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(err) = sink.send(text).await {
                    // The sink is unusable after an error; do not close it.
                    if let Some(inner) = weak.upgrade() {
                        inner.fail(&format!("write failed: {err}"));
                    }
                    return;
                }
            }
            let _ = sink.close().await;
            tracing::debug!(connection_id, "writer stopped");
        });

        let weak = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(text)) => {
                        let Some(inner) = weak.upgrade() else {
                            break "connection dropped".to_string();
                        };
                        dispatch::dispatch(&Connection { inner }, &text);
                    }
                    Some(Err(err)) => break format!("read failed: {err}"),
                    None => break "remote closed the connection".to_string(),
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.fail(&reason);
            }
        });
        *lock(&self.inner.reader) = Some(reader);
    }

    fn handshake_failed(&self, message: String) -> RemoteAcpError {
        self.inner.fail(&message);
        RemoteAcpError::HandshakeFailed {
            address: self.inner.address.to_string(),
            message,
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Why the connection failed, once it has.
    pub fn failure_reason(&self) -> Option<String> {
        lock(&self.inner.failure).clone()
    }

    pub fn agent_info(&self) -> Option<AgentInfo> {
        lock(&self.inner.agent).clone()
    }

    pub fn created_at_ms(&self) -> i64 {
        self.inner.created_at_ms
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.inner.request_timeout
    }

    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.inner.prompt_timeout
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids = lock(&self.inner.sessions)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    /// Queues one frame for the writer.
    pub fn send(&self, frame: &Value) -> Result<(), RemoteAcpError> {
        let text = serde_json::to_string(frame).map_err(|err| RemoteAcpError::Protocol {
            message: format!("failed to encode frame: {err}"),
        })?;
        let outbound = lock(&self.inner.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(self.inner.closed_error());
        };
        tx.send(text).map_err(|_| self.inner.closed_error())
    }

    /// Sends a request and waits for its response. `timeout` is exact; `None`
    /// waits until the response arrives or the connection fails.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RemoteAcpError> {
        let (id, rx) = self.inner.pending.register(method)?;
        let _guard = PendingGuard::new(&self.inner.pending, id);
        tracing::debug!(connection_id = self.inner.id, id, method, "request → agent");
        self.send(&frame::request(id, method, params))?;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!(
                        connection_id = self.inner.id,
                        id,
                        method,
                        timeout_ms = limit.as_millis() as u64,
                        "request timed out"
                    );
                    return Err(RemoteAcpError::Timeout {
                        method: method.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };
        received.unwrap_or_else(|_| Err(self.inner.closed_error()))
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<(), RemoteAcpError> {
        tracing::debug!(connection_id = self.inner.id, method, "notification → agent");
        self.send(&frame::notification(method, params))
    }

    /// Closes the connection for good. Pending calls fail with
    /// `ConnectionClosed` and every session on it is closed.
    pub fn close(&self) {
        tracing::info!(
            connection_id = self.inner.id,
            address = %self.inner.address,
            "closing connection"
        );
        self.inner.fail("closed locally");
    }

    pub(crate) fn session(&self, session_id: &str) -> Option<Arc<SessionInner>> {
        lock(&self.inner.sessions).get(session_id).cloned()
    }

    pub(crate) fn remove_session(&self, session_id: &str) -> Option<Arc<SessionInner>> {
        let mut sessions = lock(&self.inner.sessions);
        let removed = sessions.remove(session_id);
        if removed.is_some() {
            let mut closed = lock(&self.inner.recently_closed);
            if closed.len() >= RECENTLY_CLOSED_SIZE {
                closed.pop_front();
            }
            closed.push_back(session_id.to_string());
        }
        removed
    }

    /// Adds a session to the table and replays any notifications that
    /// arrived for it before registration.
    pub(crate) fn register_session(&self, session: Arc<SessionInner>) -> Result<(), RemoteAcpError> {
        let replayed = {
            let mut sessions = lock(&self.inner.sessions);
            let state = self.state();
            if !state.is_open() {
                return Err(RemoteAcpError::SessionCreationFailed {
                    message: format!("connection to {} is {state:?}", self.inner.address),
                });
            }
            if sessions.contains_key(&session.id) {
                return Err(RemoteAcpError::SessionCreationFailed {
                    message: format!("agent reused session id {}", session.id),
                });
            }
            sessions.insert(session.id.clone(), session.clone());
            lock(&self.inner.recently_closed).retain(|id| *id != session.id);

            let mut orphans = lock(&self.inner.orphans);
            let (matching, rest): (Vec<_>, Vec<_>) = orphans
                .drain(..)
                .partition(|orphan| orphan.session_id == session.id);
            orphans.extend(rest);
            // Recorded under the table lock so later notifications queue
            // behind these.
            matching
                .into_iter()
                .filter_map(|orphan| session.record(&orphan.method, orphan.params))
                .collect::<Vec<_>>()
        };
        if !replayed.is_empty() {
            tracing::debug!(
                connection_id = self.inner.id,
                session_id = %session.id,
                count = replayed.len(),
                "replayed early notifications"
            );
        }
        for update in &replayed {
            session.notify_handler(update);
        }
        Ok(())
    }

    /// Delivers a session-scoped notification, or holds it until the session
    /// registers.
    pub(crate) fn route_notification(&self, session_id: &str, method: &str, params: Value) {
        let session = {
            let sessions = lock(&self.inner.sessions);
            match sessions.get(session_id) {
                Some(session) => session.clone(),
                None => {
                    if lock(&self.inner.recently_closed).iter().any(|id| id == session_id) {
                        tracing::debug!(
                            connection_id = self.inner.id,
                            session_id = %session_id,
                            method = %method,
                            "dropping notification for closed session"
                        );
                    } else if self.is_open() {
                        self.inner.buffer_orphan(session_id, method, params);
                    }
                    return;
                }
            }
        };
        if let Some(update) = session.record(method, params) {
            session.notify_handler(&update);
        }
    }
}

impl ConnectionInner {
    fn new(id: u64, address: EndpointAddress, config: &ClientConfig) -> Self {
        Self {
            id,
            address,
            state: Mutex::new(ConnectionState::Disconnected),
            failure: Mutex::new(None),
            outbound: Mutex::new(None),
            pending: PendingCalls::new(),
            sessions: Mutex::new(HashMap::new()),
            orphans: Mutex::new(VecDeque::with_capacity(ORPHAN_BUFFER_SIZE)),
            recently_closed: Mutex::new(VecDeque::with_capacity(RECENTLY_CLOSED_SIZE)),
            agent: Mutex::new(None),
            request_timeout: config.request_timeout,
            prompt_timeout: config.prompt_timeout,
            created_at_ms: now_ms(),
            reader: Mutex::new(None),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = lock(&self.state);
        if *state != ConnectionState::Failed {
            *state = next;
        }
    }

    fn closed_error(&self) -> RemoteAcpError {
        RemoteAcpError::ConnectionClosed {
            address: self.address.to_string(),
        }
    }

    fn buffer_orphan(&self, session_id: &str, method: &str, params: Value) {
        let mut orphans = lock(&self.orphans);
        if orphans.len() >= ORPHAN_BUFFER_SIZE {
            if let Some(dropped) = orphans.pop_front() {
                tracing::debug!(
                    connection_id = self.id,
                    session_id = %dropped.session_id,
                    method = %dropped.method,
                    "dropping oldest notification for unknown session"
                );
            }
        }
        orphans.push_back(Orphan {
            session_id: session_id.to_string(),
            method: method.to_string(),
            params,
        });
    }

    /// Moves to `Failed`. Idempotent; only the first call has effects.
    pub(crate) fn fail(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Failed {
                return;
            }
            *state = ConnectionState::Failed;
        }
        *lock(&self.failure) = Some(reason.to_string());
        // Dropping the sender lets the writer flush what is queued and exit.
        lock(&self.outbound).take();
        let failed_calls = self.pending.fail_all(self.closed_error());
        let sessions = lock(&self.sessions)
            .drain()
            .map(|(_, session)| session)
            .collect::<Vec<_>>();
        lock(&self.orphans).clear();
        for session in &sessions {
            session.mark_closed();
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        tracing::warn!(
            connection_id = self.id,
            address = %self.address,
            reason,
            failed_calls,
            closed_sessions = sessions.len(),
            "connection failed"
        );
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::UnsupportedHandler;
    use crate::session::SessionConfig;
    use serde_json::json;

    fn open_connection() -> Connection {
        let address = EndpointAddress::parse("ws://127.0.0.1:1/ws").expect("address");
        let connection = Connection {
            inner: Arc::new(ConnectionInner::new(1, address, &ClientConfig::default())),
        };
        connection.inner.set_state(ConnectionState::Connected);
        connection
    }

    fn session(id: &str) -> Arc<SessionInner> {
        Arc::new(SessionInner::new(
            id.to_string(),
            SessionConfig::new("/tmp"),
            Arc::new(UnsupportedHandler),
            json!({ "sessionId": id }),
        ))
    }

    fn chunk(session_id: &str) -> Value {
        json!({
            "sessionId": session_id,
            "update": { "sessionUpdate": "agent_message_chunk", "content": { "type": "text", "text": "x" } }
        })
    }

    #[test]
    fn closed_sessions_do_not_crowd_out_early_updates() {
        let connection = open_connection();
        connection.register_session(session("old")).expect("register old");
        connection.remove_session("old").expect("removed");

        for _ in 0..(ORPHAN_BUFFER_SIZE * 2) {
            connection.route_notification("old", methods::SESSION_UPDATE, chunk("old"));
        }
        connection.route_notification("new", methods::SESSION_UPDATE, chunk("new"));
        assert_eq!(lock(&connection.inner.orphans).len(), 1);

        let new = session("new");
        connection.register_session(new.clone()).expect("register new");
        assert!(lock(&connection.inner.orphans).is_empty());
        // The buffered chunk was replayed as the first update.
        let next = new
            .record(methods::SESSION_UPDATE, chunk("new"))
            .expect("session open");
        assert_eq!(next.sequence, 2);
    }

    #[test]
    fn agent_info_requires_protocol_version() {
        let info = AgentInfo::from_initialize(&json!({
            "protocolVersion": 1,
            "agentCapabilities": { "loadSession": true },
            "authMethods": [{ "id": "token" }],
        }))
        .expect("valid");
        assert_eq!(info.protocol_version, 1);
        assert_eq!(info.agent_capabilities["loadSession"], true);
        assert_eq!(info.auth_methods.len(), 1);
        assert!(info.agent_info.is_none());

        assert!(AgentInfo::from_initialize(&json!({})).is_err());
    }

    #[test]
    fn only_connecting_and_connected_are_open() {
        assert!(!ConnectionState::Disconnected.is_open());
        assert!(ConnectionState::Connecting.is_open());
        assert!(ConnectionState::Connected.is_open());
        assert!(!ConnectionState::Failed.is_open());
    }
}
