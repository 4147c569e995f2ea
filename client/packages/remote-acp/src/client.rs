use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use remote_acp_error::RemoteAcpError;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::address::EndpointAddress;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::frame::methods;
use crate::handler::ClientHandler;
use crate::session::{Session, SessionConfig, SessionInner};
use crate::transport::{Connector, WebSocketConnector};

/// Shares one connection per remote address between any number of
/// sessions.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MultiplexerInner>,
}

struct MultiplexerInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    next_connection_id: AtomicU64,
    connections: RwLock<HashMap<String, Connection>>,
    connection_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("config", &self.inner.config)
            .field("connector", &self.inner.connector)
            .finish_non_exhaustive()
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Multiplexer {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                config,
                connector,
                next_connection_id: AtomicU64::new(1),
                connections: RwLock::new(HashMap::new()),
                connection_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the live connection for `address`, establishing it if needed.
    ///
    /// Concurrent callers for the same address share a single connect
    /// attempt. A failed cached connection is replaced, never revived.
    pub async fn get_or_create_connection(&self, address: &str) -> Result<Connection, RemoteAcpError> {
        let address = EndpointAddress::parse(address)?;
        let key = address.key();

        if let Some(existing) = self.live_connection(&key).await {
            return Ok(existing);
        }

        let lock = {
            let mut locks = self.inner.connection_locks.lock().await;
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.create_connection(&key, address).await
        };
        self.release_connection_lock(&key, lock).await;
        result
    }

    /// Runs under the per-address creation lock.
    async fn create_connection(
        &self,
        key: &str,
        address: EndpointAddress,
    ) -> Result<Connection, RemoteAcpError> {
        if let Some(existing) = self.live_connection(key).await {
            return Ok(existing);
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let result = Connection::connect(
            id,
            address,
            self.inner.connector.as_ref(),
            &self.inner.config,
        )
        .await;

        let mut connections = self.inner.connections.write().await;
        match result {
            Ok(connection) => {
                if let Some(previous) = connections.insert(key.to_string(), connection.clone()) {
                    tracing::debug!(
                        key = %key,
                        previous_id = previous.id(),
                        connection_id = connection.id(),
                        "replaced failed connection"
                    );
                }
                Ok(connection)
            }
            Err(err) => {
                if connections
                    .get(key)
                    .is_some_and(|existing| !existing.is_open())
                {
                    connections.remove(key);
                }
                tracing::error!(key = %key, error = %err, "failed to connect");
                Err(err)
            }
        }
    }

    /// Forgets the creation lock for `key` once no other caller is waiting
    /// on it. Clones are only taken under the map lock, so the count is exact.
    async fn release_connection_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.inner.connection_locks.lock().await;
        let idle = locks
            .get(key)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    async fn connection_lock_count(&self) -> usize {
        self.inner.connection_locks.lock().await.len()
    }

    async fn live_connection(&self, key: &str) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .await
            .get(key)
            .filter(|connection| connection.is_open())
            .cloned()
    }

    /// Cached connection for `address`, whatever its state.
    pub async fn connection(&self, address: &str) -> Option<Connection> {
        let key = EndpointAddress::parse(address).ok()?.key();
        self.inner.connections.read().await.get(&key).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Runs `session/new` on `connection` and registers the resulting
    /// session with `handler`.
    pub async fn create_session(
        &self,
        connection: &Connection,
        config: SessionConfig,
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Session, RemoteAcpError> {
        let state = connection.state();
        if state != ConnectionState::Connected {
            return Err(RemoteAcpError::SessionCreationFailed {
                message: format!("connection to {} is {state:?}", connection.address()),
            });
        }

        let start = Instant::now();
        let result = connection
            .request(
                methods::SESSION_NEW,
                config.new_session_params(),
                connection.request_timeout(),
            )
            .await
            .map_err(|err| {
                tracing::warn!(
                    connection_id = connection.id(),
                    error = %err,
                    "session/new failed"
                );
                RemoteAcpError::SessionCreationFailed {
                    message: err.to_string(),
                }
            })?;

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RemoteAcpError::SessionCreationFailed {
                message: "session/new response has no sessionId".to_string(),
            })?
            .to_string();

        let inner = Arc::new(SessionInner::new(session_id, config, handler, result));
        connection.register_session(inner.clone())?;
        inner.activate();

        tracing::info!(
            connection_id = connection.id(),
            session_id = %inner.id,
            cwd = %inner.config.cwd.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "session created"
        );
        Ok(Session::new(inner, connection.clone()))
    }

    /// Sends a raw request on `connection`. `timeout` overrides the
    /// configured request timeout.
    pub async fn call(
        &self,
        connection: &Connection,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RemoteAcpError> {
        connection
            .request(method, params, timeout.or(connection.request_timeout()))
            .await
    }

    pub fn close_session(&self, session: &Session) {
        session.close();
    }

    /// Closes every connection. Sessions on them close and pending calls
    /// fail with `ConnectionClosed`.
    pub async fn shutdown(&self) {
        let connections = self
            .inner
            .connections
            .write()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect::<Vec<_>>();
        tracing::info!(count = connections.len(), "shutting down connections");
        for connection in connections {
            connection.close();
        }
        self.inner.connection_locks.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use remote_acp_error::ErrorType;

    #[derive(Debug)]
    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, address: &EndpointAddress) -> Result<Transport, RemoteAcpError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(RemoteAcpError::ConnectionRefused {
                address: address.to_string(),
                message: "refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn creation_locks_are_released_after_each_attempt() {
        let mux = Multiplexer::with_connector(ClientConfig::default(), Arc::new(RefusingConnector));
        let attempts = (0..4).map(|n| {
            let mux = mux.clone();
            async move {
                mux.get_or_create_connection(&format!("ws://127.0.0.1:{}/ws", 9000 + n % 2))
                    .await
            }
        });
        for result in futures::future::join_all(attempts).await {
            let err = result.expect_err("refused");
            assert_eq!(err.error_type(), ErrorType::ConnectionRefused);
        }
        assert_eq!(mux.connection_lock_count().await, 0);
        assert_eq!(mux.connection_count().await, 0);
    }
}
