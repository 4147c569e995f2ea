#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

/// Routes client logs through the test harness; `RUST_LOG` widens them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Delay before answering `initialize`.
    pub initialize_delay: Option<Duration>,
    /// Emit an `available_commands_update` before the `session/new` response.
    pub early_updates: bool,
}

#[derive(Debug, Default)]
pub struct MockStats {
    pub connections: AtomicUsize,
    pub initializes: AtomicUsize,
    pub sessions: AtomicUsize,
    pub notifications: Mutex<Vec<Value>>,
}

/// In-process ACP agent speaking JSON-RPC over WebSocket.
pub struct MockAgent {
    pub url: String,
    pub stats: Arc<MockStats>,
    task: JoinHandle<()>,
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockAgent {
    pub async fn start() -> Self {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock agent");
        let port = listener.local_addr().expect("local addr").port();
        let stats = Arc::new(MockStats::default());

        let accept_stats = stats.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_stats.clone(), options.clone()));
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}/ws"),
            stats,
            task,
        }
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn initializes(&self) -> usize {
        self.stats.initializes.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> Vec<Value> {
        self.stats.notifications.lock().expect("notifications").clone()
    }

    pub async fn wait_for_notification(&self, method: &str) -> Value {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(found) = self
                .notifications()
                .into_iter()
                .find(|frame| frame["method"] == method)
            {
                return found;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {method} notification"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

enum Outbound {
    Frame(Value),
    Close,
}

struct Peer {
    tx: mpsc::UnboundedSender<Outbound>,
    waiting: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    stats: Arc<MockStats>,
    options: MockOptions,
}

async fn serve(stream: TcpStream, stats: Arc<MockStats>, options: MockOptions) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    stats.connections.fetch_add(1, Ordering::SeqCst);

    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write.close().await;
                    break;
                }
            }
        }
    });

    let peer = Arc::new(Peer {
        tx,
        waiting: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        stats,
        options,
    });

    while let Some(Ok(message)) = read.next().await {
        let text = match message {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let method = frame.get("method").and_then(Value::as_str).map(str::to_string);
        let id = frame.get("id").cloned().filter(|id| !id.is_null());

        match (method, id) {
            (Some(method), Some(id)) => {
                if method == "mock/disconnect" {
                    let _ = peer.tx.send(Outbound::Close);
                    break;
                }
                let params = frame.get("params").cloned().unwrap_or(Value::Null);
                let peer = peer.clone();
                tokio::spawn(async move { peer.handle(id, &method, params).await });
            }
            (Some(_), None) => {
                peer.stats.notifications.lock().expect("notifications").push(frame);
            }
            (None, Some(id)) => {
                let waiter = peer.waiting.lock().expect("waiting").remove(&id.to_string());
                if let Some(waiter) = waiter {
                    let _ = waiter.send(frame);
                }
            }
            (None, None) => {}
        }
    }
}

impl Peer {
    async fn handle(&self, id: Value, method: &str, params: Value) {
        let session_id = params["sessionId"].clone();
        let outcome: Result<Value, Value> = match method {
            "initialize" => {
                self.stats.initializes.fetch_add(1, Ordering::SeqCst);
                if let Some(delay) = self.options.initialize_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(json!({
                    "protocolVersion": 1,
                    "agentCapabilities": { "loadSession": false },
                    "authMethods": [],
                    "agentInfo": { "name": "mock-agent", "version": "0.0.0" }
                }))
            }
            "session/new" => {
                let n = self.stats.sessions.fetch_add(1, Ordering::SeqCst) + 1;
                let session_id = format!("mock-session-{n}");
                if self.options.early_updates {
                    self.update(
                        &session_id,
                        json!({
                            "sessionUpdate": "available_commands_update",
                            "availableCommands": [
                                { "name": "plan", "description": "Plan the work" },
                                { "name": "review", "description": "Review changes" }
                            ]
                        }),
                    );
                }
                Ok(json!({ "sessionId": session_id, "cwd": params["cwd"] }))
            }
            "session/prompt" => {
                let sid = session_id.as_str().unwrap_or_default().to_string();
                let text = params["prompt"][0]["text"].as_str().unwrap_or_default().to_string();
                for chunk in ["echo: ", text.as_str()] {
                    self.update(
                        &sid,
                        json!({
                            "sessionUpdate": "agent_message_chunk",
                            "content": { "type": "text", "text": chunk }
                        }),
                    );
                }
                Ok(json!({ "stopReason": "end_turn" }))
            }
            "session/set_mode" => Ok(json!({})),
            "mock/echo" => Ok(json!({ "echoed": params })),
            "mock/delay" => {
                let ms = params["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "delayed": ms }))
            }
            "mock/never" => return,
            "mock/fail" => Err(json!({
                "code": -32000,
                "message": "mock failure",
                "data": { "reason": "requested" }
            })),
            "mock/read_file" => {
                let response = self
                    .ask_client(
                        "fs/read_text_file",
                        json!({ "sessionId": session_id, "path": params["path"] }),
                    )
                    .await;
                Ok(json!({ "clientResponse": response }))
            }
            "mock/ask_unknown_session" => {
                let response = self
                    .ask_client(
                        "fs/read_text_file",
                        json!({ "sessionId": "no-such-session", "path": "/etc/hosts" }),
                    )
                    .await;
                Ok(json!({ "clientResponse": response }))
            }
            "mock/ask_permission" => {
                let response = self
                    .ask_client(
                        "session/request_permission",
                        json!({
                            "sessionId": session_id,
                            "toolCall": { "toolCallId": "call-1", "title": "Edit file" },
                            "options": [
                                { "optionId": "allow", "name": "Allow", "kind": "allow_once" },
                                { "optionId": "reject", "name": "Reject", "kind": "reject_once" }
                            ]
                        }),
                    )
                    .await;
                Ok(json!({ "clientResponse": response }))
            }
            "mock/notify" => {
                let target = params["target"].as_str().unwrap_or_default().to_string();
                self.update(
                    &target,
                    json!({
                        "sessionUpdate": "agent_message_chunk",
                        "content": { "type": "text", "text": "ping" }
                    }),
                );
                Ok(json!({}))
            }
            other => Err(json!({ "code": -32601, "message": format!("method not found: {other}") })),
        };

        let frame = match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({ "jsonrpc": "2.0", "id": id, "error": error }),
        };
        let _ = self.tx.send(Outbound::Frame(frame));
    }

    fn update(&self, session_id: &str, update: Value) {
        let _ = self.tx.send(Outbound::Frame(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": session_id, "update": update }
        })));
    }

    async fn ask_client(&self, method: &str, params: Value) -> Value {
        let id = json!(format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .expect("waiting")
            .insert(id.to_string(), tx);
        let _ = self.tx.send(Outbound::Frame(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        })));
        rx.await.unwrap_or(Value::Null)
    }
}

/// A port nothing listens on.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").port()
}
