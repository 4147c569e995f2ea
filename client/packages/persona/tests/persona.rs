use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use remote_acp::{ClientConfig, Multiplexer, SessionConfig};
use remote_acp_persona::{ExamplePersona, RemotePersona, WorkspaceHandler};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Minimal agent: answers `initialize`, `session/new`, and echoes prompts
/// back as two message chunks.
struct EchoAgent {
    url: String,
    connections: Arc<AtomicUsize>,
}

impl EchoAgent {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let connections = Arc::new(AtomicUsize::new(0));
        let sessions = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (mut write, mut read) = socket.split();
                    while let Some(Ok(Message::Text(text))) = read.next().await {
                        let frame: Value = match serde_json::from_str(text.as_str()) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        };
                        if frame.get("id").is_none() {
                            continue;
                        }
                        for reply in answer(&frame, &sessions) {
                            if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}/ws"),
            connections,
        }
    }
}

fn answer(frame: &Value, sessions: &AtomicUsize) -> Vec<Value> {
    let id = frame["id"].clone();
    let params = &frame["params"];
    match frame["method"].as_str().unwrap_or_default() {
        "initialize" => vec![json!({
            "jsonrpc": "2.0", "id": id, "result": { "protocolVersion": 1 }
        })],
        "session/new" => {
            let n = sessions.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = format!("echo-{n}");
            vec![
                json!({
                    "jsonrpc": "2.0",
                    "method": "session/update",
                    "params": {
                        "sessionId": session_id,
                        "update": {
                            "sessionUpdate": "available_commands_update",
                            "availableCommands": [{ "name": "explain", "description": "Explain code" }]
                        }
                    }
                }),
                json!({ "jsonrpc": "2.0", "id": id, "result": { "sessionId": session_id } }),
            ]
        }
        "session/prompt" => {
            let session_id = params["sessionId"].clone();
            let text = params["prompt"][0]["text"].as_str().unwrap_or_default();
            let mut frames = ["echo: ", text]
                .iter()
                .map(|chunk| {
                    json!({
                        "jsonrpc": "2.0",
                        "method": "session/update",
                        "params": {
                            "sessionId": session_id,
                            "update": {
                                "sessionUpdate": "agent_message_chunk",
                                "content": { "type": "text", "text": chunk }
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();
            frames.push(json!({ "jsonrpc": "2.0", "id": id, "result": { "stopReason": "end_turn" } }));
            frames
        }
        other => vec![json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("method not found: {other}") }
        })],
    }
}

fn persona(multiplexer: &Multiplexer, url: &str) -> RemotePersona {
    RemotePersona::new(
        multiplexer.clone(),
        url,
        ExamplePersona::defaults(),
        SessionConfig::new(std::env::temp_dir()),
        Arc::new(WorkspaceHandler::new()),
    )
    .expect("persona")
}

#[tokio::test]
async fn personas_share_a_connection_but_not_a_session() {
    let agent = EchoAgent::start().await;
    let multiplexer = Multiplexer::new(ClientConfig::default());
    let first = persona(&multiplexer, &agent.url);
    let second = persona(&multiplexer, &agent.url);

    let first_id = first.session_id().await.expect("first session");
    let second_id = second.session_id().await.expect("second session");
    assert_ne!(first_id, second_id);
    assert_eq!(agent.connections.load(Ordering::SeqCst), 1);
    assert_eq!(first.session_id().await.expect("stable"), first_id);

    let reply = first
        .process_message("@remote-acp-example  hello there ")
        .await
        .expect("reply");
    assert_eq!(reply.text, "echo: hello there");
    assert_eq!(reply.stop_reason, "end_turn");

    let commands = first.acp_slash_commands().await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].name, "explain");
}

#[tokio::test]
async fn shutdown_closes_only_the_persona_session() {
    let agent = EchoAgent::start().await;
    let multiplexer = Multiplexer::new(ClientConfig::default());
    let first = persona(&multiplexer, &agent.url);
    let second = persona(&multiplexer, &agent.url);

    let closed_id = first.session_id().await.expect("first session");
    second.session_id().await.expect("second session");
    first.shutdown().await;

    let reply = second.process_message("still here?").await.expect("reply");
    assert_eq!(reply.text, "echo: still here?");

    // The next use opens a fresh session on the same connection.
    let reopened = first.session_id().await.expect("recreated");
    assert_ne!(reopened, closed_id);
    assert_eq!(agent.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn consecutive_replies_do_not_bleed_into_each_other() {
    let agent = EchoAgent::start().await;
    let multiplexer = Multiplexer::new(ClientConfig::default());
    let persona = persona(&multiplexer, &agent.url);

    let first = persona.process_message("one").await.expect("first");
    let second = persona.process_message("two").await.expect("second");
    assert_eq!(first.text, "echo: one");
    assert_eq!(second.text, "echo: two");
}
