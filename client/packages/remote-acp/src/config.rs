use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const REQUEST_TIMEOUT_ENV: &str = "REMOTE_ACP_REQUEST_TIMEOUT_MS";
pub const PROMPT_TIMEOUT_ENV: &str = "REMOTE_ACP_PROMPT_TIMEOUT_MS";
pub const HANDSHAKE_TIMEOUT_ENV: &str = "REMOTE_ACP_HANDSHAKE_TIMEOUT_MS";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
pub const PROTOCOL_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "remote-acp".to_string(),
            title: "Remote ACP Client".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    pub read_text_file: bool,
    pub write_text_file: bool,
    pub terminal: bool,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            read_text_file: true,
            write_text_file: true,
            terminal: true,
        }
    }
}

impl ClientCapabilities {
    pub fn to_value(&self) -> Value {
        json!({
            "fs": {
                "readTextFile": self.read_text_file,
                "writeTextFile": self.write_text_file,
            },
            "terminal": self.terminal,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for calls that do not carry their own. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Deadline for `session/prompt`; agent turns routinely outlast
    /// ordinary requests.
    pub prompt_timeout: Option<Duration>,
    /// Bound on the `initialize` exchange after the socket is up.
    pub handshake_timeout: Duration,
    pub client_info: ClientInfo,
    pub capabilities: ClientCapabilities,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            prompt_timeout: None,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            client_info: ClientInfo::default(),
            capabilities: ClientCapabilities::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: optional_duration_from_env_ms(
                REQUEST_TIMEOUT_ENV,
                defaults.request_timeout,
            ),
            prompt_timeout: optional_duration_from_env_ms(
                PROMPT_TIMEOUT_ENV,
                defaults.prompt_timeout,
            ),
            handshake_timeout: duration_from_env_ms(
                HANDSHAKE_TIMEOUT_ENV,
                defaults.handshake_timeout,
            ),
            ..defaults
        }
    }

    pub fn initialize_params(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": self.capabilities.to_value(),
            "clientInfo": self.client_info,
        })
    }
}

fn duration_from_env_ms(key: &str, default: Duration) -> Duration {
    parse_ms(std::env::var(key).ok()).unwrap_or(default)
}

fn optional_duration_from_env_ms(key: &str, default: Option<Duration>) -> Option<Duration> {
    parse_ms(std::env::var(key).ok()).or(default)
}

fn parse_ms(raw: Option<String>) -> Option<Duration> {
    raw?.trim()
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}
