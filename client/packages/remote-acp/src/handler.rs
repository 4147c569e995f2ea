//! Client-side capabilities an agent may invoke on a session.
//!
//! The agent drives these through JSON-RPC requests addressed to a
//! `sessionId`; [`handle_request`] decodes the params, applies the session's
//! [`PermissionMode`] and calls into the session's [`ClientHandler`].

use std::path::PathBuf;

use async_trait::async_trait;
use remote_acp_error::RemoteAcpError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::frame::methods;
use crate::session::{PermissionMode, SessionConfig, SessionInner, SessionUpdate};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTextFileRequest {
    pub path: PathBuf,
    /// 1-based first line to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadTextFileResponse {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTextFileRequest {
    pub path: PathBuf,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
    #[serde(other)]
    Other,
}

impl PermissionOptionKind {
    pub fn is_allow(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }

    pub fn is_reject(self) -> bool {
        matches!(self, Self::RejectOnce | Self::RejectAlways)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub name: String,
    pub kind: PermissionOptionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionRequest {
    #[serde(default)]
    pub tool_call: Value,
    pub options: Vec<PermissionOption>,
}

impl RequestPermissionRequest {
    /// First offered option matching `wanted`, trying once-options before
    /// always-options.
    fn pick(&self, wanted: fn(PermissionOptionKind) -> bool) -> Option<&PermissionOption> {
        let once = self.options.iter().find(|option| {
            wanted(option.kind)
                && matches!(
                    option.kind,
                    PermissionOptionKind::AllowOnce | PermissionOptionKind::RejectOnce
                )
        });
        once.or_else(|| self.options.iter().find(|option| wanted(option.kind)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    Cancelled,
    #[serde(rename_all = "camelCase")]
    Selected { option_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPermissionResponse {
    pub outcome: PermissionOutcome,
}

impl RequestPermissionResponse {
    pub fn cancelled() -> Self {
        Self {
            outcome: PermissionOutcome::Cancelled,
        }
    }

    pub fn selected(option_id: impl Into<String>) -> Self {
        Self {
            outcome: PermissionOutcome::Selected {
                option_id: option_id.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_byte_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalResponse {
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRequest {
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitStatus {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutputResponse {
    pub output: String,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<TerminalExitStatus>,
}

/// What a handler knows about the session a request targets.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext<'a> {
    pub session_id: &'a str,
    pub config: &'a SessionConfig,
}

/// Capabilities the local side offers to agents, one instance per session.
///
/// Every request method defaults to `MethodNotFound`, so a handler only
/// implements what it advertises.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    async fn read_text_file(
        &self,
        _session: &SessionContext<'_>,
        _request: ReadTextFileRequest,
    ) -> Result<ReadTextFileResponse, RemoteAcpError> {
        Err(not_supported(methods::FS_READ_TEXT_FILE))
    }

    async fn write_text_file(
        &self,
        _session: &SessionContext<'_>,
        _request: WriteTextFileRequest,
    ) -> Result<(), RemoteAcpError> {
        Err(not_supported(methods::FS_WRITE_TEXT_FILE))
    }

    async fn request_permission(
        &self,
        _session: &SessionContext<'_>,
        _request: RequestPermissionRequest,
    ) -> Result<RequestPermissionResponse, RemoteAcpError> {
        Ok(RequestPermissionResponse::cancelled())
    }

    async fn create_terminal(
        &self,
        _session: &SessionContext<'_>,
        _request: CreateTerminalRequest,
    ) -> Result<CreateTerminalResponse, RemoteAcpError> {
        Err(not_supported(methods::TERMINAL_CREATE))
    }

    async fn terminal_output(
        &self,
        _session: &SessionContext<'_>,
        _request: TerminalRequest,
    ) -> Result<TerminalOutputResponse, RemoteAcpError> {
        Err(not_supported(methods::TERMINAL_OUTPUT))
    }

    async fn wait_for_terminal_exit(
        &self,
        _session: &SessionContext<'_>,
        _request: TerminalRequest,
    ) -> Result<TerminalExitStatus, RemoteAcpError> {
        Err(not_supported(methods::TERMINAL_WAIT_FOR_EXIT))
    }

    async fn kill_terminal(
        &self,
        _session: &SessionContext<'_>,
        _request: TerminalRequest,
    ) -> Result<(), RemoteAcpError> {
        Err(not_supported(methods::TERMINAL_KILL))
    }

    async fn release_terminal(
        &self,
        _session: &SessionContext<'_>,
        _request: TerminalRequest,
    ) -> Result<(), RemoteAcpError> {
        Err(not_supported(methods::TERMINAL_RELEASE))
    }

    /// Called on the connection's receive path; must not block.
    fn on_session_update(&self, _session_id: &str, _update: &SessionUpdate) {}

    fn on_session_closed(&self, _session_id: &str) {}
}

/// Handler that offers nothing and cancels every permission request.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedHandler;

impl ClientHandler for UnsupportedHandler {}

fn not_supported(method: &str) -> RemoteAcpError {
    RemoteAcpError::MethodNotFound {
        method: method.to_string(),
    }
}

fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RemoteAcpError> {
    serde_json::from_value(params).map_err(|err| RemoteAcpError::InvalidParams {
        message: err.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Value, RemoteAcpError> {
    serde_json::to_value(value).map_err(|err| RemoteAcpError::HandlerFailed {
        message: err.to_string(),
    })
}

fn empty() -> Value {
    Value::Object(Map::new())
}

/// Answers `session/request_permission` without the handler.
pub fn automatic_permission(
    mode: PermissionMode,
    request: &RequestPermissionRequest,
) -> Option<RequestPermissionResponse> {
    let wanted: fn(PermissionOptionKind) -> bool = match mode {
        PermissionMode::Default => return None,
        PermissionMode::AllowAll => PermissionOptionKind::is_allow,
        PermissionMode::RejectAll => PermissionOptionKind::is_reject,
    };
    Some(match request.pick(wanted) {
        Some(option) => RequestPermissionResponse::selected(option.option_id.clone()),
        None => RequestPermissionResponse::cancelled(),
    })
}

/// Routes one agent-to-client request to the session's handler and returns
/// the JSON-RPC result.
pub(crate) async fn handle_request(
    session: &SessionInner,
    method: &str,
    params: Value,
) -> Result<Value, RemoteAcpError> {
    let context = SessionContext {
        session_id: &session.id,
        config: &session.config,
    };
    let handler = session.handler.as_ref();

    match method {
        methods::FS_READ_TEXT_FILE => {
            encode(&handler.read_text_file(&context, decode(params)?).await?)
        }
        methods::FS_WRITE_TEXT_FILE => {
            handler.write_text_file(&context, decode(params)?).await?;
            Ok(empty())
        }
        methods::SESSION_REQUEST_PERMISSION => {
            let request: RequestPermissionRequest = decode(params)?;
            let response = match automatic_permission(session.config.permission_mode, &request) {
                Some(response) => {
                    tracing::debug!(
                        session_id = %session.id,
                        mode = ?session.config.permission_mode,
                        outcome = ?response.outcome,
                        "answered permission request automatically"
                    );
                    response
                }
                None => handler.request_permission(&context, request).await?,
            };
            encode(&response)
        }
        methods::TERMINAL_CREATE => {
            encode(&handler.create_terminal(&context, decode(params)?).await?)
        }
        methods::TERMINAL_OUTPUT => {
            encode(&handler.terminal_output(&context, decode(params)?).await?)
        }
        methods::TERMINAL_WAIT_FOR_EXIT => {
            encode(&handler.wait_for_terminal_exit(&context, decode(params)?).await?)
        }
        methods::TERMINAL_KILL => {
            handler.kill_terminal(&context, decode(params)?).await?;
            Ok(empty())
        }
        methods::TERMINAL_RELEASE => {
            handler.release_terminal(&context, decode(params)?).await?;
            Ok(empty())
        }
        other => Err(not_supported(other)),
    }
}
