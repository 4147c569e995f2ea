use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// ACP "resource not found", used for frames naming a session we do not own.
pub const RESOURCE_NOT_FOUND: i64 = -32002;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidAddress,
    ConnectionRefused,
    HandshakeFailed,
    ConnectionClosed,
    Timeout,
    SessionCreationFailed,
    SessionClosed,
    UnknownSession,
    RemoteError,
    MethodNotFound,
    InvalidParams,
    HandlerFailed,
    Protocol,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidAddress => "urn:remote-acp:error:invalid_address",
            Self::ConnectionRefused => "urn:remote-acp:error:connection_refused",
            Self::HandshakeFailed => "urn:remote-acp:error:handshake_failed",
            Self::ConnectionClosed => "urn:remote-acp:error:connection_closed",
            Self::Timeout => "urn:remote-acp:error:timeout",
            Self::SessionCreationFailed => "urn:remote-acp:error:session_creation_failed",
            Self::SessionClosed => "urn:remote-acp:error:session_closed",
            Self::UnknownSession => "urn:remote-acp:error:unknown_session",
            Self::RemoteError => "urn:remote-acp:error:remote_error",
            Self::MethodNotFound => "urn:remote-acp:error:method_not_found",
            Self::InvalidParams => "urn:remote-acp:error:invalid_params",
            Self::HandlerFailed => "urn:remote-acp:error:handler_failed",
            Self::Protocol => "urn:remote-acp:error:protocol",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidAddress => "Invalid Address",
            Self::ConnectionRefused => "Connection Refused",
            Self::HandshakeFailed => "Handshake Failed",
            Self::ConnectionClosed => "Connection Closed",
            Self::Timeout => "Timeout",
            Self::SessionCreationFailed => "Session Creation Failed",
            Self::SessionClosed => "Session Closed",
            Self::UnknownSession => "Unknown Session",
            Self::RemoteError => "Remote Error",
            Self::MethodNotFound => "Method Not Found",
            Self::InvalidParams => "Invalid Params",
            Self::HandlerFailed => "Handler Failed",
            Self::Protocol => "Protocol Error",
        }
    }

    /// JSON-RPC error code used when this error is reported back to the agent.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::InvalidAddress => INVALID_PARAMS,
            Self::ConnectionRefused => INTERNAL_ERROR,
            Self::HandshakeFailed => INTERNAL_ERROR,
            Self::ConnectionClosed => INTERNAL_ERROR,
            Self::Timeout => INTERNAL_ERROR,
            Self::SessionCreationFailed => INTERNAL_ERROR,
            Self::SessionClosed => RESOURCE_NOT_FOUND,
            Self::UnknownSession => RESOURCE_NOT_FOUND,
            Self::RemoteError => INTERNAL_ERROR,
            Self::MethodNotFound => METHOD_NOT_FOUND,
            Self::InvalidParams => INVALID_PARAMS,
            Self::HandlerFailed => INTERNAL_ERROR,
            Self::Protocol => INVALID_REQUEST,
        }
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Error)]
pub enum RemoteAcpError {
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("connection to {address} refused: {message}")]
    ConnectionRefused { address: String, message: String },
    #[error("handshake with {address} failed: {message}")]
    HandshakeFailed { address: String, message: String },
    #[error("connection to {address} is closed")]
    ConnectionClosed { address: String },
    #[error("timed out after {timeout_ms}ms waiting for '{method}'")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("session creation failed: {message}")]
    SessionCreationFailed { message: String },
    #[error("session closed: {session_id}")]
    SessionClosed { session_id: String },
    #[error("unknown session: {session_id}")]
    UnknownSession { session_id: String },
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("invalid params: {message}")]
    InvalidParams { message: String },
    #[error("handler failed: {message}")]
    HandlerFailed { message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl RemoteAcpError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidAddress { .. } => ErrorType::InvalidAddress,
            Self::ConnectionRefused { .. } => ErrorType::ConnectionRefused,
            Self::HandshakeFailed { .. } => ErrorType::HandshakeFailed,
            Self::ConnectionClosed { .. } => ErrorType::ConnectionClosed,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::SessionCreationFailed { .. } => ErrorType::SessionCreationFailed,
            Self::SessionClosed { .. } => ErrorType::SessionClosed,
            Self::UnknownSession { .. } => ErrorType::UnknownSession,
            Self::Remote { .. } => ErrorType::RemoteError,
            Self::MethodNotFound { .. } => ErrorType::MethodNotFound,
            Self::InvalidParams { .. } => ErrorType::InvalidParams,
            Self::HandlerFailed { .. } => ErrorType::HandlerFailed,
            Self::Protocol { .. } => ErrorType::Protocol,
        }
    }

    /// True for errors that mean the underlying connection is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::HandshakeFailed { .. }
                | Self::ConnectionClosed { .. }
        )
    }

    pub fn to_rpc_error(&self) -> RpcErrorObject {
        if let Self::Remote {
            code,
            message,
            data,
        } = self
        {
            return RpcErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            };
        }

        let error_type = self.error_type();
        let mut data = Map::new();
        data.insert(
            "type".to_string(),
            Value::String(error_type.as_urn().to_string()),
        );
        data.insert(
            "title".to_string(),
            Value::String(error_type.title().to_string()),
        );
        match self {
            Self::SessionClosed { session_id } | Self::UnknownSession { session_id } => {
                data.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::MethodNotFound { method } | Self::Timeout { method, .. } => {
                data.insert("method".to_string(), Value::String(method.clone()));
            }
            Self::InvalidAddress { address, .. }
            | Self::ConnectionRefused { address, .. }
            | Self::HandshakeFailed { address, .. }
            | Self::ConnectionClosed { address } => {
                data.insert("address".to_string(), Value::String(address.clone()));
            }
            _ => {}
        }

        RpcErrorObject {
            code: error_type.rpc_code(),
            message: self.to_string(),
            data: Some(Value::Object(data)),
        }
    }

    pub fn from_rpc_error(error: RpcErrorObject) -> Self {
        Self::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<RemoteAcpError> for RpcErrorObject {
    fn from(value: RemoteAcpError) -> Self {
        value.to_rpc_error()
    }
}

impl From<&RemoteAcpError> for RpcErrorObject {
    fn from(value: &RemoteAcpError) -> Self {
        value.to_rpc_error()
    }
}
