//! JSON-RPC framing for ACP traffic.
//!
//! Individual ACP method schemas are opaque here; a frame is classified only
//! by which envelope members it carries.

use remote_acp_error::{RemoteAcpError, RpcErrorObject, INTERNAL_ERROR};
use serde_json::{json, Value};

pub type RequestId = u64;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_CANCEL: &str = "session/cancel";
    pub const SESSION_SET_MODE: &str = "session/set_mode";
    pub const SESSION_UPDATE: &str = "session/update";
    pub const SESSION_REQUEST_PERMISSION: &str = "session/request_permission";
    pub const FS_READ_TEXT_FILE: &str = "fs/read_text_file";
    pub const FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";
    pub const TERMINAL_CREATE: &str = "terminal/create";
    pub const TERMINAL_OUTPUT: &str = "terminal/output";
    pub const TERMINAL_RELEASE: &str = "terminal/release";
    pub const TERMINAL_WAIT_FOR_EXIT: &str = "terminal/wait_for_exit";
    pub const TERMINAL_KILL: &str = "terminal/kill";
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response {
        id: Value,
        outcome: Result<Value, RpcErrorObject>,
    },
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, RemoteAcpError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| RemoteAcpError::Protocol {
            message: format!("invalid json: {err}"),
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, RemoteAcpError> {
        let Value::Object(mut object) = value else {
            return Err(RemoteAcpError::Protocol {
                message: "frame must be a JSON object (batches are not supported)".to_string(),
            });
        };

        let id = object.remove("id").filter(|id| !id.is_null());
        let params = object.remove("params").unwrap_or(Value::Null);

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(RemoteAcpError::Protocol {
                    message: "method must be a string".to_string(),
                });
            };
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        let Some(id) = id else {
            return Err(RemoteAcpError::Protocol {
                message: "frame has neither method nor id".to_string(),
            });
        };

        let outcome = match object.remove("error") {
            Some(error) => Err(serde_json::from_value::<RpcErrorObject>(error.clone())
                .unwrap_or_else(|_| RpcErrorObject {
                    code: INTERNAL_ERROR,
                    message: "malformed error object".to_string(),
                    data: Some(error),
                })),
            None => Ok(object.remove("result").unwrap_or(Value::Null)),
        };
        Ok(Self::Response { id, outcome })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Request { params, .. } | Self::Notification { params, .. } => {
                session_id_of(params)
            }
            Self::Response { .. } => None,
        }
    }
}

/// Extracts the numeric request id we assigned from a response id.
pub fn request_id(id: &Value) -> Option<RequestId> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

pub fn session_id_of(params: &Value) -> Option<&str> {
    params.get("sessionId").and_then(Value::as_str)
}

pub fn request(id: RequestId, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: Value, error: &RpcErrorObject) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}

/// Returns `params` with `sessionId` set, creating an object for null params.
pub(crate) fn with_session_id(params: Value, session_id: &str) -> Result<Value, RemoteAcpError> {
    let mut object = match params {
        Value::Null => serde_json::Map::new(),
        Value::Object(object) => object,
        other => {
            return Err(RemoteAcpError::InvalidParams {
                message: format!("session params must be an object, got {other}"),
            })
        }
    };
    object.insert(
        "sessionId".to_string(),
        Value::String(session_id.to_string()),
    );
    Ok(Value::Object(object))
}
