use std::time::Instant;

use remote_acp_error::{RemoteAcpError, RpcErrorObject};
use serde_json::Value;

use crate::connection::Connection;
use crate::frame::{self, InboundFrame};
use crate::handler;

/// Routes one inbound frame. Runs on the connection's reader and never
/// waits on a handler: agent requests are answered from spawned tasks.
pub(crate) fn dispatch(connection: &Connection, raw: &str) {
    let frame = match InboundFrame::parse(raw) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(
                connection_id = connection.id(),
                error = %err,
                "dropping malformed frame"
            );
            return;
        }
    };

    match frame {
        InboundFrame::Response { id, outcome } => dispatch_response(connection, id, outcome),
        InboundFrame::Request { id, method, params } => {
            dispatch_request(connection, id, method, params)
        }
        InboundFrame::Notification { method, params } => {
            dispatch_notification(connection, method, params)
        }
    }
}

fn dispatch_response(connection: &Connection, id: Value, outcome: Result<Value, RpcErrorObject>) {
    let Some(request_id) = frame::request_id(&id) else {
        tracing::debug!(connection_id = connection.id(), id = %id, "response with foreign id");
        return;
    };
    let outcome = outcome.map_err(RemoteAcpError::from_rpc_error);
    if !connection.pending().resolve(request_id, outcome) {
        // Timed out, abandoned or duplicate.
        tracing::debug!(
            connection_id = connection.id(),
            id = request_id,
            "dropping late response"
        );
    }
}

fn dispatch_request(connection: &Connection, id: Value, method: String, params: Value) {
    let Some(session_id) = frame::session_id_of(&params).map(str::to_string) else {
        tracing::warn!(
            connection_id = connection.id(),
            method = %method,
            "agent request without sessionId"
        );
        reply(
            connection,
            frame::error_response(
                id,
                &RemoteAcpError::InvalidParams {
                    message: format!("{method} requires sessionId"),
                }
                .to_rpc_error(),
            ),
        );
        return;
    };

    let Some(session) = connection.session(&session_id) else {
        tracing::warn!(
            connection_id = connection.id(),
            session_id = %session_id,
            method = %method,
            "agent request for unknown session"
        );
        reply(
            connection,
            frame::error_response(
                id,
                &RemoteAcpError::UnknownSession { session_id }.to_rpc_error(),
            ),
        );
        return;
    };
    session.touch();

    let connection = connection.clone();
    tokio::spawn(async move {
        let start = Instant::now();
        let frame = match handler::handle_request(&session, &method, params).await {
            Ok(result) => {
                tracing::debug!(
                    session_id = %session_id,
                    method = %method,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "agent request handled"
                );
                frame::response(id, result)
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    method = %method,
                    error = %err,
                    "agent request failed"
                );
                frame::error_response(id, &err.to_rpc_error())
            }
        };
        reply(&connection, frame);
    });
}

fn dispatch_notification(connection: &Connection, method: String, params: Value) {
    let Some(session_id) = frame::session_id_of(&params).map(str::to_string) else {
        tracing::debug!(
            connection_id = connection.id(),
            method = %method,
            "dropping notification without sessionId"
        );
        return;
    };
    connection.route_notification(&session_id, &method, params);
}

fn reply(connection: &Connection, frame: Value) {
    if let Err(err) = connection.send(&frame) {
        tracing::debug!(
            connection_id = connection.id(),
            error = %err,
            "could not answer agent request"
        );
    }
}
