//! Client-side multiplexer for ACP agents reachable over WebSocket.
//!
//! A [`Multiplexer`] keeps one [`Connection`] per remote address and runs
//! any number of [`Session`]s over it. Responses are routed to their callers
//! by request id, session notifications by `sessionId`, and agent-initiated
//! requests are answered by the session's [`ClientHandler`].

mod address;
mod client;
mod config;
mod connection;
mod dispatch;
pub mod frame;
mod handler;
mod pending;
mod session;
mod transport;

pub use address::{EndpointAddress, Scheme};
pub use client::Multiplexer;
pub use config::{
    ClientCapabilities, ClientConfig, ClientInfo, HANDSHAKE_TIMEOUT_ENV, PROMPT_TIMEOUT_ENV,
    PROTOCOL_VERSION, REQUEST_TIMEOUT_ENV,
};
pub use connection::{AgentInfo, Connection, ConnectionState};
pub use handler::{
    automatic_permission, ClientHandler, CreateTerminalRequest, CreateTerminalResponse,
    EnvVariable, PermissionOption, PermissionOptionKind, PermissionOutcome, ReadTextFileRequest,
    ReadTextFileResponse, RequestPermissionRequest, RequestPermissionResponse, SessionContext,
    TerminalExitStatus, TerminalOutputResponse, TerminalRequest, UnsupportedHandler,
    WriteTextFileRequest,
};
pub use remote_acp_error::{ErrorType, RemoteAcpError, RpcErrorObject};
pub use session::{
    AvailableCommand, PermissionMode, PromptResponse, Session, SessionConfig, SessionState,
    SessionUpdate,
};
pub use transport::{Connector, FrameSink, FrameStream, Transport, WebSocketConnector};
