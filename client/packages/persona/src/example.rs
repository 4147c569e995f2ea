use std::path::PathBuf;
use std::sync::Arc;

use remote_acp::{Multiplexer, SessionConfig};
use remote_acp_error::RemoteAcpError;

use crate::config::{server_url_from_env, PersonaDefaults};
use crate::persona::RemotePersona;
use crate::workspace::WorkspaceHandler;

/// Ready-made persona pointed at `ACP_SERVER_URL`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExamplePersona;

impl ExamplePersona {
    pub fn defaults() -> PersonaDefaults {
        PersonaDefaults {
            name: "Remote ACP Example".to_string(),
            description: "Example persona that connects to a remote ACP server via WebSocket"
                .to_string(),
            avatar_path: None,
            system_prompt: Some(
                "You are a helpful AI assistant connected via a remote ACP server.".to_string(),
            ),
        }
    }

    pub fn build(
        multiplexer: Multiplexer,
        cwd: impl Into<PathBuf>,
    ) -> Result<RemotePersona, RemoteAcpError> {
        RemotePersona::new(
            multiplexer,
            server_url_from_env(),
            Self::defaults(),
            SessionConfig::new(cwd),
            Arc::new(WorkspaceHandler::new()),
        )
    }
}
