use std::path::{Path, PathBuf};

use async_trait::async_trait;
use remote_acp::{
    ClientHandler, CreateTerminalRequest, CreateTerminalResponse, ReadTextFileRequest,
    ReadTextFileResponse, SessionContext, SessionUpdate, TerminalExitStatus,
    TerminalOutputResponse, TerminalRequest, WriteTextFileRequest,
};
use remote_acp_error::RemoteAcpError;

use crate::terminal::TerminalManager;

/// Serves agent file and terminal requests against the local filesystem,
/// resolving relative paths against the session's working directory.
#[derive(Debug, Default)]
pub struct WorkspaceHandler {
    terminals: TerminalManager,
}

impl WorkspaceHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

fn resolve(session: &SessionContext<'_>, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        session.config.cwd.join(path)
    }
}

/// Lines `line..line + limit` (1-based, inclusive of line endings).
fn slice_lines(content: &str, line: Option<u32>, limit: Option<u32>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let skip = line.unwrap_or(1).max(1) as usize - 1;
    let take = limit.map(|limit| limit as usize).unwrap_or(usize::MAX);
    content.split_inclusive('\n').skip(skip).take(take).collect()
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> RemoteAcpError {
    RemoteAcpError::HandlerFailed {
        message: format!("failed to {action} {}: {err}", path.display()),
    }
}

#[async_trait]
impl ClientHandler for WorkspaceHandler {
    async fn read_text_file(
        &self,
        session: &SessionContext<'_>,
        request: ReadTextFileRequest,
    ) -> Result<ReadTextFileResponse, RemoteAcpError> {
        let path = resolve(session, &request.path);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| io_error("read", &path, err))?;
        tracing::debug!(
            session_id = session.session_id,
            path = %path.display(),
            bytes = content.len(),
            "agent read file"
        );
        Ok(ReadTextFileResponse {
            content: slice_lines(&content, request.line, request.limit),
        })
    }

    async fn write_text_file(
        &self,
        session: &SessionContext<'_>,
        request: WriteTextFileRequest,
    ) -> Result<(), RemoteAcpError> {
        let path = resolve(session, &request.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error("create", parent, err))?;
        }
        tokio::fs::write(&path, request.content.as_bytes())
            .await
            .map_err(|err| io_error("write", &path, err))?;
        tracing::info!(
            session_id = session.session_id,
            path = %path.display(),
            bytes = request.content.len(),
            "agent wrote file"
        );
        Ok(())
    }

    async fn create_terminal(
        &self,
        session: &SessionContext<'_>,
        request: CreateTerminalRequest,
    ) -> Result<CreateTerminalResponse, RemoteAcpError> {
        let cwd = match &request.cwd {
            Some(cwd) => resolve(session, cwd),
            None => session.config.cwd.clone(),
        };
        let terminal_id = self.terminals.create(session.session_id, cwd, request)?;
        Ok(CreateTerminalResponse { terminal_id })
    }

    async fn terminal_output(
        &self,
        session: &SessionContext<'_>,
        request: TerminalRequest,
    ) -> Result<TerminalOutputResponse, RemoteAcpError> {
        self.terminals.output(session.session_id, &request.terminal_id)
    }

    async fn wait_for_terminal_exit(
        &self,
        session: &SessionContext<'_>,
        request: TerminalRequest,
    ) -> Result<TerminalExitStatus, RemoteAcpError> {
        self.terminals
            .wait_for_exit(session.session_id, &request.terminal_id)
            .await
    }

    async fn kill_terminal(
        &self,
        session: &SessionContext<'_>,
        request: TerminalRequest,
    ) -> Result<(), RemoteAcpError> {
        self.terminals.kill(session.session_id, &request.terminal_id)
    }

    async fn release_terminal(
        &self,
        session: &SessionContext<'_>,
        request: TerminalRequest,
    ) -> Result<(), RemoteAcpError> {
        self.terminals.release(session.session_id, &request.terminal_id)
    }

    fn on_session_update(&self, session_id: &str, update: &SessionUpdate) {
        tracing::trace!(
            session_id,
            sequence = update.sequence,
            kind = update.kind().unwrap_or(update.method.as_str()),
            "session update"
        );
    }

    fn on_session_closed(&self, session_id: &str) {
        self.terminals.release_session(session_id);
    }
}
