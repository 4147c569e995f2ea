use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use remote_acp::{CreateTerminalRequest, TerminalExitStatus, TerminalOutputResponse};
use remote_acp_error::RemoteAcpError;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{watch, Notify};

/// Output kept per terminal when the agent does not set a limit.
const DEFAULT_OUTPUT_BYTE_LIMIT: usize = 1024 * 1024;

/// Processes spawned on behalf of agents, keyed by terminal id.
#[derive(Debug, Default)]
pub struct TerminalManager {
    next_id: AtomicU64,
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
}

#[derive(Debug)]
struct Terminal {
    session_id: String,
    output: Mutex<OutputBuffer>,
    exit: watch::Sender<Option<TerminalExitStatus>>,
    kill: Notify,
}

#[derive(Debug)]
struct OutputBuffer {
    text: String,
    truncated: bool,
    limit: usize,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            truncated: false,
            limit,
        }
    }

    /// Appends and then drops from the front until the limit holds, never
    /// splitting a character.
    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.truncated = true;
    }
}

impl TerminalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        session_id: &str,
        cwd: PathBuf,
        request: CreateTerminalRequest,
    ) -> Result<String, RemoteAcpError> {
        let start = Instant::now();
        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for variable in &request.env {
            command.env(&variable.name, &variable.value);
        }

        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                session_id,
                program = %request.command,
                args = ?request.args,
                error = %err,
                "failed to spawn terminal command"
            );
            RemoteAcpError::HandlerFailed {
                message: format!("failed to spawn `{}`: {err}", request.command),
            }
        })?;

        let terminal_id = format!("term-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let limit = request
            .output_byte_limit
            .map(|limit| limit as usize)
            .unwrap_or(DEFAULT_OUTPUT_BYTE_LIMIT);
        let (exit, _) = watch::channel(None);
        let terminal = Arc::new(Terminal {
            session_id: session_id.to_string(),
            output: Mutex::new(OutputBuffer::new(limit)),
            exit,
            kill: Notify::new(),
        });

        let readers = [
            child.stdout.take().map(|stdout| spawn_reader(terminal.clone(), stdout)),
            child.stderr.take().map(|stderr| spawn_reader(terminal.clone(), stderr)),
        ];

        let watcher = terminal.clone();
        let watched_id = terminal_id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = watcher.kill.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // Let the readers hit EOF so output is complete before exit is
            // observable.
            for reader in readers.into_iter().flatten() {
                let _ = reader.await;
            }
            let exit_status = match status {
                Ok(status) => exit_status(status),
                Err(err) => {
                    tracing::warn!(terminal_id = %watched_id, error = %err, "wait failed");
                    TerminalExitStatus::default()
                }
            };
            tracing::info!(
                terminal_id = %watched_id,
                exit_code = ?exit_status.exit_code,
                signal = ?exit_status.signal,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "terminal exited"
            );
            watcher.exit.send_replace(Some(exit_status));
        });

        tracing::info!(
            session_id,
            terminal_id = %terminal_id,
            program = %request.command,
            cwd = %cwd.display(),
            "terminal started"
        );
        lock(&self.terminals).insert(terminal_id.clone(), terminal);
        Ok(terminal_id)
    }

    pub fn output(
        &self,
        session_id: &str,
        terminal_id: &str,
    ) -> Result<TerminalOutputResponse, RemoteAcpError> {
        let terminal = self.get(session_id, terminal_id)?;
        let output = lock(&terminal.output);
        let response = TerminalOutputResponse {
            output: output.text.clone(),
            truncated: output.truncated,
            exit_status: terminal.exit.borrow().clone(),
        };
        Ok(response)
    }

    pub async fn wait_for_exit(
        &self,
        session_id: &str,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus, RemoteAcpError> {
        let terminal = self.get(session_id, terminal_id)?;
        let mut exit = terminal.exit.subscribe();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RemoteAcpError::HandlerFailed {
                message: format!("terminal {terminal_id} went away"),
            })?
            .clone();
        Ok(status.unwrap_or_default())
    }

    pub fn kill(&self, session_id: &str, terminal_id: &str) -> Result<(), RemoteAcpError> {
        let terminal = self.get(session_id, terminal_id)?;
        terminal.kill.notify_one();
        Ok(())
    }

    /// Kills the process if it still runs and forgets the terminal.
    pub fn release(&self, session_id: &str, terminal_id: &str) -> Result<(), RemoteAcpError> {
        let terminal = self.get(session_id, terminal_id)?;
        lock(&self.terminals).remove(terminal_id);
        if terminal.exit.borrow().is_none() {
            terminal.kill.notify_one();
        }
        tracing::debug!(session_id, terminal_id, "terminal released");
        Ok(())
    }

    /// Releases every terminal owned by `session_id`.
    pub fn release_session(&self, session_id: &str) {
        let released = {
            let mut terminals = lock(&self.terminals);
            let ids = terminals
                .iter()
                .filter(|(_, terminal)| terminal.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| terminals.remove(&id))
                .collect::<Vec<_>>()
        };
        for terminal in released {
            terminal.kill.notify_one();
        }
    }

    fn get(&self, session_id: &str, terminal_id: &str) -> Result<Arc<Terminal>, RemoteAcpError> {
        lock(&self.terminals)
            .get(terminal_id)
            .filter(|terminal| terminal.session_id == session_id)
            .cloned()
            .ok_or_else(|| RemoteAcpError::InvalidParams {
                message: format!("unknown terminal {terminal_id}"),
            })
    }
}

fn spawn_reader<R>(terminal: Arc<Terminal>, mut pipe: R) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = [0u8; 4096];
        loop {
            match pipe.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let chunk = String::from_utf8_lossy(&buffer[..read]);
                    lock(&terminal.output).push(&chunk);
                }
            }
        }
    })
}

#[cfg(unix)]
fn exit_status(status: std::process::ExitStatus) -> TerminalExitStatus {
    use std::os::unix::process::ExitStatusExt;
    TerminalExitStatus {
        exit_code: status.code(),
        signal: status.signal().map(|signal| signal.to_string()),
    }
}

#[cfg(not(unix))]
fn exit_status(status: std::process::ExitStatus) -> TerminalExitStatus {
    TerminalExitStatus {
        exit_code: status.code(),
        signal: None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
