use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use remote_acp::{
    ClientConfig, Multiplexer, PermissionMode, SessionConfig, REQUEST_TIMEOUT_ENV,
};
use remote_acp_persona::{
    ExamplePersona, RemotePersona, WorkspaceHandler, DEFAULT_SERVER_URL, SERVER_URL_ENV,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "remote-acp")]
#[command(about = "Chat with a remote ACP agent over WebSocket", version)]
struct Cli {
    /// Remote agent address (ws:// or wss://).
    #[arg(long, env = SERVER_URL_ENV, default_value = DEFAULT_SERVER_URL)]
    url: String,

    /// Working directory announced to the agent and used for file requests.
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long, env = REQUEST_TIMEOUT_ENV)]
    request_timeout_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = PermissionArg::Default)]
    permission_mode: PermissionArg,

    /// Prompt to send. Reads one prompt per line from stdin when omitted.
    prompt: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PermissionArg {
    Default,
    #[value(name = "allow_all")]
    AllowAll,
    #[value(name = "reject_all")]
    RejectAll,
}

impl From<PermissionArg> for PermissionMode {
    fn from(value: PermissionArg) -> Self {
        match value {
            PermissionArg::Default => Self::Default,
            PermissionArg::AllowAll => Self::AllowAll,
            PermissionArg::RejectAll => Self::RejectAll,
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run(Cli::parse()).await {
        tracing::error!(error = %err, "remote-acp failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

async fn run(cli: Cli) -> CliResult {
    let mut config = ClientConfig::from_env();
    if let Some(ms) = cli.request_timeout_ms.filter(|ms| *ms > 0) {
        config.request_timeout = Some(Duration::from_millis(ms));
    }
    let cwd = match cli.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };

    let multiplexer = Multiplexer::new(config);
    let persona = RemotePersona::new(
        multiplexer.clone(),
        cli.url,
        ExamplePersona::defaults(),
        SessionConfig::new(cwd).with_permission_mode(cli.permission_mode.into()),
        Arc::new(WorkspaceHandler::new()),
    )?;

    let result = if cli.prompt.is_empty() {
        run_stdin(&persona).await
    } else {
        run_prompt(&persona, &cli.prompt.join(" ")).await
    };

    persona.shutdown().await;
    multiplexer.shutdown().await;
    result
}

async fn run_stdin(persona: &RemotePersona) -> CliResult {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        run_prompt(persona, &line).await?;
    }
}

async fn run_prompt(persona: &RemotePersona, prompt: &str) -> CliResult {
    let stop_reason = persona
        .stream_message(prompt, |chunk| {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(chunk.as_bytes());
            let _ = stdout.flush();
        })
        .await?;
    println!();
    tracing::info!(stop_reason = %stop_reason, "turn finished");
    Ok(())
}
