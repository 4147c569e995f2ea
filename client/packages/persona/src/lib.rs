//! Chat personas backed by sessions on a remote ACP agent.

pub mod config;
mod example;
mod persona;
mod terminal;
mod workspace;

pub use config::{server_url_from_env, PersonaDefaults, DEFAULT_SERVER_URL, SERVER_URL_ENV};
pub use example::ExamplePersona;
pub use persona::{strip_mention, PersonaReply, RemotePersona};
pub use terminal::TerminalManager;
pub use workspace::WorkspaceHandler;
