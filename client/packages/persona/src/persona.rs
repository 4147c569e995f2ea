use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use remote_acp::{
    AvailableCommand, ClientHandler, EndpointAddress, Multiplexer, Session, SessionConfig,
    SessionUpdate,
};
use remote_acp_error::RemoteAcpError;
use tokio::sync::Mutex;

use crate::config::PersonaDefaults;

/// What the agent said in reply to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaReply {
    pub text: String,
    pub stop_reason: String,
}

/// A chat participant backed by one session on a shared remote connection.
///
/// Personas built from the same [`Multiplexer`] and URL share the connection
/// but each owns its own session.
pub struct RemotePersona {
    defaults: PersonaDefaults,
    mention_name: String,
    remote_url: String,
    multiplexer: Multiplexer,
    session_config: SessionConfig,
    handler: Arc<dyn ClientHandler>,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for RemotePersona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePersona")
            .field("name", &self.defaults.name)
            .field("remote_url", &self.remote_url)
            .finish_non_exhaustive()
    }
}

impl RemotePersona {
    pub fn new(
        multiplexer: Multiplexer,
        remote_url: impl Into<String>,
        defaults: PersonaDefaults,
        session_config: SessionConfig,
        handler: Arc<dyn ClientHandler>,
    ) -> Result<Self, RemoteAcpError> {
        let remote_url = remote_url.into();
        EndpointAddress::parse(&remote_url)?;
        Ok(Self {
            mention_name: defaults.mention_name(),
            defaults,
            remote_url,
            multiplexer,
            session_config,
            handler,
            session: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.defaults.name
    }

    pub fn mention_name(&self) -> &str {
        &self.mention_name
    }

    pub fn defaults(&self) -> &PersonaDefaults {
        &self.defaults
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    /// The persona's session, created on first use and recreated if the
    /// previous one has closed.
    pub async fn session(&self) -> Result<Session, RemoteAcpError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref().filter(|session| !session.is_closed()) {
            return Ok(session.clone());
        }
        if let Some(previous) = slot.take() {
            tracing::info!(
                persona = %self.defaults.name,
                session_id = %previous.id(),
                "previous session closed; creating a new one"
            );
        }

        let connection = self
            .multiplexer
            .get_or_create_connection(&self.remote_url)
            .await?;
        let session = self
            .multiplexer
            .create_session(&connection, self.session_config.clone(), self.handler.clone())
            .await?;
        tracing::info!(
            persona = %self.defaults.name,
            session_id = %session.id(),
            remote_url = %self.remote_url,
            "persona session ready"
        );
        *slot = Some(session.clone());
        Ok(session)
    }

    pub async fn session_id(&self) -> Result<String, RemoteAcpError> {
        Ok(self.session().await?.id().to_string())
    }

    /// Sends a chat message to the agent and collects the streamed reply.
    pub async fn process_message(&self, body: &str) -> Result<PersonaReply, RemoteAcpError> {
        let mut text = String::new();
        let stop_reason = self
            .stream_message(body, |chunk| text.push_str(chunk))
            .await?;
        Ok(PersonaReply { text, stop_reason })
    }

    /// Sends a chat message and hands each reply chunk to `on_chunk` as it
    /// arrives. Returns the stop reason.
    pub async fn stream_message<F>(
        &self,
        body: &str,
        mut on_chunk: F,
    ) -> Result<String, RemoteAcpError>
    where
        F: FnMut(&str) + Send,
    {
        let prompt = strip_mention(body, &self.mention_name);
        if prompt.is_empty() {
            return Err(RemoteAcpError::InvalidParams {
                message: "prompt is empty".to_string(),
            });
        }

        let session = self.session().await?;
        let baseline = session.last_update_sequence();
        let mut updates = session.updates();
        let mut reply_bytes = 0;
        let mut emit = |update: &SessionUpdate| {
            if let Some(chunk) = reply_chunk(baseline, update) {
                reply_bytes += chunk.len();
                on_chunk(chunk);
            }
        };

        let prompt_call = session.prompt(&prompt);
        tokio::pin!(prompt_call);
        let response = loop {
            tokio::select! {
                biased;
                Some(update) = updates.next() => emit(&update),
                response = &mut prompt_call => break response?,
            }
        };
        // Updates already buffered when the response arrived.
        while let Some(Some(update)) = updates.next().now_or_never() {
            emit(&update);
        }

        tracing::debug!(
            persona = %self.defaults.name,
            session_id = %session.id(),
            stop_reason = %response.stop_reason,
            reply_bytes,
            "prompt finished"
        );
        Ok(response.stop_reason)
    }

    /// Slash commands the agent advertised on the current session.
    pub async fn acp_slash_commands(&self) -> Vec<AvailableCommand> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Session::available_commands)
            .unwrap_or_default()
    }

    /// Closes this persona's session. The shared connection stays up.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            tracing::info!(
                persona = %self.defaults.name,
                session_id = %session.id(),
                "closing persona session"
            );
            session.close();
        }
    }
}

fn reply_chunk(baseline: u64, update: &SessionUpdate) -> Option<&str> {
    if update.sequence <= baseline || update.kind() != Some("agent_message_chunk") {
        return None;
    }
    update.text()
}

/// Removes every `@mention` of the persona and trims the rest.
pub fn strip_mention(body: &str, mention_name: &str) -> String {
    if mention_name.is_empty() {
        return body.trim().to_string();
    }
    body.replace(&format!("@{mention_name}"), "").trim().to_string()
}
