use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const SERVER_URL_ENV: &str = "ACP_SERVER_URL";
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8080/ws";

/// The remote agent address from `ACP_SERVER_URL`, or the local default.
pub fn server_url_from_env() -> String {
    server_url(std::env::var(SERVER_URL_ENV).ok())
}

fn server_url(raw: Option<String>) -> String {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
}

/// How a persona presents itself in chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaDefaults {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl PersonaDefaults {
    /// `@`-handle users type to address the persona: the lowercased name with
    /// runs of non-alphanumerics collapsed to `-`.
    pub fn mention_name(&self) -> String {
        let mut mention = String::with_capacity(self.name.len());
        for ch in self.name.chars() {
            if ch.is_alphanumeric() {
                mention.extend(ch.to_lowercase());
            } else if !mention.is_empty() && !mention.ends_with('-') {
                mention.push('-');
            }
        }
        while mention.ends_with('-') {
            mention.pop();
        }
        mention
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_falls_back_to_default() {
        assert_eq!(server_url(None), DEFAULT_SERVER_URL);
        assert_eq!(server_url(Some("  ".to_string())), DEFAULT_SERVER_URL);
        assert_eq!(
            server_url(Some(" wss://agents.example.com/acp ".to_string())),
            "wss://agents.example.com/acp"
        );
    }

    #[test]
    fn mention_name_is_slugged() {
        let defaults = PersonaDefaults {
            name: "Remote ACP  Example!".to_string(),
            description: String::new(),
            avatar_path: None,
            system_prompt: None,
        };
        assert_eq!(defaults.mention_name(), "remote-acp-example");
    }
}
