use std::fmt;

use remote_acp_error::RemoteAcpError;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `ws://`
    Plain,
    /// `wss://`
    Tls,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "ws",
            Self::Tls => "wss",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Plain => 80,
            Self::Tls => 443,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "ws" => Some(Self::Plain),
            "wss" => Some(Self::Tls),
            _ => None,
        }
    }
}

/// A validated remote agent address.
///
/// Two addresses that differ only in host case or in an explicit default
/// port share the same [`EndpointAddress::key`], and therefore the same
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
    url: Url,
}

impl EndpointAddress {
    pub fn parse(raw: &str) -> Result<Self, RemoteAcpError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "address cannot be empty"));
        }

        let url = Url::parse(trimmed).map_err(|err| invalid(raw, &err.to_string()))?;
        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
            invalid(
                raw,
                &format!("unsupported scheme '{}'; expected ws or wss", url.scheme()),
            )
        })?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid(raw, "missing host"))?
            .to_ascii_lowercase();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        let path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };
        let query = url.query().map(ToString::to_string);

        Ok(Self {
            scheme,
            host,
            port,
            path,
            query,
            url,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_encrypted(&self) -> bool {
        self.scheme == Scheme::Tls
    }

    /// Canonical form used to key the connection registry.
    pub fn key(&self) -> String {
        let mut key = format!(
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.path
        );
        if let Some(query) = &self.query {
            key.push('?');
            key.push_str(query);
        }
        key
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn invalid(address: &str, reason: &str) -> RemoteAcpError {
    RemoteAcpError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_acp_error::ErrorType;

    #[test]
    fn accepts_both_websocket_schemes() {
        let plain = EndpointAddress::parse("ws://localhost:8080/ws").expect("ws");
        assert_eq!(plain.scheme(), Scheme::Plain);
        assert_eq!(plain.host(), "localhost");
        assert_eq!(plain.port(), 8080);
        assert_eq!(plain.path(), "/ws");
        assert!(!plain.is_encrypted());

        let tls = EndpointAddress::parse("wss://agents.example.com/acp").expect("wss");
        assert_eq!(tls.scheme(), Scheme::Tls);
        assert_eq!(tls.port(), 443);
        assert!(tls.is_encrypted());
    }

    #[test]
    fn rejects_other_schemes() {
        let err = EndpointAddress::parse("http://host:1/ws").expect_err("http must fail");
        assert_eq!(err.error_type(), ErrorType::InvalidAddress);
        assert!(err.to_string().contains("unsupported scheme 'http'"));
    }

    #[test]
    fn rejects_empty_and_malformed() {
        for raw in ["", "   ", "not a url", "ws://"] {
            let err = EndpointAddress::parse(raw).expect_err(raw);
            assert_eq!(err.error_type(), ErrorType::InvalidAddress, "{raw}");
        }
    }

    #[test]
    fn key_normalizes_case_and_default_port() {
        let a = EndpointAddress::parse("ws://LocalHost/ws").expect("a");
        let b = EndpointAddress::parse("ws://localhost:80/ws").expect("b");
        assert_eq!(a.key(), "ws://localhost:80/ws");
        assert_eq!(a.key(), b.key());

        let c = EndpointAddress::parse("ws://localhost:80/ws?token=1").expect("c");
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn empty_path_defaults_to_root() {
        let address = EndpointAddress::parse("ws://localhost:9000").expect("parse");
        assert_eq!(address.path(), "/");
    }
}
