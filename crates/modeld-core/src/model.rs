//! Entity, resident-handle and endpoint type definitions

use serde::{Deserialize, Serialize};

use crate::{ModeldError, ModeldResult};

/// Maximum length of an entity name
pub const MAX_ENTITY_NAME_LEN: usize = 255;

/// Check that `name` can be used as an entity key.
///
/// Names become directory names under the checkpoint root, so separators,
/// relative components and control characters are refused.
pub fn validate_entity_name(name: &str) -> ModeldResult<()> {
    if name.is_empty() {
        return Err(ModeldError::InvalidRequest(
            "entity name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_ENTITY_NAME_LEN {
        return Err(ModeldError::InvalidRequest(format!(
            "entity name longer than {} bytes",
            MAX_ENTITY_NAME_LEN
        )));
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(ModeldError::InvalidRequest(format!(
            "entity name '{}' may not start with '.'",
            name
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
    {
        return Err(ModeldError::InvalidRequest(format!(
            "entity name '{}' contains a path separator or control character",
            name
        )));
    }
    Ok(())
}

/// An in-memory model handle the resident cache can write back.
///
/// `encode` produces the snapshot bytes handed to the snapshot store.
pub trait Resident: Send + Sync + 'static {
    fn encode(&self) -> ModeldResult<Vec<u8>>;
}

/// Network endpoint of a worker process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Whether TLS is enabled
    pub tls: bool,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            tls: false,
        }
    }

    /// Parse `http://host:port` / `https://host:port` / `host:port`
    pub fn parse(url: &str) -> ModeldResult<Self> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            (false, url)
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ModeldError::InvalidRequest(format!("missing port in '{}'", url)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ModeldError::InvalidRequest(format!("invalid port in '{}'", url)))?;
        if host.is_empty() {
            return Err(ModeldError::InvalidRequest(format!(
                "missing host in '{}'",
                url
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }

    /// Get the URL for this endpoint
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_entity_names() {
        assert!(validate_entity_name("cpu").is_ok());
        assert!(validate_entity_name("host-01.cpu_load").is_ok());
        assert!(validate_entity_name("温度").is_ok());
    }

    #[test]
    fn test_invalid_entity_names() {
        for name in ["", ".", "..", ".hidden", "a/b", "a\\b", "a\0b", "a\nb"] {
            let err = validate_entity_name(name).unwrap_err();
            assert!(matches!(err, ModeldError::InvalidRequest(_)), "{:?}", name);
        }
        let long = "x".repeat(MAX_ENTITY_NAME_LEN + 1);
        assert!(validate_entity_name(&long).is_err());
    }

    #[test]
    fn test_endpoint_url() {
        let endpoint = Endpoint::new("127.0.0.1".to_string(), 30000);
        assert_eq!(endpoint.url(), "http://127.0.0.1:30000");

        let tls_endpoint = Endpoint {
            host: "localhost".to_string(),
            port: 443,
            tls: true,
        };
        assert_eq!(tls_endpoint.url(), "https://localhost:443");
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("http://10.0.0.2:9090/").unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.2".to_string(), 9090));

        let ep = Endpoint::parse("https://worker:443").unwrap();
        assert!(ep.tls);

        let ep = Endpoint::parse("worker-3:9091").unwrap();
        assert_eq!(ep.url(), "http://worker-3:9091");

        assert!(Endpoint::parse("http://worker").is_err());
        assert!(Endpoint::parse("http://:80").is_err());
    }
}
