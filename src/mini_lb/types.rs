use serde::{Deserialize, Serialize};

use super::error::{MiniLbError, Result};

/// Bootstrap port used when none is given on the command line.
pub const DEFAULT_BOOTSTRAP_PORT: u16 = 8998;
/// Per-request ceiling shared by both dispatch legs.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// A prefill server and the port its KV bootstrap server listens on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PrefillConfig {
    pub url: String,
    pub bootstrap_port: u16,
}

impl PrefillConfig {
    pub fn new(url: impl Into<String>, bootstrap_port: u16) -> Self {
        Self {
            url: url.into(),
            bootstrap_port,
        }
    }
}

/// Configuration for the Mini Load Balancer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MiniLbConfig {
    /// Host to bind the load balancer server
    pub host: String,
    /// Port to bind the load balancer server
    pub port: u16,
    /// Prefill servers with their bootstrap ports, in round-robin order
    pub prefill: Vec<PrefillConfig>,
    /// Decode server URLs
    pub decode_urls: Vec<String>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl MiniLbConfig {
    pub fn new(
        host: String,
        port: u16,
        prefill: Vec<PrefillConfig>,
        decode_urls: Vec<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            host,
            port,
            prefill,
            decode_urls,
            timeout_secs,
        }
    }

    /// Build a config from the comma-separated lists accepted on the command line.
    ///
    /// A single bootstrap port is shared by every prefill server; otherwise there
    /// must be exactly one port per prefill URL.
    pub fn from_cli_lists(
        prefill_urls: Vec<String>,
        bootstrap_ports: Vec<u16>,
        decode_urls: Vec<String>,
        host: String,
        port: u16,
    ) -> Result<Self> {
        let ports = match bootstrap_ports.len() {
            0 => vec![DEFAULT_BOOTSTRAP_PORT; prefill_urls.len()],
            1 => vec![bootstrap_ports[0]; prefill_urls.len()],
            n if n == prefill_urls.len() => bootstrap_ports,
            n => {
                return Err(MiniLbError::Configuration(format!(
                    "Number of prefill URLs ({}) must match number of bootstrap ports ({})",
                    prefill_urls.len(),
                    n
                )))
            }
        };

        let prefill = prefill_urls
            .into_iter()
            .zip(ports)
            .map(|(url, port)| PrefillConfig::new(url, port))
            .collect();

        let config = Self::new(host, port, prefill, decode_urls, DEFAULT_TIMEOUT_SECS);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefill.is_empty() {
            return Err(MiniLbError::Configuration(
                "At least one prefill server is required".to_string(),
            ));
        }
        if self.decode_urls.is_empty() {
            return Err(MiniLbError::Configuration(
                "At least one decode server is required".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(MiniLbError::Configuration(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        for url in self
            .prefill
            .iter()
            .map(|p| p.url.as_str())
            .chain(self.decode_urls.iter().map(String::as_str))
        {
            validate_url(url)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<BackendRegistry> {
        self.validate()?;
        BackendRegistry::new(self.prefill.clone(), self.decode_urls.clone())
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| MiniLbError::Configuration(format!("Invalid server URL {}: {}", raw, e)))?;
    if parsed.host_str().is_none() {
        return Err(MiniLbError::Configuration(format!(
            "Server URL {} has no host",
            raw
        )));
    }
    Ok(())
}

/// The two backend pools. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    prefill: Vec<PrefillConfig>,
    decode: Vec<String>,
}

impl BackendRegistry {
    pub fn new(prefill: Vec<PrefillConfig>, decode: Vec<String>) -> Result<Self> {
        if prefill.is_empty() || decode.is_empty() {
            return Err(MiniLbError::Configuration(format!(
                "both pools must be non-empty (prefill={}, decode={})",
                prefill.len(),
                decode.len()
            )));
        }

        let prefill = prefill
            .into_iter()
            .map(|p| PrefillConfig::new(p.url.trim_end_matches('/'), p.bootstrap_port))
            .collect();
        let decode = decode
            .into_iter()
            .map(|url| url.trim_end_matches('/').to_string())
            .collect();

        Ok(Self { prefill, decode })
    }

    pub fn prefill(&self) -> &[PrefillConfig] {
        &self.prefill
    }

    pub fn decode(&self) -> &[String] {
        &self.decode
    }

    /// Every backend URL, prefill pool first, each pool in configured order.
    pub fn all_urls(&self) -> impl Iterator<Item = &str> {
        self.prefill
            .iter()
            .map(|p| p.url.as_str())
            .chain(self.decode.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A pair of prefill and decode servers selected for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPair {
    pub prefill_url: String,
    pub prefill_bootstrap_port: u16,
    pub decode_url: String,
    /// Cursor value this pair was drawn at
    pub prefill_index: usize,
}

impl ServerPair {
    pub fn new(
        prefill_url: String,
        prefill_bootstrap_port: u16,
        decode_url: String,
        prefill_index: usize,
    ) -> Self {
        Self {
            prefill_url,
            prefill_bootstrap_port,
            decode_url,
            prefill_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_bootstrap_port_is_shared() {
        let config = MiniLbConfig::from_cli_lists(
            urls(&["http://p1:30000", "http://p2:30000"]),
            vec![9000],
            urls(&["http://d1:31000"]),
            "0.0.0.0".to_string(),
            8000,
        )
        .unwrap();

        assert_eq!(config.prefill[0].bootstrap_port, 9000);
        assert_eq!(config.prefill[1].bootstrap_port, 9000);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_mismatched_bootstrap_ports_rejected() {
        let err = MiniLbConfig::from_cli_lists(
            urls(&["http://p1:30000", "http://p2:30000", "http://p3:30000"]),
            vec![9000, 9001],
            urls(&["http://d1:31000"]),
            "0.0.0.0".to_string(),
            8000,
        )
        .unwrap_err();

        assert!(matches!(err, MiniLbError::Configuration(_)));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = MiniLbConfig::new(
            "0.0.0.0".to_string(),
            8000,
            vec![PrefillConfig::new("not a url", 8998)],
            urls(&["http://d1:31000"]),
            3600,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registry_orders_prefill_first_and_trims_slashes() {
        let registry = BackendRegistry::new(
            vec![PrefillConfig::new("http://p1:30000/", 8998)],
            urls(&["http://d1:31000", "http://d2:31000/"]),
        )
        .unwrap();

        let all: Vec<&str> = registry.all_urls().collect();
        assert_eq!(
            all,
            vec!["http://p1:30000", "http://d1:31000", "http://d2:31000"]
        );
        assert_eq!(registry.len(), 3);
    }
}
