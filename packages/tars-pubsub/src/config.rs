use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::codec::DEFAULT_CONTENT_TYPE;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Content type used when a publish names none and an inbound
    /// envelope carries none.
    pub default_content_type: String,
    /// Routing target that replaces the exchange of every publish.
    pub proxy: Option<String>,
    /// Upper bound on waiting for in-flight handlers at shutdown.
    pub shutdown_timeout: Duration,
    /// Broker endpoints, forwarded to `Broker::init`.
    pub broker_addrs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_content_type: DEFAULT_CONTENT_TYPE.to_string(),
            proxy: None,
            shutdown_timeout: Duration::from_secs(30),
            broker_addrs: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            default_content_type: var("TARS_DEFAULT_CONTENT_TYPE")
                .unwrap_or(defaults.default_content_type),
            proxy: var("TARS_PROXY"),
            shutdown_timeout: match var("TARS_SHUTDOWN_TIMEOUT_SECS") {
                Some(secs) => Duration::from_secs(
                    secs.trim()
                        .parse()
                        .context("TARS_SHUTDOWN_TIMEOUT_SECS must be a valid number")?,
                ),
                None => defaults.shutdown_timeout,
            },
            broker_addrs: var("TARS_BROKER_ADDRS")
                .map(|addrs| {
                    addrs
                        .split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.default_content_type, "application/octet-stream");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_reads_all_variables() {
        let config = load(&[
            ("TARS_DEFAULT_CONTENT_TYPE", "application/json"),
            ("TARS_PROXY", "gateway"),
            ("TARS_SHUTDOWN_TIMEOUT_SECS", "5"),
            ("TARS_BROKER_ADDRS", "redis://a:6379, redis://b:6379,"),
        ])
        .unwrap();

        assert_eq!(config.default_content_type, "application/json");
        assert_eq!(config.proxy.as_deref(), Some("gateway"));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(
            config.broker_addrs,
            vec!["redis://a:6379".to_string(), "redis://b:6379".to_string()]
        );
    }

    #[test]
    fn test_blank_proxy_is_unset() {
        let config = load(&[("TARS_PROXY", "  ")]).unwrap();
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_invalid_timeout() {
        let err = load(&[("TARS_SHUTDOWN_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("TARS_SHUTDOWN_TIMEOUT_SECS"));
    }
}
