//! Network configuration for the socket layer.

use std::time::Duration;

use arena_core::{Config, DEFAULT_PORT};

/// Resolved listen settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Socket worker count requested by the caller.
    pub workers: usize,
    /// Maximum time to wait for an HTTP request to complete.
    pub request_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            workers: 1,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Fills every unset argument from `config`.
    ///
    /// An explicit port of 0 counts as unset, like an absent one.
    #[must_use]
    pub fn resolve(
        config: &Config,
        port: Option<u16>,
        bind_address: Option<String>,
        workers: Option<usize>,
    ) -> Self {
        Self {
            host: bind_address.unwrap_or_else(|| config.bind_address.clone()),
            port: port.filter(|p| *p != 0).unwrap_or(config.port),
            workers: workers.unwrap_or(config.workers).max(1),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn explicit_arguments_win() {
        let resolved = NetworkConfig::resolve(
            &Config::default(),
            Some(9000),
            Some("127.0.0.1".to_string()),
            Some(4),
        );
        assert_eq!(resolved.addr(), "127.0.0.1:9000");
        assert_eq!(resolved.workers, 4);
    }

    #[test]
    fn absent_or_zero_port_falls_back_to_config() {
        let config = Config {
            port: 8080,
            workers: 0,
            ..Config::default()
        };
        assert_eq!(NetworkConfig::resolve(&config, None, None, None).port, 8080);
        assert_eq!(NetworkConfig::resolve(&config, Some(0), None, None).port, 8080);
        assert_eq!(NetworkConfig::resolve(&config, None, None, None).workers, 1);
    }
}
