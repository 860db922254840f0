/// Configuration for the engine, the caller-side viewport and the server.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid PORT '{0}': expected a number between 0 and 65535")]
    InvalidPort(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries held before capacity eviction kicks in.
    pub max_size: usize,
    /// Extra rows kept on each side of a window, as a fraction of its length.
    pub buffer_multiplier: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: 1000,
            buffer_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub cache: CacheConfig,
    /// Quiet period after the last scroll before a prefetch fires.
    pub prefetch_debounce: Duration,
    /// Rows fetched beyond each edge of the visible window.
    pub prefetch_margin: usize,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        ViewportConfig {
            cache: CacheConfig::default(),
            prefetch_debounce: Duration::from_millis(50),
            prefetch_margin: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for FETCH_DATA requests.
    pub remote_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            remote_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read `HOST` and `PORT`, falling back to the defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::var("HOST").ok(), env::var("PORT").ok())
    }

    fn from_vars(host: Option<String>, port: Option<String>) -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();
        if let Some(host) = host {
            config.host = host;
        }
        if let Some(port) = port {
            config.port = port.trim().parse().map_err(|_| ConfigError::InvalidPort(port))?;
        }
        Ok(config)
    }

    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.max_size, 1000);
        assert_eq!(cache.buffer_multiplier, 0.5);
        assert_eq!(ViewportConfig::default().prefetch_debounce, Duration::from_millis(50));
        assert_eq!(EngineConfig::default().remote_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_server_vars() {
        let config = ServerConfig::from_vars(None, None).unwrap();
        assert_eq!(config.bind_address(), ("127.0.0.1".to_string(), 8080));

        let config = ServerConfig::from_vars(Some("0.0.0.0".into()), Some("9000".into())).unwrap();
        assert_eq!(config.bind_address(), ("0.0.0.0".to_string(), 9000));

        assert_eq!(
            ServerConfig::from_vars(None, Some("http".into())),
            Err(ConfigError::InvalidPort("http".into()))
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CacheConfig = serde_json::from_str(r#"{"max_size": 10}"#).unwrap();
        assert_eq!(config.max_size, 10);
        assert_eq!(config.buffer_multiplier, 0.5);
    }
}
