//! Configuration for the AIM daemon.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    pub listen_addr: SocketAddr,

    /// Per-request deadline in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// CORS allowlist; empty means same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Public-endpoint rate limit: requests per minute per caller.
    #[serde(default = "default_rate_limit")]
    pub public_rate_limit_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8420".parse().expect("static addr parses"),
            request_timeout_secs: 10,
            cors_origins: vec![],
            public_rate_limit_per_minute: 120,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (development and tests).
    Memory,

    /// PostgreSQL storage.
    Postgres {
        url: String,

        #[serde(default = "default_pool_size")]
        max_connections: u32,

        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for user JWTs and SDK refresh tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Grace window after an agent key rotation, hours.
    #[serde(default = "default_rotation_grace")]
    pub rotation_grace_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_jwt_secret(),
            rotation_grace_hours: default_rotation_grace(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn default_request_timeout() -> u64 {
    10
}

fn default_rate_limit() -> u32 {
    120
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_jwt_secret() -> String {
    // Dev-only default; production deployments set AIM_AUTH_JWT_SECRET.
    "aim-dev-secret".to_string()
}

fn default_rotation_grace() -> i64 {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then an optional file, then `AIM_`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("AIM")
                .separator("_")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.request_timeout_secs, 10);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.auth.rotation_grace_hours, 24);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
