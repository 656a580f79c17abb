//! Coordinator configuration.
//!
//! Configuration is loaded from environment variables. Sensitive fields are
//! redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use secrecy::SecretString;
use thiserror::Error;

/// Default bind address for the combined HTTP/WebSocket server.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3001";

/// Default directory-store file path.
pub const DEFAULT_DATA_PATH: &str = "data.json";

/// Default session token lifetime in seconds (24h).
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 86_400;

/// Coordinator configuration.
///
/// Loaded from environment variables with sensible defaults; only the JWT
/// secret is required.
#[derive(Clone)]
pub struct Config {
    /// Bind address for signaling, REST and health (default: "0.0.0.0:3001").
    pub bind_address: String,

    /// Path to the JSON directory-store file (default: "data.json").
    pub data_path: PathBuf,

    /// Base URL of the SFU sidecar. When unset, the in-memory engine is
    /// used (local development only).
    pub sfu_url: Option<String>,

    /// Session token lifetime in seconds (default: 86400).
    pub token_ttl_seconds: u64,

    /// HMAC secret for session tokens.
    /// Protected by `SecretString` to prevent accidental logging.
    pub jwt_secret: SecretString,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("data_path", &self.data_path)
            .field("sfu_url", &self.sfu_url)
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("jwt_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = SecretString::from(
            vars.get("PTT_JWT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("PTT_JWT_SECRET".to_string()))?
                .clone(),
        );

        let bind_address = vars
            .get("PTT_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let data_path = vars
            .get("PTT_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_PATH));

        let sfu_url = vars.get("PTT_SFU_URL").cloned().filter(|s| !s.is_empty());

        let token_ttl_seconds = match vars.get("PTT_TOKEN_TTL_SECONDS") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("PTT_TOKEN_TTL_SECONDS: {raw}"))
            })?,
            None => DEFAULT_TOKEN_TTL_SECONDS,
        };

        Ok(Config {
            bind_address,
            data_path,
            sfu_url,
            token_ttl_seconds,
            jwt_secret,
        })
    }
}
