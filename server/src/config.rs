//! Server configuration module.
//!
//! Parses configuration from environment variables for the Chatter server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 5050 | HTTP server port |
//! | `CHATTER_HOST` | No | 0.0.0.0 | Address to bind |
//! | `CHATTER_QUEUE_CAPACITY` | No | 16 | Outbound queue slots per connection |
//! | `CHATTER_HUB_CAPACITY` | No | 64 | Hub command channel capacity |
//! | `CHATTER_HISTORY_CAPACITY` | No | 500 | Messages kept for `/messages`; `0` disables history |
//! | `CHATTER_AVATAR_DIR` | No | ./images/128x128 | Avatar images served under `/images` |
//! | `CHATTER_IDENTITY_PUBLIC_KEY` | Yes* | - | Base64 Ed25519 key verifying identity tokens |
//! | `CHATTER_UNSAFE_NO_AUTH` | No | false | Accept everyone as a guest (dev only) |
//! | `CHATTER_CORS_ORIGINS` | No | any | Comma-separated allowed origins |
//!
//! *Not required if `CHATTER_UNSAFE_NO_AUTH=true`

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::auth::TokenAuthenticator;
use crate::hub::DEFAULT_HUB_CAPACITY;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::store::DEFAULT_HISTORY_CAPACITY;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 5050;

/// Default directory holding avatar images.
const DEFAULT_AVATAR_DIR: &str = "./images/128x128";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Address to bind.
    pub host: IpAddr,

    /// Capacity of each connection's outbound queue.
    pub queue_capacity: usize,

    /// Capacity of the hub's command channel.
    pub hub_capacity: usize,

    /// Messages retained in history. `0` disables persistence.
    pub history_capacity: usize,

    /// Directory of avatar images, also the source of the guest roster.
    pub avatar_dir: PathBuf,

    /// Base64-encoded Ed25519 public key for identity tokens.
    pub identity_public_key: Option<String>,

    /// When true, every connection is accepted as a guest (development only).
    pub unsafe_no_auth: bool,

    /// Allowed CORS origins. Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            hub_capacity: DEFAULT_HUB_CAPACITY,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            avatar_dir: PathBuf::from(DEFAULT_AVATAR_DIR),
            identity_public_key: None,
            unsafe_no_auth: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `CHATTER_IDENTITY_PUBLIC_KEY` is missing or not a valid key (when
    ///   `CHATTER_UNSAFE_NO_AUTH` is not true)
    /// - Environment variables have invalid format
    /// - A capacity is zero
    ///
    /// # Example
    ///
    /// ```no_run
    /// use chatter_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on {}", config.socket_addr());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            host: parse_host()?,
            queue_capacity: parse_usize_env("CHATTER_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            hub_capacity: parse_usize_env("CHATTER_HUB_CAPACITY", DEFAULT_HUB_CAPACITY)?,
            history_capacity: parse_usize_env(
                "CHATTER_HISTORY_CAPACITY",
                DEFAULT_HISTORY_CAPACITY,
            )?,
            avatar_dir: env::var("CHATTER_AVATAR_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AVATAR_DIR)),
            identity_public_key: env::var("CHATTER_IDENTITY_PUBLIC_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            unsafe_no_auth: parse_bool_env("CHATTER_UNSAFE_NO_AUTH"),
            cors_origins: parse_list_env("CHATTER_CORS_ORIGINS"),
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "CHATTER_UNSAFE_NO_AUTH is enabled - every connection is accepted as a guest. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Address the server binds to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Returns `true` if chat history is kept.
    pub fn persistence_enabled(&self) -> bool {
        self.history_capacity > 0
    }

    /// Validate the configuration.
    ///
    /// Capacities must be non-zero, and unless `unsafe_no_auth` is set, a
    /// decodable identity public key is required.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "CHATTER_QUEUE_CAPACITY must be greater than zero".to_string(),
            ));
        }

        if self.hub_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "CHATTER_HUB_CAPACITY must be greater than zero".to_string(),
            ));
        }

        if self.unsafe_no_auth {
            return Ok(());
        }

        let Some(key) = &self.identity_public_key else {
            return Err(ConfigError::MissingEnvVar(
                "CHATTER_IDENTITY_PUBLIC_KEY".to_string(),
            ));
        };

        TokenAuthenticator::from_base64(key).map_err(|err| ConfigError::InvalidFormat {
            var: "CHATTER_IDENTITY_PUBLIC_KEY".to_string(),
            message: err.to_string(),
        })?;

        Ok(())
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the CHATTER_HOST environment variable as an IP address.
fn parse_host() -> Result<IpAddr, ConfigError> {
    match env::var("CHATTER_HOST") {
        Ok(host) if !host.trim().is_empty() => {
            host.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidFormat {
                    var: "CHATTER_HOST".to_string(),
                    message: format!("expected an IP address, got '{}'", host),
                })
        }
        _ => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
    }
}

/// Parse a non-negative integer environment variable, falling back to
/// `default` when unset.
fn parse_usize_env(name: &str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidFormat {
                    var: name.to_string(),
                    message: format!("expected a non-negative integer, got '{}'", value),
                })
        }
        _ => Ok(default),
    }
}

/// Parse a comma-separated list, skipping empty entries.
fn parse_list_env(name: &str) -> Vec<String> {
    env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
