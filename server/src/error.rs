//! Error types for the Chatter server.
//!
//! Request-level failures are handled close to where they happen: the hub
//! sheds slow connections, authentication failures become `401` responses.
//! [`ServerError`] covers what is left, the failures that stop the server
//! from starting or serving at all.
//!
//! # Error Types
//!
//! - [`ConfigError`](crate::config::ConfigError) - Missing or invalid environment variables
//! - [`AuthError`](crate::auth::AuthError) - Authenticator could not be built
//! - [`HubError`](crate::hub::HubError) - The hub task has stopped
//! - [`ServerError`] - Top-level server errors encompassing all startup failure modes
//!
//! # Example
//!
//! ```rust
//! use chatter_server::error::ServerError;
//!
//! let err = ServerError::bind("0.0.0.0:80", std::io::Error::other("permission denied"));
//! assert_eq!(
//!     err.to_string(),
//!     "failed to bind 0.0.0.0:80: permission denied"
//! );
//! ```

use std::error::Error;
use std::fmt;
use std::io;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::hub::HubError;

/// Top-level error type for the Chatter server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// The configured authenticator could not be constructed.
    Auth(AuthError),

    /// The listening socket could not be bound.
    Bind {
        /// The address that was requested.
        addr: String,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The HTTP server stopped with an I/O error.
    Serve(io::Error),

    /// The hub task is not running.
    Hub(HubError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(err) => write!(f, "authentication setup failed: {err}"),
            Self::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            Self::Serve(err) => write!(f, "server error: {err}"),
            Self::Hub(err) => write!(f, "hub error: {err}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Auth(err) => Some(err),
            Self::Bind { source, .. } => Some(source),
            Self::Serve(err) => Some(err),
            Self::Hub(err) => Some(err),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        Self::Hub(err)
    }
}

impl ServerError {
    /// Creates a new bind error.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address the server tried to listen on
    /// * `source` - The I/O error returned by the bind
    pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    /// Creates a new serve error.
    pub fn serve(source: io::Error) -> Self {
        Self::Serve(source)
    }

    /// Returns `true` if the error was caused by bad configuration rather
    /// than the environment the server runs in.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chatter_server::config::ConfigError;
    /// use chatter_server::error::ServerError;
    ///
    /// let err = ServerError::from(ConfigError::MissingEnvVar("PORT".into()));
    /// assert!(err.is_config_error());
    /// ```
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ServerError::from(ConfigError::MissingEnvVar(
            "CHATTER_IDENTITY_PUBLIC_KEY".to_string(),
        ));
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: CHATTER_IDENTITY_PUBLIC_KEY"
        );
    }

    #[test]
    fn test_auth_error_display() {
        let err = ServerError::from(AuthError::InvalidPublicKey);
        assert_eq!(
            err.to_string(),
            "authentication setup failed: invalid public key format"
        );
    }

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::bind(
            "127.0.0.1:5050",
            io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        );
        assert_eq!(
            err.to_string(),
            "failed to bind 127.0.0.1:5050: address in use"
        );
    }

    #[test]
    fn test_serve_error_display() {
        let err = ServerError::serve(io::Error::other("connection aborted"));
        assert_eq!(err.to_string(), "server error: connection aborted");
    }

    #[test]
    fn test_hub_error_display() {
        let err = ServerError::from(HubError::Closed);
        assert_eq!(err.to_string(), "hub error: hub is not running");
        assert!(!err.is_config_error());
    }

    #[test]
    fn test_error_source_chain() {
        let err = ServerError::from(ConfigError::ValidationError("bad".to_string()));
        let source = err.source().expect("config error has a source");
        assert_eq!(source.to_string(), "configuration validation failed: bad");

        let err = ServerError::bind("x", io::Error::other("nope"));
        assert_eq!(err.source().unwrap().to_string(), "nope");
    }

    #[test]
    fn test_is_config_error() {
        assert!(ServerError::from(ConfigError::MissingEnvVar("X".into())).is_config_error());
        assert!(ServerError::from(AuthError::InvalidPublicKey).is_config_error());
        assert!(!ServerError::serve(io::Error::other("x")).is_config_error());
    }

    #[test]
    fn test_server_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServerError>();
    }
}
