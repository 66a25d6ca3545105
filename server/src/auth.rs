//! Connection authentication.
//!
//! The hub performs no authentication itself. Before a WebSocket is upgraded,
//! an [`Authenticator`] resolves the request to an [`Identity`], which the
//! connection carries unchanged for its whole life.
//!
//! Two authenticators are provided:
//!
//! - [`TokenAuthenticator`] verifies an Ed25519-signed identity token issued
//!   by the login service.
//! - [`GuestAuthenticator`] (development only) accepts everyone and hands out
//!   a name and avatar from a [`Roster`].
//!
//! # Token Format
//!
//! ```text
//! base64url(claims JSON) "." base64url(Ed25519 signature over the first segment)
//! ```
//!
//! Both segments use the URL-safe alphabet without padding. Claims:
//!
//! ```json
//! { "id": "u-42", "name": "Ada", "avatar": "https://…/ada.png", "exp": 1767225600 }
//! ```
//!
//! # Example
//!
//! ```rust
//! use chatter_server::auth::{encode_token, Authenticator, ConnectRequest, IdentityClaims, TokenAuthenticator};
//! use ed25519_dalek::SigningKey;
//!
//! let signing_key = SigningKey::from_bytes(&[7u8; 32]);
//! let auth = TokenAuthenticator::new(signing_key.verifying_key());
//!
//! let claims = IdentityClaims {
//!     id: "u-42".to_string(),
//!     name: "Ada".to_string(),
//!     avatar: String::new(),
//!     exp: i64::MAX,
//! };
//! let request = ConnectRequest::with_token(encode_token(&signing_key, &claims));
//!
//! let identity = auth.authenticate(&request).unwrap();
//! assert_eq!(identity.name, "Ada");
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::Identity;

/// Names handed out when no avatar directory is available.
const BUILTIN_ROSTER: &[&str] = &[
    "Arctic Fox",
    "Barn Owl",
    "Capybara",
    "Dingo",
    "Emu",
    "Fennec",
    "Gecko",
    "Heron",
    "Ibis",
    "Jackal",
];

/// Errors that can occur while resolving a connection's identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied.
    #[error("missing identity token")]
    MissingToken,

    /// The token is not two `.`-separated segments.
    #[error("malformed identity token")]
    MalformedToken,

    /// Base64 decoding failed for the named part.
    #[error("invalid base64 encoding for {0}")]
    InvalidBase64(String),

    /// The signature did not verify against the configured key.
    #[error("invalid signature")]
    InvalidSignature,

    /// The signed claims are not a valid identity.
    #[error("invalid identity claims: {0}")]
    InvalidClaims(String),

    /// The token's `exp` is in the past.
    #[error("identity token expired")]
    Expired,

    /// The configured public key is not a valid Ed25519 key.
    #[error("invalid public key format")]
    InvalidPublicKey,
}

impl AuthError {
    /// Creates an error for invalid base64 encoding.
    pub fn invalid_base64(field: impl Into<String>) -> Self {
        Self::InvalidBase64(field.into())
    }

    /// Short machine-readable code for HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedToken | Self::InvalidBase64(_) => "invalid_token",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidClaims(_) => "invalid_claims",
            Self::Expired => "token_expired",
            Self::InvalidPublicKey => "server_error",
        }
    }

    /// Returns `true` if the failure lies with the server's configuration
    /// rather than the client's credentials.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::InvalidPublicKey)
    }
}

/// What an authenticator gets to see of an inbound connection request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The `token` query parameter, if present and non-empty.
    pub token: Option<String>,
}

impl ConnectRequest {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }
}

/// Resolves an inbound connection request to a stable identity.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, request: &ConnectRequest) -> Result<Identity, AuthError>;
}

// ============================================================================
// Signed identity tokens
// ============================================================================

/// Claims carried by an identity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    /// Expiry, in seconds since the Unix epoch.
    pub exp: i64,
}

/// Verifies identity tokens signed by the login service.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    key: VerifyingKey,
}

impl TokenAuthenticator {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Builds an authenticator from a base64-encoded (standard alphabet)
    /// Ed25519 public key.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidBase64`] or [`AuthError::InvalidPublicKey`]
    /// if the key cannot be decoded.
    pub fn from_base64(public_key: &str) -> Result<Self, AuthError> {
        let bytes = STANDARD
            .decode(public_key.trim())
            .map_err(|_| AuthError::invalid_base64("public_key"))?;

        let array: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| AuthError::InvalidPublicKey)?;

        let key = VerifyingKey::from_bytes(&array).map_err(|_| AuthError::InvalidPublicKey)?;
        Ok(Self::new(key))
    }

    /// Verifies `token` as of `now` and returns the identity it names.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Identity, AuthError> {
        let (claims_segment, signature_segment) =
            token.split_once('.').ok_or(AuthError::MalformedToken)?;
        if claims_segment.is_empty() || signature_segment.is_empty() {
            return Err(AuthError::MalformedToken);
        }

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_segment)
            .map_err(|_| AuthError::invalid_base64("signature"))?;
        let signature_array: [u8; SIGNATURE_LENGTH] = signature_bytes
            .try_into()
            .map_err(|_| AuthError::InvalidSignature)?;
        let signature = Signature::from_bytes(&signature_array);

        self.key
            .verify_strict(claims_segment.as_bytes(), &signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_segment)
            .map_err(|_| AuthError::invalid_base64("claims"))?;
        let claims: IdentityClaims = serde_json::from_slice(&claims_json)
            .map_err(|err| AuthError::InvalidClaims(err.to_string()))?;

        if claims.id.trim().is_empty() {
            return Err(AuthError::InvalidClaims("id cannot be empty".to_string()));
        }
        if claims.exp <= now.timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(Identity::new(claims.id, claims.name, claims.avatar))
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, request: &ConnectRequest) -> Result<Identity, AuthError> {
        let token = request.token.as_deref().ok_or(AuthError::MissingToken)?;
        self.verify(token, Utc::now())
    }
}

/// Signs `claims` into an identity token.
///
/// The server only verifies tokens; this is the counterpart used by the
/// login service and by tests.
pub fn encode_token(key: &SigningKey, claims: &IdentityClaims) -> String {
    // Serializing a struct of strings and an integer cannot fail.
    let json = serde_json::to_vec(claims).unwrap_or_default();
    let claims_segment = URL_SAFE_NO_PAD.encode(json);
    let signature = key.sign(claims_segment.as_bytes());
    format!(
        "{claims_segment}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}

// ============================================================================
// Guest roster
// ============================================================================

/// A fixed list of `(name, avatar)` pairs handed out to guests in turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<(String, String)>,
}

impl Roster {
    /// Creates a roster, or `None` if `entries` is empty.
    pub fn new(entries: Vec<(String, String)>) -> Option<Self> {
        if entries.is_empty() {
            None
        } else {
            Some(Self { entries })
        }
    }

    /// The roster used when no avatar directory is available.
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_ROSTER
                .iter()
                .map(|name| (name.to_string(), String::new()))
                .collect(),
        }
    }

    /// Builds a roster from the image files in `dir`.
    ///
    /// Every file except `system.*` becomes one entry: `grumpy_cat.png`
    /// yields the name `Grumpy Cat` and the avatar `/images/grumpy_cat.png`.
    /// Entries are sorted by file name. Returns `Ok(None)` if the directory
    /// holds no usable files.
    pub fn from_dir(dir: &Path) -> io::Result<Option<Self>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let stem = file_name.split('.').next().unwrap_or_default();
            if stem.is_empty() || stem == "system" {
                continue;
            }
            files.push(file_name);
        }
        files.sort();

        let entries = files
            .into_iter()
            .map(|file_name| {
                let stem = file_name.split('.').next().unwrap_or_default();
                (display_name(stem), format!("/images/{file_name}"))
            })
            .collect();
        Ok(Self::new(entries))
    }

    /// Loads the roster from `dir`, shuffled, falling back to
    /// [`Roster::builtin`] if the directory is unreadable or empty.
    pub fn load(dir: &Path) -> Self {
        match Self::from_dir(dir) {
            Ok(Some(roster)) => {
                debug!(dir = %dir.display(), entries = roster.len(), "Loaded guest roster");
                roster.shuffled()
            }
            Ok(None) => {
                warn!(dir = %dir.display(), "No avatars found, using built-in roster");
                Self::builtin()
            }
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Failed to list avatars, using built-in roster");
                Self::builtin()
            }
        }
    }

    /// Returns the roster in random order.
    #[must_use]
    pub fn shuffled(mut self) -> Self {
        self.entries.shuffle(&mut rand::rng());
        self
    }

    /// The `(name, avatar)` pair for the `sequence`-th guest.
    pub fn assign(&self, sequence: usize) -> (&str, &str) {
        let (name, avatar) = &self.entries[sequence % self.entries.len()];
        (name, avatar)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `grumpy_cat` -> `Grumpy Cat`.
fn display_name(stem: &str) -> String {
    stem.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accepts every connection as a guest with a fresh id.
///
/// Development only: it trusts nothing and verifies nothing.
#[derive(Debug)]
pub struct GuestAuthenticator {
    roster: Roster,
    sequence: AtomicUsize,
}

impl GuestAuthenticator {
    pub fn new(roster: Roster) -> Self {
        Self {
            roster,
            sequence: AtomicUsize::new(0),
        }
    }
}

impl Authenticator for GuestAuthenticator {
    fn authenticate(&self, _request: &ConnectRequest) -> Result<Identity, AuthError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (name, avatar) = self.roster.assign(sequence);
        Ok(Identity::new(Uuid::new_v4().to_string(), name, avatar))
    }
}
