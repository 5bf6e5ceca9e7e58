//! Authentication extraction: API keys and bearer tokens.
//!
//! The gateway does not issue tokens; it validates what arrives. An API-key
//! header is checked against an in-memory table refreshed from
//! configuration; otherwise a bearer token is verified (signature + issuer)
//! against a configured key set. Requests without credentials proceed
//! unauthenticated; downstream services decide what anonymous callers may
//! do; the principal's job here is rate-limit identity.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use merx_core::error::{Classify, ErrorKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Authentication failures.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The presented API key is not in the table.
    #[error("Unknown API key")]
    UnknownApiKey,

    /// The bearer token failed verification.
    #[error("Invalid bearer token: {0}")]
    InvalidToken(String),
}

impl Classify for AuthError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::AuthFailure
    }

    fn code(&self) -> &'static str {
        match self {
            Self::UnknownApiKey => "INVALID_API_KEY",
            Self::InvalidToken(_) => "INVALID_TOKEN",
        }
    }
}

/// Who is calling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    /// A configured API key.
    ApiKey {
        /// The key's configured name.
        name: String,
    },
    /// A verified bearer-token subject.
    User {
        /// The token subject.
        subject: String,
    },
    /// No credentials presented.
    Anonymous,
}

impl Principal {
    /// The rate-limit identity: `api-key:<name>` ∨ `user:<sub>` ∨
    /// `ip:<client>`.
    #[must_use]
    pub fn identity_key(&self, client_ip: &str) -> String {
        match self {
            Self::ApiKey { name } => format!("api-key:{name}"),
            Self::User { subject } => format!("user:{subject}"),
            Self::Anonymous => format!("ip:{client_ip}"),
        }
    }
}

/// In-memory API key table, replaceable at runtime from configuration.
#[derive(Default)]
pub struct ApiKeyTable {
    /// key value -> key name
    keys: RwLock<HashMap<String, String>>,
}

impl ApiKeyTable {
    /// Create a table from `(name, key)` pairs.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let keys = entries
            .into_iter()
            .map(|(name, key)| (key, name))
            .collect();
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// Replace the whole table (config refresh).
    pub fn replace(&self, entries: impl IntoIterator<Item = (String, String)>) {
        if let Ok(mut keys) = self.keys.write() {
            *keys = entries
                .into_iter()
                .map(|(name, key)| (key, name))
                .collect();
        }
    }

    /// Look up a key value, returning the key's name.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.keys.read().ok()?.get(key).cloned()
    }
}

/// Claims the gateway cares about.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Bearer-token verifier over a configured key set.
pub struct JwtVerifier {
    /// Decoding keys by `kid`; a single unnamed key uses the empty string.
    keys: HashMap<String, DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for HS256 secrets keyed by `kid`, pinned to
    /// `issuer`.
    #[must_use]
    pub fn new_hmac(secrets: impl IntoIterator<Item = (String, Vec<u8>)>, issuer: &str) -> Self {
        let keys = secrets
            .into_iter()
            .map(|(kid, secret)| (kid, DecodingKey::from_secret(&secret)))
            .collect();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        Self { keys, validation }
    }

    /// Verify a token, producing its subject.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidToken`] for bad signatures, unknown key ids or
    /// issuer mismatches.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let kid = header.kid.unwrap_or_default();
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown key id '{kid}'")))?;

        let data = decode::<Claims>(token, key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(data.claims.sub)
    }
}

/// The gateway's authentication stage.
pub struct Authenticator {
    api_keys: ApiKeyTable,
    jwt: Option<JwtVerifier>,
}

impl Authenticator {
    /// Create an authenticator over a key table and an optional verifier.
    #[must_use]
    pub const fn new(api_keys: ApiKeyTable, jwt: Option<JwtVerifier>) -> Self {
        Self { api_keys, jwt }
    }

    /// Access the key table (config refresh).
    #[must_use]
    pub const fn api_keys(&self) -> &ApiKeyTable {
        &self.api_keys
    }

    /// Extract a principal from request headers.
    ///
    /// # Errors
    ///
    /// [`AuthError`] when credentials are presented but invalid; absent
    /// credentials yield [`Principal::Anonymous`].
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<Principal, AuthError> {
        if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            return match self.api_keys.lookup(key) {
                Some(name) => Ok(Principal::ApiKey { name }),
                None => Err(AuthError::UnknownApiKey),
            };
        }

        if let Some(bearer) = headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            if let Some(jwt) = &self.jwt {
                let subject = jwt.verify(bearer)?;
                return Ok(Principal::User { subject });
            }
            return Err(AuthError::InvalidToken(
                "no token verifier configured".to_string(),
            ));
        }

        Ok(Principal::Anonymous)
    }
}
