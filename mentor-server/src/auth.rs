//! Bearer-token verification.
//!
//! Turns `Authorization: Bearer <jwt>` headers into an [`Identity`], the
//! verified-caller value every storage operation requires. `Identity` is
//! deliberately not deserializable, so a request body or query string can
//! never smuggle one in; the only request-path source is the verifier.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Claims and identity
// ============================================================================

/// JWT claims minted by the identity provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user's UUID.
    pub sub: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: usize,
    /// Issued-at, seconds since the Unix epoch.
    pub iat: usize,
}

/// A verified caller.
///
/// The inner id is private: handlers read it through [`Identity::user_id`]
/// and the store binds it into SQL, but nothing outside this module can
/// overwrite it after verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    user_id: Uuid,
}

impl Identity {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Construct an identity without verifying a token.
    ///
    /// Request paths must go through [`AuthVerifier::verify_bearer`]; this
    /// exists for tests and for trusted offline tooling only.
    pub fn assume(user_id: Uuid) -> Self {
        Self { user_id }
    }
}

// ============================================================================
// Verifier
// ============================================================================

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed bearer token")]
    MissingToken,

    #[error("token rejected: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token subject is not a valid user id")]
    BadSubject,
}

/// HS256 verifier for provider-minted session tokens.
#[derive(Clone)]
pub struct AuthVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthVerifier {
    /// `leeway_secs` absorbs clock skew between this host and the identity
    /// provider when checking `exp`.
    pub fn new(secret: &str, leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a raw JWT and derive the caller's identity from its subject.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::BadSubject)?;
        Ok(Identity { user_id })
    }

    /// Verify the value of an `Authorization` header, if one was sent.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<Identity, AuthError> {
        let header = header.ok_or(AuthError::MissingToken)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError::MissingToken)?;
        self.verify(token.trim())
    }
}

// ============================================================================
// Tests
// ============================================================================
