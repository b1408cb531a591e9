//! Identity boundary: bearer credential verification
//!
//! Credential issuance lives outside this service. Requests carry an
//! `Authorization: Bearer <token>` header and an [`IdentityVerifier`] turns the
//! token into an [`Identity`] once per request.
//!
//! The default verifier checks HS256 JWTs signed with the secret in
//! `CAPTURE_JWT_SECRET`. Tokens must carry `sub` (the identity id) and `exp`;
//! an optional `username` claim is passed through as the display name.

use crate::{AuthError, ConfigError};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const JWT_SECRET_ENV: &str = "CAPTURE_JWT_SECRET";

const MIN_SECRET_LENGTH: usize = 32;

/// A verified principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header.trim().split_once(' ').ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedHeader);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    Ok(token)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Clone)]
pub struct JwtIdentityVerifier {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl fmt::Debug for JwtIdentityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtIdentityVerifier")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

impl JwtIdentityVerifier {
    pub fn new(secret: &str) -> Result<Self, ConfigError> {
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "JWT secret must be at least {MIN_SECRET_LENGTH} characters (got {})",
                secret.len()
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = std::env::var(JWT_SECRET_ENV).map_err(|_| ConfigError::MissingEnv(JWT_SECRET_ENV))?;
        Self::new(&secret)
    }
}

impl IdentityVerifier for JwtIdentityVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty subject".to_string()));
        }

        Ok(Identity {
            id: data.claims.sub,
            username: data.claims.username,
        })
    }
}
