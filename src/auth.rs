#![forbid(unsafe_code)]

// Auth module - turns a join token into an identity and its roles

use crate::room::roles::Role;
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

const TOKEN_LIFETIME_SECS: u64 = 15 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token could not be issued: {0}")]
    Issue(String),
}

/// Who a peer is, as far as the room is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Subject of a verified token; `None` for guests.
    pub subject: Option<String>,
    pub display_name: Option<String>,
    /// Roles granted on top of the default role.
    pub roles: Vec<Role>,
}

impl Identity {
    pub fn guest() -> Self {
        Self::default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: usize,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verifies the token presented with `join`. A missing token is a guest.
    async fn verify(&self, token: Option<&str>) -> Result<Identity, AuthError>;
}

/// Accepts everyone as a guest. Used when no signing secret is configured.
#[derive(Debug, Default)]
pub struct GuestAuthenticator;

#[async_trait]
impl Authenticator for GuestAuthenticator {
    async fn verify(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        if token.is_some() {
            debug!("Ignoring join token, authentication is disabled");
        }
        Ok(Identity::guest())
    }
}

/// HS256 tokens signed with a shared secret.
pub struct JwtAuthenticator {
    secret: String,
}

impl JwtAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Issues a token; used by operators and tests.
    pub fn create_token(
        &self,
        subject: &str,
        display_name: Option<&str>,
        roles: &[Role],
    ) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthError::Issue("system clock error".to_string()))?;

        let claims = Claims {
            sub: subject.to_string(),
            name: display_name.map(str::to_string),
            roles: roles.iter().map(|r| r.name().to_string()).collect(),
            exp: (now.as_secs() + TOKEN_LIFETIME_SECS) as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Issue(format!("JWT encode error: {e}")))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })?;

        Ok(data.claims)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn verify(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let Some(token) = token else {
            return Ok(Identity::guest());
        };
        let claims = self.validate_token(token)?;

        let mut roles = Vec::new();
        for claim in &claims.roles {
            match Role::from_claim(claim) {
                Some(role) if role != Role::DEFAULT => roles.push(role),
                Some(_) => {}
                None => debug!("Ignoring unknown role claim {:?} for {}", claim, claims.sub),
            }
        }

        Ok(Identity {
            subject: Some(claims.sub),
            display_name: claims.name,
            roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-at-least-32-bytes-long!!";

    #[tokio::test]
    async fn test_token_roles_become_identity() {
        let auth = JwtAuthenticator::new(SECRET);
        let token = auth
            .create_token("user-123", Some("Alice"), &[Role::Moderator, Role::Normal])
            .unwrap();

        let identity = auth.verify(Some(&token)).await.unwrap();
        assert_eq!(identity.subject.as_deref(), Some("user-123"));
        assert_eq!(identity.display_name.as_deref(), Some("Alice"));
        assert_eq!(identity.roles, vec![Role::Moderator]);
    }

    #[tokio::test]
    async fn test_unknown_role_claims_are_dropped() {
        let auth = JwtAuthenticator::new(SECRET);
        let claims = Claims {
            sub: "u".into(),
            name: None,
            roles: vec!["owner".into(), "presenter".into()],
            exp: (SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() + 60) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let identity = auth.verify(Some(&token)).await.unwrap();
        assert_eq!(identity.roles, vec![Role::Presenter]);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let token = JwtAuthenticator::new("secret-1").create_token("u", None, &[]).unwrap();
        let result = JwtAuthenticator::new("secret-2").verify(Some(&token)).await;
        assert_eq!(result, Err(AuthError::InvalidToken));

        let result = JwtAuthenticator::new("secret").verify(Some("not.a.jwt")).await;
        assert_eq!(result, Err(AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_missing_token_is_a_guest() {
        let identity = JwtAuthenticator::new(SECRET).verify(None).await.unwrap();
        assert_eq!(identity, Identity::guest());
        let identity = GuestAuthenticator.verify(Some("anything")).await.unwrap();
        assert_eq!(identity, Identity::guest());
    }
}
