use super::{parse_token_bearer, BearerError, Caller};
use crate::directory::DirectoryError;
use crate::store::ReadMode;
use crate::tokens::{SystemTokenStore, Token, TokenError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Malformed(#[from] BearerError),

    /// Unknown token or wrong secret. Deliberately indistinguishable.
    #[error("invalid token")]
    Invalid,

    #[error("token is disabled")]
    Disabled,

    #[error("token has expired")]
    Expired,

    #[error("user is disabled")]
    UserDisabled,

    #[error("authentication backend failure: {0}")]
    Backend(String),
}

/// Resolves `ext/<name>:<secret>` bearer values to callers.
pub struct TokenAuthenticator {
    tokens: Arc<SystemTokenStore>,
}

impl TokenAuthenticator {
    pub fn new(tokens: Arc<SystemTokenStore>) -> Self {
        Self { tokens }
    }

    pub fn authenticate(&self, bearer: &str) -> Result<Caller, AuthError> {
        let (name, secret) = parse_token_bearer(bearer)?;
        let token = self.lookup(&name)?;

        if let Err(e) = self.tokens.hashers().verify(&token.status.hash, &secret) {
            debug!(token = %name, error = %e, "Token secret rejected");
            return Err(AuthError::Invalid);
        }
        if !token.spec.enabled {
            return Err(AuthError::Disabled);
        }
        if token.status.expired {
            return Err(AuthError::Expired);
        }

        match self.tokens.directory().get_user(&token.spec.user_id, ReadMode::Cached) {
            Ok(user) if user.enabled => {}
            Ok(_) => return Err(AuthError::UserDisabled),
            Err(DirectoryError::NotFound { .. }) => return Err(AuthError::Invalid),
            Err(e) => return Err(AuthError::Backend(e.to_string())),
        }

        if let Err(e) = self.tokens.update_last_used_at(&name, self.tokens.now()) {
            warn!(token = %name, error = %e, "Failed to record token use");
        }

        Ok(Caller::new(token.spec.user_id).with_session(name))
    }

    // Tokens created moments ago may not have reached the cache yet.
    fn lookup(&self, name: &str) -> Result<Token, AuthError> {
        let cached = match self.tokens.get(name, ReadMode::Cached) {
            Err(e) if e.is_not_found() => self.tokens.get(name, ReadMode::Consistent),
            other => other,
        };

        cached.map_err(|e| match e {
            TokenError::NotFound(_) => AuthError::Invalid,
            TokenError::Corrupt { .. } => {
                warn!(token = %name, error = %e, "Refusing to authenticate with corrupt token");
                AuthError::Invalid
            }
            other => AuthError::Backend(other.to_string()),
        })
    }
}
