mod authenticator;
mod authorizer;

pub use authenticator::{AuthError, TokenAuthenticator};
pub use authorizer::{Authorizer, Caller, Decision, Resource, StaticAuthorizer, Verb};

use axum::http::HeaderMap;
use thiserror::Error;


/// Prefix of bearer values that name a token from the token store.
pub const TOKEN_BEARER_PREFIX: &str = "ext/";

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, BearerError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(BearerError::Missing)?
        .to_str()
        .map_err(|_| BearerError::InvalidFormat)?;

    parse_bearer_header(auth_header)
}

/// Parse "Bearer <token>" from an Authorization header value
fn parse_bearer_header(header_value: &str) -> Result<String, BearerError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(BearerError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(BearerError::InvalidFormat);
    }

    let token = parts[1].trim();
    if token.is_empty() {
        return Err(BearerError::Empty);
    }

    Ok(token.to_string())
}

/// Split a token bearer value into token name and secret.
///
/// Accepts `ext/<name>:<secret>` and the bare `<name>:<secret>` form.
pub fn parse_token_bearer(bearer: &str) -> Result<(String, String), BearerError> {
    let bearer = bearer.strip_prefix(TOKEN_BEARER_PREFIX).unwrap_or(bearer);
    if bearer.is_empty() {
        return Err(BearerError::Empty);
    }

    let (name, secret) = bearer.split_once(':').ok_or(BearerError::InvalidFormat)?;
    if name.is_empty() || secret.is_empty() || name.contains('/') {
        return Err(BearerError::InvalidFormat);
    }

    Ok((name.to_string(), secret.to_string()))
}

/// Formats the bearer value handed out once at token creation.
pub fn format_token_bearer(name: &str, secret: &str) -> String {
    format!("{}{}:{}", TOKEN_BEARER_PREFIX, name, secret)
}

/// Bearer extraction errors
#[derive(Debug, Error, PartialEq, Clone)]
pub enum BearerError {
    /// Authorization header not present
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>" or not "<name>:<secret>"
    #[error("Invalid authorization token format")]
    InvalidFormat,
    /// Token is empty string
    #[error("Authorization token is empty")]
    Empty,
}
