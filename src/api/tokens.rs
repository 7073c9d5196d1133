//! Token API endpoints.
//!
//! Every request authenticates with `Authorization: Bearer ext/<name>:<secret>`
//! and is served by the caller-scoped token store.

use crate::auth::{extract_bearer_token, AuthError, Caller, TokenAuthenticator};
use crate::tokens::{Token, TokenError, TokenStore, WriteOptions};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};


/// Shared application state for the token API
#[derive(Clone)]
pub struct TokenAppState {
    pub tokens: Arc<TokenStore>,
    pub authenticator: Arc<TokenAuthenticator>,
}

/// Query parameters accepted by create and update
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteQuery {
    pub dry_run: bool,
}

impl From<WriteQuery> for WriteOptions {
    fn from(query: WriteQuery) -> Self {
        WriteOptions {
            dry_run: query.dry_run,
        }
    }
}

#[derive(Serialize)]
pub struct TokenList {
    pub items: Vec<Token>,
}

#[derive(Serialize)]
pub struct DeletedTokens {
    pub deleted: Vec<String>,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create token API router
pub fn create_token_router(state: TokenAppState) -> Router {
    Router::new()
        .route(
            "/v1/tokens",
            get(list_tokens).post(create_token).delete(delete_tokens),
        )
        .route(
            "/v1/tokens/:name",
            get(get_token).put(update_token).delete(delete_token),
        )
        .with_state(Arc::new(state))
}

fn authenticate(state: &TokenAppState, headers: &HeaderMap) -> Result<Caller, ApiError> {
    let bearer = extract_bearer_token(headers).map_err(AuthError::from)?;
    Ok(state.authenticator.authenticate(&bearer)?)
}

/// POST /v1/tokens - Create a token for the caller (or, with full access, any user)
///
/// The response is the only place the secret is ever returned.
async fn create_token(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    Query(query): Query<WriteQuery>,
    Json(token): Json<Token>,
) -> Result<(StatusCode, Json<Token>), ApiError> {
    let caller = authenticate(&state, &headers)?;
    debug!(user = %caller.user, "Creating token");

    let created = state.tokens.create(&caller, token, query.into())?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /v1/tokens - List the tokens visible to the caller
async fn list_tokens(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
) -> Result<Json<TokenList>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let items = state.tokens.list(&caller)?;
    Ok(Json(TokenList { items }))
}

/// GET /v1/tokens/:name
async fn get_token(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Token>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    Ok(Json(state.tokens.get(&caller, &name)?))
}

/// PUT /v1/tokens/:name - Update the mutable spec of a token
async fn update_token(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(query): Query<WriteQuery>,
    Json(mut token): Json<Token>,
) -> Result<Json<Token>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    if token.name.is_empty() {
        token.name = name.clone();
    }
    if token.name != name {
        return Err(ApiError::BadRequest(format!(
            "body names token '{}' but path names '{}'",
            token.name, name
        )));
    }

    Ok(Json(state.tokens.update(&caller, token, query.into())?))
}

/// DELETE /v1/tokens/:name
async fn delete_token(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = authenticate(&state, &headers)?;
    state.tokens.delete(&caller, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /v1/tokens - Delete every token visible to the caller
async fn delete_tokens(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
) -> Result<Json<DeletedTokens>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let deleted = state.tokens.delete_collection(&caller)?;
    Ok(Json(DeletedTokens { deleted }))
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::BadRequest(_) => ApiError::BadRequest(e.to_string()),
            TokenError::NotFound(_) => ApiError::NotFound(e.to_string()),
            TokenError::Forbidden(_) => ApiError::Forbidden(e.to_string()),
            TokenError::AlreadyExists(_) => ApiError::Conflict(e.to_string()),
            TokenError::Corrupt { .. }
            | TokenError::Hash(_)
            | TokenError::Directory(_)
            | TokenError::Store(_) => {
                error!(error = %e, "Token request failed");
                ApiError::InternalServerError("internal error".to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Backend(_) => {
                error!(error = %e, "Authentication backend failed");
                ApiError::InternalServerError("internal error".to_string())
            }
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}
