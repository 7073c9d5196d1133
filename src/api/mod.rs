// HTTP API
pub mod tokens;

pub use tokens::{create_token_router, ApiError, TokenAppState};
