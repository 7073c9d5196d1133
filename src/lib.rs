// Credential hashing
pub mod hashers;

// Backing record store
pub mod store;

// Users, user attributes and clusters
pub mod directory;

// Bearer parsing, authentication and authorization
pub mod auth;

// Token store
pub mod tokens;

// Local user passwords
pub mod passwords;

// HTTP API
pub mod api;

pub mod config;
