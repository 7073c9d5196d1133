//! Cluster sync - Mirrors cluster-scoped tokens and user attributes into
//! downstream clusters.
//!
//! # Architecture
//!
//! ```text
//!        Upstream store (tokens, users, user attributes)
//!                       ↓ watches + periodic resync
//! ┌─────────────────────────────────────────┐
//! │       SyncManager (one set per cluster)  │
//! │  - WorkQueue: de-dup, retry backoff      │
//! │  - Workers: TokenSync / UserSync /       │
//! │             OrphanCleaner                │
//! └─────────────────────────────────────────┘
//!                       ↓
//!        Downstream store (shadow tokens, hash records,
//!                          user-attribute shadows)
//!                       ↓
//!        ClusterTokenValidator (cluster-local auth)
//! ```
//!
//! # Core Types
//!
//! - [`TokenSync`] - Shadow token plus hash record per cluster-scoped token
//! - [`UserSync`] - User-attribute shadow per user with shadow tokens
//! - [`OrphanCleaner`] - Drops user-attribute shadows whose upstream is gone
//! - [`SyncManager`] - Watches, queues and workers for every cluster
//! - [`ClusterTokenValidator`] - Checks bearer tokens against the shadows

mod error;
mod orphan;
mod token_sync;
mod user_sync;
pub mod manager;
pub mod queue;
pub mod types;
pub mod validator;

pub use error::SyncError;
pub use manager::{ClusterSync, SyncKey, SyncManager};
pub use orphan::OrphanCleaner;
pub use queue::WorkQueue;
pub use token_sync::TokenSync;
pub use user_sync::UserSync;
pub use validator::{ClusterTokenValidator, ValidatedToken, ValidationError};
