//! HTTP surface and services for the stowage storage core.
//!
//! This crate provides:
//! - The upload pipeline (precheck, chunk intake, finalize)
//! - Ranged and decrypting reads with play tokens
//! - Offline HTTP and BitTorrent downloads
//! - Recycle bin, shares and tar packaging
//! - Lifecycle jobs and startup recovery

pub mod auth;
pub mod bootstrap;
pub mod disks;
pub mod download;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod packaging;
pub mod permissions;
pub mod permits;
pub mod quota;
pub mod ratelimit;
pub mod reader;
pub mod recycle;
pub mod routes;
pub mod scheduler;
pub mod shares;
pub mod state;
pub mod upload;
pub mod users;

#[cfg(test)]
mod testing;

pub use auth::TraceId;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
