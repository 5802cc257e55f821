//! # kioku-server
//!
//! HTTP front end for kioku: owner-scoped block reads and edits, the agent
//! proposal queue, and human review.

pub mod api;
pub mod config;
pub mod constants;

pub use api::{ApiError, AppState, Owner, router};
pub use config::{ConfigError, ServerConfig};
