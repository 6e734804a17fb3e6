//! # octorouter-server
//!
//! Worker process for the OctoRouter pipeline: loads configuration, sender and
//! receiver settings and lookup tables, then runs one queue consumer per stage
//! until shutdown.

pub mod config;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use observability::{apply_logging_level, init_tracing};
pub use server::{RouterServer, ServerBuilder};
