//! Pipeline event system.
//!
//! Stages publish routing decisions and item failures as [`PipelineEvent`]s on a
//! shared [`EventBroadcaster`]. Subscribers (metrics sinks, audit writers, tests)
//! attach through [`EventBroadcaster::subscribe`].
//!
//! # Module Structure
//!
//! - [`types`]: Event type definitions
//! - [`broadcaster`]: Event broadcasting infrastructure

pub mod broadcaster;
pub mod types;

pub use broadcaster::EventBroadcaster;
pub use types::{PipelineEvent, PipelineEventKind};
