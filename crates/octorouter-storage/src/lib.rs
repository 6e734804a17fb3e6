//! # octorouter-storage
//!
//! Storage abstraction layer for the OctoRouter pipeline.
//!
//! This crate defines the traits and types that all storage backends must implement.
//! It does not contain any implementations - those are provided by separate crates.
//!
//! ## Overview
//!
//! - [`BlobStore`]: write-once report bodies addressed by folder and report id
//! - [`WorkQueue`]: named at-least-once queues with visibility timeouts
//! - [`LineageStore`]: reports, lineage edges and action records
//!
//! ## Example
//!
//! ```ignore
//! use octorouter_storage::prelude::*;
//!
//! async fn forward(blobs: &dyn BlobStore, queue: &dyn WorkQueue, bytes: &[u8], id: ReportId)
//!     -> StorageResult<()>
//! {
//!     let info = blobs
//!         .upload(bytes, MimeFormat::Fhir, BlobFolder::Process, None, id)
//!         .await?;
//!     queue.send("destination-filter", info.url.to_string()).await
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::StorageError;
pub use traits::{BlobStore, LineageStore, WorkQueue};
pub use types::{
    ActionLog, ActionOutcome, ActionRecord, BlobFolder, BlobInfo, Delivery, ErrorCode, LogLevel,
    LogScope, blob_url, poison_queue,
};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared blob store handle.
pub type DynBlobStore = std::sync::Arc<dyn BlobStore>;

/// Shared work queue handle.
pub type DynWorkQueue = std::sync::Arc<dyn WorkQueue>;

/// Shared lineage store handle.
pub type DynLineageStore = std::sync::Arc<dyn LineageStore>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octorouter_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::StorageError;
    pub use crate::traits::{BlobStore, LineageStore, WorkQueue};
    pub use crate::types::{
        ActionLog, ActionOutcome, ActionRecord, BlobFolder, BlobInfo, Delivery, ErrorCode,
        LogLevel, LogScope,
    };
    pub use crate::{DynBlobStore, DynLineageStore, DynWorkQueue, StorageResult};
    pub use octorouter_core::{MimeFormat, ReportId};
}
