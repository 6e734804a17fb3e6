//! In-memory storage backend for the OctoRouter pipeline.
//!
//! This crate provides in-memory implementations of the `BlobStore`, `WorkQueue`
//! and `LineageStore` traits from `octorouter-storage`, using papaya lock-free
//! HashMaps for concurrent access.
//!
//! # Example
//!
//! ```ignore
//! use octorouter_db_memory::InMemoryBlobStore;
//! use octorouter_storage::{BlobFolder, BlobStore};
//!
//! let blobs = InMemoryBlobStore::new();
//! let info = blobs
//!     .upload(b"MSH|^~\\&|...", MimeFormat::Hl7, BlobFolder::Receive, None, ReportId::new())
//!     .await?;
//! ```

mod blob;
mod lineage;
mod queue;

pub use blob::{DEFAULT_BASE_URL, InMemoryBlobStore};
pub use lineage::InMemoryLineageStore;
pub use octorouter_storage::{BlobStore, LineageStore, StorageError, WorkQueue};
pub use queue::InMemoryQueue;

use std::sync::Arc;

/// A complete set of in-memory stores sharing nothing.
#[derive(Debug, Clone)]
pub struct MemoryStores {
    pub blobs: Arc<InMemoryBlobStore>,
    pub queue: Arc<InMemoryQueue>,
    pub lineage: Arc<InMemoryLineageStore>,
}

impl MemoryStores {
    pub fn new(blobs: InMemoryBlobStore) -> Self {
        Self {
            blobs: Arc::new(blobs),
            queue: Arc::new(InMemoryQueue::new()),
            lineage: Arc::new(InMemoryLineageStore::new()),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new(InMemoryBlobStore::new())
    }
}

/// Creates the in-memory stores with blobs rooted at `base`.
pub fn create_memory_stores(base: url::Url) -> MemoryStores {
    MemoryStores::new(InMemoryBlobStore::with_base(base))
}
