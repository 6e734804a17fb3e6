//! Storage traits for the pipeline storage abstraction layer.
//!
//! Three independent contracts: a write-once blob store for report bodies, a
//! named at-least-once work queue, and the lineage/action store that makes every
//! artifact traceable to its input.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use octorouter_core::{Digest, ItemLineage, MimeFormat, Report, ReportId};
use url::Url;

use crate::error::StorageError;
use crate::types::{ActionRecord, BlobFolder, BlobInfo, Delivery};

/// Write-once storage for report bodies.
///
/// # Example
///
/// ```ignore
/// use octorouter_storage::BlobStore;
///
/// async fn body(
///     store: &dyn BlobStore,
///     url: &Url,
///     digest: &Digest,
/// ) -> Result<Vec<u8>, StorageError> {
///     store.download_verified(url, digest).await
/// }
/// ```
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads a report body to `<base>/<subfolder/>?<folder>/<report_id>.<ext>`.
    ///
    /// Uploading identical bytes to an existing location succeeds without
    /// writing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Conflict` if the location holds different bytes.
    /// Returns `StorageError::InvalidLocation` if the subfolder is malformed.
    async fn upload(
        &self,
        bytes: &[u8],
        format: MimeFormat,
        folder: BlobFolder,
        subfolder: Option<&str>,
        report_id: ReportId,
    ) -> Result<BlobInfo, StorageError>;

    /// Downloads the bytes at `url`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if nothing was uploaded there.
    async fn download(&self, url: &Url) -> Result<Vec<u8>, StorageError>;

    /// Downloads the bytes at `url` and checks them against `expected`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::DigestMismatch` if the stored bytes hash to
    /// anything other than `expected`.
    async fn download_verified(
        &self,
        url: &Url,
        expected: &Digest,
    ) -> Result<Vec<u8>, StorageError> {
        let bytes = self.download(url).await?;
        expected.verify(url.as_str(), &bytes)?;
        Ok(bytes)
    }

    /// Returns `true` if a body exists at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn exists(&self, url: &Url) -> Result<bool, StorageError>;
}

/// Named work queues with visibility-timeout leases.
///
/// A received message stays invisible for the visibility timeout. If it is
/// neither acked nor released by then it is handed out again with a higher
/// `dequeue_count`.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends a payload to `queue`.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn send(&self, queue: &str, payload: String) -> Result<(), StorageError>;

    /// Leases up to `max` visible messages from `queue`.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, StorageError>;

    /// Removes a leased message for good.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LeaseExpired` if the message was handed out again
    /// since this delivery was received.
    async fn ack(&self, delivery: &Delivery) -> Result<(), StorageError>;

    /// Makes a leased message visible again immediately.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LeaseExpired` if the lease is no longer held.
    async fn release(&self, delivery: &Delivery) -> Result<(), StorageError>;

    /// Moves a leased message to `<queue>-poison`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LeaseExpired` if the lease is no longer held.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), StorageError>;

    /// Number of messages in `queue`, visible or leased.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn depth(&self, queue: &str) -> Result<usize, StorageError>;
}

/// Provenance store: reports, the lineage edges between them and the action
/// records of the stages that produced them.
#[async_trait]
pub trait LineageStore: Send + Sync {
    /// Records a report. Recording the same id again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn record_report(&self, report: &Report) -> Result<(), StorageError>;

    /// Records lineage edges. Edges already known are skipped.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LineageCycle` if an edge would make a report its
    /// own ancestor. No edge of the batch is recorded in that case.
    async fn record_lineage(&self, edges: &[ItemLineage]) -> Result<(), StorageError>;

    /// Returns a recorded report.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn report(&self, id: ReportId) -> Result<Option<Report>, StorageError>;

    /// Direct parents of `id`, in recording order without duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn parents_of(&self, id: ReportId) -> Result<Vec<ReportId>, StorageError>;

    /// Direct children of `id`, in recording order without duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn children_of(&self, id: ReportId) -> Result<Vec<ReportId>, StorageError>;

    /// Appends an action record.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn record_action(&self, record: ActionRecord) -> Result<(), StorageError>;

    /// All action records for `report_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues.
    async fn actions_for(&self, report_id: ReportId) -> Result<Vec<ActionRecord>, StorageError>;

    /// Follows first parents from `id` until a report without parents is found.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::LineageCycle` if the walk revisits a report.
    async fn root_of(&self, id: ReportId) -> Result<ReportId, StorageError> {
        let mut current = id;
        let mut seen = HashSet::from([current]);
        while let Some(parent) = self.parents_of(current).await?.into_iter().next() {
            if !seen.insert(parent) {
                return Err(StorageError::lineage_cycle(parent, current));
            }
            current = parent;
        }
        Ok(current)
    }
}
