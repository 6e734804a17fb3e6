use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{Digest, MimeFormat, ReportId};
use octorouter_storage::{BlobFolder, BlobInfo, BlobStore, StorageError, blob_url};
use papaya::HashMap as PapayaHashMap;
use url::Url;

/// Default base location for blobs held in memory.
pub const DEFAULT_BASE_URL: &str = "memory://reports/";

/// In-memory blob store using papaya lock-free HashMap.
///
/// Each location is written once; a second upload of the same bytes is a no-op.
#[derive(Debug)]
pub struct InMemoryBlobStore {
    base: Url,
    blobs: Arc<PapayaHashMap<String, Arc<Vec<u8>>>>,
}

impl InMemoryBlobStore {
    /// Creates a store rooted at [`DEFAULT_BASE_URL`].
    pub fn new() -> Self {
        Self::with_base(
            Url::parse(DEFAULT_BASE_URL).unwrap_or_else(|_| unreachable!("constant base URL")),
        )
    }

    pub fn with_base(base: Url) -> Self {
        Self {
            base,
            blobs: Arc::new(PapayaHashMap::new()),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.blobs.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the bytes at `url` without any checks.
    ///
    /// Only meant for simulating corruption in tests.
    pub fn overwrite(&self, url: &Url, bytes: Vec<u8>) {
        self.blobs.pin().insert(url.to_string(), Arc::new(bytes));
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(
        &self,
        bytes: &[u8],
        format: MimeFormat,
        folder: BlobFolder,
        subfolder: Option<&str>,
        report_id: ReportId,
    ) -> Result<BlobInfo, StorageError> {
        let url = blob_url(&self.base, folder, subfolder, report_id, format)?;
        let guard = self.blobs.pin();
        let stored = guard.get_or_insert(url.to_string(), Arc::new(bytes.to_vec()));
        if stored.as_slice() != bytes {
            return Err(StorageError::conflict(format!(
                "{url} already holds different content"
            )));
        }
        tracing::trace!(%url, size = bytes.len(), "Stored blob");
        Ok(BlobInfo {
            url,
            digest: Digest::of(bytes),
            format,
        })
    }

    async fn download(&self, url: &Url) -> Result<Vec<u8>, StorageError> {
        let guard = self.blobs.pin();
        guard
            .get(url.as_str())
            .map(|bytes| Vec::clone(bytes))
            .ok_or_else(|| StorageError::not_found("blob", url.as_str()))
    }

    async fn exists(&self, url: &Url) -> Result<bool, StorageError> {
        Ok(self.blobs.pin().contains_key(url.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_and_download() {
        let store = InMemoryBlobStore::new();
        let id = ReportId::new();
        let info = store
            .upload(b"hello", MimeFormat::Fhir, BlobFolder::Process, None, id)
            .await
            .unwrap();

        assert_eq!(info.url.as_str(), format!("memory://reports/process/{id}.fhir"));
        assert_eq!(info.digest, Digest::of(b"hello"));
        assert!(store.exists(&info.url).await.unwrap());
        assert_eq!(store.download(&info.url).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_upload_is_write_once() {
        let store = InMemoryBlobStore::new();
        let id = ReportId::new();
        let first = store
            .upload(b"a", MimeFormat::Hl7, BlobFolder::Receive, Some("lab"), id)
            .await
            .unwrap();
        let again = store
            .upload(b"a", MimeFormat::Hl7, BlobFolder::Receive, Some("lab"), id)
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(store.len(), 1);

        let err = store
            .upload(b"b", MimeFormat::Hl7, BlobFolder::Receive, Some("lab"), id)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_download_missing() {
        let store = InMemoryBlobStore::new();
        let url = Url::parse("memory://reports/none/x.fhir").unwrap();
        assert!(store.download(&url).await.unwrap_err().is_not_found());
        assert!(!store.exists(&url).await.unwrap());
    }

    #[tokio::test]
    async fn test_download_verified_detects_corruption() {
        let store = InMemoryBlobStore::new();
        let info = store
            .upload(b"{}", MimeFormat::Fhir, BlobFolder::Route, None, ReportId::new())
            .await
            .unwrap();
        assert!(store.download_verified(&info.url, &info.digest).await.is_ok());

        store.overwrite(&info.url, b"{\"x\":1}".to_vec());
        let err = store
            .download_verified(&info.url, &info.digest)
            .await
            .unwrap_err();
        assert!(err.is_digest_mismatch());
    }
}
