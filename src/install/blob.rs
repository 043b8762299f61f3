//! Blob storage for content-addressed package archives

use crate::error::{FlowboxError, FlowboxResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Upper bound on a single archive download
const MAX_ARCHIVE_BYTES: u64 = 256 * 1024 * 1024;

/// Source of package archive bytes, addressed by archive id
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the archive bytes for `archive_id`
    async fn fetch(&self, archive_id: &str) -> FlowboxResult<Vec<u8>>;

    /// Human-readable name for diagnostics
    fn store_name(&self) -> &'static str;
}

/// Blob store backed by a local (or network-mounted) directory
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Create a store reading `<dir>/<archive_id>`
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn fetch(&self, archive_id: &str) -> FlowboxResult<Vec<u8>> {
        let path = self.dir.join(archive_id);
        debug!("Reading archive {} from {}", archive_id, path.display());

        tokio::fs::read(&path)
            .await
            .map_err(|e| FlowboxError::ArchiveFetch {
                archive_id: archive_id.to_string(),
                reason: format!("{}: {}", path.display(), e),
            })
    }

    fn store_name(&self) -> &'static str {
        "filesystem"
    }
}

/// Blob store served over HTTP as `GET <base_url>/<archive_id>`
pub struct HttpBlobStore {
    base_url: String,
}

impl HttpBlobStore {
    /// Create a store for the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// URL of a single archive
    pub fn url_for(&self, archive_id: &str) -> String {
        format!("{}/{}", self.base_url, archive_id)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn fetch(&self, archive_id: &str) -> FlowboxResult<Vec<u8>> {
        let url = self.url_for(archive_id);
        debug!("Downloading archive {} from {}", archive_id, url);

        let id = archive_id.to_string();
        tokio::task::spawn_blocking(move || {
            let fail = |reason: String| FlowboxError::ArchiveFetch {
                archive_id: id.clone(),
                reason,
            };

            let mut response = ureq::get(&url).call().map_err(|e| fail(e.to_string()))?;
            response
                .body_mut()
                .with_config()
                .limit(MAX_ARCHIVE_BYTES)
                .read_to_vec()
                .map_err(|e| fail(e.to_string()))
        })
        .await
        .map_err(|e| FlowboxError::Internal(format!("archive download task failed: {}", e)))?
    }

    fn store_name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fs_store_reads_archive() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("arch1"), b"tarball").unwrap();

        let store = FsBlobStore::new(dir.path().to_path_buf());
        assert_eq!(store.fetch("arch1").await.unwrap(), b"tarball");
        assert_eq!(store.store_name(), "filesystem");
    }

    #[tokio::test]
    async fn fs_store_missing_archive() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());

        let err = store.fetch("nope").await.unwrap_err();
        assert!(matches!(err, FlowboxError::ArchiveFetch { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn http_store_url() {
        let store = HttpBlobStore::new("https://files.example.com/archives/");
        assert_eq!(
            store.url_for("abc"),
            "https://files.example.com/archives/abc"
        );
    }
}
