//! Dependency installation into cache entry directories
//!
//! Archive packages are materialized into a shared content-addressed archive
//! directory first (fetched only when missing), then every package is handed
//! to the package manager in a single `add` call.

pub mod blob;
pub mod package_manager;

pub use blob::{BlobStore, FsBlobStore, HttpBlobStore};
pub use package_manager::{PackageManager, PnpmCli};

use crate::cache::fingerprint::{archive_file_name, PackageSpec};
use crate::error::{FlowboxError, FlowboxResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Installs package specs into a target directory
pub struct DependencyInstaller {
    archive_dir: PathBuf,
    blobs: Arc<dyn BlobStore>,
    package_manager: Arc<dyn PackageManager>,
}

impl DependencyInstaller {
    /// Create an installer
    pub fn new(
        archive_dir: PathBuf,
        blobs: Arc<dyn BlobStore>,
        package_manager: Arc<dyn PackageManager>,
    ) -> Self {
        Self {
            archive_dir,
            blobs,
            package_manager,
        }
    }

    /// Directory holding downloaded archives
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// The package manager in use
    pub fn package_manager(&self) -> &dyn PackageManager {
        self.package_manager.as_ref()
    }

    /// Install `specs` into `target_dir`.
    ///
    /// Errors carry the spec list and target directory. On failure the target
    /// directory is left as-is; callers discard it before retrying.
    pub async fn install(&self, target_dir: &Path, specs: &[PackageSpec]) -> FlowboxResult<()> {
        let wrap = |e: FlowboxError| FlowboxError::CacheBuildFailed {
            key: target_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            specs: specs.iter().map(ToString::to_string).collect(),
            target: target_dir.to_path_buf(),
            reason: e.to_string(),
        };

        for spec in specs {
            spec.validate().map_err(wrap)?;
        }

        fs::create_dir_all(target_dir)
            .await
            .map_err(|e| wrap(FlowboxError::io(format!("creating {}", target_dir.display()), e)))?;

        self.materialize_archives(specs).await.map_err(wrap)?;

        let args: Vec<String> = specs
            .iter()
            .map(|s| s.install_arg(&self.archive_dir))
            .collect();

        self.package_manager.init(target_dir).await.map_err(wrap)?;
        self.package_manager
            .add(target_dir, &args)
            .await
            .map_err(wrap)?;

        info!(
            "Installed {} package(s) into {}",
            specs.len(),
            target_dir.display()
        );
        Ok(())
    }

    /// Fetch every archive that is not already on disk.
    ///
    /// There is no per-archive lock: callers serialize per cache key, and a
    /// duplicate fetch across different keys only rewrites identical bytes.
    async fn materialize_archives(&self, specs: &[PackageSpec]) -> FlowboxResult<()> {
        let missing: Vec<&str> = specs
            .iter()
            .filter_map(PackageSpec::archive_id)
            .filter(|id| !self.archive_dir.join(archive_file_name(id)).exists())
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.archive_dir).await.map_err(|e| {
            FlowboxError::io(format!("creating {}", self.archive_dir.display()), e)
        })?;

        for archive_id in missing {
            debug!(
                "Fetching archive {} from {} store",
                archive_id,
                self.blobs.store_name()
            );
            let bytes = self.blobs.fetch(archive_id).await?;
            self.write_archive(archive_id, &bytes).await?;
        }

        Ok(())
    }

    /// Write via temp file + rename so readers never see a partial archive
    async fn write_archive(&self, archive_id: &str, bytes: &[u8]) -> FlowboxResult<()> {
        let final_path = self.archive_dir.join(archive_file_name(archive_id));
        let tmp_path = self
            .archive_dir
            .join(format!(".{}.{}.tmp", archive_id, uuid::Uuid::new_v4()));

        fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| FlowboxError::io(format!("writing {}", tmp_path.display()), e))?;

        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(FlowboxError::io(
                format!("moving archive into {}", final_path.display()),
                e,
            ));
        }

        debug!("Stored archive {} ({} bytes)", archive_id, bytes.len());
        Ok(())
    }
}
