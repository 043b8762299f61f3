//! Cache entry state and on-disk manifests
//!
//! Each cache entry directory carries a small JSON manifest recording its key,
//! state and contents. A `ready` manifest survives restarts and is adopted
//! without reinstalling; a `building` manifest means a builder crashed and the
//! directory must be rebuilt.

use crate::cache::fingerprint::PackageSpec;
use crate::error::{FlowboxError, FlowboxResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Manifest file name inside every cache entry directory
pub const MANIFEST_FILE: &str = ".flowbox-cache.json";

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// State of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// Installation in progress, or crashed mid-install
    Building,
    /// Installed, sealed and safe to bind
    Ready,
}

impl CacheState {
    /// Whether slots may bind this entry
    pub fn is_bindable(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Building => write!(f, "building"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// Persistent description of a cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    /// Fingerprint key
    pub key: String,
    /// Current state
    pub state: CacheState,
    /// When the build started
    pub created_at: DateTime<Utc>,
    /// Installed packages in canonical order
    pub packages: Vec<PackageSpec>,
    /// Inline code-step identifiers covered by this entry
    #[serde(default)]
    pub code_steps: Vec<String>,
}

impl CacheManifest {
    /// New manifest for an entry about to be built
    pub fn building(key: &str, packages: Vec<PackageSpec>, code_steps: Vec<String>) -> Self {
        Self {
            key: key.to_string(),
            state: CacheState::Building,
            created_at: Utc::now(),
            packages,
            code_steps,
        }
    }

    /// Path of the manifest for an entry directory
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Load the manifest from an entry directory, if one exists and parses
    pub async fn load(dir: &Path) -> FlowboxResult<Option<Self>> {
        let path = Self::path_in(dir);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| FlowboxError::io(format!("reading cache manifest {}", path.display()), e))?;

        Ok(serde_json::from_str(&content).ok())
    }

    /// Write the manifest atomically (temp file + rename)
    pub async fn save(&self, dir: &Path) -> FlowboxResult<()> {
        let path = Self::path_in(dir);
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        let content = serde_json::to_string_pretty(self)?;

        fs::write(&tmp, content)
            .await
            .map_err(|e| FlowboxError::io(format!("writing cache manifest {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| FlowboxError::io(format!("renaming cache manifest {}", path.display()), e))?;
        Ok(())
    }

    /// Check if this entry is older than the given number of days
    pub fn is_older_than_days(&self, days: u32) -> bool {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.created_at < cutoff
    }
}

/// A ready cache entry handed to a caller; it holds one reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRef {
    /// Fingerprint key
    pub key: String,
    /// Entry directory on disk
    pub path: PathBuf,
}

/// Scan a cache root for entry manifests (used by the CLI)
pub async fn list_entries(root: &Path) -> FlowboxResult<Vec<(PathBuf, CacheManifest)>> {
    if !root.exists() {
        return Ok(vec![]);
    }

    let mut entries = vec![];
    let mut dir = fs::read_dir(root)
        .await
        .map_err(|e| FlowboxError::io(format!("reading cache root {}", root.display()), e))?;

    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| FlowboxError::io("reading cache entry", e))?
    {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(manifest) = CacheManifest::load(&path).await? {
            entries.push((path, manifest));
        }
    }

    // Newest first
    entries.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
    Ok(entries)
}

/// Total size of regular files under a directory (symlinks are not followed)
pub fn dir_size(path: &Path) -> u64 {
    let Ok(read) = std::fs::read_dir(path) else {
        return 0;
    };
    read.flatten()
        .map(|entry| match entry.file_type() {
            Ok(t) if t.is_dir() => dir_size(&entry.path()),
            Ok(t) if t.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

/// Make the whole tree under `dir` read-only, `dir` included.
///
/// With directories sealed too, nothing bound to the entry can add, rename
/// or delete files in it. [`remove_tree`] restores write access first.
pub fn seal_readonly(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            seal_readonly(&entry.path())?;
        } else if file_type.is_file() {
            set_readonly(&entry.path())?;
        }
    }
    set_readonly(dir)
}

fn set_readonly(path: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms)
}

/// Give the owner write access to `dir` and every directory below it
fn unseal_dirs(dir: &Path) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(dir)?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o700);
    }
    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    std::fs::set_permissions(dir, perms)?;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            unseal_dirs(&entry.path())?;
        }
    }
    Ok(())
}

/// Remove a directory tree, sealed or not. A missing tree is not an error.
pub async fn remove_tree(path: &Path) -> FlowboxResult<()> {
    let target = path.to_path_buf();
    let removed = tokio::task::spawn_blocking(move || {
        match unseal_dirs(&target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        std::fs::remove_dir_all(&target)
    })
    .await
    .map_err(|e| FlowboxError::Internal(format!("remove task failed: {}", e)))?;

    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FlowboxError::io(format!("removing {}", path.display()), e)),
    }
}
