//! Dependency fingerprints for content-addressed caching
//!
//! A fingerprint is the set of packages (and inline code steps) an execution
//! needs. Its key is a SHA256 over a canonical, sorted rendering of that set,
//! so the same dependencies in any order map to the same cache entry.

use crate::error::{FlowboxError, FlowboxResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Number of hex characters kept from the SHA256 digest
const KEY_HEX_LEN: usize = 24;

/// Where a package's contents come from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "packageType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageSource {
    /// Resolved by name and version from the package registry
    Registry,
    /// Content-addressed archive fetched from blob storage
    Archive {
        #[serde(rename = "archiveId")]
        archive_id: String,
    },
}

/// One package an execution depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Package name (e.g. `@flowbox/piece-slack`)
    #[serde(rename = "pieceName")]
    pub name: String,
    /// Exact version or semver range
    #[serde(rename = "pieceVersion")]
    pub version: String,
    /// Registry or archive
    #[serde(flatten)]
    pub source: PackageSource,
}

impl PackageSpec {
    /// A registry-resolved package
    pub fn registry(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            source: PackageSource::Registry,
        }
    }

    /// A package installed from a blob-store archive
    pub fn archive(
        name: impl Into<String>,
        version: impl Into<String>,
        archive_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            source: PackageSource::Archive {
                archive_id: archive_id.into(),
            },
        }
    }

    /// Archive id if this is an archive package
    pub fn archive_id(&self) -> Option<&str> {
        match &self.source {
            PackageSource::Archive { archive_id } => Some(archive_id),
            PackageSource::Registry => None,
        }
    }

    /// Argument handed to the package manager's `add` subcommand
    pub fn install_arg(&self, archive_dir: &Path) -> String {
        match &self.source {
            PackageSource::Registry => format!("{}@{}", self.name, self.version),
            PackageSource::Archive { archive_id } => format!(
                "{}@file:{}",
                self.name,
                archive_dir.join(archive_file_name(archive_id)).display()
            ),
        }
    }

    /// Reject specs that would be unsafe to pass to the package manager
    pub fn validate(&self) -> FlowboxResult<()> {
        let invalid = |reason: &str| FlowboxError::InvalidSpec {
            spec: self.to_string(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() || self.name.starts_with('-') || self.name.contains(char::is_whitespace) {
            return Err(invalid("package name must be non-empty and must not start with '-' or contain whitespace"));
        }

        match &self.source {
            PackageSource::Registry => {
                if self.version != "latest" && semver::VersionReq::parse(&self.version).is_err() {
                    return Err(invalid("version is not a valid semver version or range"));
                }
            }
            PackageSource::Archive { archive_id } => validate_archive_id(archive_id)
                .map_err(|reason| invalid(&reason))?,
        }

        Ok(())
    }

    /// Canonical line used when hashing a fingerprint
    fn canonical(&self) -> String {
        match &self.source {
            PackageSource::Registry => format!("registry:{}@{}", self.name, self.version),
            PackageSource::Archive { archive_id } => {
                format!("archive:{}@{}#{}", self.name, self.version, archive_id)
            }
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            PackageSource::Registry => write!(f, "{}@{}", self.name, self.version),
            PackageSource::Archive { archive_id } => {
                write!(f, "{}@{} (archive {})", self.name, self.version, archive_id)
            }
        }
    }
}

/// File name of an archive inside the archive directory.
///
/// pnpm only treats a `file:` path as a tarball when it carries a tarball
/// extension.
pub fn archive_file_name(archive_id: &str) -> String {
    format!("{}.tgz", archive_id)
}

/// Archive ids become file names, so only allow a safe character set.
fn validate_archive_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("archive id cannot be empty".to_string());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(format!(
            "archive id '{}' must contain only alphanumeric characters, hyphens, or underscores",
            id
        ));
    }
    Ok(())
}

/// Everything an execution needs installed before it can run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyFingerprint {
    /// Packages to install
    pub packages: Vec<PackageSpec>,
    /// Identifiers of inline code steps bundled with the flow
    pub code_steps: Vec<String>,
}

impl DependencyFingerprint {
    /// Fingerprint over a set of packages
    pub fn new(packages: Vec<PackageSpec>) -> Self {
        Self {
            packages,
            code_steps: Vec::new(),
        }
    }

    /// Add inline code-step identifiers
    pub fn with_code_steps(mut self, steps: Vec<String>) -> Self {
        self.code_steps = steps;
        self
    }

    /// Validate every package spec
    pub fn validate(&self) -> FlowboxResult<()> {
        self.packages.iter().try_for_each(PackageSpec::validate)
    }

    /// Packages deduplicated and in canonical order
    pub fn sorted_packages(&self) -> Vec<PackageSpec> {
        let unique: BTreeSet<&PackageSpec> = self.packages.iter().collect();
        unique.into_iter().cloned().collect()
    }

    /// Deterministic cache key: same set of dependencies = same key
    pub fn key(&self) -> String {
        let mut lines: BTreeSet<String> = self.packages.iter().map(PackageSpec::canonical).collect();
        lines.extend(self.code_steps.iter().map(|s| format!("code:{}", s)));

        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hex::encode(hasher.finalize());
        digest[..KEY_HEX_LEN].to_string()
    }

    /// Human-readable spec list, used in error reports
    pub fn describe(&self) -> Vec<String> {
        self.sorted_packages().iter().map(ToString::to_string).collect()
    }
}
