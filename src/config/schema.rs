//! Configuration schema for flowbox
//!
//! Configuration is stored at `~/.config/flowbox/config.toml`

use crate::config::ConfigManager;
use crate::sandbox::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Isolation pool settings
    pub pool: PoolConfig,

    /// Per-execution limits
    pub execution: ExecutionConfig,

    /// Isolation backend settings
    pub sandbox: SandboxConfig,

    /// Dependency cache settings
    pub cache: CacheConfig,

    /// Dependency installer settings
    pub installer: InstallerConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Isolation pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of isolation slots
    pub size: usize,

    /// How long `allocate` waits for a free slot (0 = fail fast)
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout_ms: 0,
        }
    }
}

impl PoolConfig {
    /// Bounded allocation wait, if enabled
    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_ms > 0).then(|| Duration::from_millis(self.acquire_timeout_ms))
    }
}

/// Per-execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Default wall-clock deadline
    pub timeout_ms: u64,

    /// Cap on captured stdout and stderr, each
    pub max_output_bytes: usize,

    /// How long output readers may drain after the process is gone
    pub kill_grace_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_output_bytes: 1024 * 1024,
            kill_grace_ms: 500,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Isolation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which backend drives the slots
    pub backend: BackendKind,

    /// Slot directories (process) or metadata files (isolate)
    pub root: Option<PathBuf>,

    /// Path or name of the isolate binary
    pub isolate_binary: String,

    /// Engine program and arguments
    pub engine_command: Vec<String>,

    /// Directory holding the engine, made visible to every slot
    pub engine_dir: Option<PathBuf>,

    /// Extra environment passed to the engine
    pub env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            root: None,
            isolate_binary: "isolate".to_string(),
            engine_command: vec!["node".to_string(), "main.js".to_string()],
            engine_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| ConfigManager::state_dir().join("slots"))
    }
}

/// Dependency cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache entry directories
    pub root: Option<PathBuf>,

    /// Downloaded package archives
    pub archive_dir: Option<PathBuf>,

    /// Idle entries kept before least-recently-released ones are evicted (0 = unlimited)
    pub max_entries: usize,

    /// `cache gc` removes entries older than N days (0 = disabled)
    pub gc_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            archive_dir: None,
            max_entries: 0,
            gc_days: 30,
        }
    }
}

impl CacheConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| ConfigManager::state_dir().join("cache"))
    }

    pub fn archive_root(&self) -> PathBuf {
        self.archive_dir
            .clone()
            .unwrap_or_else(|| ConfigManager::state_dir().join("archives"))
    }
}

/// Dependency installer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Package manager binary
    pub package_manager: String,

    /// Registry URL passed to the package manager
    pub registry: Option<String>,

    /// Blob store base URL for archive packages
    pub blob_url: Option<String>,

    /// Blob store directory, used when no URL is set
    pub blob_dir: Option<PathBuf>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            package_manager: "pnpm".to_string(),
            registry: None,
            blob_url: None,
            blob_dir: None,
        }
    }
}

impl InstallerConfig {
    pub fn blob_root(&self) -> PathBuf {
        self.blob_dir
            .clone()
            .unwrap_or_else(|| ConfigManager::state_dir().join("blobs"))
    }
}
