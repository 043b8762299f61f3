//! Plain-process backend
//!
//! Each slot is a private directory under the backend root and the engine runs
//! as an ordinary child process with a scrubbed environment. The bound cache
//! is linked in as `cache/`; its whole tree is sealed read-only by the cache pool.
//! This backend offers no kernel-level isolation and is meant for development
//! machines and tests.

use crate::error::{FlowboxError, FlowboxResult};
use crate::sandbox::backend::IsolationBackend;
use crate::sandbox::meta::ExitMeta;
use crate::sandbox::pool::IsolationSlot;
use crate::sandbox::{ENV_CACHE, ENV_ENGINE_DIR, ENV_INPUT, ENV_OUTPUT};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

/// Name of the cache link inside a slot directory
const CACHE_LINK: &str = "cache";

/// Fallback PATH when the host has none
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs the engine as a child process in a per-slot directory
pub struct ProcessBackend {
    root: PathBuf,
    engine_command: Vec<String>,
    engine_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl ProcessBackend {
    /// Create a backend with slot directories under `root`
    pub fn new(
        root: PathBuf,
        engine_command: Vec<String>,
        engine_dir: Option<PathBuf>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            root,
            engine_command,
            engine_dir,
            env,
        }
    }

    fn slot_dir(&self, slot_id: usize) -> PathBuf {
        self.root.join(format!("slot-{}", slot_id))
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    async fn is_available(&self) -> FlowboxResult<bool> {
        Ok(!self.engine_command.is_empty())
    }

    async fn recreate(&self, slot_id: usize) -> FlowboxResult<PathBuf> {
        let dir = self.slot_dir(slot_id);

        // remove_dir_all does not follow the cache symlink
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FlowboxError::io(
                    format!("clearing slot dir {}", dir.display()),
                    e,
                ))
            }
        }

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| FlowboxError::io(format!("creating slot dir {}", dir.display()), e))?;

        debug!("Recreated slot {} at {}", slot_id, dir.display());
        Ok(dir)
    }

    async fn bind_cache(&self, slot: &IsolationSlot, cache_path: &Path) -> FlowboxResult<()> {
        let link = slot.workdir().join(CACHE_LINK);
        match fs::remove_file(&link).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FlowboxError::io(format!("removing {}", link.display()), e)),
        }

        link_cache(cache_path, &link).await.map_err(|e| {
            FlowboxError::io(
                format!("linking {} -> {}", link.display(), cache_path.display()),
                e,
            )
        })
    }

    fn command(&self, slot: &IsolationSlot, _deadline: Duration) -> FlowboxResult<Command> {
        let (program, args) = self
            .engine_command
            .split_first()
            .ok_or_else(|| FlowboxError::User("sandbox.engine_command is empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(slot.workdir())
            .env_clear()
            .env(
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into()),
            )
            .env("HOME", slot.workdir())
            .env(ENV_INPUT, slot.input_path())
            .env(ENV_OUTPUT, slot.output_path());

        if slot.cache().is_some() {
            let cache = slot.workdir().join(CACHE_LINK);
            cmd.env("NODE_PATH", cache.join("node_modules"));
            cmd.env(ENV_CACHE, cache);
        }
        if let Some(ref dir) = self.engine_dir {
            cmd.env(ENV_ENGINE_DIR, dir);
        }
        cmd.envs(&self.env);

        Ok(cmd)
    }

    async fn read_meta(&self, _slot: &IsolationSlot, status: ExitStatus) -> FlowboxResult<ExitMeta> {
        Ok(ExitMeta::from_exit_status(status))
    }

    fn backend_name(&self) -> &'static str {
        "process"
    }
}

#[cfg(unix)]
async fn link_cache(cache_path: &Path, link: &Path) -> std::io::Result<()> {
    fs::symlink(cache_path, link).await
}

#[cfg(not(unix))]
async fn link_cache(_cache_path: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process backend needs symlink support",
    ))
}
