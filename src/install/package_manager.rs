//! Package-manager tool used to materialize dependencies
//!
//! The tool is always run with offline-preferring, script-disabled and
//! lockfile-disabled flags so installing a package cannot execute code
//! shipped inside it.

use crate::error::{FlowboxError, FlowboxResult};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Flags appended to every `add` invocation
pub const SAFE_ADD_FLAGS: &[&str] = &[
    "--prefer-offline",
    "--ignore-scripts",
    "--config.lockfile=false",
    "--config.auto-install-peers=true",
];

/// External dependency resolver
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Prepare `dir` as an installable project
    async fn init(&self, dir: &Path) -> FlowboxResult<()>;

    /// Add the given install arguments (`name@version` or `name@file:path`) into `dir`
    async fn add(&self, dir: &Path, packages: &[String]) -> FlowboxResult<()>;

    /// Check whether the tool is usable on this machine
    async fn is_available(&self) -> bool;

    /// Tool name for display
    fn tool_name(&self) -> &str;
}

/// `pnpm` command-line package manager
pub struct PnpmCli {
    binary: String,
    registry: Option<String>,
}

impl PnpmCli {
    /// Create a wrapper around the given binary
    pub fn new(binary: impl Into<String>, registry: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            registry,
        }
    }

    /// Arguments for an `add` invocation
    pub fn add_args(&self, packages: &[String]) -> Vec<String> {
        let mut args = vec!["add".to_string()];
        args.extend(packages.iter().cloned());
        args.extend(SAFE_ADD_FLAGS.iter().map(|s| s.to_string()));
        if let Some(ref registry) = self.registry {
            args.push(format!("--registry={}", registry));
        }
        args
    }

    /// Run the tool in `dir` and fail on non-zero exit
    async fn exec(&self, dir: &Path, args: &[String]) -> FlowboxResult<()> {
        debug!("Executing in {}: {} {:?}", dir.display(), self.binary, args);

        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FlowboxError::command_failed(format!("{} {:?}", self.binary, args), e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(FlowboxError::command_exec(
                format!("{} {}", self.binary, args.join(" ")),
                crate::sandbox::tail_output(&stdout, &stderr),
            ))
        }
    }
}

#[async_trait]
impl PackageManager for PnpmCli {
    async fn init(&self, dir: &Path) -> FlowboxResult<()> {
        if dir.join("package.json").exists() {
            return Ok(());
        }
        self.exec(dir, &["init".to_string()]).await
    }

    async fn add(&self, dir: &Path, packages: &[String]) -> FlowboxResult<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.exec(dir, &self.add_args(packages)).await
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn tool_name(&self) -> &str {
        &self.binary
    }
}
