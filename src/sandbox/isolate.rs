//! `isolate` backend
//!
//! Each slot maps to one isolate box (`--box-id` = slot id). Recreating a slot
//! runs `--cleanup` then `--init`, which discards every file and process the
//! previous run left behind. The cache entry is mounted read-only at `/cache`
//! when the engine starts, so binding is recorded on the slot and applied by
//! [`IsolateBackend::run_args`].

use crate::error::{FlowboxError, FlowboxResult};
use crate::sandbox::backend::IsolationBackend;
use crate::sandbox::meta::ExitMeta;
use crate::sandbox::pool::IsolationSlot;
use crate::sandbox::{
    tail_output, ENV_CACHE, ENV_ENGINE_DIR, ENV_INPUT, ENV_OUTPUT, INPUT_FILE, OUTPUT_FILE,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

/// Working directory inside every box
const BOX_DIR: &str = "/box";

/// Mount point of the bound cache inside every box
const BOX_CACHE_DIR: &str = "/cache";

/// Process limit inside a box
const MAX_PROCESSES: u32 = 64;

/// Slack given to isolate's own wall-time limit past the invoker's deadline
const WALL_TIME_SLACK: Duration = Duration::from_secs(1);

/// Drives isolate boxes through the `isolate` command-line tool
pub struct IsolateBackend {
    binary: String,
    meta_dir: PathBuf,
    engine_command: Vec<String>,
    engine_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl IsolateBackend {
    /// Create a backend. Metadata files are written under `meta_dir`.
    pub fn new(
        binary: impl Into<String>,
        meta_dir: PathBuf,
        engine_command: Vec<String>,
        engine_dir: Option<PathBuf>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            meta_dir,
            engine_command,
            engine_dir,
            env,
        }
    }

    /// Metadata file for a slot
    pub fn meta_path(&self, slot_id: usize) -> PathBuf {
        self.meta_dir.join(format!("slot-{}.meta", slot_id))
    }

    /// Full `isolate --run` argument list for a slot
    pub fn run_args(&self, slot: &IsolationSlot, deadline: Duration) -> FlowboxResult<Vec<String>> {
        if self.engine_command.is_empty() {
            return Err(FlowboxError::User(
                "sandbox.engine_command is empty".to_string(),
            ));
        }

        let wall = deadline + WALL_TIME_SLACK;
        let mut args = vec![
            format!("--box-id={}", slot.id()),
            format!("--meta={}", self.meta_path(slot.id()).display()),
            format!("--time={:.3}", deadline.as_secs_f64()),
            format!("--wall-time={:.3}", wall.as_secs_f64()),
            format!("--processes={}", MAX_PROCESSES),
            format!("--chdir={}", BOX_DIR),
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            format!("--env=HOME={}", BOX_DIR),
            format!("--env={}={}/{}", ENV_INPUT, BOX_DIR, INPUT_FILE),
            format!("--env={}={}/{}", ENV_OUTPUT, BOX_DIR, OUTPUT_FILE),
        ];

        if let Some(cache) = slot.cache() {
            // isolate mounts --dir read-only unless `:rw` is given
            args.push(format!("--dir={}={}", BOX_CACHE_DIR, cache.path.display()));
            args.push(format!("--env={}={}", ENV_CACHE, BOX_CACHE_DIR));
            args.push(format!("--env=NODE_PATH={}/node_modules", BOX_CACHE_DIR));
        }
        if let Some(ref dir) = self.engine_dir {
            args.push(format!("--dir={}", dir.display()));
            args.push(format!("--env={}={}", ENV_ENGINE_DIR, dir.display()));
        }
        for (key, value) in &self.env {
            args.push(format!("--env={}={}", key, value));
        }

        args.push("--run".to_string());
        args.push("--".to_string());
        args.extend(self.engine_command.iter().cloned());
        Ok(args)
    }

    /// Run an isolate management command and return its stdout
    async fn exec(&self, args: &[String]) -> FlowboxResult<String> {
        debug!("Executing: {} {:?}", self.binary, args);

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FlowboxError::command_failed(format!("{} {:?}", self.binary, args), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(FlowboxError::command_exec(
                format!("{} {}", self.binary, args.join(" ")),
                tail_output(&stdout, &stderr),
            ))
        }
    }
}

#[async_trait]
impl IsolationBackend for IsolateBackend {
    async fn is_available(&self) -> FlowboxResult<bool> {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        Ok(status.map(|s| s.success()).unwrap_or(false))
    }

    async fn recreate(&self, slot_id: usize) -> FlowboxResult<PathBuf> {
        let box_id = format!("--box-id={}", slot_id);
        self.exec(&[box_id.clone(), "--cleanup".to_string()]).await?;
        let root = self.exec(&[box_id, "--init".to_string()]).await?;

        let root = root.trim();
        if root.is_empty() {
            return Err(FlowboxError::command_exec(
                format!("{} --init", self.binary),
                "no box path printed",
            ));
        }

        fs::create_dir_all(&self.meta_dir).await.map_err(|e| {
            FlowboxError::io(format!("creating meta dir {}", self.meta_dir.display()), e)
        })?;
        let meta = self.meta_path(slot_id);
        match fs::remove_file(&meta).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FlowboxError::io(format!("removing {}", meta.display()), e)),
        }

        let workdir = Path::new(root).join("box");
        debug!("Recreated box {} at {}", slot_id, workdir.display());
        Ok(workdir)
    }

    async fn bind_cache(&self, slot: &IsolationSlot, cache_path: &Path) -> FlowboxResult<()> {
        // Mounted at --run time
        if !cache_path.is_dir() {
            return Err(FlowboxError::invariant(format!(
                "cache {} for slot {} is not a directory",
                cache_path.display(),
                slot.id()
            )));
        }
        Ok(())
    }

    fn command(&self, slot: &IsolationSlot, deadline: Duration) -> FlowboxResult<Command> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.run_args(slot, deadline)?);
        Ok(cmd)
    }

    async fn read_meta(&self, slot: &IsolationSlot, status: ExitStatus) -> FlowboxResult<ExitMeta> {
        let path = self.meta_path(slot.id());
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(ExitMeta::parse(&content)),
            Err(e) => {
                warn!(
                    "No metadata for slot {} at {}: {}",
                    slot.id(),
                    path.display(),
                    e
                );
                Ok(ExitMeta::from_exit_status(status))
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "isolate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheRef;
    use crate::sandbox::meta::MetaStatus;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> IsolateBackend {
        IsolateBackend::new(
            "isolate",
            dir.path().join("meta"),
            vec!["/usr/bin/node".to_string(), "/opt/engine/main.js".to_string()],
            Some(PathBuf::from("/opt/engine")),
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn run_args_mount_cache_and_limit_time() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let mut slot = IsolationSlot::new(3, dir.path().join("box"));
        slot.set_cache(CacheRef {
            key: "abc".to_string(),
            path: PathBuf::from("/var/flowbox/cache/abc"),
        });

        let args = backend.run_args(&slot, Duration::from_millis(1500)).unwrap();

        assert!(args.contains(&"--box-id=3".to_string()));
        assert!(args.contains(&"--time=1.500".to_string()));
        assert!(args.contains(&"--wall-time=2.500".to_string()));
        assert!(args.contains(&"--dir=/cache=/var/flowbox/cache/abc".to_string()));
        assert!(args.contains(&"--env=FLOWBOX_INPUT=/box/input.json".to_string()));
        assert!(args.contains(&"--dir=/opt/engine".to_string()));

        let run = args.iter().position(|a| a == "--run").unwrap();
        assert_eq!(&args[run + 1..], ["--", "/usr/bin/node", "/opt/engine/main.js"]);
    }

    #[tokio::test]
    async fn run_args_without_cache_skip_mount() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let slot = IsolationSlot::new(0, dir.path().join("box"));

        let args = backend.run_args(&slot, Duration::from_secs(1)).unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--dir=/cache")));
    }

    #[tokio::test]
    async fn read_meta_parses_file() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        std::fs::create_dir_all(dir.path().join("meta")).unwrap();
        std::fs::write(backend.meta_path(1), "status:TO\nkilled:1\n").unwrap();

        let slot = IsolationSlot::new(1, dir.path().join("box"));
        let meta = backend.read_meta(&slot, exit_status(1)).await.unwrap();
        assert_eq!(meta.status, Some(MetaStatus::TimedOut));
    }

    #[tokio::test]
    async fn missing_meta_falls_back_to_exit_status() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir);
        let slot = IsolationSlot::new(2, dir.path().join("box"));

        let meta = backend.read_meta(&slot, exit_status(2)).await.unwrap();
        assert_eq!(meta.exit_code, Some(2));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let backend = IsolateBackend::new(
            "flowbox-no-such-isolate",
            dir.path().to_path_buf(),
            vec![],
            None,
            BTreeMap::new(),
        );
        assert!(!backend.is_available().await.unwrap());
        assert!(backend.recreate(0).await.is_err());
    }

    #[cfg(unix)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }
}
