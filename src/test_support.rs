//! Test doubles shared by unit tests

use crate::error::{FlowboxError, FlowboxResult};
use crate::install::{BlobStore, PackageManager};
use crate::sandbox::{ExitMeta, IsolationBackend, IsolationSlot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;

/// Blob store that counts fetches and returns synthetic bytes
pub(crate) struct CountingBlobStore {
    fetches: AtomicUsize,
    fail: bool,
}

impl CountingBlobStore {
    pub(crate) fn new() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn fetch(&self, archive_id: &str) -> FlowboxResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail {
            return Err(FlowboxError::ArchiveFetch {
                archive_id: archive_id.to_string(),
                reason: "blob store offline".to_string(),
            });
        }
        Ok(format!("archive:{}", archive_id).into_bytes())
    }

    fn store_name(&self) -> &'static str {
        "counting"
    }
}

/// Package manager that records calls and fakes an install on disk.
///
/// Packages whose argument contains `slow` wait on the gate until the test
/// opens it.
pub(crate) struct RecordingPackageManager {
    calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
    fail: AtomicBool,
    gate: Arc<Semaphore>,
}

impl RecordingPackageManager {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub(crate) fn failing() -> Self {
        let pm = Self::new();
        pm.set_failing(true);
        pm
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub(crate) fn add_calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.lock().clone()
    }

    pub(crate) fn add_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl PackageManager for RecordingPackageManager {
    async fn init(&self, dir: &Path) -> FlowboxResult<()> {
        let manifest = dir.join("package.json");
        if !manifest.exists() {
            tokio::fs::write(&manifest, r#"{"name":"flowbox-cache"}"#)
                .await
                .map_err(|e| FlowboxError::io("writing package.json", e))?;
        }
        Ok(())
    }

    async fn add(&self, dir: &Path, packages: &[String]) -> FlowboxResult<()> {
        self.calls
            .lock()
            .push((dir.to_path_buf(), packages.to_vec()));

        if packages.iter().any(|p| p.contains("slow")) {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| FlowboxError::Internal(e.to_string()))?;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        if self.fail.load(Ordering::SeqCst) {
            return Err(FlowboxError::command_exec("pnpm add", "ERR_PNPM_FETCH_404"));
        }

        for package in packages {
            let name = package.rsplit_once('@').map(|(n, _)| n).unwrap_or(package);
            let module_dir = dir.join("node_modules").join(name.trim_start_matches('@'));
            tokio::fs::create_dir_all(&module_dir)
                .await
                .map_err(|e| FlowboxError::io("creating module dir", e))?;
            tokio::fs::write(module_dir.join("index.js"), "module.exports = {}")
                .await
                .map_err(|e| FlowboxError::io("writing module", e))?;
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn tool_name(&self) -> &str {
        "recording"
    }
}

/// Isolation backend with a scripted `recreate` outcome and no real processes
pub(crate) struct FakeBackend {
    root: PathBuf,
    fail_recreate: AtomicBool,
    recreates: AtomicUsize,
}

impl FakeBackend {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            root,
            fail_recreate: AtomicBool::new(false),
            recreates: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_fail_recreate(&self, fail: bool) {
        self.fail_recreate.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn recreate_count(&self) -> usize {
        self.recreates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    async fn is_available(&self) -> FlowboxResult<bool> {
        Ok(true)
    }

    async fn recreate(&self, slot_id: usize) -> FlowboxResult<PathBuf> {
        self.recreates.fetch_add(1, Ordering::SeqCst);
        if self.fail_recreate.load(Ordering::SeqCst) {
            return Err(FlowboxError::command_exec("fake --init", "box busy"));
        }
        Ok(self.root.join(format!("slot-{}", slot_id)))
    }

    async fn bind_cache(&self, _slot: &IsolationSlot, _cache_path: &Path) -> FlowboxResult<()> {
        Ok(())
    }

    fn command(&self, _slot: &IsolationSlot, _deadline: Duration) -> FlowboxResult<Command> {
        Ok(Command::new("true"))
    }

    async fn read_meta(&self, _slot: &IsolationSlot, status: ExitStatus) -> FlowboxResult<ExitMeta> {
        Ok(ExitMeta::from_exit_status(status))
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}
