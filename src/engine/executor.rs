//! End-to-end execution: provision, invoke, release, audit

use crate::audit::AuditLog;
use crate::cache::{CacheEntryStatus, CachePool, DependencyFingerprint};
use crate::config::Config;
use crate::engine::invoker::ExecutionInvoker;
use crate::engine::operation::{ExecutionOperation, ExecutionOutcome};
use crate::engine::provisioner::Provisioner;
use crate::error::{FlowboxError, FlowboxResult};
use crate::install::{BlobStore, DependencyInstaller, FsBlobStore, HttpBlobStore, PnpmCli};
use crate::sandbox::{create_backend, IsolationPool, SlotStatus};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One execution request
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Dependencies the operation needs
    pub fingerprint: DependencyFingerprint,
    /// What to run
    pub operation: ExecutionOperation,
    /// Wall-clock deadline; the configured default when unset
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(fingerprint: DependencyFingerprint, operation: ExecutionOperation) -> Self {
        Self {
            fingerprint,
            operation,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Snapshot of both pools
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStatus {
    pub backend: &'static str,
    pub pool_size: usize,
    pub in_use: usize,
    pub slots: Vec<SlotStatus>,
    pub caches: Vec<CacheEntryStatus>,
}

/// Runs operations against the shared cache and slot pools
pub struct SandboxExecutor {
    provisioner: Provisioner,
    invoker: ExecutionInvoker,
    audit: AuditLog,
    default_timeout: Duration,
}

impl SandboxExecutor {
    /// Assemble an executor from its parts
    pub fn new(
        provisioner: Provisioner,
        invoker: ExecutionInvoker,
        audit: AuditLog,
        default_timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            invoker,
            audit,
            default_timeout,
        }
    }

    /// Wire the configured backend, installer and pools
    pub fn from_config(config: &Config) -> FlowboxResult<Self> {
        let backend = create_backend(config)?;

        let blobs: Arc<dyn BlobStore> = match &config.installer.blob_url {
            Some(url) => Arc::new(HttpBlobStore::new(url.clone())),
            None => Arc::new(FsBlobStore::new(config.installer.blob_root())),
        };
        let package_manager = Arc::new(PnpmCli::new(
            config.installer.package_manager.clone(),
            config.installer.registry.clone(),
        ));
        let installer = Arc::new(DependencyInstaller::new(
            config.cache.archive_root(),
            blobs,
            package_manager,
        ));

        let caches = Arc::new(CachePool::new(
            config.cache.root_dir(),
            installer,
            config.cache.max_entries,
        ));
        let slots = Arc::new(IsolationPool::new(config.pool.size, Arc::clone(&backend))?);

        debug!(
            "Executor: {} backend, {} slots, cache at {}",
            backend.backend_name(),
            config.pool.size,
            config.cache.root_dir().display()
        );

        Ok(Self::new(
            Provisioner::new(caches, slots, config.pool.acquire_timeout()),
            ExecutionInvoker::new(
                backend,
                config.execution.max_output_bytes,
                config.execution.kill_grace(),
            ),
            AuditLog::new(config),
            config.execution.timeout(),
        ))
    }

    /// Fail early when the configured backend cannot run anything
    pub async fn ensure_backend(&self) -> FlowboxResult<()> {
        let backend = self.provisioner.slots().backend();
        if backend.is_available().await? {
            Ok(())
        } else {
            Err(FlowboxError::BackendUnavailable(format!(
                "{} backend is not usable on this machine",
                backend.backend_name()
            )))
        }
    }

    /// Run one request.
    ///
    /// Dropping the returned future releases whatever was provisioned and
    /// kills the engine process.
    pub async fn execute(&self, request: &ExecutionRequest) -> FlowboxResult<ExecutionOutcome> {
        request.fingerprint.validate()?;
        let deadline = request.timeout.unwrap_or(self.default_timeout);
        let cache_key = request.fingerprint.key();

        let lease = self.provisioner.provision(&request.fingerprint).await?;
        let slot_id = lease.slot().id();
        let outcome = self
            .invoker
            .run(lease, &request.operation, deadline)
            .await;

        match self.provisioner.caches().evict_idle().await {
            Ok(evicted) if !evicted.is_empty() => debug!("Evicted {} idle cache entries", evicted.len()),
            Ok(_) => {}
            Err(e) => warn!("Cache eviction failed: {}", e),
        }

        let data = match &outcome {
            Ok(o) => serde_json::json!({
                "executionId": o.execution_id,
                "operationType": request.operation.operation_type,
                "cacheKey": cache_key,
                "slot": slot_id,
                "verdict": o.verdict,
                "durationMs": o.duration_ms,
            }),
            Err(e) => serde_json::json!({
                "operationType": request.operation.operation_type,
                "cacheKey": cache_key,
                "slot": slot_id,
                "error": e.to_string(),
            }),
        };
        self.audit.log("execution.completed", &data).await;

        outcome
    }

    /// Run requests concurrently; results keep request order.
    ///
    /// Requests beyond the pool size fail with `PoolExhausted` unless an
    /// acquire timeout is configured.
    pub async fn execute_batch(
        &self,
        requests: &[ExecutionRequest],
    ) -> Vec<FlowboxResult<ExecutionOutcome>> {
        join_all(requests.iter().map(|r| self.execute(r))).await
    }

    pub fn status(&self) -> ExecutorStatus {
        let slots = self.provisioner.slots();
        ExecutorStatus {
            backend: slots.backend().backend_name(),
            pool_size: slots.size(),
            in_use: slots.in_use(),
            slots: slots.snapshot(),
            caches: self.provisioner.caches().snapshot(),
        }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cache::PackageSpec;
    use crate::engine::operation::{OperationType, Verdict};
    use crate::sandbox::{IsolationBackend, ProcessBackend};
    use crate::test_support::{CountingBlobStore, RecordingPackageManager};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        pm: Arc<RecordingPackageManager>,
        executor: SandboxExecutor,
    }

    fn harness(size: usize, script: &str) -> Harness {
        let dir = TempDir::new().unwrap();
        let pm = Arc::new(RecordingPackageManager::new());
        let installer = Arc::new(DependencyInstaller::new(
            dir.path().join("archives"),
            Arc::new(CountingBlobStore::new()),
            pm.clone(),
        ));
        let caches = Arc::new(CachePool::new(dir.path().join("cache"), installer, 0));
        let backend: Arc<dyn IsolationBackend> = Arc::new(ProcessBackend::new(
            dir.path().join("slots"),
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            None,
            BTreeMap::new(),
        ));
        let slots = Arc::new(IsolationPool::new(size, Arc::clone(&backend)).unwrap());
        let audit = AuditLog::with_path(true, dir.path().join("audit.log"));

        let executor = SandboxExecutor::new(
            Provisioner::new(caches, slots, None),
            ExecutionInvoker::new(backend, 4096, Duration::from_millis(200)),
            audit,
            Duration::from_secs(5),
        );
        Harness { dir, pm, executor }
    }

    fn request(piece: &str) -> ExecutionRequest {
        ExecutionRequest::new(
            DependencyFingerprint::new(vec![PackageSpec::registry(piece, "1.0.0")]),
            ExecutionOperation::new(OperationType::ExecuteFlow, json!({"flowVersionId": "fv_1"})),
        )
    }

    const ECHO: &str = r#"cp "$FLOWBOX_INPUT" "$FLOWBOX_OUTPUT""#;

    #[tokio::test]
    async fn execute_records_audit_event() {
        let h = harness(1, ECHO);
        let outcome = h.executor.execute(&request("@flowbox/piece-http")).await.unwrap();
        assert!(outcome.is_success());

        let log = tokio::fs::read_to_string(h.dir.path().join("audit.log"))
            .await
            .unwrap();
        let entry: serde_json::Value = serde_json::from_str(log.trim()).unwrap();
        assert_eq!(entry["event"], "execution.completed");
        assert_eq!(entry["data"]["verdict"], "success");
        assert_eq!(entry["data"]["slot"], 0);
    }

    #[tokio::test]
    async fn process_backend_is_available() {
        let h = harness(1, ECHO);
        h.executor.ensure_backend().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_fingerprint_is_rejected_before_provisioning() {
        let h = harness(1, ECHO);
        let mut req = request("@flowbox/piece-http");
        req.fingerprint = DependencyFingerprint::new(vec![PackageSpec::registry("", "1.0.0")]);

        let err = h.executor.execute(&req).await.unwrap_err();
        assert!(matches!(err, FlowboxError::InvalidSpec { .. }));
        assert_eq!(h.pm.add_count(), 0);
        assert_eq!(h.executor.status().in_use, 0);
    }

    #[tokio::test]
    async fn batch_beyond_pool_size_fails_fast() {
        let h = harness(1, "sleep 0.2; echo '{}' > \"$FLOWBOX_OUTPUT\"");
        let requests = vec![request("@flowbox/piece-http"), request("@flowbox/piece-http")];

        let results = h.executor.execute_batch(&requests).await;

        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(FlowboxError::PoolExhausted { size: 1 })))
            .count();
        let succeeded = results
            .iter()
            .filter(|r| r.as_ref().is_ok_and(|o| o.verdict == Verdict::Success))
            .count();
        assert_eq!((succeeded, exhausted), (1, 1));
        assert_eq!(h.pm.add_count(), 1);
        assert_eq!(h.executor.status().in_use, 0);
    }

    #[tokio::test]
    async fn cancelled_execution_releases_everything() {
        let h = harness(1, "sleep 5");
        let req = request("@flowbox/piece-http");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(200),
            h.executor.execute(&req),
        )
        .await;
        assert!(cancelled.is_err());

        let status = h.executor.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.caches[0].ref_count, 0);
    }

    #[tokio::test]
    async fn status_after_execution_shows_idle_ready_cache() {
        let h = harness(2, ECHO);
        h.executor.execute(&request("@flowbox/piece-http")).await.unwrap();

        let status = h.executor.status();
        assert_eq!(status.backend, "process");
        assert_eq!(status.pool_size, 2);
        assert!(status.slots.iter().all(|s| !s.in_use && s.cache_key.is_none()));
        assert_eq!(status.caches.len(), 1);
        assert_eq!(status.caches[0].state, crate::cache::CacheState::Ready);
        assert_eq!(status.caches[0].ref_count, 0);
    }
}
