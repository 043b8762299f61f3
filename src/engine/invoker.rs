//! Runs one operation inside a provisioned slot
//!
//! The engine contract is file based: the operation is written to
//! `input.json` before the process starts and the result is read from
//! `output.json` after it exits. The process runs in its own process group so
//! a timeout can kill everything it spawned.

use crate::engine::operation::{EngineResult, ExecutionOperation, ExecutionOutcome, Verdict};
use crate::engine::provisioner::Lease;
use crate::error::{FlowboxError, FlowboxResult};
use crate::sandbox::{kill_process_group, ExitMeta, IsolationBackend, IsolationSlot, OutputCapture};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::process::Child;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one invocation, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InputWritten,
    Running,
    Completed,
    TimedOut,
    Crashed,
    Released,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InputWritten => "input-written",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed-out",
            Self::Crashed => "crashed",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// How long output pipes may stay open after the engine exits before its
/// process group is killed
const LINGER_CHECK: Duration = Duration::from_millis(200);

fn enter(id: Uuid, slot: usize, phase: Phase) {
    debug!("Execution {} (slot {}): {}", id, slot, phase);
}

/// Starts engine processes and classifies how they ended
pub struct ExecutionInvoker {
    backend: Arc<dyn IsolationBackend>,
    max_output_bytes: usize,
    kill_grace: Duration,
}

impl ExecutionInvoker {
    /// `backend` must be the one driving the slots leases come from
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        max_output_bytes: usize,
        kill_grace: Duration,
    ) -> Self {
        Self {
            backend,
            max_output_bytes,
            kill_grace,
        }
    }

    /// Run `operation` in the lease's slot with a wall-clock `deadline`.
    ///
    /// The lease is released on every path. Timeouts and engine failures come
    /// back as an outcome verdict; only failures to start or supervise the
    /// process are errors.
    pub async fn run(
        &self,
        lease: Lease,
        operation: &ExecutionOperation,
        deadline: Duration,
    ) -> FlowboxResult<ExecutionOutcome> {
        let execution_id = Uuid::new_v4();
        let slot_id = lease.slot().id();

        let result = self
            .invoke(execution_id, lease.slot(), operation, deadline)
            .await;
        let released = lease.release();
        enter(execution_id, slot_id, Phase::Released);

        match (result, released) {
            (Ok(outcome), Ok(())) => {
                info!(
                    "Execution {} finished: {} in {}ms",
                    execution_id, outcome.verdict, outcome.duration_ms
                );
                Ok(outcome)
            }
            (Err(e), Ok(())) => Err(e),
            (result, Err(release_err)) => {
                if let Err(e) = result {
                    error!("Execution {} failed before release error: {}", execution_id, e);
                }
                Err(release_err)
            }
        }
    }

    async fn invoke(
        &self,
        id: Uuid,
        slot: &IsolationSlot,
        operation: &ExecutionOperation,
        deadline: Duration,
    ) -> FlowboxResult<ExecutionOutcome> {
        let input = operation.to_wire()?;
        fs::write(slot.input_path(), &input).await.map_err(|e| {
            FlowboxError::io(format!("writing {}", slot.input_path().display()), e)
        })?;
        remove_stale(&slot.output_path()).await?;
        enter(id, slot.id(), Phase::InputWritten);

        let mut cmd = self.backend.command(slot, deadline)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            enter(id, slot.id(), Phase::Crashed);
            FlowboxError::ExecutionCrashed {
                reason: format!("failed to start engine: {}", e),
            }
        })?;
        let pid = child.id();
        let mut stdout = OutputCapture::spawn(child.stdout.take(), self.max_output_bytes);
        let mut stderr = OutputCapture::spawn(child.stderr.take(), self.max_output_bytes);
        enter(id, slot.id(), Phase::Running);

        let (timed_out, meta) = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                // Leftover group members still hold the pipes, which also
                // keeps the group id from being reused by another process.
                let closed = stdout.wait_closed(LINGER_CHECK).await
                    && stderr.wait_closed(LINGER_CHECK).await;
                if let (Some(pid), false) = (pid, closed) {
                    debug!("Engine exited with children still attached, killing group {}", pid);
                    if let Err(e) = kill_process_group(pid) {
                        warn!("Failed to reap process group {}: {}", pid, e);
                    }
                }
                enter(id, slot.id(), Phase::Completed);

                let meta = match self.backend.read_meta(slot, status).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!("Reading exit metadata for slot {}: {}", slot.id(), e);
                        ExitMeta::from_exit_status(status)
                    }
                };
                (meta.timed_out(), Some(meta))
            }
            Ok(Err(e)) => {
                self.terminate(pid, &mut child).await;
                enter(id, slot.id(), Phase::Crashed);
                let _ = stdout.finish(self.kill_grace).await;
                let _ = stderr.finish(self.kill_grace).await;
                return Err(FlowboxError::ExecutionCrashed {
                    reason: format!("waiting for engine: {}", e),
                });
            }
            Err(_) => {
                warn!(
                    "Execution {} exceeded {}ms on slot {}, killing",
                    id,
                    deadline.as_millis(),
                    slot.id()
                );
                self.terminate(pid, &mut child).await;
                enter(id, slot.id(), Phase::TimedOut);
                (true, None)
            }
        };

        let stdout = stdout.finish(self.kill_grace).await;
        let stderr = stderr.finish(self.kill_grace).await;
        let duration_ms = millis(started.elapsed());

        let result = if timed_out {
            None
        } else {
            read_result(&slot.output_path()).await
        };

        let clean = meta.as_ref().is_some_and(ExitMeta::is_clean);
        let verdict = if timed_out {
            Verdict::Timeout
        } else if clean && result.is_some() {
            Verdict::Success
        } else {
            Verdict::RuntimeError
        };

        Ok(ExecutionOutcome {
            execution_id: id,
            verdict,
            result,
            stdout,
            stderr,
            duration_ms,
            deadline_ms: millis(deadline),
            meta,
        })
    }

    /// SIGKILL the process group and the child, then reap it.
    ///
    /// Failures are logged; the caller's cleanup continues regardless.
    async fn terminate(&self, pid: Option<u32>, child: &mut Child) {
        if let Some(pid) = pid {
            if let Err(e) = kill_process_group(pid) {
                warn!("Failed to kill process group {}: {}", pid, e);
            }
        }
        if let Err(e) = child.start_kill() {
            debug!("Child kill: {}", e);
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to reap killed engine: {}", e),
            Err(_) => warn!("Engine did not exit within {:?} of SIGKILL", self.kill_grace),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

async fn remove_stale(path: &Path) -> FlowboxResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FlowboxError::io(format!("removing {}", path.display()), e)),
    }
}

async fn read_result(path: &Path) -> Option<EngineResult> {
    match fs::read(path).await {
        Ok(bytes) => Some(EngineResult::parse(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Reading result {}: {}", path.display(), e);
            None
        }
    }
}
