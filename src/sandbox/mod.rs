//! Isolation slots and the backends that run engine processes inside them
//!
//! Provides a fixed pool of reusable slots over a pluggable backend:
//! - `isolate`: each slot is an isolate box, the cache is mounted read-only
//! - `process`: each slot is a plain directory, for development and tests

mod backend;
mod factory;
mod isolate;
mod meta;
mod pool;
mod process;

pub use backend::IsolationBackend;
pub use factory::{create_backend, BackendKind};
pub use isolate::IsolateBackend;
pub use meta::{ExitMeta, MetaStatus};
pub use pool::{IsolationPool, IsolationSlot, SlotStatus};
pub use process::ProcessBackend;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::warn;

/// Operation file written into the slot before the engine starts
pub const INPUT_FILE: &str = "input.json";

/// Result file the engine writes before exiting
pub const OUTPUT_FILE: &str = "output.json";

/// Engine env var: path of the operation file
pub const ENV_INPUT: &str = "FLOWBOX_INPUT";

/// Engine env var: path the result file must be written to
pub const ENV_OUTPUT: &str = "FLOWBOX_OUTPUT";

/// Engine env var: root of the bound dependency cache
pub const ENV_CACHE: &str = "FLOWBOX_CACHE";

/// Engine env var: directory holding the engine itself
pub const ENV_ENGINE_DIR: &str = "FLOWBOX_ENGINE_DIR";

/// Marker appended to captured output that hit the size limit
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Max number of output lines to include in tool error messages.
const ERROR_TAIL_LINES: usize = 50;

/// Extract the useful tail of tool output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `ERROR_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub(crate) fn tail_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > ERROR_TAIL_LINES {
        lines[total - ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// Background reader that accumulates a child stream up to a byte limit.
///
/// Bytes past the limit are read and discarded so the child never blocks on a
/// full pipe.
pub(crate) struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    truncated: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl OutputCapture {
    /// Start draining `reader`. A missing stream yields empty output.
    pub(crate) fn spawn<R>(reader: Option<R>, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let truncated = Arc::new(AtomicBool::new(false));

        let task = reader.map(|mut reader| {
            let buffer = Arc::clone(&buffer);
            let truncated = Arc::clone(&truncated);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    let n = match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let mut buf = buffer.lock();
                    let room = limit.saturating_sub(buf.len());
                    if n > room {
                        truncated.store(true, Ordering::Relaxed);
                    }
                    buf.extend_from_slice(&chunk[..n.min(room)]);
                }
            })
        });

        Self {
            buffer,
            truncated,
            task,
        }
    }

    /// Wait up to `wait` for the stream to reach EOF; false if it is still open
    pub(crate) async fn wait_closed(&mut self, wait: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        if tokio::time::timeout(wait, task).await.is_err() {
            return false;
        }
        self.task = None;
        true
    }

    /// Wait up to `grace` for the stream to close, then return what was read
    pub(crate) async fn finish(mut self, grace: Duration) -> String {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!("Output stream still open after {:?}, abandoning reader", grace);
                task.abort();
            }
        }

        let bytes = std::mem::take(&mut *self.buffer.lock());
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if self.truncated.load(Ordering::Relaxed) {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Send SIGKILL to every process in the group led by `pid`.
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;

    // SAFETY: killpg only sends a signal; it has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) -> std::io::Result<()> {
    Ok(())
}
