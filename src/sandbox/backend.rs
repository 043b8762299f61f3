//! Isolation backend abstraction
//!
//! Provides a trait for slot operations that can be implemented by different
//! backends (isolate boxes in production, plain processes for development).

use crate::error::FlowboxResult;
use crate::sandbox::meta::ExitMeta;
use crate::sandbox::pool::IsolationSlot;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;

/// Abstract isolation backend interface
///
/// This trait allows the pool to drive different isolation mechanisms:
/// - `isolate`: namespaces + cgroups, cache mounted read-only
/// - `process`: a private directory per slot, cache linked in
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Check if the backend can run on this system
    async fn is_available(&self) -> FlowboxResult<bool>;

    /// Reset a slot to a clean state and return its host-side working directory.
    ///
    /// Any files or processes left by a previous occupant are discarded.
    async fn recreate(&self, slot_id: usize) -> FlowboxResult<PathBuf>;

    /// Make `cache_path` visible to the slot, read-only from the engine's side
    async fn bind_cache(&self, slot: &IsolationSlot, cache_path: &Path) -> FlowboxResult<()>;

    /// Build the command that runs the engine inside the slot.
    ///
    /// `deadline` is the wall-clock budget; backends may pass it on as a
    /// second line of defence, the invoker enforces it regardless.
    fn command(&self, slot: &IsolationSlot, deadline: Duration) -> FlowboxResult<Command>;

    /// Read exit metadata once the engine process has exited
    async fn read_meta(&self, slot: &IsolationSlot, status: ExitStatus) -> FlowboxResult<ExitMeta>;

    /// Get the human-readable backend name for display
    fn backend_name(&self) -> &'static str;
}
