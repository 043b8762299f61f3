//! Flow execution over the cache and isolation pools
//!
//! [`Provisioner`] pairs a ready dependency cache with a free slot,
//! [`ExecutionInvoker`] runs one engine process in it under a deadline, and
//! [`SandboxExecutor`] ties both to configuration and the audit log.

mod executor;
mod invoker;
mod operation;
mod provisioner;

pub use executor::{ExecutionRequest, ExecutorStatus, SandboxExecutor};
pub use invoker::ExecutionInvoker;
pub use operation::{EngineResult, ExecutionOperation, ExecutionOutcome, OperationType, Verdict};
pub use provisioner::{Lease, Provisioner};
