//! Backend factory for creating the configured isolation backend

use crate::config::Config;
use crate::error::FlowboxResult;
use crate::sandbox::backend::IsolationBackend;
use crate::sandbox::isolate::IsolateBackend;
use crate::sandbox::process::ProcessBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Selectable isolation backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plain child processes in per-slot directories
    #[default]
    Process,
    /// isolate boxes (namespaces + cgroups)
    Isolate,
}

impl BackendKind {
    /// Get a human-readable backend name
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Isolate => "isolate",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Create the isolation backend selected by `sandbox.backend`
pub fn create_backend(config: &Config) -> FlowboxResult<Arc<dyn IsolationBackend>> {
    let sandbox = &config.sandbox;
    let backend: Arc<dyn IsolationBackend> = match sandbox.backend {
        BackendKind::Process => Arc::new(ProcessBackend::new(
            sandbox.root_dir(),
            sandbox.engine_command.clone(),
            sandbox.engine_dir.clone(),
            sandbox.env.clone(),
        )),
        BackendKind::Isolate => Arc::new(IsolateBackend::new(
            sandbox.isolate_binary.clone(),
            sandbox.root_dir().join("meta"),
            sandbox.engine_command.clone(),
            sandbox.engine_dir.clone(),
            sandbox.env.clone(),
        )),
    };
    Ok(backend)
}
