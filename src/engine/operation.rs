//! Operations sent to the engine and the outcomes it produces

use crate::error::{FlowboxError, FlowboxResult};
use crate::sandbox::ExitMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Kind of work the engine is asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    ExecuteFlow,
    ExecuteStep,
    ExecuteTriggerHook,
    ExecuteProperty,
    ExecuteValidateAuth,
    ExtractPieceMetadata,
}

/// One unit of work for one slot and one engine process.
///
/// The payload is opaque to this crate; it is written verbatim into the
/// operation file as `{"operationType": ..., "operation": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOperation {
    pub operation_type: OperationType,
    pub operation: Value,
}

impl ExecutionOperation {
    pub fn new(operation_type: OperationType, operation: Value) -> Self {
        Self {
            operation_type,
            operation,
        }
    }

    /// Serialized operation file contents
    pub fn to_wire(&self) -> FlowboxResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Classified result of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Verdict {
    Success,
    Timeout,
    RuntimeError,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Timeout => write!(f, "timeout"),
            Self::RuntimeError => write!(f, "runtimeError"),
        }
    }
}

/// Result file contents: parsed JSON when possible, raw text otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EngineResult {
    Json(Value),
    Raw(String),
}

impl EngineResult {
    /// Best-effort parse; malformed output is kept as text
    pub fn parse(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(text),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}

/// Everything one invocation produced; owned by the caller once returned
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub verdict: Verdict,
    pub result: Option<EngineResult>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub deadline_ms: u64,
    pub meta: Option<ExitMeta>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }

    /// Turn a non-success verdict into the matching error
    pub fn into_result(self) -> FlowboxResult<Self> {
        match self.verdict {
            Verdict::Success => Ok(self),
            Verdict::Timeout => Err(FlowboxError::ExecutionTimeout {
                timeout_ms: self.deadline_ms,
            }),
            Verdict::RuntimeError => {
                let reason = match (&self.meta, &self.result) {
                    (Some(meta), _) if !meta.is_clean() => meta.describe(),
                    (_, None) => "engine produced no result".to_string(),
                    _ => "engine failed".to_string(),
                };
                Err(FlowboxError::ExecutionCrashed { reason })
            }
        }
    }
}
