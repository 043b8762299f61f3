//! Run command - execute one operation in a sandbox slot

use crate::cache::{DependencyFingerprint, PackageSpec};
use crate::cli::args::{OperationKind, RunArgs};
use crate::config::{Config, ConfigManager};
use crate::engine::{ExecutionOperation, ExecutionRequest, OperationType, SandboxExecutor};
use crate::error::{FlowboxError, FlowboxResult};
use crate::ui::{TaskSpinner, UiContext};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Execute the run command.
///
/// The outcome is printed as JSON on stdout; any verdict other than success
/// is returned as an error so the process exits non-zero.
pub async fn execute(args: RunArgs, config: &Config) -> FlowboxResult<()> {
    let payload = read_operation(&args.operation).await?;
    let fingerprint = build_fingerprint(&args)?;
    debug!("Fingerprint {} ({:?})", fingerprint.key(), fingerprint.describe());

    let mut request = ExecutionRequest::new(
        fingerprint,
        ExecutionOperation::new(operation_type(args.operation_type), payload),
    );
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }

    ConfigManager::ensure_state_dirs(config).await?;
    let executor = SandboxExecutor::from_config(config)?;
    executor.ensure_backend().await?;

    let ctx = UiContext::detect();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Executing operation...");

    // Dropping the execution on Ctrl-C kills the engine and releases its slot
    let result = tokio::select! {
        result = executor.execute(&request) => result,
        _ = tokio::signal::ctrl_c() => {
            spinner.stop_error("Interrupted");
            return Err(FlowboxError::User("Interrupted".to_string()));
        }
    };
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            spinner.stop_error("Execution failed");
            return Err(e);
        }
    };

    if outcome.is_success() {
        spinner.stop(&format!("Finished in {}ms", outcome.duration_ms));
    } else {
        spinner.stop_error(&format!("Finished with verdict {}", outcome.verdict));
    }

    let json = if args.pretty {
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string(&outcome)?
    };
    println!("{}", json);

    outcome.into_result().map(|_| ())
}

async fn read_operation(path: &Path) -> FlowboxResult<Value> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buf)
            .await
            .map_err(|e| FlowboxError::io("reading operation from stdin", e))?;
        buf
    } else {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FlowboxError::io(format!("reading {}", path.display()), e))?
    };

    serde_json::from_str(&content)
        .map_err(|e| FlowboxError::User(format!("Operation is not valid JSON: {}", e)))
}

fn build_fingerprint(args: &RunArgs) -> FlowboxResult<DependencyFingerprint> {
    let mut packages = Vec::with_capacity(args.pieces.len() + args.archives.len());

    for piece in &args.pieces {
        let (name, version) = split_name_version(piece)?;
        packages.push(PackageSpec::registry(name, version));
    }
    for archive in &args.archives {
        let (package, archive_id) = archive.rsplit_once('#').ok_or_else(|| {
            FlowboxError::User(format!(
                "Invalid archive package '{}': expected name@version#archive-id",
                archive
            ))
        })?;
        let (name, version) = split_name_version(package)?;
        packages.push(PackageSpec::archive(name, version, archive_id));
    }

    let fingerprint =
        DependencyFingerprint::new(packages).with_code_steps(args.code_steps.clone());
    fingerprint.validate()?;
    Ok(fingerprint)
}

/// Split `name@version`, allowing a scoped `@org/name`
fn split_name_version(spec: &str) -> FlowboxResult<(&str, &str)> {
    match spec.rsplit_once('@') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => Ok((name, version)),
        _ => Err(FlowboxError::User(format!(
            "Invalid package '{}': expected name@version",
            spec
        ))),
    }
}

fn operation_type(kind: OperationKind) -> OperationType {
    match kind {
        OperationKind::ExecuteFlow => OperationType::ExecuteFlow,
        OperationKind::ExecuteStep => OperationType::ExecuteStep,
        OperationKind::ExecuteTriggerHook => OperationType::ExecuteTriggerHook,
        OperationKind::ExecuteProperty => OperationType::ExecuteProperty,
        OperationKind::ExecuteValidateAuth => OperationType::ExecuteValidateAuth,
        OperationKind::ExtractPieceMetadata => OperationType::ExtractPieceMetadata,
    }
}
