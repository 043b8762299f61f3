//! Status command - check backend, package manager and cache health

use crate::cache::{dir_size, format_bytes, list_entries, CacheState};
use crate::cli::args::{OutputFormat, StatusArgs};
use crate::config::Config;
use crate::error::FlowboxResult;
use crate::install::{PackageManager, PnpmCli};
use crate::sandbox::create_backend;
use crate::ui::{self, UiContext};
use serde::Serialize;
use std::path::PathBuf;

/// Point-in-time health report
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    backend: String,
    backend_available: bool,
    package_manager: String,
    package_manager_available: bool,
    pool_size: usize,
    acquire_timeout_ms: u64,
    timeout_ms: u64,
    cache_root: PathBuf,
    cache_entries: usize,
    cache_building: usize,
    cache_bytes: u64,
}

impl StatusReport {
    fn healthy(&self) -> bool {
        self.backend_available && self.package_manager_available
    }
}

/// Execute the status command
pub async fn execute(args: StatusArgs, config: &Config) -> FlowboxResult<()> {
    let report = collect(config).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain | OutputFormat::Table => print_report(&report),
    }

    Ok(())
}

async fn collect(config: &Config) -> FlowboxResult<StatusReport> {
    let backend = create_backend(config)?;
    let package_manager = PnpmCli::new(
        config.installer.package_manager.clone(),
        config.installer.registry.clone(),
    );

    let cache_root = config.cache.root_dir();
    let entries = list_entries(&cache_root).await?;

    Ok(StatusReport {
        backend: backend.backend_name().to_string(),
        backend_available: backend.is_available().await?,
        package_manager: package_manager.tool_name().to_string(),
        package_manager_available: package_manager.is_available().await,
        pool_size: config.pool.size,
        acquire_timeout_ms: config.pool.acquire_timeout_ms,
        timeout_ms: config.execution.timeout_ms,
        cache_entries: entries.len(),
        cache_building: entries
            .iter()
            .filter(|(_, m)| m.state == CacheState::Building)
            .count(),
        cache_bytes: entries.iter().map(|(path, _)| dir_size(path)).sum(),
        cache_root,
    })
}

fn print_report(report: &StatusReport) {
    let ctx = UiContext::detect();

    ui::section(&ctx, "Isolation");
    ui::key_value_status(
        &ctx,
        "backend",
        &report.backend,
        report.backend_available,
    );
    ui::key_value(&ctx, "pool size", &report.pool_size.to_string());
    let wait = if report.acquire_timeout_ms == 0 {
        "fail fast".to_string()
    } else {
        format!("{}ms", report.acquire_timeout_ms)
    };
    ui::key_value(&ctx, "acquire wait", &wait);
    ui::key_value(&ctx, "deadline", &format!("{}ms", report.timeout_ms));

    ui::section(&ctx, "Dependencies");
    ui::key_value_status(
        &ctx,
        "package manager",
        &report.package_manager,
        report.package_manager_available,
    );
    ui::key_value(&ctx, "cache root", &report.cache_root.display().to_string());
    ui::key_value(
        &ctx,
        "cache entries",
        &format!("{} ({})", report.cache_entries, format_bytes(report.cache_bytes)),
    );
    if report.cache_building > 0 {
        ui::step_warn_hint(
            &ctx,
            &format!("{} abandoned build(s)", report.cache_building),
            "Run: flowbox cache gc",
        );
    }

    println!();
    if report.healthy() {
        ui::step_ok(&ctx, "All critical checks passed");
    } else {
        ui::step_error_detail(&ctx, "Some checks failed", "see above for details");
    }
}
