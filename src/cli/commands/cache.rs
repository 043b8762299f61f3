//! Cache command - manage dependency cache entries on disk
//!
//! These commands work on the directory tree directly and are meant to run
//! while no executor is using the same cache root.

use crate::audit::AuditLog;
use crate::cache::{dir_size, format_bytes, list_entries, remove_tree, CacheManifest, CacheState};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::Config;
use crate::error::FlowboxResult;
use crate::ui::{self, UiContext};
use chrono::Utc;
use console::style;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> FlowboxResult<()> {
    let root = config.cache.root_dir();

    match args.action {
        CacheAction::List { format } => list_caches(&root, format).await,
        CacheAction::Gc { days, dry_run } => gc_caches(config, &root, days, dry_run).await,
        CacheAction::Clear { yes } => clear_caches(config, &root, yes).await,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheRow {
    key: String,
    state: CacheState,
    packages: Vec<String>,
    size_bytes: u64,
    created_at: String,
    path: PathBuf,
}

impl CacheRow {
    fn new(path: &Path, manifest: &CacheManifest) -> Self {
        Self {
            key: manifest.key.clone(),
            state: manifest.state,
            packages: manifest.packages.iter().map(ToString::to_string).collect(),
            size_bytes: dir_size(path),
            created_at: manifest.created_at.to_rfc3339(),
            path: path.to_path_buf(),
        }
    }
}

/// List cache entries
async fn list_caches(root: &Path, format: OutputFormat) -> FlowboxResult<()> {
    let rows: Vec<CacheRow> = list_entries(root)
        .await?
        .iter()
        .map(|(path, manifest)| CacheRow::new(path, manifest))
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => rows.iter().for_each(|r| println!("{}", r.key)),
        OutputFormat::Table => print_cache_table(&rows),
    }

    Ok(())
}

fn print_cache_table(rows: &[CacheRow]) {
    if rows.is_empty() {
        println!("No cache entries found.");
        return;
    }

    println!("{:<26} {:<10} {:>10}  {:<18} PACKAGES", "KEY", "STATE", "SIZE", "CREATED");
    println!("{}", "-".repeat(90));

    for row in rows {
        let state = match row.state {
            CacheState::Ready => style("ready").green().to_string(),
            CacheState::Building => style("building").yellow().to_string(),
        };
        let created = chrono::DateTime::parse_from_rfc3339(&row.created_at)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();

        println!(
            "{:<26} {:<10} {:>10}  {:<18} {}",
            row.key,
            state,
            format_bytes(row.size_bytes),
            created,
            row.packages.join(", ")
        );
    }

    let total: u64 = rows.iter().map(|r| r.size_bytes).sum();
    println!();
    println!("Total: {} entr(ies), {}", rows.len(), format_bytes(total));
}

/// Entries `gc` removes: abandoned builds, and entries older than `days`
fn gc_candidates(
    entries: Vec<(PathBuf, CacheManifest)>,
    days: u32,
) -> Vec<(PathBuf, CacheManifest)> {
    entries
        .into_iter()
        .filter(|(_, m)| m.state == CacheState::Building || m.is_older_than_days(days))
        .collect()
}

/// Remove old and abandoned entries
async fn gc_caches(
    config: &Config,
    root: &Path,
    days_override: Option<u32>,
    dry_run: bool,
) -> FlowboxResult<()> {
    let ctx = UiContext::detect();
    let gc_days = days_override.unwrap_or(config.cache.gc_days);

    if gc_days == 0 {
        println!("Cache GC is disabled (gc_days = 0)");
        return Ok(());
    }

    let to_remove = gc_candidates(list_entries(root).await?, gc_days);
    if to_remove.is_empty() {
        println!("No cache entries older than {} days.", gc_days);
        return Ok(());
    }

    println!("Found {} cache entr(ies) to remove:", to_remove.len());
    for (_, manifest) in &to_remove {
        let age_days = (Utc::now() - manifest.created_at).num_days();
        println!(
            "  {} {} ({}, {} days old)",
            style("•").red(),
            manifest.key,
            manifest.state,
            age_days
        );
    }

    if dry_run {
        println!();
        println!("Dry run - no entries removed.");
        return Ok(());
    }

    let mut removed = Vec::with_capacity(to_remove.len());
    for (path, manifest) in to_remove {
        remove_dir(&path).await?;
        removed.push(manifest.key);
    }

    AuditLog::new(config)
        .log(
            "cache.gc",
            &serde_json::json!({ "days": gc_days, "removed": removed }),
        )
        .await;
    ui::step_ok(&ctx, &format!("Removed {} cache entr(ies)", removed.len()));

    Ok(())
}

/// Remove every entry and downloaded archive
async fn clear_caches(config: &Config, root: &Path, yes: bool) -> FlowboxResult<()> {
    let ctx = UiContext::detect().with_auto_yes(yes);
    let entries = list_entries(root).await?;
    let archives = config.cache.archive_root();

    println!(
        "This will remove {} cache entr(ies) under {} and all archives under {}",
        entries.len(),
        root.display(),
        archives.display()
    );

    if !ui::confirm(&ctx, "Are you sure?", false).await? {
        ui::step_warn_hint(&ctx, "Aborted", "Pass --yes to skip the prompt");
        return Ok(());
    }

    remove_dir(root).await?;
    remove_dir(&archives).await?;

    AuditLog::new(config)
        .log("cache.clear", &serde_json::json!({ "entries": entries.len() }))
        .await;
    ui::step_ok(&ctx, &format!("Cleared {} cache entr(ies)", entries.len()));

    Ok(())
}

async fn remove_dir(path: &Path) -> FlowboxResult<()> {
    debug!("Removing {}", path.display());
    remove_tree(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PackageSpec;

    fn manifest(key: &str, state: CacheState, age_days: i64) -> CacheManifest {
        let mut m = CacheManifest::building(
            key,
            vec![PackageSpec::registry("@flowbox/piece-http", "0.3.0")],
            vec![],
        );
        m.state = state;
        m.created_at = Utc::now() - chrono::Duration::days(age_days);
        m
    }

    #[test]
    fn gc_picks_old_and_abandoned_entries() {
        let entries = vec![
            (PathBuf::from("/c/fresh"), manifest("fresh", CacheState::Ready, 1)),
            (PathBuf::from("/c/old"), manifest("old", CacheState::Ready, 40)),
            (PathBuf::from("/c/crashed"), manifest("crashed", CacheState::Building, 0)),
        ];

        let keys: Vec<String> = gc_candidates(entries, 30)
            .into_iter()
            .map(|(_, m)| m.key)
            .collect();
        assert_eq!(keys, vec!["old", "crashed"]);
    }

    #[test]
    fn row_reports_packages_and_size() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.js"), b"module.exports = 1;").unwrap();

        let row = CacheRow::new(dir.path(), &manifest("k", CacheState::Ready, 0));
        assert_eq!(row.packages, vec!["@flowbox/piece-http@0.3.0"]);
        assert_eq!(row.size_bytes, 19);
    }

    #[tokio::test]
    async fn remove_dir_ignores_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        remove_dir(&dir.path().join("absent")).await.unwrap();
    }
}
