//! Audit logging for executions and cache maintenance
//!
//! Writes JSON lines to `<state dir>/flowbox/audit.log`. Enabled by default.

use crate::config::{schema::Config, ConfigManager};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// File-based audit logger that appends JSON lines
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self::with_path(config.general.audit_log, ConfigManager::audit_log_path())
    }

    /// Audit logger writing to an explicit file
    pub fn with_path(enabled: bool, path: PathBuf) -> Self {
        Self { enabled, path }
    }

    /// Log an audit event as a JSON line
    ///
    /// IO failures are logged and dropped; an execution never fails because
    /// its audit record could not be written.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write audit log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_json_line() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::with_path(true, dir.path().join("audit.log"));

        audit
            .log("cache.gc", &serde_json::json!({"removed": 3}))
            .await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();

        assert_eq!(parsed["event"], "cache.gc");
        assert_eq!(parsed["data"]["removed"], 3);
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_and_creates_parent() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::with_path(true, dir.path().join("nested/audit.log"));

        audit.log("execution.completed", &serde_json::json!({})).await;
        audit.log("execution.completed", &serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(&audit.path).await.unwrap();
        assert_eq!(content.trim().lines().count(), 2);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::with_path(false, dir.path().join("audit.log"));

        audit.log("should.not.appear", &serde_json::json!({})).await;

        assert!(!audit.path.exists());
    }
}
