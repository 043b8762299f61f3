//! Exit metadata for one engine run
//!
//! The isolate backend reports it as a `key:value` metadata file; the process
//! backend synthesises it from the child's exit status.

use serde::Serialize;
use std::process::ExitStatus;

/// Abnormal termination class reported in the `status` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MetaStatus {
    /// `RE`: exited with a non-zero code
    RuntimeError,
    /// `SG`: killed by a signal
    Signaled,
    /// `TO`: exceeded a time limit
    TimedOut,
    /// `XX`: the sandbox itself failed
    InternalError,
}

impl MetaStatus {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "RE" => Some(Self::RuntimeError),
            "SG" => Some(Self::Signaled),
            "TO" => Some(Self::TimedOut),
            "XX" => Some(Self::InternalError),
            _ => None,
        }
    }
}

/// Parsed exit metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitMeta {
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub status: Option<MetaStatus>,
    pub time_secs: Option<f64>,
    pub wall_time_secs: Option<f64>,
    pub max_rss_kb: Option<u64>,
    pub killed: bool,
    pub message: Option<String>,
}

impl ExitMeta {
    /// Parse a metadata file. Unknown keys and malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut meta = Self::default();
        let mut saw_exitcode = false;

        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "exitcode" => {
                    saw_exitcode = true;
                    meta.exit_code = value.parse().ok();
                }
                "exitsig" => meta.exit_signal = value.parse().ok(),
                "status" => meta.status = MetaStatus::from_code(value),
                "time" => meta.time_secs = value.parse().ok(),
                "time-wall" => meta.wall_time_secs = value.parse().ok(),
                "max-rss" => meta.max_rss_kb = value.parse().ok(),
                "killed" => meta.killed = value == "1",
                "message" => meta.message = Some(value.to_string()),
                _ => {}
            }
        }

        // isolate omits exitcode on a clean exit
        if !saw_exitcode && meta.status.is_none() && meta.exit_signal.is_none() {
            meta.exit_code = Some(0);
        }
        meta
    }

    /// Build metadata from a plain child exit status
    pub fn from_exit_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal: Option<i32> = None;

        let exit_status = if signal.is_some() {
            Some(MetaStatus::Signaled)
        } else if !status.success() {
            Some(MetaStatus::RuntimeError)
        } else {
            None
        };

        Self {
            exit_code: status.code(),
            exit_signal: signal,
            status: exit_status,
            killed: signal.is_some(),
            ..Self::default()
        }
    }

    /// Exited with code 0 and no abnormal status
    pub fn is_clean(&self) -> bool {
        self.status.is_none() && self.exit_code == Some(0)
    }

    /// The sandbox reported a time-limit kill
    pub fn timed_out(&self) -> bool {
        self.status == Some(MetaStatus::TimedOut)
    }

    /// Short description of an unclean exit
    pub fn describe(&self) -> String {
        if let Some(ref message) = self.message {
            return message.clone();
        }
        match (self.exit_code, self.exit_signal) {
            (_, Some(sig)) => format!("killed by signal {}", sig),
            (Some(code), None) => format!("exited with code {}", code),
            (None, None) => "exited abnormally".to_string(),
        }
    }
}
