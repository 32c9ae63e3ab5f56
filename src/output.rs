//! Structured output writer supporting JSON Lines and human-readable modes.

use crate::accounting::{format_bytes, AccountStat};
use crate::error::ErrorClass;
use crate::manager::TransferResult;
use serde::Serialize;

const ICON_SUCCESS: &str = "\u{2713}";
const ICON_SKIPPED: &str = "\u{21b7}";
const ICON_ERROR: &str = "\u{2717}";

/// Output mode for CLI results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
    /// Only errors and the final summary
    Quiet,
}

/// One finished task, as printed in JSON mode
#[derive(Debug, Serialize)]
pub struct TaskReport<'a> {
    pub status: &'static str,
    pub source: &'a str,
    pub target: &'a str,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

impl<'a> TaskReport<'a> {
    pub fn from_result(result: &'a TransferResult) -> Self {
        let task = &result.task;
        let mut report = TaskReport {
            status: "success",
            source: &task.source_url,
            target: &task.target_url,
            size: task.source_size,
            etag: None,
            version_id: None,
            error: None,
            class: None,
        };
        match &result.outcome {
            Ok(success) => {
                if success.faked {
                    report.status = "skipped";
                }
                report.etag = success.etag.as_deref();
                report.version_id = success.version_id.as_deref();
            }
            Err(e) => {
                report.status = "error";
                report.error = Some(sanitize_error(&e.to_string()));
                report.class = result.error_class().map(|c| c.to_string());
            }
        }
        report
    }
}

/// Final counters of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub succeeded: u64,
    /// Completed by an earlier run of the same session
    pub skipped: u64,
    /// Ignorable failures, including enumeration errors
    pub failed: u64,
    /// Batch-fatal failures
    pub fatal: u64,
    /// Tasks never started because the run was interrupted
    pub cancelled: u64,
    pub bytes: u64,
    pub interrupted: bool,
    pub session_preserved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<AccountStat>,
    pub exit_code: i32,
}

/// Structured output writer that supports both human-readable and JSON output
#[derive(Debug, Clone)]
pub struct OutputWriter {
    pub mode: OutputMode,
}

impl Default for OutputWriter {
    fn default() -> Self {
        Self {
            mode: OutputMode::Quiet,
        }
    }
}

impl OutputWriter {
    pub fn new(json: bool, quiet: bool) -> Self {
        let mode = if json {
            OutputMode::Json
        } else if quiet {
            OutputMode::Quiet
        } else {
            OutputMode::Human
        };
        Self { mode }
    }

    pub fn is_json(&self) -> bool {
        self.mode == OutputMode::Json
    }

    /// Print the outcome of one task
    pub fn task_result(&self, result: &TransferResult) {
        match self.mode {
            OutputMode::Json => {
                if let Ok(json) = serde_json::to_string(&TaskReport::from_result(result)) {
                    println!("{}", json);
                }
            }
            OutputMode::Human | OutputMode::Quiet => match &result.outcome {
                Ok(success) if self.mode == OutputMode::Human => {
                    let icon = if success.faked { ICON_SKIPPED } else { ICON_SUCCESS };
                    println!(
                        "  {} {} \u{2192} {}",
                        icon, result.task.source_url, result.task.target_url
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    let class = result.error_class().unwrap_or(ErrorClass::BatchFatal);
                    eprintln!("  {} [{}] {}", ICON_ERROR, class, sanitize_error(&e.to_string()));
                }
            },
        }
    }

    /// Print the run summary
    pub fn summary(&self, summary: &Summary) {
        match self.mode {
            OutputMode::Json => {
                if let Ok(json) = serde_json::to_string(summary) {
                    println!("{}", json);
                }
            }
            OutputMode::Human | OutputMode::Quiet => {
                println!(
                    "{} transferred ({}), {} skipped, {} failed",
                    summary.succeeded,
                    format_bytes(summary.bytes),
                    summary.skipped,
                    summary.failed + summary.fatal
                );
                if let Some(stat) = &summary.stat {
                    println!("{}", stat);
                }
                if summary.session_preserved {
                    if let Some(identity) = &summary.session {
                        println!("Resume with: ferry session resume {}", identity);
                    }
                }
            }
        }
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        match self.mode {
            OutputMode::Json => {
                let line = serde_json::json!({
                    "status": "error",
                    "error": sanitize_error(msg),
                });
                eprintln!("{}", line);
            }
            OutputMode::Human | OutputMode::Quiet => {
                eprintln!("Error: {}", sanitize_error(msg));
            }
        }
    }

    /// Print an info message (human mode only)
    pub fn info(&self, msg: &str) {
        if self.mode == OutputMode::Human {
            println!("{}", msg);
        }
    }
}

/// Sanitize error messages by collapsing whitespace
pub fn sanitize_error(msg: &str) -> String {
    msg.split_whitespace().collect::<Vec<&str>>().join(" ")
}
