//! Structured JSONL audit logging for request decisions.
//!
//! Every request the proxy accepts produces exactly one policy decision
//! (`allowed` or `blocked`); tunnels additionally produce one close-time
//! decision (`closed` or `error`). The log file is truncated once at startup
//! so each process run yields one fresh, append-only record.

use serde::Serialize;
use std::path::Path;

/// Terminal outcome of a proxy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allowed,
    Blocked,
    Error,
    Closed,
}

/// A single audit log entry. Written once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub timestamp: String,
    pub outcome: Outcome,
    pub method: String,
    /// `host[:port]` for CONNECT, `host + path` for plain HTTP.
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Decision {
    pub fn new(outcome: Outcome, method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            timestamp: now_iso8601(),
            outcome,
            method: method.into(),
            target: target.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Returns the current UTC time as an ISO 8601 / RFC 3339 string.
pub fn now_iso8601() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Audit logger that writes JSONL entries to a file.
///
/// Uses `std::fs::File` with a `std::sync::Mutex` since writes are small
/// and fast, avoiding the need for tokio's `fs` feature. The mutex keeps
/// concurrent writers from interleaving partial lines.
pub struct AuditLogger {
    writer: std::sync::Mutex<std::io::BufWriter<std::fs::File>>,
}

impl AuditLogger {
    /// Create the audit log file, truncating any previous run's content.
    /// The parent directory is created if it does not exist.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: std::sync::Mutex::new(std::io::BufWriter::new(file)),
        })
    }

    /// Write a decision as a JSON line. Errors are logged but never propagated.
    pub fn log(&self, decision: &Decision) {
        use std::io::Write;
        let json = match serde_json::to_string(decision) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize audit decision");
                return;
            }
        };

        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "Failed to lock audit log writer");
                return;
            }
        };
        if let Err(e) = writeln!(writer, "{}", json) {
            tracing::error!(error = %e, "Failed to write audit decision");
            return;
        }
        if let Err(e) = writer.flush() {
            tracing::error!(error = %e, "Failed to flush audit log");
        }
    }

    /// Flush the underlying stream. Called on shutdown so no decision is lost.
    pub fn flush(&self) {
        use std::io::Write;
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writer.flush() {
                tracing::error!(error = %e, "Failed to flush audit log");
            }
        }
    }
}
