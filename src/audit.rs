//! Security audit log
//!
//! Append-only record of policy decisions. One line per event:
//!
//! `{iso8601} - Session: {id8}... - {action} - Command: '{cmd}' - Reason: {reason}`
//!
//! Blocked events are the mandatory path of record; allowed events are not
//! routinely written. The file handle is held behind a mutex so appends are
//! single-writer ordered.

use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// What the policy engine did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    Blocked,
    Allowed,
}

impl AuditAction {
    fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Blocked => "BLOCKED",
            AuditAction::Allowed => "ALLOWED",
        }
    }
}

/// Aggregate block counts read back from the log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total_blocks: u64,
    pub today_blocks: u64,
}

/// Append-only audit log backed by a local UTF-8 file.
pub struct SecurityAudit {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl SecurityAudit {
    /// Open (or create) the audit log at the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                error!(path = %path.display(), "Failed to open audit log: {e}");
                e
            })
            .ok();

        Self {
            path,
            file: Mutex::new(file),
        }
    }

    /// Record one policy decision. Blocked events log at warn level.
    pub fn record(&self, session_id: &str, command: &str, reason: &str, action: AuditAction) {
        let id_prefix: String = session_id.chars().take(8).collect();
        let line = format!(
            "{} - Session: {}... - {} - Command: '{}' - Reason: {}",
            Local::now().to_rfc3339(),
            id_prefix,
            action.as_str(),
            command,
            reason
        );

        match action {
            AuditAction::Blocked => warn!(session_id = %id_prefix, command, reason, "command blocked"),
            AuditAction::Allowed => {}
        }

        let mut guard = self.file.lock();
        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{line}") {
                error!(path = %self.path.display(), "Failed to append audit event: {e}");
            }
        }
    }

    /// Last `limit` events, newest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        // Hold the writer lock so a concurrent append cannot tear a line.
        let _guard = self.file.lock();

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .map_while(|l| l.ok())
            .filter(|l| !l.trim().is_empty())
            .collect();

        lines.into_iter().rev().take(limit).collect()
    }

    /// Total and today's block counts, by scanning for BLOCKED lines and
    /// matching today's date prefix.
    pub fn stats(&self) -> AuditStats {
        let _guard = self.file.lock();

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return AuditStats::default(),
        };

        let today = Local::now().format("%Y-%m-%d").to_string();
        let mut stats = AuditStats::default();

        for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
            if line.contains("BLOCKED") {
                stats.total_blocks += 1;
                if line.contains(&today) {
                    stats.today_blocks += 1;
                }
            }
        }

        stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
