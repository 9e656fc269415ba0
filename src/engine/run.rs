//! Run state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Queued, RunStatus::Running) => true,
            // a delegated submit can fail before the run ever starts
            (RunStatus::Queued, RunStatus::Failed) => true,
            (RunStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Queued, started and completed markers
    Lifecycle,
    /// One executed plan step
    Step,
    /// The terminal failure
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// 1-based position in the run's log
    pub step_number: u32,
    pub message: String,
    pub kind: LogKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Observable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub owner: String,
    pub status: RunStatus,
    pub current_step: String,
    pub progress: u8,
    pub logs: Vec<LogEntry>,
    pub screenshots: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-step results reported by a delegate executor
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub results: HashMap<String, Value>,
}

impl Run {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of log entries for executed plan steps
    pub fn step_log_count(&self) -> usize {
        self.logs.iter().filter(|l| l.kind == LogKind::Step).count()
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.logs.iter().map(|l| l.message.as_str())
    }

    /// Apply a partial update.
    ///
    /// Progress never decreases and a terminal run is never modified.
    pub fn apply(&mut self, update: &RunUpdate) {
        if self.is_terminal() {
            return;
        }
        if let Some(status) = update.status {
            if status != self.status && self.status.can_transition_to(status) {
                self.status = status;
            }
        }
        if let Some(step) = &update.current_step {
            self.current_step = step.clone();
        }
        if let Some(progress) = update.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(end_time) = update.end_time {
            if self.end_time.is_none() {
                self.end_time = Some(end_time);
            }
        }
        if let Some(error) = &update.error {
            if self.error.is_none() {
                self.error = Some(error.clone());
            }
        }
        if let Some(results) = &update.results {
            self.results = results.clone();
        }
    }

    /// Append a log entry, assigning the next step number
    pub fn push_log(
        &mut self,
        message: &str,
        kind: LogKind,
        screenshot_ref: Option<String>,
    ) -> LogEntry {
        let entry = LogEntry {
            step_number: self.logs.len() as u32 + 1,
            message: message.to_string(),
            kind,
            screenshot_ref: screenshot_ref.clone(),
            timestamp: Utc::now(),
        };
        if let Some(reference) = screenshot_ref {
            self.screenshots.push(reference);
        }
        self.logs.push(entry.clone());
        entry
    }
}

/// A partial change to a run's fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub current_step: Option<String>,
    pub progress: Option<u8>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub results: Option<HashMap<String, Value>>,
}

impl RunUpdate {
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn ended(mut self) -> Self {
        self.end_time = Some(Utc::now());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn results(mut self, results: HashMap<String, Value>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == RunUpdate::default()
    }
}

/// Progress for having finished `done` of `total` steps, in [10, 90]
pub fn step_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 90;
    }
    let fraction = done.min(total) as f64 / total as f64;
    (10.0 + fraction * 80.0).round() as u8
}

/// Reference recorded for a step's screenshot
pub fn screenshot_ref(run_id: &str, step: usize) -> String {
    format!("screenshot_{}_step_{}.png", run_id, step)
}
