//! Run registry - durable mirror of run records and their execution logs
//!
//! The engine pushes every transition here but never reads its own writes
//! back to make decisions. `read` and `list_for_owner` rebuild a [`Run`] by
//! joining the stored record with its ordered log rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::engine::bus::Subscription;
use crate::engine::run::{LogEntry, LogKind, Run, RunStatus, RunUpdate};
use crate::task::TaskDescriptor;

pub mod memory;

pub use memory::InMemoryRegistry;

/// Current step text of a freshly created run
pub const QUEUED_STEP: &str = "Initializing task...";
/// First log line of every run
pub const QUEUED_LOG: &str = "Task queued for execution";

/// A new opaque run id
pub fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stored run fields (the log lives in a separate table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_inputs: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_task: Option<String>,
    pub status: RunStatus,
    pub current_step: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
}

impl RunRecord {
    /// A queued record for a new submission
    pub fn queued(id: &str, task: &TaskDescriptor) -> Self {
        Self {
            id: id.to_string(),
            owner: task.owner.clone(),
            template_id: task.template_id.clone(),
            template_inputs: task.template_inputs.clone(),
            custom_task: task.custom_task.clone(),
            status: RunStatus::Queued,
            current_step: QUEUED_STEP.to_string(),
            progress: 0,
            error_message: None,
            start_time: Utc::now(),
            end_time: None,
            results: HashMap::new(),
        }
    }

    /// Apply a partial update with the same rules as [`Run::apply`]
    pub fn apply(&mut self, update: &RunUpdate) {
        let mut run = self.to_run(Vec::new());
        run.apply(update);
        self.status = run.status;
        self.current_step = run.current_step;
        self.progress = run.progress;
        self.end_time = run.end_time;
        self.error_message = run.error;
        self.results = run.results;
    }

    /// Join with the run's log rows
    pub fn to_run(&self, logs: Vec<LogRecord>) -> Run {
        let logs: Vec<LogEntry> = logs.into_iter().map(LogRecord::into_entry).collect();
        let screenshots = logs
            .iter()
            .filter_map(|l| l.screenshot_ref.clone())
            .collect();
        Run {
            id: self.id.clone(),
            owner: self.owner.clone(),
            status: self.status,
            current_step: self.current_step.clone(),
            progress: self.progress,
            logs,
            screenshots,
            start_time: self.start_time,
            end_time: self.end_time,
            error: self.error_message.clone(),
            results: self.results.clone(),
        }
    }
}

/// One stored execution log row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub run_id: String,
    pub step_number: u32,
    pub message: String,
    pub kind: LogKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn from_entry(run_id: &str, entry: &LogEntry) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_number: entry.step_number,
            message: entry.message.clone(),
            kind: entry.kind,
            screenshot_ref: entry.screenshot_ref.clone(),
            timestamp: entry.timestamp,
        }
    }

    pub fn into_entry(self) -> LogEntry {
        LogEntry {
            step_number: self.step_number,
            message: self.message,
            kind: self.kind,
            screenshot_ref: self.screenshot_ref,
            timestamp: self.timestamp,
        }
    }
}

/// Storage for runs and logs
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Create a queued run with a fresh id and its first log entry;
    /// returns the stored snapshot
    async fn create(&self, task: &TaskDescriptor) -> Result<Run, RegistryError>;

    async fn update(&self, id: &str, update: &RunUpdate) -> Result<(), RegistryError>;

    async fn append_log(&self, id: &str, entry: &LogEntry) -> Result<(), RegistryError>;

    async fn read(&self, id: &str) -> Result<Option<Run>, RegistryError>;

    /// Runs of one owner, newest first by start time
    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Run>, RegistryError>;

    /// Change feed for one run; fires after each stored update or log row
    fn subscribe(
        &self,
        id: &str,
        on_change: Box<dyn Fn(&Run) + Send + Sync>,
    ) -> Result<Subscription, RegistryError>;
}
