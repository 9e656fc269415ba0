//! Bridge to a remote delegate executor
//!
//! In delegate mode the full step plan is handed to a remote service which
//! performs the real execution. This module provides:
//! - `DelegateExecutor` - the submit/poll/cancel seam the engine drives
//! - `http` - [`HttpDelegate`], the request/response implementation
//! - `push` - [`PushListener`], the WebSocket channel for pushed status events

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::task::{StepKind, StepSpec, WorkflowStepType};

pub mod http;
pub mod push;

pub use http::HttpDelegate;
pub use push::PushListener;

#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// One plan step in the delegate's wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateStep {
    pub id: String,
    pub step_type: WorkflowStepType,
    pub step_order: u32,
    #[serde(default)]
    pub config: Value,
}

/// Delegate step type and config for a plan step, or `None` for steps the
/// delegate performs on its own (it opens the launchpad before step 1).
pub fn wire_form(kind: &StepKind) -> Option<(WorkflowStepType, Value)> {
    let automation = |id: &str, inputs: Value| {
        (
            WorkflowStepType::CuaAutomation,
            json!({"automationId": id, "inputs": inputs}),
        )
    };

    let form = match kind {
        StepKind::Navigate { .. } => return None,
        StepKind::Authenticate => automation("authenticate", json!({})),
        StepKind::OpenApp { app } => automation("open_app", json!({ "app": app })),
        StepKind::Input { field, value } => (
            WorkflowStepType::Action,
            json!({
                "action": "type",
                "selector": format!("[name=\"{}\"]", field),
                "value": value,
            }),
        ),
        StepKind::Validate { rule, expected } => {
            let mut config = json!({"validation": {"rule": rule, "type": "custom"}});
            if let Some(expected) = expected {
                config["expectedValue"] = json!(expected);
            }
            (WorkflowStepType::Validation, config)
        }
        StepKind::Execute { operation } => automation(operation, json!({})),
        StepKind::Screenshot => (WorkflowStepType::Screenshot, json!({})),
        StepKind::Delay { duration_ms } => (
            WorkflowStepType::Delay,
            json!({ "duration": duration_ms.to_string() }),
        ),
        StepKind::Custom { instruction } => {
            automation("custom_task", json!({ "task": instruction }))
        }
        StepKind::Authored { step_type, config } => (*step_type, config.clone()),
    };
    Some(form)
}

/// The plan steps a delegate is asked to perform, in order
pub fn remote_plan(plan: &[StepSpec]) -> Vec<StepSpec> {
    plan.iter()
        .filter(|step| wire_form(&step.kind).is_some())
        .cloned()
        .collect()
}

/// Body of a submit request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRequest {
    pub workflow_steps: Vec<DelegateStep>,
    #[serde(default)]
    pub template_inputs: HashMap<String, String>,
    #[serde(
        rename = "sap_fiori_url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_url: Option<String>,
}

impl AutomationRequest {
    /// Build a request from a full plan. Steps without a wire form are left
    /// out and the rest are numbered from 1.
    pub fn from_plan(
        plan: &[StepSpec],
        inputs: &HashMap<String, String>,
        target_url: Option<String>,
    ) -> Self {
        let workflow_steps = plan
            .iter()
            .filter_map(|step| wire_form(&step.kind).map(|form| (step, form)))
            .enumerate()
            .map(|(i, (step, (step_type, mut config)))| {
                if let Some(map) = config.as_object_mut() {
                    map.entry("description")
                        .or_insert_with(|| json!(step.description));
                }
                DelegateStep {
                    id: format!("step_{}", i + 1),
                    step_type,
                    step_order: i as u32 + 1,
                    config,
                }
            })
            .collect();
        Self {
            workflow_steps,
            template_inputs: inputs.clone(),
            target_url,
        }
    }
}

/// Status reported by the delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteState::Completed | RemoteState::Failed | RemoteState::Cancelled
        )
    }
}

/// One status observation, from a poll or a pushed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub run_id: String,
    pub status: RemoteState,
    /// 1-based index of the step in progress
    #[serde(default)]
    pub current_step: Option<u32>,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub results: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Remote executor seam
#[async_trait]
pub trait DelegateExecutor: Send + Sync {
    /// Hand over a plan; returns the remote run id
    async fn submit(&self, request: &AutomationRequest) -> Result<String, DelegateError>;

    async fn poll(&self, remote_run_id: &str) -> Result<RemoteStatus, DelegateError>;

    /// Ask the remote side to stop; honoured at its discretion
    async fn cancel(&self, remote_run_id: &str) -> Result<(), DelegateError>;

    async fn health(&self) -> Result<(), DelegateError> {
        Ok(())
    }

    /// Pushed status events, if this executor has a push channel
    fn push_updates(&self) -> Option<broadcast::Receiver<RemoteStatus>> {
        None
    }
}
