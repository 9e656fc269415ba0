//! Step plan builder
//!
//! Turns a [`TaskDescriptor`] into the ordered list of [`StepSpec`]s a run
//! executes. Plans are:
//! 1. Two bootstrap steps shared by every task (navigate, authenticate)
//! 2. The template's authored workflow, if it has one, with every step
//!    config rendered against the task's inputs
//! 3. Otherwise a hand-authored sequence for a known [`TemplateKind`], or a
//!    short generic sequence for anything else
//!
//! Building never fails: unknown templates and malformed inputs fall back
//! to the generic plan.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::substitution::{substitute, substitute_value};
use super::template::{TemplateCatalog, TemplateKind, WorkflowStep, WorkflowStepType};

/// Landing page the bootstrap navigation step opens
pub const DEFAULT_LAUNCHPAD_URL: &str = "https://fiori.example.com/launchpad";

/// A submitted task: either a template reference with inputs, or free text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_inputs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_task: Option<String>,
}

impl TaskDescriptor {
    pub fn template(owner: &str, template_id: &str, inputs: HashMap<String, String>) -> Self {
        Self {
            owner: owner.to_string(),
            template_id: Some(template_id.to_string()),
            template_inputs: inputs,
            custom_task: None,
        }
    }

    pub fn custom(owner: &str, text: &str) -> Self {
        Self {
            owner: owner.to_string(),
            template_id: None,
            template_inputs: HashMap::new(),
            custom_task: Some(text.to_string()),
        }
    }

    /// Add or replace one template input
    pub fn with_input(mut self, key: &str, value: &str) -> Self {
        self.template_inputs
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// Typed configuration for each kind of step.
///
/// Serialized as `{"step_type": ..., "config": {...}}`. The delegate wire
/// form is derived from this in [`crate::bridge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", content = "config", rename_all = "snake_case")]
pub enum StepKind {
    Navigate { url: String },
    Authenticate,
    OpenApp { app: String },
    Input { field: String, value: String },
    Validate {
        rule: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<String>,
    },
    Execute { operation: String },
    Screenshot,
    Delay { duration_ms: u64 },
    Custom { instruction: String },
    /// A template-authored step with its config already rendered
    Authored {
        step_type: WorkflowStepType,
        config: Value,
    },
}

/// One unit of simulated work
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpec {
    pub description: String,
    pub duration: Duration,
    pub can_fail: bool,
    pub error_message: Option<String>,
    pub takes_screenshot: bool,
    pub kind: StepKind,
}

impl StepSpec {
    fn new(description: &str, duration_ms: u64, kind: StepKind) -> Self {
        Self {
            description: description.to_string(),
            duration: Duration::from_millis(duration_ms),
            can_fail: false,
            error_message: None,
            takes_screenshot: false,
            kind,
        }
    }

    fn fallible(mut self, error_message: &str) -> Self {
        self.can_fail = true;
        self.error_message = Some(error_message.to_string());
        self
    }

    fn with_screenshot(mut self) -> Self {
        self.takes_screenshot = true;
        self
    }

    /// Message surfaced as the run error if this step fails
    pub fn failure_message(&self) -> &str {
        self.error_message
            .as_deref()
            .unwrap_or("Step execution failed")
    }
}

/// Builds step plans, resolving template ids against a catalog
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    catalog: TemplateCatalog,
}

impl PlanBuilder {
    pub fn new(catalog: TemplateCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut TemplateCatalog {
        &mut self.catalog
    }

    /// Build the plan for a task. Never empty.
    pub fn build(&self, task: &TaskDescriptor) -> Vec<StepSpec> {
        let mut steps = bootstrap_steps();

        let template = task
            .template_id
            .as_deref()
            .and_then(|id| self.catalog.get(id));

        if let Some(template) = template.filter(|t| !t.workflow.is_empty()) {
            debug!(
                "Template '{}' has {} authored steps",
                template.id,
                template.workflow.len()
            );
            steps.extend(
                template
                    .workflow
                    .iter()
                    .map(|step| authored_step(step, &task.template_inputs)),
            );
            return steps;
        }

        match (template, template.and_then(|t| t.kind())) {
            (Some(template), Some(kind)) => {
                match template.validate_inputs(&task.template_inputs) {
                    Ok(()) => {
                        debug!("Building {} plan", kind.id());
                        steps.extend(kind_steps(kind, &task.template_inputs));
                    }
                    Err(e) => {
                        warn!(
                            "Inputs for template '{}' rejected ({}), using generic plan",
                            template.id, e
                        );
                        steps.extend(generic_steps(&template.render(&task.template_inputs)));
                    }
                }
            }
            (Some(template), None) => {
                debug!("User template '{}', using generic plan", template.id);
                steps.extend(generic_steps(&template.render(&task.template_inputs)));
            }
            (None, _) => {
                if let Some(id) = &task.template_id {
                    warn!("Unknown template '{}', using generic plan", id);
                }
                let instruction = task.custom_task.clone().unwrap_or_default();
                steps.extend(generic_steps(&instruction));
            }
        }

        steps
    }
}

/// Build a plan with the built-in catalog
pub fn build_plan(task: &TaskDescriptor) -> Vec<StepSpec> {
    PlanBuilder::default().build(task)
}

fn bootstrap_steps() -> Vec<StepSpec> {
    vec![
        StepSpec::new(
            "Navigating to SAP Fiori home page",
            1500,
            StepKind::Navigate {
                url: DEFAULT_LAUNCHPAD_URL.to_string(),
            },
        ),
        StepSpec::new("Authenticating user session", 1000, StepKind::Authenticate)
            .fallible("Authentication failed"),
    ]
}

fn generic_steps(instruction: &str) -> Vec<StepSpec> {
    vec![
        StepSpec::new(
            "Processing custom automation request",
            3000,
            StepKind::Custom {
                instruction: instruction.to_string(),
            },
        )
        .fallible("Custom task execution failed"),
        StepSpec::new(
            "Completing requested operations",
            2000,
            StepKind::Execute {
                operation: "complete".to_string(),
            },
        ),
    ]
}

const AUTHORED_STEP_MS: u64 = 1000;

fn authored_step(step: &WorkflowStep, inputs: &HashMap<String, String>) -> StepSpec {
    let config = substitute_value(&step.config, inputs);
    let text = |key: &str| config.get(key).and_then(Value::as_str).unwrap_or_default();

    let description = match text("description") {
        "" => match step.step_type {
            WorkflowStepType::Action => {
                format!("Performing {} on {}", text("action"), text("selector"))
            }
            WorkflowStepType::Validation => "Validating page state".to_string(),
            WorkflowStepType::Screenshot => "Taking screenshot".to_string(),
            WorkflowStepType::Delay => "Waiting".to_string(),
            WorkflowStepType::CuaAutomation => {
                format!("Running automation {}", text("automationId"))
            }
        },
        authored => authored.to_string(),
    };
    let duration_ms = match step.step_type {
        WorkflowStepType::Delay => delay_ms(&config),
        _ => AUTHORED_STEP_MS,
    };
    let step_type = step.step_type;
    let planned = StepSpec::new(
        description.trim(),
        duration_ms,
        StepKind::Authored { step_type, config },
    );

    match step_type {
        WorkflowStepType::Screenshot => planned.with_screenshot(),
        WorkflowStepType::Validation => planned.fallible("Validation failed"),
        WorkflowStepType::CuaAutomation => planned.fallible("Automation step failed"),
        WorkflowStepType::Action | WorkflowStepType::Delay => planned,
    }
}

/// `duration` in milliseconds, given as a number or a numeric string
fn delay_ms(config: &Value) -> u64 {
    match config.get("duration") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .unwrap_or(AUTHORED_STEP_MS)
}

fn kind_steps(kind: TemplateKind, inputs: &HashMap<String, String>) -> Vec<StepSpec> {
    let render = |text: &str| substitute(text, inputs);

    match kind {
        TemplateKind::StockTransfer => vec![
            StepSpec::new(
                "Opening Stock Transfer application",
                2000,
                StepKind::OpenApp {
                    app: "Stock Transfer".to_string(),
                },
            ),
            StepSpec::new(
                &render("Entering material code: {material}"),
                1000,
                StepKind::Input {
                    field: "material".to_string(),
                    value: render("{material}"),
                },
            ),
            StepSpec::new(
                &render("Setting quantity to: {qty}"),
                800,
                StepKind::Input {
                    field: "qty".to_string(),
                    value: render("{qty}"),
                },
            ),
            StepSpec::new(
                &render("Selecting source plant: {from_plant}"),
                1000,
                StepKind::Input {
                    field: "from_plant".to_string(),
                    value: render("{from_plant}"),
                },
            ),
            StepSpec::new(
                &render("Selecting destination plant: {to_plant}"),
                1000,
                StepKind::Input {
                    field: "to_plant".to_string(),
                    value: render("{to_plant}"),
                },
            ),
            StepSpec::new(
                "Validating transfer details",
                1500,
                StepKind::Validate {
                    rule: "stock_available".to_string(),
                    expected: Some(render("{qty}")),
                },
            )
            .fallible("Validation failed: Insufficient stock"),
            StepSpec::new(
                "Executing stock transfer",
                2000,
                StepKind::Execute {
                    operation: "post_transfer".to_string(),
                },
            )
            .fallible("Transfer execution failed"),
            StepSpec::new(
                "Confirming transfer completion",
                1000,
                StepKind::Validate {
                    rule: "document_posted".to_string(),
                    expected: None,
                },
            )
            .with_screenshot(),
        ],
        TemplateKind::LeadTimeUpdate => vec![
            StepSpec::new(
                "Opening Material Master application",
                2000,
                StepKind::OpenApp {
                    app: "Material Master".to_string(),
                },
            ),
            StepSpec::new(
                &render("Searching for material: {material}"),
                1500,
                StepKind::Input {
                    field: "material".to_string(),
                    value: render("{material}"),
                },
            )
            .fallible("Material not found"),
            StepSpec::new(
                "Navigating to MRP2 tab",
                1000,
                StepKind::OpenApp {
                    app: "MRP2".to_string(),
                },
            ),
            StepSpec::new(
                &render("Updating lead time to: {new_days} days"),
                1500,
                StepKind::Input {
                    field: "new_days".to_string(),
                    value: render("{new_days}"),
                },
            ),
            StepSpec::new(
                "Saving material master changes",
                2000,
                StepKind::Execute {
                    operation: "save".to_string(),
                },
            )
            .fallible("Save operation failed"),
        ],
        TemplateKind::StockCheck => vec![
            StepSpec::new(
                "Opening Stock Overview application",
                2000,
                StepKind::OpenApp {
                    app: "Stock Overview".to_string(),
                },
            ),
            StepSpec::new(
                &render("Looking up material: {material}"),
                1500,
                StepKind::Input {
                    field: "material".to_string(),
                    value: render("{material}"),
                },
            )
            .fallible("Material not found in system"),
            StepSpec::new(
                "Retrieving current stock levels",
                1000,
                StepKind::Execute {
                    operation: "read_stock".to_string(),
                },
            ),
            StepSpec::new("Taking screenshot of stock information", 500, StepKind::Screenshot)
                .with_screenshot(),
        ],
    }
}
