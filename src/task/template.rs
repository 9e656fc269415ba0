//! Task templates
//!
//! A template is a named prompt with `{placeholder}` tokens and a list of
//! declared inputs. Built-in templates map to a [`TemplateKind`] which the
//! plan builder knows how to expand into domain steps. User-defined
//! templates are kept in a [`TemplateCatalog`]; they either carry an
//! authored workflow of [`WorkflowStep`]s or run as generic plans.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::substitution::{placeholders, substitute};

/// Template kinds with a hand-authored step sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateKind {
    StockTransfer,
    LeadTimeUpdate,
    StockCheck,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 3] = [
        TemplateKind::StockTransfer,
        TemplateKind::LeadTimeUpdate,
        TemplateKind::StockCheck,
    ];

    /// Canonical template id
    pub fn id(&self) -> &'static str {
        match self {
            TemplateKind::StockTransfer => "stock-transfer",
            TemplateKind::LeadTimeUpdate => "lead-time-update",
            TemplateKind::StockCheck => "stock-check",
        }
    }

    /// Human-facing template name
    pub fn display_name(&self) -> &'static str {
        match self {
            TemplateKind::StockTransfer => "Stock Transfer",
            TemplateKind::LeadTimeUpdate => "Lead Time Update",
            TemplateKind::StockCheck => "Stock Check",
        }
    }

    /// Resolve an id, alias or display name ("Stock Transfer", "stock_transfer").
    pub fn from_id(id: &str) -> Option<Self> {
        let normalized = id.trim().to_lowercase().replace([' ', '_'], "-");
        match normalized.as_str() {
            "stock-transfer" => Some(TemplateKind::StockTransfer),
            "lead-time-update" | "lead-time" => Some(TemplateKind::LeadTimeUpdate),
            "stock-check" => Some(TemplateKind::StockCheck),
            _ => None,
        }
    }
}

/// Input widget type, with the allowed values for selects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputType {
    Text,
    Number,
    Select { options: Vec<String> },
}

/// A declared template input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInput {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub input_type: InputType,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl TemplateInput {
    pub fn text(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            input_type: InputType::Text,
            required: true,
        }
    }

    pub fn number(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            input_type: InputType::Number,
            required: true,
        }
    }

    pub fn select(id: &str, label: &str, options: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            input_type: InputType::Select {
                options: options.iter().map(|o| o.to_string()).collect(),
            },
            required: true,
        }
    }
}

/// Why a set of template inputs was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("Missing required input: {0}")]
    Missing(String),

    #[error("Input '{id}' is not a number: {value}")]
    NotANumber { id: String, value: String },

    #[error("Input '{id}' must be one of {options:?}, got: {value}")]
    NotAnOption {
        id: String,
        value: String,
        options: Vec<String>,
    },
}

/// Step types an authored workflow may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStepType {
    Action,
    Validation,
    Screenshot,
    Delay,
    CuaAutomation,
}

impl WorkflowStepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStepType::Action => "action",
            WorkflowStepType::Validation => "validation",
            WorkflowStepType::Screenshot => "screenshot",
            WorkflowStepType::Delay => "delay",
            WorkflowStepType::CuaAutomation => "cua_automation",
        }
    }
}

/// A user-authored step. The config may hold `{placeholder}` tokens at any
/// depth; they are rendered when a plan is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub step_type: WorkflowStepType,
    #[serde(default)]
    pub config: Value,
}

impl WorkflowStep {
    pub fn new(id: &str, step_type: WorkflowStepType, config: Value) -> Self {
        Self {
            id: id.to_string(),
            step_type,
            config,
        }
    }
}

/// A named, parameterized task source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub inputs: Vec<TemplateInput>,
    /// Authored steps, in execution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflow: Vec<WorkflowStep>,
}

impl Template {
    /// The built-in templates
    pub fn builtin() -> Vec<Template> {
        TemplateKind::ALL.iter().map(|k| Self::for_kind(*k)).collect()
    }

    pub fn for_kind(kind: TemplateKind) -> Template {
        let (description, prompt, inputs) = match kind {
            TemplateKind::StockTransfer => (
                "Transfer materials between plants",
                "Transfer {qty} units of material {material} from Plant {from_plant} to {to_plant} using SAP Stock Transfer app.",
                vec![
                    TemplateInput::number("qty", "Quantity"),
                    TemplateInput::text("material", "Material Code"),
                    TemplateInput::select("from_plant", "From Plant", &["1710", "1020", "1030"]),
                    TemplateInput::select("to_plant", "To Plant", &["1010", "1020", "1030"]),
                ],
            ),
            TemplateKind::LeadTimeUpdate => (
                "Update material lead times in Material Master",
                "Open Material Master for {material}, go to MRP2 tab, and set lead time to {new_days} days.",
                vec![
                    TemplateInput::text("material", "Material Code"),
                    TemplateInput::number("new_days", "Lead Time (Days)"),
                ],
            ),
            TemplateKind::StockCheck => (
                "Check material stock levels",
                "Open \"Stock - Single Material\" app and look up material {material}. Take a screenshot of stock levels.",
                vec![TemplateInput::text("material", "Material Code")],
            ),
        };

        Template {
            id: kind.id().to_string(),
            name: kind.display_name().to_string(),
            description: description.to_string(),
            prompt: prompt.to_string(),
            inputs,
            workflow: Vec::new(),
        }
    }

    /// The built-in kind this template maps to, if any
    pub fn kind(&self) -> Option<TemplateKind> {
        TemplateKind::from_id(&self.id).or_else(|| TemplateKind::from_id(&self.name))
    }

    /// Placeholder names used by the prompt
    pub fn placeholders(&self) -> Vec<String> {
        placeholders(&self.prompt)
    }

    /// Render the prompt with the given inputs
    pub fn render(&self, values: &HashMap<String, String>) -> String {
        substitute(&self.prompt, values)
    }

    /// Check supplied values against the declared inputs
    pub fn validate_inputs(&self, values: &HashMap<String, String>) -> Result<(), InputError> {
        for input in &self.inputs {
            let value = match values.get(&input.id).map(|v| v.trim()) {
                Some(v) if !v.is_empty() => v,
                _ if input.required => return Err(InputError::Missing(input.id.clone())),
                _ => continue,
            };

            match &input.input_type {
                InputType::Text => {}
                InputType::Number => {
                    if value.parse::<f64>().is_err() {
                        return Err(InputError::NotANumber {
                            id: input.id.clone(),
                            value: value.to_string(),
                        });
                    }
                }
                InputType::Select { options } => {
                    if !options.iter().any(|o| o == value) {
                        return Err(InputError::NotAnOption {
                            id: input.id.clone(),
                            value: value.to_string(),
                            options: options.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-memory template store, seeded with the built-ins
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: Vec<Template>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self {
            templates: Template::builtin(),
        }
    }

    pub fn empty() -> Self {
        Self {
            templates: Vec::new(),
        }
    }

    /// Look up by id (case-insensitive) or display name
    pub fn get(&self, id: &str) -> Option<&Template> {
        self.templates
            .iter()
            .find(|t| t.id.eq_ignore_ascii_case(id))
            .or_else(|| self.templates.iter().find(|t| t.name.eq_ignore_ascii_case(id)))
            .or_else(|| {
                let kind = TemplateKind::from_id(id)?;
                self.templates.iter().find(|t| t.kind() == Some(kind))
            })
    }

    pub fn list(&self) -> &[Template] {
        &self.templates
    }

    /// Add a template; returns false if the id is taken
    pub fn insert(&mut self, template: Template) -> bool {
        if self.templates.iter().any(|t| t.id == template.id) {
            return false;
        }
        self.templates.push(template);
        true
    }

    /// Replace a template with the same id; returns false if absent
    pub fn update(&mut self, template: Template) -> bool {
        match self.templates.iter_mut().find(|t| t.id == template.id) {
            Some(existing) => {
                *existing = template;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Template> {
        let idx = self.templates.iter().position(|t| t.id == id)?;
        Some(self.templates.remove(idx))
    }

    fn workflow_mut(&mut self, template_id: &str) -> Option<&mut Vec<WorkflowStep>> {
        self.templates
            .iter_mut()
            .find(|t| t.id == template_id)
            .map(|t| &mut t.workflow)
    }

    /// Append a step to a template's workflow; returns false if the
    /// template is absent or the step id is taken
    pub fn add_step(&mut self, template_id: &str, step: WorkflowStep) -> bool {
        match self.workflow_mut(template_id) {
            Some(workflow) if !workflow.iter().any(|s| s.id == step.id) => {
                workflow.push(step);
                true
            }
            _ => false,
        }
    }

    /// Replace one step's config
    pub fn update_step(&mut self, template_id: &str, step_id: &str, config: Value) -> bool {
        let step = self
            .workflow_mut(template_id)
            .and_then(|w| w.iter_mut().find(|s| s.id == step_id));
        match step {
            Some(step) => {
                step.config = config;
                true
            }
            None => false,
        }
    }

    pub fn remove_step(&mut self, template_id: &str, step_id: &str) -> Option<WorkflowStep> {
        let workflow = self.workflow_mut(template_id)?;
        let idx = workflow.iter().position(|s| s.id == step_id)?;
        Some(workflow.remove(idx))
    }

    /// Put a workflow in the given order. `step_ids` must name every step
    /// exactly once, otherwise nothing changes and false is returned.
    pub fn reorder_steps(&mut self, template_id: &str, step_ids: &[&str]) -> bool {
        let Some(workflow) = self.workflow_mut(template_id) else {
            return false;
        };

        let unique: HashSet<&str> = step_ids.iter().copied().collect();
        if unique.len() != step_ids.len() || step_ids.len() != workflow.len() {
            return false;
        }

        let mut reordered = Vec::with_capacity(workflow.len());
        for id in step_ids {
            match workflow.iter().position(|s| s.id == *id) {
                Some(idx) => reordered.push(workflow[idx].clone()),
                None => return false,
            }
        }
        *workflow = reordered;
        true
    }
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::new()
    }
}
