//! Task types and planning
//!
//! This module contains everything that happens before a run starts:
//! - `template` - Templates, declared inputs and the template catalog
//! - `substitution` - `{placeholder}` replacement in strings and nested values
//! - `plan` - Task descriptors, step kinds and the step plan builder
//! - `config` - Engine configuration loaded from YAML

pub mod config;
pub mod plan;
pub mod substitution;
pub mod template;

pub use config::{ConfigError, DelegateConfig, EngineConfig, FailureMode};
pub use plan::{build_plan, PlanBuilder, StepKind, StepSpec, TaskDescriptor};
pub use substitution::{substitute, substitute_value};
pub use template::{
    InputError, InputType, Template, TemplateCatalog, TemplateInput, TemplateKind, WorkflowStep,
    WorkflowStepType,
};
