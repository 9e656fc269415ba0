//! # Run Engine
//!
//! An execution engine for template-driven automation tasks. A submitted
//! task becomes an ordered step plan; each run is driven through
//! `queued -> running -> completed | failed | cancelled` while its progress is
//! mirrored into a run registry and pushed to observers in-process.
//!
//! ## Features
//!
//! - **Templates** - Parameterized prompts with `{placeholder}` substitution
//! - **Step plans** - Hand-authored step sequences per template kind, with a
//!   generic fallback for free-text tasks
//! - **Local simulation** - Timed steps with injectable failure draws
//! - **Delegate mode** - Forward the plan to a remote executor and follow it by
//!   polling and pushed events
//! - **Notifications** - Per-run subscriptions and a live event stream
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use run_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = RunService::new(EngineConfig::default())?;
//!
//!     let task = TaskDescriptor::template("alice", "stock-transfer", Default::default())
//!         .with_input("material", "FG100")
//!         .with_input("qty", "100")
//!         .with_input("from_plant", "1710")
//!         .with_input("to_plant", "1010");
//!
//!     let (run_id, _subscription) = service
//!         .submit_and_subscribe(task, |run| {
//!             println!("[{:>3}%] {} - {}", run.progress, run.status, run.current_step);
//!         })
//!         .await?;
//!
//!     let run = service.wait(&run_id).await?;
//!     println!("Run {} finished: {}", run.id, run.status);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod engine;
pub mod registry;
pub mod task;

// Re-export main types
pub use bridge::{
    AutomationRequest, DelegateError, DelegateExecutor, DelegateStep, HttpDelegate, PushListener,
    RemoteState, RemoteStatus,
};
pub use engine::{
    DelegateTracker, EngineError, EventStream, FailureSource, LogEntry, LogKind, NeverFail,
    NotificationBus, RandomFailures, Run, RunExecutor, RunService, RunStatus, RunUpdate,
    ScriptedFailures, SeededFailures, StreamEvent, StreamEventType, Subscription,
};
pub use registry::{InMemoryRegistry, RegistryError, RunRegistry};
pub use task::{
    build_plan, substitute, substitute_value, ConfigError, DelegateConfig, EngineConfig,
    FailureMode, PlanBuilder, StepKind, StepSpec, TaskDescriptor, Template, TemplateCatalog,
    TemplateKind,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{DelegateExecutor, HttpDelegate};
    pub use crate::engine::{
        EngineError, EventStream, Run, RunService, RunStatus, StreamEvent, Subscription,
    };
    pub use crate::registry::{InMemoryRegistry, RunRegistry};
    pub use crate::task::{
        build_plan, EngineConfig, FailureMode, StepSpec, TaskDescriptor, TemplateCatalog,
    };
}
