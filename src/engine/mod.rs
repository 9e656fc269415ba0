//! Run execution engine module
//!
//! This module contains:
//! - `run` - Run state, log entries and partial updates
//! - `bus` - In-process notification bus keyed by run id
//! - `failure` - Injectable sources of simulated step failures
//! - `executor` - Local simulation of a run's plan
//! - `delegate` - Remote execution through a delegate executor
//! - `events` - Live event stream for dashboards
//! - `service` - The run service tying it all together
//! - `error` - Engine error types

pub mod bus;
pub mod delegate;
pub mod error;
pub mod events;
pub mod executor;
pub mod failure;
pub mod run;
pub mod service;

pub use bus::{NotificationBus, Subscription};
pub use delegate::{DelegateControl, DelegateRunner, DelegateTracker};
pub use error::EngineError;
pub use events::{EventResult, EventStream, StreamEvent, StreamEventType};
pub use executor::RunExecutor;
pub use failure::{FailureSource, NeverFail, RandomFailures, ScriptedFailures, SeededFailures};
pub use run::{LogEntry, LogKind, Run, RunStatus, RunUpdate};
pub use service::RunService;
