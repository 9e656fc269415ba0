//! Run Executor - drives one run through its plan in local simulation mode
//!
//! The executor:
//! 1. Marks the run `running` and waits out the startup delay
//! 2. Executes steps in order, one registry write and one notification each
//! 3. Draws a simulated failure after every fallible step
//! 4. Ends the run exactly once, as `completed` or `failed`
//!
//! The in-flight [`Run`] is held locally and is authoritative; the registry
//! is only written to, never read back.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::bus::NotificationBus;
use crate::engine::failure::FailureSource;
use crate::engine::run::{screenshot_ref, step_progress, LogKind, Run, RunStatus, RunUpdate};
use crate::registry::{RegistryError, RunRegistry};
use crate::task::{EngineConfig, StepSpec};

pub const STARTING_STEP: &str = "Opening SAP Fiori launchpad...";
pub const STARTED_LOG: &str = "Starting browser automation";
pub const COMPLETED_STEP: &str = "Task completed successfully";
pub const COMPLETED_LOG: &str = "Task execution completed successfully";
pub const FAILED_STEP: &str = "Task failed";
pub const CANCELLED_STEP: &str = "Task cancelled";

/// Initial progress once a run has started
pub const START_PROGRESS: u8 = 10;

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

/// A log line waiting to be numbered and stored
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LogLine {
    pub message: String,
    pub kind: LogKind,
    pub screenshot_ref: Option<String>,
}

impl LogLine {
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: LogKind::Lifecycle,
            screenshot_ref: None,
        }
    }

    pub fn step(message: impl Into<String>, screenshot_ref: Option<String>) -> Self {
        Self {
            message: message.into(),
            kind: LogKind::Step,
            screenshot_ref,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            message: format!("Error: {}", message),
            kind: LogKind::Error,
            screenshot_ref: None,
        }
    }
}

/// The authoritative in-flight state of one run, plus where it is mirrored.
///
/// Every change is applied locally, written to the registry, then published
/// as one snapshot, so registry readers and bus observers agree.
pub(crate) struct LiveRun {
    run: Run,
    registry: Arc<dyn RunRegistry>,
    bus: NotificationBus,
}

impl LiveRun {
    pub fn new(run: Run, registry: Arc<dyn RunRegistry>, bus: NotificationBus) -> Self {
        Self { run, registry, bus }
    }

    pub fn id(&self) -> &str {
        &self.run.id
    }

    pub fn snapshot(&self) -> &Run {
        &self.run
    }

    pub fn into_run(self) -> Run {
        self.run
    }

    /// Apply a non-terminal change. On a registry error nothing is
    /// published and the caller is expected to fail the run.
    pub async fn commit(
        &mut self,
        update: RunUpdate,
        logs: Vec<LogLine>,
    ) -> Result<(), RegistryError> {
        if self.run.is_terminal() {
            return Ok(());
        }
        self.run.apply(&update);
        let entries: Vec<_> = logs
            .into_iter()
            .map(|l| self.run.push_log(&l.message, l.kind, l.screenshot_ref))
            .collect();

        for entry in &entries {
            self.registry.append_log(&self.run.id, entry).await?;
        }
        if !update.is_empty() {
            self.registry.update(&self.run.id, &update).await?;
        }
        self.bus.publish(&self.run.id, &self.run);
        Ok(())
    }

    /// Apply the terminal change. Runs at most once per run. The terminal
    /// registry write is retried; the snapshot is published even if every
    /// attempt is rejected.
    pub async fn finish(&mut self, update: RunUpdate, log: LogLine) {
        if self.run.is_terminal() {
            return;
        }
        self.run.apply(&update);
        if !self.run.is_terminal() {
            warn!(run_id = %self.run.id, "Terminal update did not end the run");
            return;
        }
        let entry = self.run.push_log(&log.message, log.kind, log.screenshot_ref);

        if let Err(e) = self.registry.append_log(&self.run.id, &entry).await {
            warn!(run_id = %self.run.id, "Failed to store final log entry: {}", e);
        }
        if let Err(e) = self.store_terminal(&update).await {
            error!(
                run_id = %self.run.id,
                status = %self.run.status,
                "Registry did not record the terminal state, stored run stays active: {}",
                e
            );
        }
        self.bus.publish(&self.run.id, &self.run);
    }

    async fn store_terminal(&self, update: &RunUpdate) -> Result<(), RegistryError> {
        let mut attempt = 1;
        loop {
            match self.registry.update(&self.run.id, update).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    warn!(run_id = %self.run.id, attempt, "Failed to store terminal state: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn complete(&mut self) {
        self.finish(
            RunUpdate::default()
                .status(RunStatus::Completed)
                .current_step(COMPLETED_STEP)
                .progress(100)
                .ended(),
            LogLine::lifecycle(COMPLETED_LOG),
        )
        .await;
    }

    pub async fn fail(&mut self, message: &str) {
        self.finish(
            RunUpdate::default()
                .status(RunStatus::Failed)
                .current_step(FAILED_STEP)
                .progress(100)
                .error(message)
                .ended(),
            LogLine::error(message),
        )
        .await;
    }
}

/// Sleep for `duration`, or just yield to the scheduler when it is zero
pub(crate) async fn pause(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}

/// Local simulation executor
#[derive(Clone)]
pub struct RunExecutor {
    registry: Arc<dyn RunRegistry>,
    bus: NotificationBus,
    failures: Arc<dyn FailureSource>,
    config: EngineConfig,
}

impl RunExecutor {
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        bus: NotificationBus,
        failures: Arc<dyn FailureSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            failures,
            config,
        }
    }

    /// Drive a queued run to its terminal state and return the final snapshot
    #[instrument(skip(self, run, plan), fields(run_id = %run.id, steps = plan.len()))]
    pub async fn execute(&self, run: Run, plan: Vec<StepSpec>) -> Run {
        let mut live = LiveRun::new(run, self.registry.clone(), self.bus.clone());

        match self.run_steps(&mut live, &plan).await {
            Ok(()) => {
                live.complete().await;
                info!("Run completed");
            }
            Err(message) => {
                live.fail(&message).await;
                warn!("Run failed: {}", message);
            }
        }
        live.into_run()
    }

    async fn run_steps(&self, live: &mut LiveRun, plan: &[StepSpec]) -> Result<(), String> {
        live.commit(
            RunUpdate::default()
                .status(RunStatus::Running)
                .current_step(STARTING_STEP)
                .progress(START_PROGRESS),
            vec![LogLine::lifecycle(STARTED_LOG)],
        )
        .await
        .map_err(|e| e.to_string())?;

        pause(self.config.startup_delay()).await;

        let total = plan.len();
        for (index, step) in plan.iter().enumerate() {
            debug!("Executing step {}/{}: {}", index + 1, total, step.description);

            let screenshot = step
                .takes_screenshot
                .then(|| screenshot_ref(live.id(), index + 1));
            live.commit(
                RunUpdate::default()
                    .current_step(step.description.clone())
                    .progress(step_progress(index + 1, total)),
                vec![LogLine::step(step.description.clone(), screenshot)],
            )
            .await
            .map_err(|e| e.to_string())?;

            pause(self.config.scaled(step.duration)).await;

            if step.can_fail
                && self
                    .failures
                    .should_fail(live.id(), index, self.config.failure_probability)
            {
                return Err(step.failure_message().to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::failure::{NeverFail, ScriptedFailures};
    use crate::registry::InMemoryRegistry;
    use crate::task::{build_plan, TaskDescriptor};
    use std::sync::Mutex;

    fn executor(
        registry: Arc<InMemoryRegistry>,
        bus: NotificationBus,
        failures: Arc<dyn FailureSource>,
    ) -> RunExecutor {
        RunExecutor::new(registry, bus, failures, EngineConfig::instant())
    }

    #[tokio::test]
    async fn test_successful_run() {
        let registry = Arc::new(InMemoryRegistry::new());
        let bus = NotificationBus::new();
        let task = TaskDescriptor::custom("alice", "Check open purchase orders");
        let plan = build_plan(&task);
        let run = registry.create(&task).await.unwrap();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let s = statuses.clone();
        bus.subscribe(&run.id, move |r| s.lock().unwrap().push((r.status, r.progress)));

        let done = executor(registry.clone(), bus, Arc::new(NeverFail))
            .execute(run, plan.clone())
            .await;

        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.step_log_count(), plan.len());
        assert!(done.end_time.is_some());

        let statuses = statuses.lock().unwrap();
        // start + one per step + terminal
        assert_eq!(statuses.len(), plan.len() + 2);
        assert_eq!(statuses[0], (RunStatus::Running, START_PROGRESS));
        assert_eq!(*statuses.last().unwrap(), (RunStatus::Completed, 100));

        let stored = registry.read(&done.id).await.unwrap().unwrap();
        assert_eq!(stored, done);
    }

    #[tokio::test]
    async fn test_scripted_failure_stops_run() {
        let registry = Arc::new(InMemoryRegistry::new());
        let task = TaskDescriptor::custom("alice", "Run MRP");
        let plan = build_plan(&task);
        let run = registry.create(&task).await.unwrap();

        // plan position 1 is the authentication step
        let done = executor(
            registry.clone(),
            NotificationBus::new(),
            Arc::new(ScriptedFailures::at([1])),
        )
        .execute(run, plan)
        .await;

        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("Authentication failed"));
        assert_eq!(done.current_step, FAILED_STEP);
        assert_eq!(done.progress, 100);
        assert_eq!(done.step_log_count(), 2);
        assert_eq!(
            done.logs.last().map(|l| l.message.as_str()),
            Some("Error: Authentication failed")
        );
    }

    #[tokio::test]
    async fn test_screenshot_refs_follow_step_positions() {
        let registry = Arc::new(InMemoryRegistry::new());
        let task = TaskDescriptor::template("alice", "stock-check", Default::default())
            .with_input("material", "FG100");
        let plan = build_plan(&task);
        let shots: Vec<usize> = plan
            .iter()
            .enumerate()
            .filter(|(_, s)| s.takes_screenshot)
            .map(|(i, _)| i + 1)
            .collect();
        let run = registry.create(&task).await.unwrap();

        let done = executor(registry, NotificationBus::new(), Arc::new(NeverFail))
            .execute(run, plan)
            .await;

        let expected: Vec<String> = shots.iter().map(|n| screenshot_ref(&done.id, *n)).collect();
        assert_eq!(done.screenshots, expected);
    }
}
