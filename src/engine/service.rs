//! Run Service - the engine's public surface
//!
//! One explicitly constructed service owns the registry, the notification
//! bus, the failure source and the optional delegate executor. Submitting a
//! task creates a queued record synchronously and spawns one tokio task that
//! owns the run until it ends. Runs share nothing but the registry and the
//! bus, both keyed by run id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::{DelegateExecutor, HttpDelegate};
use crate::engine::bus::{NotificationBus, Subscription};
use crate::engine::delegate::{DelegateControl, DelegateRunner};
use crate::engine::error::EngineError;
use crate::engine::events::EventStream;
use crate::engine::executor::{LiveRun, RunExecutor};
use crate::engine::failure::{self, FailureSource};
use crate::engine::run::Run;
use crate::registry::{InMemoryRegistry, RunRegistry};
use crate::task::{
    DelegateConfig, EngineConfig, PlanBuilder, StepSpec, TaskDescriptor, TemplateCatalog,
};

pub const ABORTED_PANIC: &str = "Run execution panicked";
pub const ABORTED_CANCELLED: &str = "Run execution was aborted";

/// How a run's steps are executed
#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Local,
    Delegated { target_url: Option<String> },
}

/// Bookkeeping for a run whose task is still alive
struct ActiveRun {
    finished: watch::Receiver<Option<Run>>,
    control: Option<Arc<DelegateControl>>,
}

type ActiveRuns = Arc<Mutex<HashMap<String, ActiveRun>>>;

pub struct RunService {
    registry: Arc<dyn RunRegistry>,
    bus: NotificationBus,
    failures: Arc<dyn FailureSource>,
    delegate: Option<Arc<dyn DelegateExecutor>>,
    config: EngineConfig,
    planner: PlanBuilder,
    active: ActiveRuns,
}

impl std::fmt::Debug for RunService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunService")
            .field("bus", &self.bus)
            .field("delegate", &self.delegate.is_some())
            .field("config", &self.config)
            .field("active", &lock(&self.active).len())
            .finish()
    }
}

fn lock(active: &ActiveRuns) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

impl RunService {
    /// Build a service from config with an in-memory registry.
    ///
    /// If `config.delegate` is set an [`HttpDelegate`] is created; with
    /// `push_events` this spawns the push listener, so call it inside a
    /// tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let delegate = match &config.delegate {
            Some(delegate_config) => {
                info!("Using delegate executor at {}", delegate_config.base_url);
                let delegate: Arc<dyn DelegateExecutor> =
                    Arc::new(HttpDelegate::from_config(delegate_config)?);
                Some(delegate)
            }
            None => None,
        };

        Ok(Self {
            registry: Arc::new(InMemoryRegistry::new()),
            bus: NotificationBus::new(),
            failures: failure::from_mode(&config.failure_mode),
            delegate,
            config,
            planner: PlanBuilder::default(),
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_registry(mut self, registry: Arc<dyn RunRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_failures(mut self, failures: Arc<dyn FailureSource>) -> Self {
        self.failures = failures;
        self
    }

    /// Use `delegate` for delegated runs. Poll settings come from
    /// `config.delegate`, or its defaults when unset.
    pub fn with_delegate(mut self, delegate: Arc<dyn DelegateExecutor>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_catalog(mut self, catalog: TemplateCatalog) -> Self {
        self.planner = PlanBuilder::new(catalog);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<dyn RunRegistry> {
        &self.registry
    }

    /// Submit a task for local simulated execution; returns the run id
    /// immediately while the run proceeds in the background.
    pub async fn submit(&self, task: TaskDescriptor) -> Result<String, EngineError> {
        self.start(task, Mode::Local, None).await
    }

    /// Like [`submit`](Self::submit), but `on_update` is registered before
    /// the run starts, so it observes every transition including `queued`.
    pub async fn submit_and_subscribe<F>(
        &self,
        task: TaskDescriptor,
        on_update: F,
    ) -> Result<(String, Subscription), EngineError>
    where
        F: Fn(&Run) + Send + Sync + 'static,
    {
        let mut subscription = None;
        let id = self
            .start(
                task,
                Mode::Local,
                Some(Box::new(|id: &str| {
                    subscription = Some(self.bus.subscribe(id, on_update));
                })),
            )
            .await?;
        let subscription = subscription.ok_or_else(|| EngineError::RunNotFound(id.clone()))?;
        Ok((id, subscription))
    }

    /// Submit a task to the delegate executor
    pub async fn submit_delegated(
        &self,
        task: TaskDescriptor,
        target_url: Option<String>,
    ) -> Result<String, EngineError> {
        if self.delegate.is_none() {
            return Err(EngineError::NoDelegate);
        }
        self.start(task, Mode::Delegated { target_url }, None).await
    }

    #[instrument(skip(self, task, before_start), fields(owner = %task.owner))]
    async fn start(
        &self,
        task: TaskDescriptor,
        mode: Mode,
        before_start: Option<Box<dyn FnOnce(&str) + Send + '_>>,
    ) -> Result<String, EngineError> {
        let plan = self.planner.build(&task);
        let run = self.registry.create(&task).await?;
        let id = run.id.clone();
        info!(run_id = %id, steps = plan.len(), "Run queued");

        if let Some(hook) = before_start {
            hook(&id);
        }
        self.bus.publish(&id, &run);

        let (done_tx, done_rx) = watch::channel(None);
        let control = match mode {
            Mode::Local => None,
            Mode::Delegated { .. } => Some(Arc::new(DelegateControl::default())),
        };
        lock(&self.active).insert(
            id.clone(),
            ActiveRun {
                finished: done_rx,
                control: control.clone(),
            },
        );

        let queued = run.clone();
        let handle = match (mode, control, self.delegate.clone()) {
            (Mode::Delegated { target_url }, Some(control), Some(delegate)) => {
                let runner = DelegateRunner::new(
                    delegate,
                    self.registry.clone(),
                    self.bus.clone(),
                    self.delegate_config(),
                );
                let inputs = task.template_inputs.clone();
                tokio::spawn(async move {
                    runner.execute(run, plan, inputs, target_url, control).await
                })
            }
            _ => {
                let executor = RunExecutor::new(
                    self.registry.clone(),
                    self.bus.clone(),
                    self.failures.clone(),
                    self.config.clone(),
                );
                tokio::spawn(async move { executor.execute(run, plan).await })
            }
        };

        let active = self.active.clone();
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let done = supervise(handle, queued, registry, bus).await;
            finish(&active, done, done_tx);
        });

        Ok(id)
    }

    fn delegate_config(&self) -> DelegateConfig {
        self.config
            .delegate
            .clone()
            .unwrap_or_else(|| DelegateConfig::new(""))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, EngineError> {
        Ok(self.registry.read(run_id).await?)
    }

    /// Runs of one owner, newest first
    pub async fn list_runs(&self, owner: &str) -> Result<Vec<Run>, EngineError> {
        Ok(self.registry.list_for_owner(owner).await?)
    }

    /// Observe future transitions of a run. Past transitions are not
    /// replayed; read the current state with [`get_run`](Self::get_run).
    pub fn subscribe<F>(&self, run_id: &str, on_update: F) -> Subscription
    where
        F: Fn(&Run) + Send + Sync + 'static,
    {
        self.bus.subscribe(run_id, on_update)
    }

    /// Ask the delegate to cancel a run.
    ///
    /// Best effort: the run only becomes `cancelled` if the remote side
    /// reports it before any other terminal status. Cancelling a run that
    /// has already ended is a no-op.
    pub async fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
        let control = lock(&self.active).get(run_id).map(|a| a.control.clone());

        match control {
            Some(Some(control)) => {
                info!(run_id, "Cancellation requested");
                match (control.request_cancel(), &self.delegate) {
                    (Some(remote_id), Some(delegate)) => Ok(delegate.cancel(&remote_id).await?),
                    // not submitted yet; the runner cancels right after submit
                    _ => Ok(()),
                }
            }
            Some(None) => Err(EngineError::CancelUnsupported(run_id.to_string())),
            None => match self.registry.read(run_id).await? {
                Some(run) if run.is_terminal() => {
                    debug!(run_id, "Cancel ignored, run already {}", run.status);
                    Ok(())
                }
                Some(_) => Err(EngineError::CancelUnsupported(run_id.to_string())),
                None => Err(EngineError::RunNotFound(run_id.to_string())),
            },
        }
    }

    /// Wait for a run to end and return its terminal snapshot
    pub async fn wait(&self, run_id: &str) -> Result<Run, EngineError> {
        let finished = lock(&self.active).get(run_id).map(|a| a.finished.clone());

        if let Some(mut rx) = finished {
            if let Ok(done) = rx.wait_for(Option::is_some).await {
                if let Some(run) = done.as_ref() {
                    return Ok(run.clone());
                }
            }
        }

        self.registry
            .read(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    /// Live `{type, taskId, result, error}` events for every run
    pub fn event_stream(&self) -> EventStream {
        EventStream::tap(&self.bus, self.config.event_buffer)
    }

    pub fn templates(&self) -> &TemplateCatalog {
        self.planner.catalog()
    }

    pub fn templates_mut(&mut self) -> &mut TemplateCatalog {
        self.planner.catalog_mut()
    }

    /// The plan a task would run, without running it
    pub fn plan(&self, task: &TaskDescriptor) -> Vec<StepSpec> {
        self.planner.build(task)
    }

    pub async fn health(&self) -> Result<(), EngineError> {
        let delegate = self.delegate.as_ref().ok_or(EngineError::NoDelegate)?;
        Ok(delegate.health().await?)
    }

    /// Number of runs still executing
    pub fn active_runs(&self) -> usize {
        lock(&self.active).len()
    }
}

/// Await a run task. If it panicked or was aborted, end the run as
/// `failed` from the last state the registry holds.
async fn supervise(
    handle: JoinHandle<Run>,
    queued: Run,
    registry: Arc<dyn RunRegistry>,
    bus: NotificationBus,
) -> Run {
    let e = match handle.await {
        Ok(run) => return run,
        Err(e) => e,
    };
    let message = if e.is_panic() {
        ABORTED_PANIC
    } else {
        ABORTED_CANCELLED
    };
    error!(run_id = %queued.id, "{}: {}", message, e);

    let last = match registry.read(&queued.id).await {
        Ok(Some(run)) => run,
        Ok(None) => queued,
        Err(read_error) => {
            warn!(run_id = %queued.id, "Could not read run after abort: {}", read_error);
            queued
        }
    };
    let mut live = LiveRun::new(last, registry, bus);
    live.fail(message).await;
    live.into_run()
}

fn finish(active: &ActiveRuns, done: Run, done_tx: watch::Sender<Option<Run>>) {
    debug!(run_id = %done.id, "Run finished as {}", done.status);
    let id = done.id.clone();
    let _ = done_tx.send(Some(done));
    lock(active).remove(&id);
}
