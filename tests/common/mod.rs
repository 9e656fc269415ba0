#![allow(dead_code)]

use async_trait::async_trait;
use run_engine::bridge::{
    AutomationRequest, DelegateError, DelegateExecutor, RemoteState, RemoteStatus,
};
use run_engine::engine::{
    FailureSource, LogEntry, NeverFail, Run, RunService, RunStatus, RunUpdate,
    Subscription,
};
use run_engine::registry::{InMemoryRegistry, RegistryError, RunRegistry};
use run_engine::task::{DelegateConfig, EngineConfig, TaskDescriptor};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const REMOTE_ID: &str = "remote_1";

pub fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

pub fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("engine.yaml");
    fs::write(&path, content).expect("Failed to write engine.yaml");
    path
}

pub fn transfer_task(owner: &str) -> TaskDescriptor {
    TaskDescriptor::template(owner, "stock-transfer", HashMap::new())
        .with_input("material", "FG100")
        .with_input("qty", "100")
        .with_input("from_plant", "1710")
        .with_input("to_plant", "1010")
}

/// Service with instant steps and no failures
pub fn instant_service() -> RunService {
    service_with_failures(Arc::new(NeverFail))
}

pub fn service_with_failures(failures: Arc<dyn FailureSource>) -> RunService {
    RunService::new(EngineConfig::instant())
        .expect("Failed to build service")
        .with_failures(failures)
}

/// Service wired to `delegate`, polling every `poll_ms`
pub fn delegated_service(delegate: Arc<FakeDelegate>, poll_ms: u64) -> RunService {
    delegated_service_with(delegate, poll_ms, None)
}

pub fn delegated_service_with(
    delegate: Arc<FakeDelegate>,
    poll_ms: u64,
    max_run_duration_ms: Option<u64>,
) -> RunService {
    let mut delegate_config = DelegateConfig::new("http://delegate.invalid");
    delegate_config.poll_interval_ms = poll_ms;
    delegate_config.max_run_duration_ms = max_run_duration_ms;
    let config = EngineConfig {
        delegate: Some(delegate_config),
        ..EngineConfig::instant()
    };

    RunService::new(config)
        .expect("Failed to build service")
        .with_delegate(delegate)
}

/// Collects every snapshot delivered to a subscription
#[derive(Clone, Default)]
pub struct Recorder {
    snapshots: Arc<Mutex<Vec<Run>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&Run) + Send + Sync + 'static {
        let snapshots = self.snapshots.clone();
        move |run: &Run| snapshots.lock().unwrap().push(run.clone())
    }

    pub fn snapshots(&self) -> Vec<Run> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn progress(&self) -> Vec<u8> {
        self.snapshots().iter().map(|r| r.progress).collect()
    }

    pub fn statuses(&self) -> Vec<RunStatus> {
        self.snapshots().iter().map(|r| r.status).collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.snapshots().iter().filter(|r| r.is_terminal()).count()
    }
}

/// Submit a task, record every transition and wait for the run to end
pub async fn run_recorded(service: &RunService, task: TaskDescriptor) -> (Run, Recorder) {
    let recorder = Recorder::new();
    let (id, _subscription): (String, Subscription) = service
        .submit_and_subscribe(task, recorder.callback())
        .await
        .expect("submit failed");
    let run = service.wait(&id).await.expect("wait failed");
    (run, recorder)
}

/// Record every snapshot of every run published on the service's bus
pub fn record_all(service: &RunService) -> (Recorder, Subscription) {
    let recorder = Recorder::new();
    let subscription = service.bus().subscribe_all(recorder.callback());
    (recorder, subscription)
}

pub fn is_non_decreasing(values: &[u8]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

pub fn remote(status: RemoteState, step: Option<u32>, total: u32) -> RemoteStatus {
    RemoteStatus {
        run_id: REMOTE_ID.to_string(),
        status,
        current_step: step,
        total_steps: total,
        results: HashMap::new(),
        error: None,
    }
}

/// Delegate executor that replays scripted poll responses
pub struct FakeDelegate {
    script: Mutex<VecDeque<Result<RemoteStatus, String>>>,
    last: Mutex<RemoteStatus>,
    submit_error: Option<String>,
    honor_cancel: bool,
    cancelled: AtomicBool,
    push: Option<broadcast::Sender<RemoteStatus>>,
    pub submitted: Mutex<Vec<AutomationRequest>>,
    pub cancels: Mutex<Vec<String>>,
    pub polls: AtomicUsize,
}

impl FakeDelegate {
    pub fn new(script: Vec<Result<RemoteStatus, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(remote(RemoteState::Queued, None, 0)),
            submit_error: None,
            honor_cancel: false,
            cancelled: AtomicBool::new(false),
            push: None,
            submitted: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
        }
    }

    /// A delegate that reports `statuses` in order, then repeats the last
    pub fn scripted(statuses: Vec<RemoteStatus>) -> Self {
        Self::new(statuses.into_iter().map(Ok).collect())
    }

    pub fn failing_submit(error: &str) -> Self {
        let mut delegate = Self::new(vec![]);
        delegate.submit_error = Some(error.to_string());
        delegate
    }

    /// Report `cancelled` on every poll after a cancel request
    pub fn honoring_cancel(mut self) -> Self {
        self.honor_cancel = true;
        self
    }

    /// Expose a push channel; returns the sending side
    pub fn with_push(mut self) -> (Self, broadcast::Sender<RemoteStatus>) {
        let (tx, _) = broadcast::channel(64);
        self.push = Some(tx.clone());
        (self, tx)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.lock().unwrap().len()
    }
}

#[async_trait]
impl DelegateExecutor for FakeDelegate {
    async fn submit(&self, request: &AutomationRequest) -> Result<String, DelegateError> {
        if let Some(error) = &self.submit_error {
            return Err(DelegateError::Connection(error.clone()));
        }
        self.submitted.lock().unwrap().push(request.clone());
        Ok(REMOTE_ID.to_string())
    }

    async fn poll(&self, remote_run_id: &str) -> Result<RemoteStatus, DelegateError> {
        assert_eq!(remote_run_id, REMOTE_ID);
        self.polls.fetch_add(1, Ordering::SeqCst);

        if self.honor_cancel && self.cancelled.load(Ordering::SeqCst) {
            return Ok(remote(RemoteState::Cancelled, None, 0));
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(status)) => {
                *self.last.lock().unwrap() = status.clone();
                Ok(status)
            }
            Some(Err(error)) => Err(DelegateError::Connection(error)),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }

    async fn cancel(&self, remote_run_id: &str) -> Result<(), DelegateError> {
        self.cancels.lock().unwrap().push(remote_run_id.to_string());
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn push_updates(&self) -> Option<broadcast::Receiver<RemoteStatus>> {
        self.push.as_ref().map(|tx| tx.subscribe())
    }
}

/// Failure source that panics when asked, killing the run task
pub struct PanickingFailures;

impl FailureSource for PanickingFailures {
    fn should_fail(&self, _run_id: &str, _step_index: usize, _probability: f64) -> bool {
        panic!("failure source exploded")
    }
}

/// Registry that rejects writes on demand
pub struct FlakyRegistry {
    inner: InMemoryRegistry,
    remaining: AtomicUsize,
    terminal_rejections: AtomicUsize,
}

impl FlakyRegistry {
    /// Reject non-terminal updates once `updates` have succeeded
    pub fn failing_after(updates: usize) -> Self {
        Self {
            inner: InMemoryRegistry::new(),
            remaining: AtomicUsize::new(updates),
            terminal_rejections: AtomicUsize::new(0),
        }
    }

    /// Reject the first `times` terminal updates
    pub fn rejecting_terminal(times: usize) -> Self {
        Self {
            inner: InMemoryRegistry::new(),
            remaining: AtomicUsize::new(usize::MAX),
            terminal_rejections: AtomicUsize::new(times),
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RunRegistry for FlakyRegistry {
    async fn create(&self, task: &TaskDescriptor) -> Result<Run, RegistryError> {
        self.inner.create(task).await
    }

    async fn update(&self, id: &str, update: &RunUpdate) -> Result<(), RegistryError> {
        if update.status.map_or(false, |s| s.is_terminal()) {
            if take_one(&self.terminal_rejections) {
                return Err(RegistryError::Unavailable("write timeout".to_string()));
            }
        } else if !take_one(&self.remaining) {
            return Err(RegistryError::Unavailable("connection reset".to_string()));
        }
        self.inner.update(id, update).await
    }

    async fn append_log(&self, id: &str, entry: &LogEntry) -> Result<(), RegistryError> {
        self.inner.append_log(id, entry).await
    }

    async fn read(&self, id: &str) -> Result<Option<Run>, RegistryError> {
        self.inner.read(id).await
    }

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Run>, RegistryError> {
        self.inner.list_for_owner(owner).await
    }

    fn subscribe(
        &self,
        id: &str,
        on_change: Box<dyn Fn(&Run) + Send + Sync>,
    ) -> Result<Subscription, RegistryError> {
        self.inner.subscribe(id, on_change)
    }
}
