//! Delegate Runner - drives a run whose steps execute on a remote service
//!
//! The runner submits the plan once, minus the steps the remote side performs
//! by itself, then follows the remote run until
//! it reaches a terminal status. Status arrives from two sources: a fixed
//! interval poll and, when the executor has one, a push channel. Both feed
//! the same [`DelegateTracker`], which turns remote observations into run
//! updates and drops anything stale, so observers cannot tell the sources
//! apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::bridge::{
    remote_plan, AutomationRequest, DelegateExecutor, RemoteState, RemoteStatus,
};
use crate::engine::bus::NotificationBus;
use crate::engine::executor::{LiveRun, LogLine, CANCELLED_STEP, START_PROGRESS};
use crate::engine::run::{screenshot_ref, step_progress, Run, RunStatus, RunUpdate};
use crate::registry::RunRegistry;
use crate::task::{DelegateConfig, StepSpec};

pub const SUBMITTED_STEP: &str = "Submitted to remote executor";
pub const CANCELLED_LOG: &str = "Task cancelled by request";
pub const REMOTE_FAILURE: &str = "Remote execution failed";

/// Cancellation handshake between the service and a running delegate loop
#[derive(Debug, Default)]
pub struct DelegateControl {
    remote_id: Mutex<Option<String>>,
    cancel_requested: AtomicBool,
}

impl DelegateControl {
    pub fn remote_id(&self) -> Option<String> {
        self.remote_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_remote_id(&self, id: &str) {
        *self.remote_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
    }

    /// Mark the run for cancellation; returns the remote id if already known
    pub fn request_cancel(&self) -> Option<String> {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.remote_id()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

/// Result of translating one remote observation
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Translation {
    Progress {
        update: RunUpdate,
        logs: Vec<LogLine>,
    },
    Completed {
        logs: Vec<LogLine>,
    },
    Failed {
        logs: Vec<LogLine>,
        error: String,
    },
    Cancelled,
}

/// Translates remote status observations into run changes.
///
/// Remote steps are 1-based. Observations that would move the run backwards
/// or repeat what was already seen produce nothing, and after the first
/// terminal observation every later one is ignored.
#[derive(Debug)]
pub struct DelegateTracker {
    run_id: String,
    plan: Vec<StepSpec>,
    reached: u32,
    results: HashMap<String, serde_json::Value>,
    finished: bool,
}

impl DelegateTracker {
    pub fn new(run_id: &str, plan: Vec<StepSpec>) -> Self {
        Self {
            run_id: run_id.to_string(),
            plan,
            reached: 0,
            results: HashMap::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of remote steps already logged
    pub fn reached(&self) -> u32 {
        self.reached
    }

    fn total(&self, status: &RemoteStatus) -> u32 {
        if status.total_steps > 0 {
            status.total_steps
        } else {
            self.plan.len() as u32
        }
    }

    fn description(&self, step: u32) -> String {
        self.plan
            .get(step as usize - 1)
            .map(|s| s.description.clone())
            .unwrap_or_else(|| format!("Remote step {}", step))
    }

    /// Step log lines for every step newly reached up to `target`
    fn advance_to(&mut self, target: u32) -> Vec<LogLine> {
        let mut logs = Vec::new();
        while self.reached < target {
            self.reached += 1;
            let step = self.reached;
            let screenshot = self
                .plan
                .get(step as usize - 1)
                .filter(|s| s.takes_screenshot)
                .map(|_| screenshot_ref(&self.run_id, step as usize));
            logs.push(LogLine::step(self.description(step), screenshot));
        }
        logs
    }

    pub(crate) fn observe(&mut self, status: &RemoteStatus) -> Option<Translation> {
        if self.finished {
            return None;
        }
        let total = self.total(status);
        let current = status.current_step.unwrap_or(0).min(total);

        match status.status {
            RemoteState::Queued | RemoteState::Running => {
                let logs = self.advance_to(current);
                let results_changed = status.results != self.results;
                if logs.is_empty() && !results_changed {
                    return None;
                }

                let mut update = RunUpdate::default();
                if !logs.is_empty() {
                    update = update
                        .current_step(self.description(self.reached))
                        .progress(step_progress(self.reached as usize, total as usize));
                }
                if results_changed {
                    self.results = status.results.clone();
                    update = update.results(self.results.clone());
                }
                Some(Translation::Progress { update, logs })
            }
            RemoteState::Completed => {
                self.finished = true;
                self.results = status.results.clone();
                Some(Translation::Completed {
                    logs: self.advance_to(total),
                })
            }
            RemoteState::Failed => {
                self.finished = true;
                self.results = status.results.clone();
                let error = status
                    .error
                    .clone()
                    .filter(|e| !e.is_empty())
                    .unwrap_or_else(|| REMOTE_FAILURE.to_string());
                Some(Translation::Failed {
                    logs: self.advance_to(current),
                    error,
                })
            }
            RemoteState::Cancelled => {
                self.finished = true;
                Some(Translation::Cancelled)
            }
        }
    }

    fn results(&self) -> HashMap<String, serde_json::Value> {
        self.results.clone()
    }
}

/// Drives delegated runs against one [`DelegateExecutor`]
#[derive(Clone)]
pub struct DelegateRunner {
    delegate: Arc<dyn DelegateExecutor>,
    registry: Arc<dyn RunRegistry>,
    bus: NotificationBus,
    config: DelegateConfig,
}

impl DelegateRunner {
    pub fn new(
        delegate: Arc<dyn DelegateExecutor>,
        registry: Arc<dyn RunRegistry>,
        bus: NotificationBus,
        config: DelegateConfig,
    ) -> Self {
        Self {
            delegate,
            registry,
            bus,
            config,
        }
    }

    /// Submit a queued run's plan and follow it to a terminal state
    #[instrument(skip_all, fields(run_id = %run.id, remote_run_id = tracing::field::Empty))]
    pub async fn execute(
        &self,
        run: Run,
        plan: Vec<StepSpec>,
        inputs: HashMap<String, String>,
        target_url: Option<String>,
        control: Arc<DelegateControl>,
    ) -> Run {
        let mut live = LiveRun::new(run, self.registry.clone(), self.bus.clone());

        // subscribe before submitting so no pushed update is missed
        let mut push = self.delegate.push_updates();

        // remote step N is plan[N-1] of the forwarded steps
        let plan = remote_plan(&plan);
        let request = AutomationRequest::from_plan(&plan, &inputs, target_url);
        let remote_id = match self.delegate.submit(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Delegate submit failed: {}", e);
                live.fail(&e.to_string()).await;
                return live.into_run();
            }
        };
        tracing::Span::current().record("remote_run_id", remote_id.as_str());
        control.set_remote_id(&remote_id);
        info!("Run delegated as {}", remote_id);

        if let Err(e) = live
            .commit(
                RunUpdate::default()
                    .status(RunStatus::Running)
                    .current_step(SUBMITTED_STEP)
                    .progress(START_PROGRESS),
                vec![LogLine::lifecycle(format!(
                    "Task submitted for remote execution ({})",
                    remote_id
                ))],
            )
            .await
        {
            live.fail(&e.to_string()).await;
            return live.into_run();
        }

        if control.cancel_requested() {
            self.request_cancel(&remote_id).await;
        }

        let mut tracker = DelegateTracker::new(live.id(), plan);
        self.follow(&mut live, &mut tracker, &remote_id, &mut push)
            .await;
        live.into_run()
    }

    async fn request_cancel(&self, remote_id: &str) {
        if let Err(e) = self.delegate.cancel(remote_id).await {
            warn!("Cancel request for {} failed: {}", remote_id, e);
        }
    }

    async fn follow(
        &self,
        live: &mut LiveRun,
        tracker: &mut DelegateTracker,
        remote_id: &str,
        push: &mut Option<broadcast::Receiver<RemoteStatus>>,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = self
            .config
            .max_run_duration()
            .map(|d| (Instant::now() + d, d));

        while !tracker.is_finished() {
            let observed = tokio::select! {
                _ = ticker.tick() => self.delegate.poll(remote_id).await.map_err(|e| e.to_string()),
                Some(status) = next_push(push, remote_id) => Ok(status),
                _ = deadline_elapsed(deadline.map(|(at, _)| at)) => {
                    let limit = deadline.map(|(_, d)| d.as_millis()).unwrap_or_default();
                    let message = format!("Run exceeded maximum duration of {} ms", limit);
                    warn!("{}", message);
                    live.fail(&message).await;
                    return;
                }
            };

            let status = match observed {
                Ok(status) => status,
                Err(error) => {
                    warn!("Polling {} failed: {}", remote_id, error);
                    live.fail(&error).await;
                    return;
                }
            };

            let Some(translation) = tracker.observe(&status) else {
                continue;
            };
            debug!("Remote status {:?} at step {:?}", status.status, status.current_step);

            match translation {
                Translation::Progress { update, logs } => {
                    if let Err(e) = live.commit(update, logs).await {
                        live.fail(&e.to_string()).await;
                        return;
                    }
                }
                Translation::Completed { logs } => {
                    if let Err(e) = self.commit_final_steps(live, tracker, logs).await {
                        live.fail(&e).await;
                        return;
                    }
                    live.complete().await;
                    info!("Delegated run completed");
                }
                Translation::Failed { logs, error } => {
                    if let Err(e) = self.commit_final_steps(live, tracker, logs).await {
                        live.fail(&e).await;
                        return;
                    }
                    live.fail(&error).await;
                    warn!("Delegated run failed: {}", error);
                }
                Translation::Cancelled => {
                    live.finish(
                        RunUpdate::default()
                            .status(RunStatus::Cancelled)
                            .current_step(CANCELLED_STEP)
                            .ended(),
                        LogLine::lifecycle(CANCELLED_LOG),
                    )
                    .await;
                    info!("Delegated run cancelled");
                }
            }
        }
    }

    /// Record steps first reached by a terminal observation
    async fn commit_final_steps(
        &self,
        live: &mut LiveRun,
        tracker: &DelegateTracker,
        logs: Vec<LogLine>,
    ) -> Result<(), String> {
        let mut update = RunUpdate::default();
        if tracker.results() != live.snapshot().results {
            update = update.results(tracker.results());
        }
        if logs.is_empty() && update.is_empty() {
            return Ok(());
        }
        if let Some(last) = logs.last() {
            update = update.current_step(last.message.clone());
        }
        live.commit(update, logs).await.map_err(|e| e.to_string())
    }
}

/// Next pushed status for `remote_id`; never resolves without a channel
async fn next_push(
    push: &mut Option<broadcast::Receiver<RemoteStatus>>,
    remote_id: &str,
) -> Option<RemoteStatus> {
    let Some(rx) = push.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(status) if status.run_id == remote_id => return Some(status),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!("Push channel lagged, skipped {} updates", skipped);
            }
            Err(RecvError::Closed) => {
                *push = None;
                return None;
            }
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{build_plan, TaskDescriptor};

    fn remote(status: RemoteState, step: Option<u32>) -> RemoteStatus {
        RemoteStatus {
            run_id: "remote_1".to_string(),
            status,
            current_step: step,
            total_steps: 3,
            results: HashMap::new(),
            error: None,
        }
    }

    fn new_tracker() -> DelegateTracker {
        let plan = build_plan(&TaskDescriptor::custom("alice", "Post goods receipt"));
        DelegateTracker::new("run_1", remote_plan(&plan))
    }

    #[test]
    fn test_progress_logs_each_new_step_once() {
        let mut tracker = new_tracker();

        match tracker.observe(&remote(RemoteState::Running, Some(2))) {
            Some(Translation::Progress { update, logs }) => {
                assert_eq!(logs.len(), 2);
                assert_eq!(logs[0].message, "Authenticating user session");
                assert_eq!(logs[1].message, "Processing custom automation request");
                assert_eq!(update.progress, Some(63));
            }
            other => panic!("unexpected translation: {:?}", other),
        }

        assert!(tracker.observe(&remote(RemoteState::Running, Some(2))).is_none());
        // regression is ignored
        assert!(tracker.observe(&remote(RemoteState::Running, Some(1))).is_none());
        assert_eq!(tracker.reached(), 2);
    }

    #[test]
    fn test_completed_logs_remaining_steps() {
        let mut tracker = new_tracker();
        tracker.observe(&remote(RemoteState::Running, Some(1)));

        match tracker.observe(&remote(RemoteState::Completed, Some(3))) {
            Some(Translation::Completed { logs }) => assert_eq!(logs.len(), 2),
            other => panic!("unexpected translation: {:?}", other),
        }
        assert!(tracker.is_finished());
    }

    #[test]
    fn test_first_terminal_wins() {
        let mut tracker = new_tracker();
        assert_eq!(
            tracker.observe(&remote(RemoteState::Cancelled, Some(1))),
            Some(Translation::Cancelled)
        );
        assert!(tracker.observe(&remote(RemoteState::Completed, Some(3))).is_none());
    }

    #[test]
    fn test_failed_uses_remote_error_or_default() {
        let mut tracker = new_tracker();
        match tracker.observe(&remote(RemoteState::Failed, None)) {
            Some(Translation::Failed { error, logs }) => {
                assert_eq!(error, REMOTE_FAILURE);
                assert!(logs.is_empty());
            }
            other => panic!("unexpected translation: {:?}", other),
        }

        let mut tracker = new_tracker();
        let mut status = remote(RemoteState::Failed, Some(3));
        status.error = Some("Element not found: #material".to_string());
        match tracker.observe(&status) {
            Some(Translation::Failed { error, logs }) => {
                assert_eq!(error, "Element not found: #material");
                assert_eq!(logs.len(), 3);
            }
            other => panic!("unexpected translation: {:?}", other),
        }
    }

    #[test]
    fn test_results_change_is_an_update() {
        let mut tracker = new_tracker();
        tracker.observe(&remote(RemoteState::Running, Some(1)));

        let mut status = remote(RemoteState::Running, Some(1));
        status
            .results
            .insert("step_1".to_string(), serde_json::json!({"ok": true}));
        match tracker.observe(&status) {
            Some(Translation::Progress { update, logs }) => {
                assert!(logs.is_empty());
                assert_eq!(update.results.map(|r| r.len()), Some(1));
                assert!(update.progress.is_none());
            }
            other => panic!("unexpected translation: {:?}", other),
        }
    }

    #[test]
    fn test_control_handshake() {
        let control = DelegateControl::default();
        assert_eq!(control.request_cancel(), None);
        assert!(control.cancel_requested());

        control.set_remote_id("remote_9");
        assert_eq!(control.request_cancel().as_deref(), Some("remote_9"));
    }
}
