//! Live event stream for dashboards
//!
//! A bus-wide tap that reshapes every published snapshot into a
//! [`StreamEvent`] and forwards it over a bounded `async_channel`. Nothing
//! is stored; when the buffer is full the event is dropped.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::bus::{NotificationBus, Subscription};
use super::run::{Run, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    TaskQueued,
    TaskRunning,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
}

impl From<RunStatus> for StreamEventType {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Queued => StreamEventType::TaskQueued,
            RunStatus::Running => StreamEventType::TaskRunning,
            RunStatus::Completed => StreamEventType::TaskCompleted,
            RunStatus::Failed => StreamEventType::TaskFailed,
            RunStatus::Cancelled => StreamEventType::TaskCancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResult {
    pub progress: u8,
    pub current_step: String,
    pub status: RunStatus,
}

/// `{type, taskId?, result?, error?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EventResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn from_run(run: &Run) -> Self {
        Self {
            event_type: run.status.into(),
            task_id: Some(run.id.clone()),
            result: Some(EventResult {
                progress: run.progress,
                current_step: run.current_step.clone(),
                status: run.status,
            }),
            error: run.error.clone(),
        }
    }
}

/// Receiving end of a tap. Dropping it detaches the tap from the bus.
#[derive(Debug)]
pub struct EventStream {
    rx: async_channel::Receiver<StreamEvent>,
    subscription: Option<Subscription>,
}

impl EventStream {
    /// Tap every run published on `bus`, buffering up to `capacity` events
    pub fn tap(bus: &NotificationBus, capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        let subscription = bus.subscribe_all(move |run| {
            if let Err(e) = tx.try_send(StreamEvent::from_run(run)) {
                debug!(run_id = %run.id, "Dropping stream event: {}", e);
            }
        });
        Self {
            rx,
            subscription: Some(subscription),
        }
    }

    /// Next event, or `None` once the tap is closed
    pub async fn recv(&self) -> Option<StreamEvent> {
        self.rx.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    pub fn receiver(&self) -> &async_channel::Receiver<StreamEvent> {
        &self.rx
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}
