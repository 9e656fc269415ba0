//! In-memory run registry

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{new_run_id, LogRecord, RegistryError, RunRecord, RunRegistry, QUEUED_LOG};
use crate::engine::bus::{NotificationBus, Subscription};
use crate::engine::run::{LogEntry, LogKind, Run, RunUpdate};
use crate::task::TaskDescriptor;

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<String, RunRecord>,
    logs: HashMap<String, Vec<LogRecord>>,
}

impl Tables {
    fn joined(&self, id: &str) -> Option<Run> {
        let record = self.runs.get(id)?;
        let mut logs = self.logs.get(id).cloned().unwrap_or_default();
        logs.sort_by_key(|l| l.step_number);
        Some(record.to_run(logs))
    }
}

/// Registry backed by process memory. Records live as long as the registry.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    tables: RwLock<Tables>,
    changes: NotificationBus,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored record, without logs
    pub async fn record(&self, id: &str) -> Option<RunRecord> {
        self.tables.read().await.runs.get(id).cloned()
    }

    /// Raw stored log rows, in step-number order
    pub async fn log_rows(&self, id: &str) -> Vec<LogRecord> {
        let tables = self.tables.read().await;
        let mut rows = tables.logs.get(id).cloned().unwrap_or_default();
        rows.sort_by_key(|l| l.step_number);
        rows
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.runs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn notify(&self, id: &str, snapshot: Option<Run>) {
        if let Some(run) = snapshot {
            self.changes.publish(id, &run);
        }
    }
}

#[async_trait]
impl RunRegistry for InMemoryRegistry {
    async fn create(&self, task: &TaskDescriptor) -> Result<Run, RegistryError> {
        let id = new_run_id();
        let record = RunRecord::queued(&id, task);
        let first_log = LogRecord {
            run_id: id.clone(),
            step_number: 1,
            message: QUEUED_LOG.to_string(),
            kind: LogKind::Lifecycle,
            screenshot_ref: None,
            timestamp: record.start_time,
        };

        let snapshot = {
            let mut tables = self.tables.write().await;
            tables.runs.insert(id.clone(), record);
            tables.logs.insert(id.clone(), vec![first_log]);
            tables.joined(&id)
        };
        debug!(run_id = %id, "Run record created");

        snapshot.ok_or(RegistryError::NotFound(id))
    }

    async fn update(&self, id: &str, update: &RunUpdate) -> Result<(), RegistryError> {
        let snapshot = {
            let mut tables = self.tables.write().await;
            let record = tables
                .runs
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            record.apply(update);
            tables.joined(id)
        };
        self.notify(id, snapshot);
        Ok(())
    }

    async fn append_log(&self, id: &str, entry: &LogEntry) -> Result<(), RegistryError> {
        let snapshot = {
            let mut tables = self.tables.write().await;
            if !tables.runs.contains_key(id) {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            tables
                .logs
                .entry(id.to_string())
                .or_default()
                .push(LogRecord::from_entry(id, entry));
            tables.joined(id)
        };
        self.notify(id, snapshot);
        Ok(())
    }

    async fn read(&self, id: &str) -> Result<Option<Run>, RegistryError> {
        Ok(self.tables.read().await.joined(id))
    }

    async fn list_for_owner(&self, owner: &str) -> Result<Vec<Run>, RegistryError> {
        let tables = self.tables.read().await;
        let mut runs: Vec<Run> = tables
            .runs
            .values()
            .filter(|r| r.owner == owner)
            .filter_map(|r| tables.joined(&r.id))
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(runs)
    }

    fn subscribe(
        &self,
        id: &str,
        on_change: Box<dyn Fn(&Run) + Send + Sync>,
    ) -> Result<Subscription, RegistryError> {
        Ok(self.changes.subscribe(id, on_change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::run::RunStatus;
    use std::sync::{Arc, Mutex};

    fn task(owner: &str) -> TaskDescriptor {
        TaskDescriptor::custom(owner, "Check open purchase orders")
    }

    #[tokio::test]
    async fn test_create_is_queued_with_first_log() {
        let registry = InMemoryRegistry::new();
        let run = registry.create(&task("alice")).await.unwrap();

        assert!(run.id.starts_with("run_"));
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.progress, 0);
        assert_eq!(run.current_step, "Initializing task...");
        assert_eq!(run.messages().collect::<Vec<_>>(), vec![QUEUED_LOG]);

        let record = registry.record(&run.id).await.unwrap();
        assert_eq!(record.custom_task.as_deref(), Some("Check open purchase orders"));
    }

    #[tokio::test]
    async fn test_update_and_read_join_logs() {
        let registry = InMemoryRegistry::new();
        let mut run = registry.create(&task("alice")).await.unwrap();

        registry
            .update(
                &run.id,
                &RunUpdate::default()
                    .status(RunStatus::Running)
                    .current_step("Working")
                    .progress(40),
            )
            .await
            .unwrap();
        let entry = run.push_log("Did a thing", LogKind::Step, Some("shot.png".to_string()));
        registry.append_log(&run.id, &entry).await.unwrap();

        let stored = registry.read(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(stored.progress, 40);
        assert_eq!(stored.logs.len(), 2);
        assert_eq!(stored.screenshots, vec!["shot.png"]);
    }

    #[test]
    fn test_missing_run() {
        let registry = InMemoryRegistry::new();
        let read = tokio_test::block_on(registry.read("nope"));
        assert!(tokio_test::assert_ok!(read).is_none());

        let update = tokio_test::block_on(registry.update("nope", &RunUpdate::default()));
        let err = tokio_test::assert_err!(update);
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_for_owner_newest_first() {
        let registry = InMemoryRegistry::new();
        let first = registry.create(&task("alice")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = registry.create(&task("alice")).await.unwrap();
        registry.create(&task("bob")).await.unwrap();

        let runs = registry.list_for_owner("alice").await.unwrap();
        let ids: Vec<_> = runs.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let registry = InMemoryRegistry::new();
        let run = registry.create(&task("alice")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = registry
            .subscribe(&run.id, Box::new(move |r| s.lock().unwrap().push(r.progress)))
            .unwrap();

        registry
            .update(&run.id, &RunUpdate::default().status(RunStatus::Running).progress(10))
            .await
            .unwrap();
        sub.unsubscribe();
        registry
            .update(&run.id, &RunUpdate::default().progress(50))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![10]);
    }
}
