//! In-memory implementation of RunStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Internal per-run state
struct RunEntry {
    run: WorkflowRun,
    steps: Vec<StepRecord>,
}

/// In-memory implementation of RunStore
///
/// This is primarily for testing and local development. It provides the
/// same semantics as the PostgreSQL implementation, including version
/// compare-and-swap, but nothing survives the process.
///
/// # Example
///
/// ```
/// use storefront_durable::InMemoryRunStore;
///
/// let store = InMemoryRunStore::new();
/// assert_eq!(store.run_count(), 0);
/// ```
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, RunEntry>>,
}

impl InMemoryRunStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Overwrite a run as-is, bypassing version checks
    ///
    /// Used to stage crash scenarios in tests.
    pub fn put_run(&self, run: WorkflowRun) {
        let mut runs = self.runs.write();
        match runs.get_mut(&run.id) {
            Some(entry) => entry.run = run,
            None => {
                runs.insert(run.id, RunEntry { run, steps: vec![] });
            }
        }
    }

    /// Insert a step record directly, bypassing the run's version
    pub fn put_step_record(&self, record: StepRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let entry = runs
            .get_mut(&record.run_id)
            .ok_or(StoreError::RunNotFound(record.run_id))?;
        upsert_record(&mut entry.steps, record);
        Ok(())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert_record(steps: &mut Vec<StepRecord>, record: StepRecord) {
    match steps.iter_mut().find(|r| r.step_name == record.step_name) {
        Some(existing) => *existing = record,
        None => steps.push(record),
    }
}

fn check_version(run: &WorkflowRun, expected_version: i64) -> Result<(), StoreError> {
    if run.version != expected_version {
        return Err(StoreError::ConcurrencyConflict {
            run_id: run.id,
            expected: expected_version,
            actual: run.version,
        });
    }
    Ok(())
}

fn oldest_first(mut runs: Vec<WorkflowRun>) -> Vec<WorkflowRun> {
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    runs
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_runs(&self, runs: &[WorkflowRun]) -> Result<(), StoreError> {
        let mut stored = self.runs.write();
        if let Some(existing) = runs.iter().find(|r| stored.contains_key(&r.id)) {
            return Err(StoreError::Database(format!(
                "run {} already exists",
                existing.id
            )));
        }

        for run in runs {
            stored.insert(
                run.id,
                RunEntry {
                    run: run.clone(),
                    steps: vec![],
                },
            );
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|e| e.run.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let runs = self
            .runs
            .read()
            .values()
            .filter(|e| filter.matches(&e.run))
            .map(|e| e.run.clone())
            .collect();

        Ok(oldest_first(runs)
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn step_records(&self, run_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let runs = self.runs.read();
        let entry = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        let mut records = entry.steps.clone();
        records.sort_by_key(|r| r.completed_at);
        Ok(records)
    }

    async fn claim_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut runs = self.runs.write();
        let entry = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        check_version(&entry.run, expected_version)?;
        if entry.run.state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: entry.run.state,
                to: RunState::Running,
            });
        }

        let mut update = RunUpdate::from_run(&entry.run, now);
        update.state = RunState::Running;
        update.wake_at = None;
        update.apply(&mut entry.run);

        Ok(entry.run.clone())
    }

    async fn heartbeat_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut runs = self.runs.write();
        let entry = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        if entry.run.version != expected_version || entry.run.state != RunState::Running {
            return Ok(false);
        }
        entry.run.updated_at = now;
        Ok(true)
    }

    async fn checkpoint(
        &self,
        run_id: Uuid,
        expected_version: i64,
        update: RunUpdate,
        record: Option<StepRecord>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut runs = self.runs.write();
        let entry = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        check_version(&entry.run, expected_version)?;

        update.apply(&mut entry.run);
        if let Some(record) = record {
            upsert_record(&mut entry.steps, record);
        }

        Ok(entry.run.clone())
    }

    async fn cancel_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut runs = self.runs.write();
        let entry = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        if entry.run.state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: entry.run.state,
                to: RunState::Cancelled,
            });
        }

        let mut update = RunUpdate::from_run(&entry.run, now);
        update.state = RunState::Cancelled;
        update.wake_at = None;
        update.apply(&mut entry.run);

        Ok(entry.run.clone())
    }

    async fn reset_failed_run(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkflowRun, StoreError> {
        let mut runs = self.runs.write();
        let entry = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        if entry.run.state != RunState::Failed {
            return Err(StoreError::InvalidTransition {
                run_id,
                from: entry.run.state,
                to: RunState::Pending,
            });
        }

        let mut update = RunUpdate::from_run(&entry.run, now);
        update.state = RunState::Pending;
        update.attempt = 0;
        update.wake_at = None;
        update.apply(&mut entry.run);

        Ok(entry.run.clone())
    }

    async fn due_runs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let runs = self
            .runs
            .read()
            .values()
            .filter(|e| e.run.is_due(now))
            .map(|e| e.run.clone())
            .collect();

        Ok(oldest_first(runs).into_iter().take(limit).collect())
    }

    async fn stale_runs(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let runs = self
            .runs
            .read()
            .values()
            .filter(|e| e.run.state == RunState::Running && e.run.updated_at < stale_before)
            .map(|e| e.run.clone())
            .collect();

        Ok(oldest_first(runs).into_iter().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Event, StepError};

    fn pending_run(now: DateTime<Utc>) -> WorkflowRun {
        WorkflowRun::new(
            "low-stock-alert",
            Event::new(
                "app/product.stock_updated",
                serde_json::json!({"productId": "p1", "stock": 3, "storeId": "s1"}),
            ),
            now,
        )
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let store = InMemoryRunStore::new();
        let run = pending_run(Utc::now());

        store.create_runs(&[run.clone()]).await.unwrap();

        assert_eq!(store.get_run(run.id).await.unwrap(), run);
        assert_eq!(store.run_count(), 1);
    }

    #[tokio::test]
    async fn test_create_runs_is_all_or_nothing() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let existing = pending_run(now);
        store.create_runs(&[existing.clone()]).await.unwrap();

        let result = store.create_runs(&[pending_run(now), existing]).await;

        assert!(result.is_err());
        assert_eq!(store.run_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_requires_current_version() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let run = pending_run(now);
        store.create_runs(&[run.clone()]).await.unwrap();

        let claimed = store.claim_run(run.id, 0, now).await.unwrap();
        assert_eq!(claimed.state, RunState::Running);
        assert_eq!(claimed.version, 1);

        // A second worker holding the old version loses
        let result = store.claim_run(run.id, 0, now).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { expected: 0, actual: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_running_run_under_its_version() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let run = pending_run(now);
        store.create_runs(&[run.clone()]).await.unwrap();
        let claimed = store.claim_run(run.id, 0, now).await.unwrap();

        let later = now + chrono::Duration::minutes(10);
        assert!(store.heartbeat_run(run.id, claimed.version, later).await.unwrap());

        let current = store.get_run(run.id).await.unwrap();
        assert_eq!(current.updated_at, later);
        assert_eq!(current.version, claimed.version);
        assert!(store
            .stale_runs(later - chrono::Duration::minutes(5), 10)
            .await
            .unwrap()
            .is_empty());

        // Cancelled under the worker: heartbeat is refused
        store.cancel_run(run.id, later).await.unwrap();
        assert!(!store.heartbeat_run(run.id, claimed.version, later).await.unwrap());
        assert!(matches!(
            store.heartbeat_run(Uuid::now_v7(), 0, later).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_writes_record_and_run() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let run = pending_run(now);
        store.create_runs(&[run.clone()]).await.unwrap();
        let claimed = store.claim_run(run.id, 0, now).await.unwrap();

        let mut update = RunUpdate::from_run(&claimed, now);
        update.current_step_index = 1;
        let record = StepRecord::succeeded(run.id, "notify-seller", serde_json::json!({}), 1, now);

        let updated = store
            .checkpoint(run.id, claimed.version, update, Some(record))
            .await
            .unwrap();

        assert_eq!(updated.current_step_index, 1);
        let records = store.step_records(run.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_step_record_is_upserted_per_step() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let run = pending_run(now);
        store.create_runs(&[run.clone()]).await.unwrap();

        store
            .put_step_record(StepRecord::failed(
                run.id,
                "notify-seller",
                StepError::retryable("sink down"),
                3,
                now,
            ))
            .unwrap();
        store
            .put_step_record(StepRecord::succeeded(
                run.id,
                "notify-seller",
                serde_json::json!({"alert": "low_stock"}),
                1,
                now,
            ))
            .unwrap();

        let records = store.step_records(run.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_due_and_stale_runs() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();

        let pending = pending_run(now);

        let mut sleeping_due = pending_run(now);
        sleeping_due.state = RunState::Sleeping;
        sleeping_due.wake_at = Some(now - chrono::Duration::minutes(1));

        let mut sleeping_later = pending_run(now);
        sleeping_later.state = RunState::Sleeping;
        sleeping_later.wake_at = Some(now + chrono::Duration::hours(2));

        let mut stuck = pending_run(now);
        stuck.state = RunState::Running;
        stuck.updated_at = now - chrono::Duration::minutes(30);

        store
            .create_runs(&[
                pending.clone(),
                sleeping_due.clone(),
                sleeping_later.clone(),
                stuck.clone(),
            ])
            .await
            .unwrap();

        let due: Vec<_> = store
            .due_runs(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(due.len(), 2);
        assert!(due.contains(&pending.id));
        assert!(due.contains(&sleeping_due.id));

        let stale = store
            .stale_runs(now - chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, stuck.id);
    }

    #[tokio::test]
    async fn test_cancel_and_reset() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();

        let run = pending_run(now);
        let mut failed = pending_run(now);
        failed.state = RunState::Failed;
        failed.attempt = 3;
        store.create_runs(&[run.clone(), failed.clone()]).await.unwrap();

        let cancelled = store.cancel_run(run.id, now).await.unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert!(matches!(
            store.cancel_run(run.id, now).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        let reset = store.reset_failed_run(failed.id, now).await.unwrap();
        assert_eq!(reset.state, RunState::Pending);
        assert_eq!(reset.attempt, 0);
        assert!(matches!(
            store.reset_failed_run(run.id, now).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_runs_filter() {
        let store = InMemoryRunStore::new();
        let now = Utc::now();
        let run = pending_run(now);
        let mut failed = pending_run(now);
        failed.state = RunState::Failed;
        store.create_runs(&[run, failed.clone()]).await.unwrap();

        let listed = store
            .list_runs(RunFilter::state(RunState::Failed), Pagination::default())
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, failed.id);
    }
}
