//! 进程内结果存储

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::store::{ResultStore, StoreError};
use crate::workflow::run::sort_summaries;
use crate::workflow::{RunFilter, RunRecord, RunStatus, RunSummary, StepAttempt};

#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<String, RunRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn begin(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::AlreadyExists(run.run_id.clone()));
        }
        let mut header = run.clone();
        header.attempts.clear();
        runs.insert(run.run_id.clone(), header);
        Ok(())
    }

    async fn append(&self, run_id: &str, attempt: &StepAttempt) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StoreError::Finalized {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        run.attempts.push(attempt.clone());
        Ok(())
    }

    async fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        failure: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StoreError::Finalized {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        run.status = status;
        run.ended_at = Some(ended_at);
        run.failure = failure.map(String::from);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let mut list: Vec<RunSummary> = self
            .runs
            .read()
            .await
            .values()
            .map(RunRecord::summary)
            .filter(|s| filter.matches(s))
            .collect();
        sort_summaries(&mut list);
        Ok(list)
    }
}
