//! 结果存储集成测试：三种介质行为一致

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use planrun::store::{open_store, MemoryStore, ResultStore, StoreError};
    use planrun::workflow::{
        AttemptStatus, PlanBuilder, RunFilter, RunRecord, RunStatus, StepAttempt, StepBuilder,
        ToolInvocationRecord,
    };

    fn record(plan_name: &str) -> RunRecord {
        let plan = PlanBuilder::new(plan_name)
            .step(StepBuilder::new("build", "Build").tool("echo"))
            .build()
            .unwrap();
        RunRecord::new(&plan)
    }

    fn attempt(step: &str, visit: u32, n: u32, status: AttemptStatus) -> StepAttempt {
        let started = Utc::now();
        StepAttempt {
            step_id: step.to_string(),
            visit,
            attempt: n,
            started_at: started,
            finished_at: started + Duration::milliseconds(25),
            request: "3 message(s); candidates: echo".to_string(),
            response: Some("call echo {\"text\":\"hi\"}".to_string()),
            invocation: Some(ToolInvocationRecord {
                name: "echo".to_string(),
                arguments: json!({"text": "hi"}),
                result: (status == AttemptStatus::Succeeded).then(|| "hi".to_string()),
                error: (status == AttemptStatus::Failed).then(|| "exit 1".to_string()),
            }),
            status,
            detail: format!("attempt {n}"),
        }
    }

    /// 增量写入后整体读回：顺序、状态、时间戳一致；终态后拒绝写入
    async fn exercise(store: Arc<dyn ResultStore>) {
        let mut run = record("deploy");
        store.begin(&run).await.unwrap();
        assert!(matches!(
            store.begin(&run).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let attempts = vec![
            attempt("build", 1, 1, AttemptStatus::Succeeded),
            attempt("deploy", 2, 1, AttemptStatus::Failed),
            attempt("deploy", 2, 2, AttemptStatus::Succeeded),
        ];
        for a in &attempts {
            store.append(&run.run_id, a).await.unwrap();
        }

        let partial = store.load(&run.run_id).await.unwrap();
        assert_eq!(partial.status, RunStatus::Running);
        assert_eq!(partial.attempts, attempts);

        let ended = Utc::now();
        store
            .finish(&run.run_id, RunStatus::Completed, ended, None)
            .await
            .unwrap();
        run.attempts = attempts;
        run.status = RunStatus::Completed;
        run.ended_at = Some(ended);

        let loaded = store.load(&run.run_id).await.unwrap();
        assert_eq!(loaded, run);

        assert!(matches!(
            store
                .append(&run.run_id, &attempt("late", 3, 1, AttemptStatus::Succeeded))
                .await,
            Err(StoreError::Finalized { .. })
        ));
        assert!(matches!(
            store.load("run_does_not_exist").await,
            Err(StoreError::NotFound(_))
        ));
    }

    /// 按开始时间 + run id 排序，并按状态 / 计划名过滤
    async fn exercise_listing(store: Arc<dyn ResultStore>) {
        let mut older = record("nightly");
        older.started_at = Utc::now() - Duration::hours(2);
        let newer = record("release");
        let mut aborted = record("nightly");
        aborted.started_at = Utc::now() - Duration::hours(1);

        for r in [&newer, &older, &aborted] {
            store.begin(r).await.unwrap();
        }
        store
            .append(&aborted.run_id, &attempt("build", 1, 1, AttemptStatus::Failed))
            .await
            .unwrap();
        store
            .finish(&aborted.run_id, RunStatus::Aborted, Utc::now(), Some("step 'build' exhausted"))
            .await
            .unwrap();

        let all = store.list_runs(&RunFilter::default()).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.run_id.as_str()).collect();
        assert_eq!(ids, vec![older.run_id.as_str(), aborted.run_id.as_str(), newer.run_id.as_str()]);
        assert_eq!(all[1].attempts, 1);
        assert_eq!(all[1].status, RunStatus::Aborted);

        let nightly = store
            .list_runs(&RunFilter {
                status: None,
                plan: Some("nightly".into()),
            })
            .await
            .unwrap();
        assert_eq!(nightly.len(), 2);

        let running_nightly = store
            .list_runs(&RunFilter {
                status: Some(RunStatus::Running),
                plan: Some("nightly".into()),
            })
            .await
            .unwrap();
        assert_eq!(running_nightly.len(), 1);
        assert_eq!(running_nightly[0].run_id, older.run_id);

        let loaded = store.load(&aborted.run_id).await.unwrap();
        assert_eq!(loaded.failure.as_deref(), Some("step 'build' exhausted"));
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        exercise(Arc::new(MemoryStore::new())).await;
        exercise_listing(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_jsonl_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().join("runs").display());
        exercise(open_store(&uri).await.unwrap()).await;

        let other = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", other.path().display());
        exercise_listing(open_store(&uri).await.unwrap()).await;
    }

    #[tokio::test]
    async fn test_jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().display());
        let run = record("deploy");
        {
            let store = open_store(&uri).await.unwrap();
            store.begin(&run).await.unwrap();
            store
                .append(&run.run_id, &attempt("build", 1, 1, AttemptStatus::Failed))
                .await
                .unwrap();
        }
        let store = open_store(&uri).await.unwrap();
        let loaded = store.load(&run.run_id).await.unwrap();
        assert_eq!(loaded.attempts.len(), 1);
        assert_eq!(loaded.status, RunStatus::Running);
        store
            .append(&run.run_id, &attempt("build", 1, 2, AttemptStatus::Succeeded))
            .await
            .unwrap();
        assert_eq!(store.load(&run.run_id).await.unwrap().attempts.len(), 2);
    }

    #[cfg(feature = "async-sqlite")]
    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("sqlite://{}", dir.path().join("runs.db").display());
        exercise(open_store(&uri).await.unwrap()).await;

        let uri = format!("sqlite://{}", dir.path().join("listing.db").display());
        exercise_listing(open_store(&uri).await.unwrap()).await;
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        assert!(matches!(
            open_store("ftp://runs").await,
            Err(StoreError::InvalidUri { .. })
        ));
    }
}
