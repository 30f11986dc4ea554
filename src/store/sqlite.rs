//! 异步 SQLite 结果存储（sqlx）
//!
//! 两张表：runs（运行头与终态）与 attempts（(run_id, seq) 主键，seq 即写入顺序）。
//! 时间戳以 RFC3339 文本保存，工具调用记录以 JSON 文本保存。

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::store::{ResultStore, StoreError};
use crate::workflow::{
    AttemptStatus, RunFilter, RunRecord, RunStatus, RunSummary, StepAttempt, ToolInvocationRecord,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                plan_name TEXT NOT NULL,
                plan_source TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                failure TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS attempts (
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                step_id TEXT NOT NULL,
                visit INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                request TEXT NOT NULL,
                response TEXT,
                invocation TEXT,
                status TEXT NOT NULL,
                detail TEXT NOT NULL,
                PRIMARY KEY (run_id, seq),
                FOREIGN KEY (run_id) REFERENCES runs(run_id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at, run_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn current_status(&self, run_id: &str) -> Result<RunStatus, StoreError> {
        let row = sqlx::query("SELECT status FROM runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let status: String = row.get("status");
        parse_status(run_id, &status)
    }

    async fn ensure_open(&self, run_id: &str) -> Result<(), StoreError> {
        let status = self.current_status(run_id).await?;
        if status.is_terminal() {
            return Err(StoreError::Finalized {
                run_id: run_id.to_string(),
                status,
            });
        }
        Ok(())
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(run_id: &str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            run_id: run_id.to_string(),
            reason: format!("bad timestamp '{s}': {e}"),
        })
}

fn parse_status(run_id: &str, s: &str) -> Result<RunStatus, StoreError> {
    RunStatus::from_str(s).map_err(|reason| StoreError::Corrupt {
        run_id: run_id.to_string(),
        reason,
    })
}

fn summary_from_row(row: &SqliteRow) -> Result<RunSummary, StoreError> {
    let run_id: String = row.get("run_id");
    let status: String = row.get("status");
    let started_at: String = row.get("started_at");
    let ended_at: Option<String> = row.get("ended_at");
    let attempts: i64 = row.get("attempt_count");
    Ok(RunSummary {
        status: parse_status(&run_id, &status)?,
        started_at: parse_ts(&run_id, &started_at)?,
        ended_at: ended_at.map(|s| parse_ts(&run_id, &s)).transpose()?,
        plan_name: row.get("plan_name"),
        attempts: attempts as usize,
        run_id,
    })
}

fn attempt_from_row(run_id: &str, row: &SqliteRow) -> Result<StepAttempt, StoreError> {
    let visit: i64 = row.get("visit");
    let attempt: i64 = row.get("attempt");
    let started_at: String = row.get("started_at");
    let finished_at: String = row.get("finished_at");
    let invocation: Option<String> = row.get("invocation");
    let status: String = row.get("status");
    Ok(StepAttempt {
        step_id: row.get("step_id"),
        visit: visit as u32,
        attempt: attempt as u32,
        started_at: parse_ts(run_id, &started_at)?,
        finished_at: parse_ts(run_id, &finished_at)?,
        request: row.get("request"),
        response: row.get("response"),
        invocation: invocation
            .map(|s| serde_json::from_str::<ToolInvocationRecord>(&s))
            .transpose()?,
        status: AttemptStatus::from_str(&status).map_err(|reason| StoreError::Corrupt {
            run_id: run_id.to_string(),
            reason,
        })?,
        detail: row.get("detail"),
    })
}

#[async_trait]
impl ResultStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn begin(&self, run: &RunRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO runs (run_id, plan_name, plan_source, status, started_at, ended_at, failure)
             VALUES (?, ?, ?, ?, ?, NULL, NULL)",
        )
        .bind(&run.run_id)
        .bind(&run.plan_name)
        .bind(&run.plan_source)
        .bind(RunStatus::Running.as_str())
        .bind(ts(&run.started_at))
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::AlreadyExists(run.run_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, run_id: &str, attempt: &StepAttempt) -> Result<(), StoreError> {
        self.ensure_open(run_id).await?;
        let invocation = attempt
            .invocation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO attempts
                (run_id, seq, step_id, visit, attempt, started_at, finished_at, request, response, invocation, status, detail)
             VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM attempts WHERE run_id = ?), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(run_id)
        .bind(&attempt.step_id)
        .bind(attempt.visit as i64)
        .bind(attempt.attempt as i64)
        .bind(ts(&attempt.started_at))
        .bind(ts(&attempt.finished_at))
        .bind(&attempt.request)
        .bind(attempt.response.as_deref())
        .bind(invocation)
        .bind(attempt.status.as_str())
        .bind(&attempt.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        failure: Option<&str>,
    ) -> Result<(), StoreError> {
        self.ensure_open(run_id).await?;
        sqlx::query("UPDATE runs SET status = ?, ended_at = ?, failure = ? WHERE run_id = ? AND status = ?")
            .bind(status.as_str())
            .bind(ts(&ended_at))
            .bind(failure)
            .bind(run_id)
            .bind(RunStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        let row = sqlx::query(
            "SELECT run_id, plan_name, plan_source, status, started_at, ended_at, failure
             FROM runs WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;

        let status: String = row.get("status");
        let started_at: String = row.get("started_at");
        let ended_at: Option<String> = row.get("ended_at");

        let rows = sqlx::query("SELECT * FROM attempts WHERE run_id = ? ORDER BY seq ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let attempts = rows
            .iter()
            .map(|r| attempt_from_row(run_id, r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RunRecord {
            run_id: row.get("run_id"),
            plan_name: row.get("plan_name"),
            plan_source: row.get("plan_source"),
            attempts,
            status: parse_status(run_id, &status)?,
            started_at: parse_ts(run_id, &started_at)?,
            ended_at: ended_at.map(|s| parse_ts(run_id, &s)).transpose()?,
            failure: row.get("failure"),
        })
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT r.run_id, r.plan_name, r.status, r.started_at, r.ended_at,
                    (SELECT COUNT(*) FROM attempts a WHERE a.run_id = r.run_id) AS attempt_count
             FROM runs r
             WHERE (? IS NULL OR r.status = ?) AND (? IS NULL OR r.plan_name = ?)
             ORDER BY r.started_at ASC, r.run_id ASC",
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.plan.as_deref())
        .bind(filter.plan.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut list = rows
            .iter()
            .map(summary_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RFC3339 文本排序对不同时区偏移不可靠，按解析后的时间再排一次
        crate::workflow::run::sort_summaries(&mut list);
        Ok(list)
    }
}
