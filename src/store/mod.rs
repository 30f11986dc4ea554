//! 结果存储：按 run id 追加写入步骤结果，可替换存储介质
//!
//! - `memory://`：进程内（测试与嵌入）
//! - `file://<dir>`：每个运行一个 JSON Lines 文件
//! - `sqlite://<path>`：sqlx 异步 SQLite（需 `async-sqlite` feature）
//!
//! 各介质可观察行为一致：只追加；读者看到的尝试序列是写入顺序的前缀；终态后拒绝再写。

pub mod jsonl;
pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::workflow::{RunFilter, RunRecord, RunStatus, RunSummary, StepAttempt};

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("run '{0}' not found")]
    NotFound(String),

    #[error("run '{0}' already exists")]
    AlreadyExists(String),

    /// 运行已是终态，不允许再写
    #[error("run '{run_id}' is already {status}")]
    Finalized { run_id: String, status: RunStatus },

    #[error("invalid store uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store database error: {0}")]
    Database(String),

    #[error("corrupt run data for '{run_id}': {reason}")]
    Corrupt { run_id: String, reason: String },
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// 结果存储 trait
#[async_trait]
pub trait ResultStore: Send + Sync {
    fn name(&self) -> &str;

    /// 写入运行头（status = running）
    async fn begin(&self, run: &RunRecord) -> Result<(), StoreError>;

    /// 追加一次尝试
    async fn append(&self, run_id: &str, attempt: &StepAttempt) -> Result<(), StoreError>;

    /// 写入终态
    async fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        failure: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn load(&self, run_id: &str) -> Result<RunRecord, StoreError>;

    /// 按开始时间、run id 排序
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError>;
}

/// 存储位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
    Sqlite(PathBuf),
}

impl StoreLocation {
    pub fn parse(uri: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("expected <scheme>://<path>"))?;
        match scheme.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreLocation::Memory),
            "file" if !rest.is_empty() => Ok(StoreLocation::File(PathBuf::from(rest))),
            "sqlite" if !rest.is_empty() => Ok(StoreLocation::Sqlite(PathBuf::from(rest))),
            "file" | "sqlite" => Err(invalid("missing path")),
            _ => Err(invalid("unsupported scheme (expected memory, file or sqlite)")),
        }
    }
}

/// 按 URI 打开存储
pub async fn open_store(uri: &str) -> Result<Arc<dyn ResultStore>, StoreError> {
    let store: Arc<dyn ResultStore> = match StoreLocation::parse(uri)? {
        StoreLocation::Memory => Arc::new(MemoryStore::new()),
        StoreLocation::File(dir) => Arc::new(JsonlStore::open(dir).await?),
        #[cfg(feature = "async-sqlite")]
        StoreLocation::Sqlite(path) => Arc::new(SqliteStore::open(path).await?),
        #[cfg(not(feature = "async-sqlite"))]
        StoreLocation::Sqlite(_) => {
            return Err(StoreError::InvalidUri {
                uri: uri.to_string(),
                reason: "built without the async-sqlite feature".to_string(),
            })
        }
    };
    tracing::debug!(store = store.name(), uri, "result store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locations() {
        assert_eq!(StoreLocation::parse("memory://").unwrap(), StoreLocation::Memory);
        assert_eq!(
            StoreLocation::parse("file://runs").unwrap(),
            StoreLocation::File(PathBuf::from("runs"))
        );
        assert_eq!(
            StoreLocation::parse("sqlite:///var/lib/planrun.db").unwrap(),
            StoreLocation::Sqlite(PathBuf::from("/var/lib/planrun.db"))
        );
        assert!(StoreLocation::parse("file://").is_err());
        assert!(StoreLocation::parse("s3://bucket").is_err());
        assert!(StoreLocation::parse("runs").is_err());
    }
}
