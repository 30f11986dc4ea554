//! JSON Lines 结果存储：`<dir>/<run_id>.jsonl`
//!
//! 每行一个条目（run 头 / attempt / finish），只追加。只有没有换行结尾的尾行允许解析失败
//! （写到一半的条目对读者不可见），下一次追加前会先截掉它；其它位置的坏行视为文件损坏。

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::store::{ResultStore, StoreError};
use crate::workflow::run::sort_summaries;
use crate::workflow::{RunFilter, RunRecord, RunStatus, RunSummary, StepAttempt};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonlEntry {
    Run {
        run_id: String,
        plan_name: String,
        plan_source: String,
        started_at: DateTime<Utc>,
    },
    Attempt {
        attempt: StepAttempt,
    },
    Finish {
        status: RunStatus,
        ended_at: DateTime<Utc>,
        failure: Option<String>,
    },
}

// ============================================================================
// File Operations (blocking, run via spawn_blocking)
// ============================================================================

fn read_entries_sync(run_id: &str, path: &Path) -> Result<Vec<JsonlEntry>, StoreError> {
    // 截断的尾行可能切开多字节字符
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let terminated = text.ends_with('\n');
    let lines: Vec<&str> = text.split_terminator('\n').collect();
    let mut entries = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonlEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if !terminated && idx + 1 == lines.len() => {
                tracing::debug!(path = %path.display(), error = %e, "ignoring unterminated trailing entry");
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    run_id: run_id.to_string(),
                    reason: format!("line {}: {e}", idx + 1),
                });
            }
        }
    }
    Ok(entries)
}

fn append_entry_sync(path: &Path, entry: &JsonlEntry) -> Result<(), StoreError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    // 上一次写入被截断（没有换行结尾）时，先截掉残缺的尾行
    let len = file.metadata()?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            let mut content = Vec::with_capacity(len as usize);
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut content)?;
            let keep = content
                .iter()
                .rposition(|b| *b == b'\n')
                .map_or(0, |pos| pos as u64 + 1);
            file.set_len(keep)?;
        }
    }

    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

fn reconstruct(run_id: &str, entries: Vec<JsonlEntry>) -> Result<RunRecord, StoreError> {
    let corrupt = |reason: &str| StoreError::Corrupt {
        run_id: run_id.to_string(),
        reason: reason.to_string(),
    };
    let mut iter = entries.into_iter();
    let mut record = match iter.next() {
        Some(JsonlEntry::Run {
            run_id,
            plan_name,
            plan_source,
            started_at,
        }) => RunRecord {
            run_id,
            plan_name,
            plan_source,
            attempts: Vec::new(),
            status: RunStatus::Running,
            started_at,
            ended_at: None,
            failure: None,
        },
        _ => return Err(corrupt("missing run header")),
    };
    for entry in iter {
        match entry {
            JsonlEntry::Attempt { attempt } => record.attempts.push(attempt),
            JsonlEntry::Finish {
                status,
                ended_at,
                failure,
            } => {
                record.status = status;
                record.ended_at = Some(ended_at);
                record.failure = failure;
            }
            JsonlEntry::Run { .. } => return Err(corrupt("duplicate run header")),
        }
    }
    Ok(record)
}

fn valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ============================================================================
// JSONL Store
// ============================================================================

pub struct JsonlStore {
    dir: PathBuf,
    /// 写锁 + 已知运行状态缓存（终态后拒绝写入）
    known: Mutex<HashMap<String, RunStatus>>,
}

impl JsonlStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            known: Mutex::new(HashMap::new()),
        })
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        if !valid_run_id(run_id) {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        Ok(self.dir.join(format!("{run_id}.jsonl")))
    }

    async fn read_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        let path = self.run_path(run_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        let id = run_id.to_string();
        let entries = tokio::task::spawn_blocking(move || read_entries_sync(&id, &path))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        reconstruct(run_id, entries)
    }

    async fn write(&self, run_id: &str, entry: JsonlEntry) -> Result<(), StoreError> {
        let path = self.run_path(run_id)?;
        tokio::task::spawn_blocking(move || append_entry_sync(&path, &entry))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    /// 写入前确认运行存在且未终结（调用方持有写锁）
    async fn ensure_open(
        &self,
        known: &mut HashMap<String, RunStatus>,
        run_id: &str,
    ) -> Result<(), StoreError> {
        let status = match known.get(run_id) {
            Some(s) => *s,
            None => {
                let status = self.read_run(run_id).await?.status;
                known.insert(run_id.to_string(), status);
                status
            }
        };
        if status.is_terminal() {
            return Err(StoreError::Finalized {
                run_id: run_id.to_string(),
                status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for JsonlStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn begin(&self, run: &RunRecord) -> Result<(), StoreError> {
        let mut known = self.known.lock().await;
        let path = self.run_path(&run.run_id)?;
        if known.contains_key(&run.run_id) || tokio::fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists(run.run_id.clone()));
        }
        self.write(
            &run.run_id,
            JsonlEntry::Run {
                run_id: run.run_id.clone(),
                plan_name: run.plan_name.clone(),
                plan_source: run.plan_source.clone(),
                started_at: run.started_at,
            },
        )
        .await?;
        known.insert(run.run_id.clone(), RunStatus::Running);
        Ok(())
    }

    async fn append(&self, run_id: &str, attempt: &StepAttempt) -> Result<(), StoreError> {
        let mut known = self.known.lock().await;
        self.ensure_open(&mut known, run_id).await?;
        self.write(
            run_id,
            JsonlEntry::Attempt {
                attempt: attempt.clone(),
            },
        )
        .await
    }

    async fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        failure: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut known = self.known.lock().await;
        self.ensure_open(&mut known, run_id).await?;
        self.write(
            run_id,
            JsonlEntry::Finish {
                status,
                ended_at,
                failure: failure.map(String::from),
            },
        )
        .await?;
        known.insert(run_id.to_string(), status);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        self.read_run(run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StoreError> {
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        let mut list = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(run_id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            match self.read_run(&run_id).await {
                Ok(record) => {
                    let summary = record.summary();
                    if filter.matches(&summary) {
                        list.push(summary);
                    }
                }
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "skipping unreadable run file"),
            }
        }
        sort_summaries(&mut list);
        Ok(list)
    }
}
