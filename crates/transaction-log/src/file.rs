//! Append-only file backend.
//!
//! Each state change appends one JSON line and syncs it to disk before the
//! call returns. Replaying the file rebuilds the live entries. A torn final
//! line (crash in the middle of a write) is dropped on open; a malformed line
//! anywhere else is reported as corruption. A write that fails part way
//! leaves the file damaged, and the next append rewrites it from the live
//! entries before writing anything new.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProcessHandle, ResourceId, Xid};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{LogEntry, LogError, LogState, LogStream, Result, TransactionLog};

/// Compaction kicks in once the file holds this many records and at least
/// twice as many records as live entries.
const DEFAULT_COMPACT_AFTER: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Put { entry: LogEntry },
    Remove { xid: Xid },
}

impl Record {
    fn apply(self, entries: &mut HashMap<Xid, LogEntry>) {
        match self {
            Record::Put { entry } => {
                entries.insert(entry.xid.clone(), entry);
            }
            Record::Remove { xid } => {
                entries.remove(&xid);
            }
        }
    }
}

struct Replayed {
    entries: HashMap<Xid, LogEntry>,
    records: usize,
    torn: bool,
}

struct FileLogInner {
    file: File,
    entries: HashMap<Xid, LogEntry>,
    records: usize,
    /// Set when a write failed; the file may end in a partial line.
    damaged: bool,
}

/// Transaction log persisted to a single append-only file.
#[derive(Clone)]
pub struct FileTransactionLog {
    path: Arc<PathBuf>,
    inner: Arc<Mutex<FileLogInner>>,
    compact_after: usize,
}

impl FileTransactionLog {
    /// Opens (or creates) the log at `path` and replays it.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let replayed = match tokio::fs::read(&path).await {
            Ok(bytes) => replay(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Replayed {
                entries: HashMap::new(),
                records: 0,
                torn: false,
            },
            Err(e) => return Err(e.into()),
        };

        let (file, records) = if replayed.torn {
            tracing::warn!("dropping torn record at end of transaction log");
            (rewrite(&path, &replayed.entries).await?, replayed.entries.len())
        } else {
            (open_append(&path).await?, replayed.records)
        };

        tracing::info!(
            entries = replayed.entries.len(),
            records,
            "transaction log opened"
        );

        Ok(Self {
            path: Arc::new(path),
            inner: Arc::new(Mutex::new(FileLogInner {
                file,
                entries: replayed.entries,
                records,
                damaged: false,
            })),
            compact_after: DEFAULT_COMPACT_AFTER,
        })
    }

    /// Overrides the compaction threshold.
    pub fn with_compact_after(mut self, records: usize) -> Self {
        self.compact_after = records;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the file so it holds exactly one record per live entry.
    pub async fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.compact_locked(&mut inner).await
    }

    async fn compact_locked(&self, inner: &mut FileLogInner) -> Result<()> {
        inner.file = rewrite(&self.path, &inner.entries).await?;
        inner.records = inner.entries.len();
        inner.damaged = false;
        tracing::debug!(records = inner.records, "transaction log compacted");
        Ok(())
    }

    async fn append(&self, inner: &mut FileLogInner, record: Record) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if inner.damaged {
            tracing::warn!("rewriting transaction log after failed write");
            self.compact_locked(inner).await?;
        }
        if let Err(err) = Self::write_line(&mut inner.file, &line).await {
            tracing::error!(error = %err, "transaction log write failed");
            inner.damaged = true;
            return Err(err.into());
        }
        metrics::counter!("tm_log_writes_total").increment(1);

        record.apply(&mut inner.entries);
        inner.records += 1;

        if inner.records >= self.compact_after && inner.records >= inner.entries.len() * 2 {
            self.compact_locked(inner).await?;
        }
        Ok(())
    }

    async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
        file.write_all(line).await?;
        file.sync_data().await
    }

    async fn put(&self, inner: &mut FileLogInner, entry: LogEntry) -> Result<()> {
        self.append(inner, Record::Put { entry }).await
    }

    fn sorted(entries: &HashMap<Xid, LogEntry>) -> Vec<LogEntry> {
        let mut entries: Vec<_> = entries.values().cloned().collect();
        entries.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.xid.cmp(&b.xid)));
        entries
    }
}

fn replay(bytes: &[u8]) -> Result<Replayed> {
    let complete = bytes.is_empty() || bytes.ends_with(b"\n");
    let lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
    let last = lines.len();

    let mut entries = HashMap::new();
    let mut records = 0;
    for (index, line) in lines.into_iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Record>(line) {
            Ok(record) => {
                record.apply(&mut entries);
                records += 1;
            }
            Err(_) if index + 1 == last && !complete => {
                return Ok(Replayed {
                    entries,
                    records,
                    torn: true,
                });
            }
            Err(e) => {
                return Err(LogError::Corrupt {
                    line: index + 1,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(Replayed {
        entries,
        records,
        torn: !complete,
    })
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Writes the live entries to a sibling file, syncs it and renames it over
/// the log, then reopens the log for appending.
async fn rewrite(path: &Path, entries: &HashMap<Xid, LogEntry>) -> Result<File> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).await?;
    for entry in FileTransactionLog::sorted(entries) {
        let mut line = serde_json::to_vec(&Record::Put { entry })?;
        line.push(b'\n');
        file.write_all(&line).await?;
    }
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    open_append(path).await
}

#[async_trait]
impl TransactionLog for FileTransactionLog {
    async fn begin(&self, entry: LogEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.put(&mut inner, entry).await
    }

    async fn prepare(
        &self,
        xid: &Xid,
        owner: &ProcessHandle,
        resources: &[ResourceId],
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = match inner.entries.get(xid) {
            Some(existing) => LogEntry {
                state: LogState::Prepared,
                resources: resources.to_vec(),
                updated: Utc::now(),
                ..existing.clone()
            },
            None => LogEntry::prepared(xid.clone(), *owner, resources.to_vec()),
        };
        self.put(&mut inner, entry).await
    }

    async fn timeout(&self, xid: &Xid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(existing) = inner.entries.get(xid) else {
            return Ok(());
        };
        let entry = LogEntry {
            state: LogState::Timeout,
            updated: Utc::now(),
            ..existing.clone()
        };
        self.put(&mut inner, entry).await
    }

    async fn remove(&self, xid: &Xid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(xid) {
            return Ok(());
        }
        self.append(&mut inner, Record::Remove { xid: xid.clone() })
            .await
    }

    async fn select(&self, xid: &Xid) -> Result<Option<LogEntry>> {
        Ok(self.inner.lock().await.entries.get(xid).cloned())
    }

    async fn scan(&self) -> Result<LogStream> {
        use futures_util::stream;

        let entries = Self::sorted(&self.inner.lock().await.entries);
        Ok(Box::pin(stream::iter(entries.into_iter().map(Ok))))
    }

    async fn passed(&self, now: DateTime<Utc>) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().await;
        Ok(Self::sorted(&inner.entries)
            .into_iter()
            .filter(|entry| entry.passed(now))
            .collect())
    }
}
