use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProcessHandle, ResourceId, Xid};
use tokio::sync::RwLock;

use crate::{LogEntry, LogError, LogState, LogStream, Result, TransactionLog};

#[derive(Debug, Default)]
struct InMemoryLogState {
    entries: HashMap<Xid, LogEntry>,
    writes: usize,
    unavailable: bool,
}

/// In-memory transaction log for testing.
///
/// Offers the same interface as the durable backends and survives a
/// coordinator restart as long as the same instance (or a clone) is reused.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransactionLog {
    state: Arc<RwLock<InMemoryLogState>>,
}

impl InMemoryTransactionLog {
    /// Creates a new empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with [`LogError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of successful writes since creation.
    pub async fn write_count(&self) -> usize {
        self.state.read().await.writes
    }

    async fn write<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<Xid, LogEntry>) + Send,
    {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(LogError::Unavailable);
        }
        apply(&mut state.entries);
        state.writes += 1;
        metrics::counter!("tm_log_writes_total").increment(1);
        Ok(())
    }

    async fn sorted(&self) -> Vec<LogEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.xid.cmp(&b.xid)));
        entries
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn begin(&self, entry: LogEntry) -> Result<()> {
        self.write(|entries| {
            entries.insert(entry.xid.clone(), entry);
        })
        .await
    }

    async fn prepare(
        &self,
        xid: &Xid,
        owner: &ProcessHandle,
        resources: &[ResourceId],
    ) -> Result<()> {
        self.write(|entries| {
            let entry = entries
                .entry(xid.clone())
                .or_insert_with(|| LogEntry::prepared(xid.clone(), *owner, Vec::new()));
            entry.state = LogState::Prepared;
            entry.resources = resources.to_vec();
            entry.updated = Utc::now();
        })
        .await
    }

    async fn timeout(&self, xid: &Xid) -> Result<()> {
        self.write(|entries| {
            if let Some(entry) = entries.get_mut(xid) {
                entry.state = LogState::Timeout;
                entry.updated = Utc::now();
            }
        })
        .await
    }

    async fn remove(&self, xid: &Xid) -> Result<()> {
        self.write(|entries| {
            entries.remove(xid);
        })
        .await
    }

    async fn select(&self, xid: &Xid) -> Result<Option<LogEntry>> {
        Ok(self.state.read().await.entries.get(xid).cloned())
    }

    async fn scan(&self) -> Result<LogStream> {
        use futures_util::stream;

        let entries = self.sorted().await;
        Ok(Box::pin(stream::iter(entries.into_iter().map(Ok))))
    }

    async fn passed(&self, now: DateTime<Utc>) -> Result<Vec<LogEntry>> {
        Ok(self
            .sorted()
            .await
            .into_iter()
            .filter(|entry| entry.passed(now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;

    fn owner() -> ProcessHandle {
        ProcessHandle::new(100, 1)
    }

    #[tokio::test]
    async fn begin_then_select() {
        let log = InMemoryTransactionLog::new();
        let xid = Xid::new();

        log.begin(LogEntry::begin(xid.clone(), owner(), None))
            .await
            .unwrap();

        let entry = log.select(&xid).await.unwrap().unwrap();
        assert_eq!(entry.state, LogState::Begin);
        assert_eq!(entry.owner, owner());
    }

    #[tokio::test]
    async fn prepare_creates_missing_entry() {
        let log = InMemoryTransactionLog::new();
        let xid = Xid::new();
        let resources = [ResourceId::new(1), ResourceId::new(2)];

        log.prepare(&xid, &owner(), &resources).await.unwrap();

        let entry = log.select(&xid).await.unwrap().unwrap();
        assert_eq!(entry.state, LogState::Prepared);
        assert_eq!(entry.resources, resources.to_vec());
    }

    #[tokio::test]
    async fn prepare_updates_begun_entry() {
        let log = InMemoryTransactionLog::new();
        let xid = Xid::new();
        log.begin(LogEntry::begin(xid.clone(), owner(), None))
            .await
            .unwrap();

        log.prepare(&xid, &owner(), &[ResourceId::new(3)])
            .await
            .unwrap();

        assert_eq!(log.len().await, 1);
        let entry = log.select(&xid).await.unwrap().unwrap();
        assert_eq!(entry.state, LogState::Prepared);
        assert_eq!(entry.resources, vec![ResourceId::new(3)]);
    }

    #[tokio::test]
    async fn remove_forgets_entry_and_tolerates_unknown_ids() {
        let log = InMemoryTransactionLog::new();
        let xid = Xid::new();
        log.begin(LogEntry::begin(xid.clone(), owner(), None))
            .await
            .unwrap();

        log.remove(&xid).await.unwrap();
        log.remove(&Xid::new()).await.unwrap();

        assert!(log.is_empty().await);
        assert!(log.select(&xid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_log_rejects_writes() {
        let log = InMemoryTransactionLog::new();
        log.set_unavailable(true).await;

        let result = log.prepare(&Xid::new(), &owner(), &[]).await;

        assert!(matches!(result, Err(LogError::Unavailable)));
        assert_eq!(log.write_count().await, 0);
    }

    #[tokio::test]
    async fn scan_streams_every_entry() {
        let log = InMemoryTransactionLog::new();
        for _ in 0..3 {
            log.begin(LogEntry::begin(Xid::new(), owner(), None))
                .await
                .unwrap();
        }

        let entries: Vec<_> = log.scan().await.unwrap().collect().await;

        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.is_ok()));
    }

    #[tokio::test]
    async fn passed_returns_only_expired_entries() {
        let log = InMemoryTransactionLog::new();
        let expiring = Xid::new();
        log.begin(LogEntry::begin(
            expiring.clone(),
            owner(),
            Some(Duration::from_secs(5)),
        ))
        .await
        .unwrap();
        log.begin(LogEntry::begin(Xid::new(), owner(), None))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(log.passed(now).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(10);
        let passed = log.passed(later).await.unwrap();
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].xid, expiring);
    }

    #[tokio::test]
    async fn timeout_marks_entry() {
        let log = InMemoryTransactionLog::new();
        let xid = Xid::new();
        log.begin(LogEntry::begin(xid.clone(), owner(), None))
            .await
            .unwrap();

        log.timeout(&xid).await.unwrap();

        let entry = log.select(&xid).await.unwrap().unwrap();
        assert_eq!(entry.state, LogState::Timeout);
    }
}
