use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ProcessHandle, ResourceId, Xid};
use futures_core::Stream;

use crate::{LogEntry, Result};

/// A stream of log entries.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry>> + Send>>;

/// Durable record of in-flight transactions.
///
/// Every write must be durable when the returned future resolves; the
/// coordinator sends no commit request until `prepare` has returned `Ok`.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Records the begin fact.
    async fn begin(&self, entry: LogEntry) -> Result<()>;

    /// Records the decision to commit, together with the resources that
    /// have to be driven to it. Creates the entry if the begin fact was
    /// never logged.
    async fn prepare(
        &self,
        xid: &Xid,
        owner: &ProcessHandle,
        resources: &[ResourceId],
    ) -> Result<()>;

    /// Marks the transaction as timed out.
    async fn timeout(&self, xid: &Xid) -> Result<()>;

    /// Forgets the transaction. Removing an unknown id is not an error.
    async fn remove(&self, xid: &Xid) -> Result<()>;

    /// Looks up one transaction.
    async fn select(&self, xid: &Xid) -> Result<Option<LogEntry>>;

    /// Streams every entry, oldest first.
    async fn scan(&self) -> Result<LogStream>;

    /// Entries whose deadline is behind `now`.
    async fn passed(&self, now: DateTime<Utc>) -> Result<Vec<LogEntry>>;
}

#[async_trait]
impl<T: TransactionLog + ?Sized> TransactionLog for Arc<T> {
    async fn begin(&self, entry: LogEntry) -> Result<()> {
        (**self).begin(entry).await
    }

    async fn prepare(
        &self,
        xid: &Xid,
        owner: &ProcessHandle,
        resources: &[ResourceId],
    ) -> Result<()> {
        (**self).prepare(xid, owner, resources).await
    }

    async fn timeout(&self, xid: &Xid) -> Result<()> {
        (**self).timeout(xid).await
    }

    async fn remove(&self, xid: &Xid) -> Result<()> {
        (**self).remove(xid).await
    }

    async fn select(&self, xid: &Xid) -> Result<Option<LogEntry>> {
        (**self).select(xid).await
    }

    async fn scan(&self) -> Result<LogStream> {
        (**self).scan().await
    }

    async fn passed(&self, now: DateTime<Utc>) -> Result<Vec<LogEntry>> {
        (**self).passed(now).await
    }
}
