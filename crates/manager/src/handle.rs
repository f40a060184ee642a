//! Client side of the coordinator.

use async_trait::async_trait;
use common::message::{
    BeginReply, BeginRequest, CommitReply, CommitRequest, DomainReply, DomainRequest,
    InvolvedMessage, ResourceReply, ResourceRequest, RollbackReply, RollbackRequest, Stage,
};
use common::{ProcessHandle, Xid};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ManagerError, Result};
use crate::message::Message;
use crate::state::Snapshot;

/// What a transaction context needs from a transaction manager.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Registers a transaction with the manager, which then enforces its
    /// timeout. A registered transaction must be completed through the
    /// manager.
    async fn begin(&self, request: BeginRequest) -> Result<BeginReply>;

    /// Starts a commit. Replies arrive on the returned stream: a two-phase
    /// commit reports the logged decision before the final outcome.
    async fn commit(&self, request: CommitRequest) -> Result<CommitReplies>;

    async fn rollback(&self, request: RollbackRequest) -> Result<RollbackReply>;

    /// Tells the manager that resources did work in a transaction owned by
    /// someone else. No reply.
    async fn involved(&self, message: InvolvedMessage) -> Result<()>;
}

/// Replies to one commit request.
#[derive(Debug)]
pub struct CommitReplies {
    receiver: mpsc::Receiver<CommitReply>,
}

impl CommitReplies {
    /// The next reply, or `None` once the manager has nothing more to say.
    pub async fn next(&mut self) -> Option<CommitReply> {
        self.receiver.recv().await
    }

    /// Waits for the final reply, skipping the decision.
    pub async fn outcome(mut self) -> Result<CommitReply> {
        loop {
            let reply = self.next().await.ok_or(ManagerError::ReplyDropped)?;
            if reply.stage != Stage::Prepare {
                return Ok(reply);
            }
        }
    }

    /// Waits for the first reply: the logged decision for a two-phase
    /// commit, the outcome otherwise.
    pub async fn decision(mut self) -> Result<CommitReply> {
        self.next().await.ok_or(ManagerError::ReplyDropped)
    }
}

/// Cloneable handle to a running [`crate::Coordinator`].
///
/// The coordinator stops once every handle is dropped or after
/// [`ManagerHandle::shutdown`].
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    sender: mpsc::Sender<Message>,
}

impl ManagerHandle {
    pub(crate) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ManagerError::Stopped)
    }

    async fn ask<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T> {
        let (reply, receiver) = oneshot::channel();
        self.send(message(reply)).await?;
        receiver.await.map_err(|_| ManagerError::ReplyDropped)
    }

    /// A prepare, commit or rollback from another domain.
    #[tracing::instrument(skip(self), fields(xid = %request.xid, op = %request.op))]
    pub async fn domain(&self, request: DomainRequest) -> Result<DomainReply> {
        self.ask(|reply| Message::Domain { request, reply }).await
    }

    /// Registers a remote domain as a participant in `xid`. Requests for it
    /// are written to `channel`; answer them with
    /// [`ManagerHandle::resource_reply`].
    pub async fn external_involved(
        &self,
        xid: Xid,
        process: ProcessHandle,
        channel: mpsc::Sender<ResourceRequest>,
    ) -> Result<()> {
        self.send(Message::ExternalInvolved {
            xid,
            process,
            channel,
        })
        .await
    }

    /// Delivers a remote domain's answer to a forwarded request.
    pub async fn resource_reply(&self, reply: ResourceReply) -> Result<()> {
        self.send(Message::ResourceReply {
            instance: None,
            reply,
            elapsed: std::time::Duration::ZERO,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.ask(Message::Snapshot).await
    }

    /// Runs a timeout sweep now instead of waiting for the next interval.
    pub async fn tick(&self) -> Result<()> {
        self.send(Message::Tick).await
    }

    /// Asks the coordinator to stop. Transactions in flight are abandoned
    /// and left to recovery.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Message::Shutdown).await
    }
}

#[async_trait]
impl TransactionManager for ManagerHandle {
    #[tracing::instrument(skip(self), fields(xid = %request.xid))]
    async fn begin(&self, request: BeginRequest) -> Result<BeginReply> {
        self.ask(|reply| Message::Begin { request, reply }).await
    }

    #[tracing::instrument(skip(self), fields(xid = %request.xid))]
    async fn commit(&self, request: CommitRequest) -> Result<CommitReplies> {
        let (reply, receiver) = mpsc::channel(2);
        self.send(Message::Commit { request, reply }).await?;
        Ok(CommitReplies { receiver })
    }

    #[tracing::instrument(skip(self), fields(xid = %request.xid))]
    async fn rollback(&self, request: RollbackRequest) -> Result<RollbackReply> {
        self.ask(|reply| Message::Rollback { request, reply }).await
    }

    async fn involved(&self, message: InvolvedMessage) -> Result<()> {
        self.send(Message::Involved(message)).await
    }
}
