use std::time::Duration;

use common::message::{
    BeginReply, BeginRequest, CommitReply, CommitRequest, ConnectReply, DomainReply,
    DomainRequest, InvolvedMessage, ResourceReply, ResourceRequest, RollbackReply,
    RollbackRequest,
};
use common::{ProcessHandle, Xid};
use tokio::sync::{mpsc, oneshot};

use crate::state::{InstanceId, Snapshot};

/// Everything the coordinator task consumes from its inbound queue.
#[derive(Debug)]
pub(crate) enum Message {
    Begin {
        request: BeginRequest,
        reply: oneshot::Sender<BeginReply>,
    },
    Commit {
        request: CommitRequest,
        reply: mpsc::Sender<CommitReply>,
    },
    Rollback {
        request: RollbackRequest,
        reply: oneshot::Sender<RollbackReply>,
    },
    Involved(InvolvedMessage),
    /// A gateway announces that a remote domain does work in `xid`;
    /// requests for that domain are written to `channel`.
    ExternalInvolved {
        xid: Xid,
        process: ProcessHandle,
        channel: mpsc::Sender<ResourceRequest>,
    },
    Domain {
        request: DomainRequest,
        reply: oneshot::Sender<DomainReply>,
    },
    Connect {
        instance: InstanceId,
        reply: ConnectReply,
    },
    ResourceReply {
        /// `None` for replies from external domains.
        instance: Option<InstanceId>,
        reply: ResourceReply,
        elapsed: Duration,
    },
    Tick,
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}
