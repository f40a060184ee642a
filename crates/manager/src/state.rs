//! Transaction table entries, resource instance bookkeeping and the
//! serializable snapshot served to administrators.

use std::time::Duration;

use common::message::{CommitReply, DomainReply, ResourceOp, RollbackReply};
use common::{CorrelationId, ProcessHandle, ResourceId, XaCode, Xid};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Progress of one resource within one transaction.
///
/// Variants are ordered; an association only moves forward, except that a
/// request state may be entered again when the request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationState {
    Involved,
    PrepareRequested,
    PrepareReplied,
    CommitRequested,
    CommitReplied,
    RollbackRequested,
    RollbackReplied,
}

impl AssociationState {
    pub fn is_request(self) -> bool {
        matches!(
            self,
            AssociationState::PrepareRequested
                | AssociationState::CommitRequested
                | AssociationState::RollbackRequested
        )
    }

    pub(crate) fn requested(op: ResourceOp) -> Self {
        match op {
            ResourceOp::Prepare => AssociationState::PrepareRequested,
            ResourceOp::Commit => AssociationState::CommitRequested,
            ResourceOp::Rollback => AssociationState::RollbackRequested,
        }
    }

    pub(crate) fn replied(op: ResourceOp) -> Self {
        match op {
            ResourceOp::Prepare => AssociationState::PrepareReplied,
            ResourceOp::Commit => AssociationState::CommitReplied,
            ResourceOp::Rollback => AssociationState::RollbackReplied,
        }
    }
}

/// A resource taking part in a transaction, with its last reported status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub resource: ResourceId,
    pub state: AssociationState,
    pub result: Option<XaCode>,
}

impl Association {
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            state: AssociationState::Involved,
            result: None,
        }
    }

    /// Moves to `next`. Returns false, leaving the association untouched,
    /// when that would go backwards.
    pub fn advance(&mut self, next: AssociationState) -> bool {
        if next > self.state || (next == self.state && next.is_request()) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// Where a transaction is in its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Resources are doing work; no completion requested yet.
    Involved,
    Preparing,
    /// Prepared on behalf of a remote owner, waiting for its decision.
    Prepared,
    Committing,
    RollingBack,
    /// Rolled back by the timeout sweep; kept so the owner learns about it.
    TimedOut,
}

/// Who gets told when the transaction completes.
#[derive(Debug, Default)]
pub(crate) enum ReplyTarget {
    #[default]
    None,
    Commit {
        correlation: CorrelationId,
        sender: mpsc::Sender<CommitReply>,
    },
    Rollback {
        correlation: CorrelationId,
        sender: oneshot::Sender<RollbackReply>,
    },
    Domain {
        correlation: CorrelationId,
        resource: ResourceId,
        op: ResourceOp,
        sender: oneshot::Sender<DomainReply>,
    },
}

/// The coordinator's record of one transaction branch.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub xid: Xid,
    pub owner: Option<ProcessHandle>,
    pub associations: Vec<Association>,
    pub phase: Phase,
    /// Acting as a participant for an owner in another domain.
    pub remote: bool,
    pub deadline: Option<Instant>,
    pub started: Instant,
    pub completion_started: Option<Instant>,
    /// Set once a failure decides the transaction must roll back.
    pub outcome: Option<XaCode>,
    /// True once the commit decision is in the log.
    pub logged: bool,
    /// Rebuilt from the log at startup.
    pub recovered: bool,
    pub target: ReplyTarget,
}

impl Transaction {
    pub fn new(xid: Xid, owner: Option<ProcessHandle>) -> Self {
        Self {
            xid,
            owner,
            associations: Vec::new(),
            phase: Phase::Involved,
            remote: false,
            deadline: None,
            started: Instant::now(),
            completion_started: None,
            outcome: None,
            logged: false,
            recovered: false,
            target: ReplyTarget::None,
        }
    }

    /// Adds `resource` unless it is already associated.
    pub fn involve(&mut self, resource: ResourceId) {
        if !self.associations.iter().any(|a| a.resource == resource) {
            self.associations.push(Association::new(resource));
        }
    }

    pub fn association_mut(&mut self, resource: ResourceId) -> Option<&mut Association> {
        self.associations.iter_mut().find(|a| a.resource == resource)
    }

    pub fn resources(&self) -> Vec<ResourceId> {
        self.associations.iter().map(|a| a.resource).collect()
    }

    /// Resources whose last reported status equals `code`.
    pub fn voted(&self, code: XaCode) -> Vec<ResourceId> {
        self.associations
            .iter()
            .filter(|a| a.result == Some(code))
            .map(|a| a.resource)
            .collect()
    }

    /// True while any association still waits in `state`.
    pub fn awaiting(&self, state: AssociationState) -> bool {
        self.associations.iter().any(|a| a.state == state)
    }

    /// Statuses of associations that reached `state`.
    pub fn results_in(&self, state: AssociationState) -> Vec<XaCode> {
        self.associations
            .iter()
            .filter(|a| a.state == state)
            .filter_map(|a| a.result)
            .collect()
    }

    /// True when a remote owner asked only for a vote; the decision comes
    /// in a later request.
    pub fn prepare_only(&self) -> bool {
        matches!(
            self.target,
            ReplyTarget::Domain {
                op: ResourceOp::Prepare,
                ..
            }
        )
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            xid: self.xid.clone(),
            owner: self.owner,
            phase: self.phase,
            remote: self.remote,
            associations: self.associations.clone(),
            age: self.started.elapsed(),
        }
    }
}

/// Identifies one instance of a configured resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub resource: ResourceId,
    pub index: usize,
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.resource, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Absent,
    /// Spawned, connection not yet reported.
    Started,
    Idle,
    Busy,
    Error,
    Shutdown,
}

/// Call latency of one resource instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub invoked: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Duration,
}

impl Statistics {
    pub fn record(&mut self, elapsed: Duration) {
        self.invoked += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |min| min.min(elapsed)));
        self.max = self.max.max(elapsed);
    }

    pub fn average(&self) -> Option<Duration> {
        let invoked = u32::try_from(self.invoked).ok().filter(|n| *n > 0)?;
        Some(self.total / invoked)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub xid: Xid,
    pub owner: Option<ProcessHandle>,
    pub phase: Phase,
    pub remote: bool,
    pub associations: Vec<Association>,
    pub age: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub index: usize,
    pub state: InstanceState,
    pub statistics: Statistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub key: String,
    pub name: String,
    pub instances: Vec<InstanceSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalSnapshot {
    pub id: ResourceId,
    pub process: ProcessHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub xid: Xid,
    pub resource: ResourceId,
    pub op: ResourceOp,
    pub queued: Duration,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub transactions: Vec<TransactionSnapshot>,
    pub resources: Vec<ResourceSnapshot>,
    pub externals: Vec<ExternalSnapshot>,
    pub pending: Vec<PendingSnapshot>,
}
