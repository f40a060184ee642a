//! Request/reply contracts exchanged between transaction contexts, the
//! coordinator, resource proxies and the domain gateway.
//!
//! Only the payloads are defined here; how they travel is up to the
//! transport.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CorrelationId, Flags, ProcessHandle, ResourceId, XaCode, Xid};

/// Stage of a commit reply.
///
/// A two-phase commit replies twice: once when the commit decision has been
/// logged (`Prepare`) and once when every resource has committed (`Commit`).
/// `Error` replaces `Commit` when the transaction could not be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Commit,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginRequest {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub process: ProcessHandle,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginReply {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub status: XaCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub process: ProcessHandle,
    pub resources: Vec<ResourceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReply {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub status: XaCode,
    pub stage: Stage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub process: ProcessHandle,
    pub resources: Vec<ResourceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackReply {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub status: XaCode,
}

/// Operation a coordinator asks of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOp {
    Prepare,
    Commit,
    Rollback,
}

impl std::fmt::Display for ResourceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceOp::Prepare => write!(f, "prepare"),
            ResourceOp::Commit => write!(f, "commit"),
            ResourceOp::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub resource: ResourceId,
    pub op: ResourceOp,
    pub flags: Flags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReply {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub resource: ResourceId,
    pub op: ResourceOp,
    pub status: XaCode,
}

/// Sent by a resource proxy instance once its connection is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectReply {
    pub resource: ResourceId,
    pub process: ProcessHandle,
    pub status: XaCode,
}

/// Fire-and-forget notice that a process did resource work in `xid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvolvedMessage {
    pub xid: Xid,
    pub process: ProcessHandle,
    pub resources: Vec<ResourceId>,
}

/// A prepare/commit/rollback arriving from another domain.
///
/// `resource` is the id the remote domain knows this coordinator by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRequest {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub process: ProcessHandle,
    pub resource: ResourceId,
    pub op: ResourceOp,
    pub flags: Flags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainReply {
    pub correlation: CorrelationId,
    pub xid: Xid,
    pub resource: ResourceId,
    pub status: XaCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRequest {
    pub correlation: CorrelationId,
    pub external: Xid,
    pub process: ProcessHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchReply {
    pub correlation: CorrelationId,
    pub external: Xid,
    pub internal: Xid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Stage::Prepare).unwrap(), "\"prepare\"");
    }

    #[test]
    fn commit_request_survives_json() {
        let request = CommitRequest {
            correlation: CorrelationId::new(),
            xid: Xid::new(),
            process: ProcessHandle::new(10, 1),
            resources: vec![ResourceId::new(1), ResourceId::new(2)],
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: CommitRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.xid, request.xid);
        assert_eq!(parsed.resources, request.resources);
    }
}
