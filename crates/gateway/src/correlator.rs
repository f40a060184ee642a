use std::collections::HashMap;

use common::Xid;
use common::message::{BranchReply, BranchRequest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one connection to a remote domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Branch {
    connection: ConnectionId,
    external: Xid,
}

/// Maps remote transaction ids to local branches and back.
///
/// A branch keeps the remote gtrid with a fresh branch qualifier, so it is
/// still the same global transaction but never the id the remote
/// coordinator uses. The mapping is per connection: the same remote id
/// arriving over two connections gets two independent branches.
#[derive(Debug, Default)]
pub struct BranchCorrelator {
    internals: HashMap<(ConnectionId, Xid), Xid>,
    branches: HashMap<Xid, Branch>,
}

impl BranchCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The local branch for `external` on `connection`, created on first
    /// use. The null id maps to itself.
    pub fn branch(&mut self, connection: ConnectionId, external: &Xid) -> Xid {
        if external.is_null() {
            return Xid::null();
        }
        if let Some(internal) = self.internals.get(&(connection, external.clone())) {
            return internal.clone();
        }

        let internal = external.branch();
        self.internals
            .insert((connection, external.clone()), internal.clone());
        self.branches.insert(
            internal.clone(),
            Branch {
                connection,
                external: external.clone(),
            },
        );

        metrics::counter!("gateway_branches_total").increment(1);
        tracing::debug!(%connection, %external, %internal, "transaction branched");
        internal
    }

    /// The remote id a local branch stands for.
    pub fn resolve(&self, internal: &Xid) -> Option<Xid> {
        if internal.is_null() {
            return Some(Xid::null());
        }
        self.branches
            .get(internal)
            .map(|branch| branch.external.clone())
    }

    /// The connection a local branch was created for.
    pub fn connection(&self, internal: &Xid) -> Option<ConnectionId> {
        self.branches.get(internal).map(|branch| branch.connection)
    }

    /// Answers a branch request arriving on `connection`.
    pub fn handle(&mut self, connection: ConnectionId, request: BranchRequest) -> BranchReply {
        let internal = self.branch(connection, &request.external);
        BranchReply {
            correlation: request.correlation,
            external: request.external,
            internal,
        }
    }

    /// Forgets a branch once its transaction is finished. Returns the
    /// remote id it stood for.
    pub fn remove(&mut self, internal: &Xid) -> Option<Xid> {
        let branch = self.branches.remove(internal)?;
        self.internals
            .remove(&(branch.connection, branch.external.clone()));
        Some(branch.external)
    }

    /// Forgets every branch of a lost connection and returns them.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Vec<Xid> {
        let mut removed: Vec<Xid> = self
            .branches
            .iter()
            .filter(|(_, branch)| branch.connection == connection)
            .map(|(internal, _)| internal.clone())
            .collect();
        removed.sort();

        for internal in &removed {
            self.remove(internal);
        }
        if !removed.is_empty() {
            tracing::info!(%connection, branches = removed.len(), "connection lost, branches dropped");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationId, ProcessHandle};

    #[test]
    fn branch_is_stable_per_connection() {
        let mut correlator = BranchCorrelator::new();
        let connection = ConnectionId::new();
        let external = Xid::new();

        let first = correlator.branch(connection, &external);
        let second = correlator.branch(connection, &external);

        assert_eq!(first, second);
        assert_ne!(first, external);
        assert!(first.same_transaction(&external));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn connections_get_independent_branches() {
        let mut correlator = BranchCorrelator::new();
        let external = Xid::new();

        let a = correlator.branch(ConnectionId::new(), &external);
        let b = correlator.branch(ConnectionId::new(), &external);

        assert_ne!(a, b);
        assert_eq!(correlator.resolve(&a), Some(external.clone()));
        assert_eq!(correlator.resolve(&b), Some(external));
    }

    #[test]
    fn null_maps_to_null() {
        let mut correlator = BranchCorrelator::new();

        let internal = correlator.branch(ConnectionId::new(), &Xid::null());

        assert!(internal.is_null());
        assert_eq!(correlator.resolve(&internal), Some(Xid::null()));
        assert!(correlator.is_empty());
    }

    #[test]
    fn unknown_branch_does_not_resolve() {
        let correlator = BranchCorrelator::new();
        assert_eq!(correlator.resolve(&Xid::new()), None);
    }

    #[test]
    fn remove_forgets_both_directions() {
        let mut correlator = BranchCorrelator::new();
        let connection = ConnectionId::new();
        let external = Xid::new();
        let internal = correlator.branch(connection, &external);

        assert_eq!(correlator.remove(&internal), Some(external.clone()));
        assert_eq!(correlator.resolve(&internal), None);

        let again = correlator.branch(connection, &external);
        assert_ne!(again, internal);
    }

    #[test]
    fn lost_connection_drops_only_its_branches() {
        let mut correlator = BranchCorrelator::new();
        let lost = ConnectionId::new();
        let kept = ConnectionId::new();
        let a = correlator.branch(lost, &Xid::new());
        let b = correlator.branch(lost, &Xid::new());
        let c = correlator.branch(kept, &Xid::new());

        let mut removed = correlator.remove_connection(lost);
        removed.sort();
        let mut expected = vec![a, b];
        expected.sort();

        assert_eq!(removed, expected);
        assert_eq!(correlator.len(), 1);
        assert_eq!(correlator.connection(&c), Some(kept));
    }

    #[test]
    fn handle_answers_branch_request() {
        let mut correlator = BranchCorrelator::new();
        let connection = ConnectionId::new();
        let request = BranchRequest {
            correlation: CorrelationId::new(),
            external: Xid::new(),
            process: ProcessHandle::new(1, 1),
        };

        let reply = correlator.handle(connection, request.clone());

        assert_eq!(reply.correlation, request.correlation);
        assert_eq!(reply.external, request.external);
        assert_eq!(
            correlator.resolve(&reply.internal),
            Some(request.external)
        );
    }
}
