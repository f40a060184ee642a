//! The context's view of one transaction.

use std::time::Duration;

use common::{CorrelationId, ProcessHandle, ResourceId, Xid};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Transaction state as seen by a participant. It only ever escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    RollbackOnly,
    TimedOut,
    /// Only reported by finalize, when reconciling a transaction failed.
    Error,
}

/// One entry of the transaction stack. A null xid stands for "no
/// transaction" and may still collect resources that work outside a
/// global transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub xid: Xid,
    pub owner: Option<ProcessHandle>,
    pub state: TransactionState,
    pub started: Instant,
    pub timeout: Option<Duration>,
    /// Dynamically registered resources.
    pub resources: Vec<ResourceId>,
    correlations: Vec<CorrelationId>,
    /// False once a call has been made inside the transaction or when it
    /// was joined rather than begun.
    local: bool,
}

impl Transaction {
    pub fn null() -> Self {
        Self {
            xid: Xid::null(),
            owner: None,
            state: TransactionState::Active,
            started: Instant::now(),
            timeout: None,
            resources: Vec::new(),
            correlations: Vec::new(),
            local: true,
        }
    }

    /// A transaction begun by `owner`.
    pub fn begin(owner: ProcessHandle, timeout: Option<Duration>) -> Self {
        Self {
            xid: Xid::new(),
            owner: Some(owner),
            timeout,
            ..Self::null()
        }
    }

    /// A transaction joined on behalf of its owner.
    pub fn join(xid: Xid, owner: ProcessHandle) -> Self {
        Self {
            xid,
            owner: Some(owner),
            local: false,
            ..Self::null()
        }
    }

    pub fn is_null(&self) -> bool {
        self.xid.is_null()
    }

    pub fn owned_by(&self, process: &ProcessHandle) -> bool {
        self.owner.as_ref() == Some(process)
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| self.started + timeout)
    }

    /// Marks the transaction timed out once its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> TransactionState {
        if let Some(deadline) = self.deadline()
            && now >= deadline
        {
            self.escalate(TransactionState::TimedOut);
        }
        self.state
    }

    pub fn escalate(&mut self, state: TransactionState) {
        if self.state < state {
            self.state = state;
        }
    }

    /// A call is now in flight inside this transaction.
    pub fn associate(&mut self, correlation: CorrelationId) {
        self.correlations.push(correlation);
        self.local = false;
    }

    /// Forgets a call that has replied. Returns false if it was not known.
    pub fn replied(&mut self, correlation: &CorrelationId) -> bool {
        let before = self.correlations.len();
        self.correlations.retain(|pending| pending != correlation);
        self.correlations.len() != before
    }

    pub fn pending(&self) -> bool {
        !self.correlations.is_empty()
    }

    /// Registered resources plus `statics`, without duplicates.
    pub fn involved(&self, statics: &[ResourceId]) -> Vec<ResourceId> {
        let mut involved = statics.to_vec();
        for id in &self.resources {
            if !involved.contains(id) {
                involved.push(*id);
            }
        }
        involved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> ProcessHandle {
        ProcessHandle::new(7, 1)
    }

    #[test]
    fn state_never_goes_back() {
        let mut transaction = Transaction::begin(owner(), None);

        transaction.escalate(TransactionState::TimedOut);
        transaction.escalate(TransactionState::RollbackOnly);
        transaction.escalate(TransactionState::Active);

        assert_eq!(transaction.state, TransactionState::TimedOut);
    }

    #[test]
    fn calls_make_transaction_non_local() {
        let mut transaction = Transaction::begin(owner(), None);
        assert!(transaction.local());

        let correlation = CorrelationId::new();
        transaction.associate(correlation);
        assert!(transaction.pending());
        assert!(!transaction.local());

        assert!(transaction.replied(&correlation));
        assert!(!transaction.replied(&correlation));
        assert!(!transaction.pending());
        assert!(!transaction.local());
    }

    #[test]
    fn joined_transaction_is_not_local() {
        let transaction = Transaction::join(Xid::new(), owner());
        assert!(!transaction.local());
        assert!(!transaction.owned_by(&ProcessHandle::new(8, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_at_deadline() {
        let mut transaction = Transaction::begin(owner(), Some(Duration::from_secs(5)));

        assert_eq!(
            transaction.expire(Instant::now()),
            TransactionState::Active
        );

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(
            transaction.expire(Instant::now()),
            TransactionState::TimedOut
        );
    }

    #[test]
    fn involved_merges_without_duplicates() {
        let mut transaction = Transaction::begin(owner(), None);
        transaction.resources = vec![ResourceId::new(2), ResourceId::new(3)];

        let involved = transaction.involved(&[ResourceId::new(1), ResourceId::new(2)]);

        assert_eq!(
            involved,
            vec![ResourceId::new(1), ResourceId::new(2), ResourceId::new(3)]
        );
    }
}
