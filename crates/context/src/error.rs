//! Transaction context error types.

use common::{CodeClass, XaCode, Xid};
use manager::ManagerError;
use thiserror::Error;
use xa::XaError;

/// Why an operation is not allowed in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// There is no current transaction.
    NoTransaction,
    /// The current transaction belongs to another process.
    NotOwner,
    /// A transaction is already current and control is not stacked.
    AlreadyActive,
    /// The transaction is marked rollback-only.
    RollbackOnly,
    /// The transaction passed its deadline.
    TimedOut,
    /// Calls made inside the transaction have not replied.
    PendingReplies,
    /// A null xid cannot be suspended.
    NullXid,
    /// A reply named a transaction this context does not know.
    UnknownTransaction,
    /// Resume needs the current transaction to be suspended.
    ActiveTransaction,
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ProtocolViolation::NoTransaction => "no ongoing transaction",
            ProtocolViolation::NotOwner => "not owner of transaction",
            ProtocolViolation::AlreadyActive => "already in transaction mode",
            ProtocolViolation::RollbackOnly => "transaction is rollback-only",
            ProtocolViolation::TimedOut => "transaction has timed out",
            ProtocolViolation::PendingReplies => "pending replies associated with transaction",
            ProtocolViolation::NullXid => "attempt to suspend a null xid",
            ProtocolViolation::UnknownTransaction => "transaction not known",
            ProtocolViolation::ActiveTransaction => "active transaction",
        };
        f.write_str(text)
    }
}

/// Errors returned by [`crate::TransactionContext`] operations.
///
/// The first four kinds leave the transaction stack untouched. The outcome
/// kinds report how a commit or rollback that did run ended.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("Protocol error: {0}")]
    Protocol(ProtocolViolation),

    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Resource work was done outside a global transaction where none may be.
    #[error("Resource work outside global transaction")]
    Outside,

    /// Internal invariant violation.
    #[error("Transaction context failure: {0}")]
    Fail(String),

    #[error("Transaction rolled back: {0}")]
    Rollback(XaCode),

    #[error("Transaction partially committed: {0}")]
    Mixed(XaCode),

    #[error("Transaction outcome unknown")]
    Hazard,

    /// The transaction is unknown to the resource or transaction manager.
    #[error("Transaction not begun: {0}")]
    NoBegin(XaCode),

    #[error("Transaction error: {0}")]
    Error(XaCode),

    #[error("Transaction manager error: {0}")]
    Manager(#[from] ManagerError),

    #[error("Resource setup error: {0}")]
    Xa(#[from] XaError),
}

impl TxError {
    /// Maps the status a commit or rollback ended with. Successful and
    /// heuristically committed outcomes are `Ok`.
    pub fn from_outcome(code: XaCode) -> Result<()> {
        match code {
            XaCode::Ok | XaCode::ReadOnly | XaCode::Retry | XaCode::HeuristicCommit => Ok(()),
            XaCode::HeuristicHazard => Err(TxError::Hazard),
            XaCode::HeuristicMixed | XaCode::HeuristicRollback => Err(TxError::Mixed(code)),
            XaCode::NotA | XaCode::ResourceError | XaCode::Async => Err(TxError::NoBegin(code)),
            code if code.class() == CodeClass::Rollback || code == XaCode::NoMigrate => {
                Err(TxError::Rollback(code))
            }
            code => Err(TxError::Error(code)),
        }
    }
}

/// Outcome of a dynamic resource registering or unregistering itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Already registered in the current transaction; treated as a resume.
    #[error("Resource already registered in {0}")]
    Resume(Xid),

    /// Not a known dynamically registering resource.
    #[error("Not a dynamic resource")]
    Invalid,

    #[error("Registration not allowed in the current state")]
    Protocol,
}

/// Convenience type alias for transaction context results.
pub type Result<T> = std::result::Result<T, TxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_outcomes() {
        for code in [
            XaCode::Ok,
            XaCode::ReadOnly,
            XaCode::Retry,
            XaCode::HeuristicCommit,
        ] {
            assert!(TxError::from_outcome(code).is_ok(), "{code}");
        }
    }

    #[test]
    fn rollback_codes_report_rollback() {
        assert!(matches!(
            TxError::from_outcome(XaCode::RollbackTimeout),
            Err(TxError::Rollback(XaCode::RollbackTimeout))
        ));
        assert!(matches!(
            TxError::from_outcome(XaCode::RollbackDeadlock),
            Err(TxError::Rollback(_))
        ));
    }

    #[test]
    fn heuristics_report_mixed_or_hazard() {
        assert!(matches!(
            TxError::from_outcome(XaCode::HeuristicMixed),
            Err(TxError::Mixed(XaCode::HeuristicMixed))
        ));
        assert!(matches!(
            TxError::from_outcome(XaCode::HeuristicHazard),
            Err(TxError::Hazard)
        ));
    }

    #[test]
    fn unknown_transaction_reports_no_begin() {
        assert!(matches!(
            TxError::from_outcome(XaCode::NotA),
            Err(TxError::NoBegin(XaCode::NotA))
        ));
        assert!(matches!(
            TxError::from_outcome(XaCode::ResourceFail),
            Err(TxError::Error(XaCode::ResourceFail))
        ));
    }
}
