//! Transaction context.
//!
//! A [`TransactionContext`] gives one process TX-style transaction control:
//! begin, commit, rollback, suspend and resume, plus the bookkeeping needed
//! when the process serves calls inside someone else's transaction.
//!
//! Commits stay local whenever possible. A transaction with no resources
//! commits without any message, one with a single resource is committed
//! one-phase directly against it, and only larger or shared transactions go
//! through the transaction manager.

pub mod config;
pub mod context;
pub mod error;
pub mod transaction;

pub use config::{CommitReturn, ContextConfig, Control};
pub use context::{Finalized, TransactionContext, TxInfo};
pub use error::{ProtocolViolation, RegistrationError, Result, TxError};
pub use transaction::{Transaction, TransactionState};
