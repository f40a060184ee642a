//! Durable transaction log.
//!
//! The coordinator records the begin fact of a transaction and, before any
//! commit request leaves the process, the decision to commit. Entries are
//! removed once the transaction is fully resolved. On restart the log is
//! scanned to finish prepared transactions and abort everything else.

pub mod entry;
pub mod error;
pub mod file;
pub mod log;
pub mod memory;
pub mod postgres;

pub use entry::{LogEntry, LogState};
pub use error::{LogError, Result};
pub use file::FileTransactionLog;
pub use log::{LogStream, TransactionLog};
pub use memory::InMemoryTransactionLog;
pub use postgres::PostgresTransactionLog;
