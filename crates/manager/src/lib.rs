//! Transaction manager.
//!
//! The [`Coordinator`] is a single task that owns the transaction table and
//! processes one message at a time. Contexts and gateways talk to it through
//! a cloneable [`ManagerHandle`]. Each configured resource is served by one
//! or more proxy instances, each a task owning its own [`xa::Resource`]; an
//! instance handles one request at a time and requests for busy instances
//! wait in a pending queue.
//!
//! Commit policy:
//! - no resources: nothing to do, the transaction is forgotten
//! - one resource: one-phase commit
//! - more: prepare everywhere, log the decision, then commit the ok voters

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod handle;
mod message;
mod proxy;
pub mod state;

pub use config::{DispatchPolicy, ManagerConfig, ResourceConfig};
pub use dispatch::Undelivered;
pub use coordinator::Coordinator;
pub use error::{ManagerError, Result};
pub use handle::{CommitReplies, ManagerHandle, TransactionManager};
pub use state::{
    Association, AssociationState, InstanceId, InstanceState, Phase, Snapshot, Statistics,
};
