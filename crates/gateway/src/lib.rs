//! Transaction branching for the domain gateway.
//!
//! When a call crosses a domain boundary the remote domain's transaction id
//! is never used locally as is. [`BranchCorrelator`] hands out a local
//! branch of it per remote connection and translates back on the way out.

pub mod correlator;

pub use correlator::{BranchCorrelator, ConnectionId};
