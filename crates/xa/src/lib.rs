//! Resource-manager layer.
//!
//! [`XaSwitch`] is the driver interface a resource manager implements.
//! [`Resource`] wraps one connection through a switch and hides transient
//! failures: a failed connection is reopened once, a duplicate start is
//! retried as a join, and a prepare that was already done elsewhere is
//! reported as read-only.

pub mod env;
pub mod error;
pub mod memory;
pub mod registry;
pub mod resource;
pub mod switch;

pub use error::{Result, XaError};
pub use memory::{InMemoryResourceManager, RecordedCall};
pub use registry::SwitchRegistry;
pub use resource::Resource;
pub use switch::{XaOperation, XaSwitch};
