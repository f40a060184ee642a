//! Shared types for the XA transaction manager.
//!
//! Everything that crosses a component boundary lives here: the global
//! transaction id ([`Xid`]) and its wire form, process and resource
//! identifiers, the XA status taxonomy ([`XaCode`]), protocol flags and the
//! request/reply message contracts exchanged between contexts, the
//! coordinator, resource proxies and the domain gateway.

pub mod code;
pub mod flags;
pub mod message;
pub mod types;
pub mod xid;

pub use code::{CodeClass, XaCode};
pub use flags::Flags;
pub use types::{CorrelationId, ProcessHandle, ResourceId};
pub use xid::{WireXid, Xid, XidError};
