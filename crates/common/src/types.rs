use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlates a request with its reply.
///
/// Every call made inside a transaction and every coordinator request
/// carries one, so that asynchronous replies can be matched to the
/// record that is waiting for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Creates a new random correlation id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a correlation id from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Identifies a process and the inbound queue it listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub queue: i64,
}

impl ProcessHandle {
    pub fn new(pid: u32, queue: i64) -> Self {
        Self { pid, queue }
    }

    /// Handle for the running process, listening on queue `0`.
    pub fn current() -> Self {
        Self::new(std::process::id(), 0)
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.queue)
    }
}

/// Identifies a resource manager.
///
/// Positive ids are configured, locally driven resources. Negative ids are
/// external proxies (another domain reached through a gateway) that the
/// coordinator allocates on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(i32);

impl ResourceId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    /// Returns true for proxies of resources owned by another domain.
    pub fn is_external(&self) -> bool {
        self.0 < 0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ResourceId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn correlation_id_serializes_as_plain_uuid() {
        let id = CorrelationId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }

    #[test]
    fn resource_id_sign_distinguishes_external_proxies() {
        assert!(!ResourceId::new(3).is_external());
        assert!(ResourceId::new(-1).is_external());
    }

    #[test]
    fn process_handle_display() {
        assert_eq!(ProcessHandle::new(42, 7).to_string(), "42@7");
    }
}
