use async_trait::async_trait;
use common::{Flags, ResourceId, WireXid, XaCode};

/// One XA primitive, used for metrics labels and call recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaOperation {
    Open,
    Close,
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Recover,
}

impl XaOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            XaOperation::Open => "open",
            XaOperation::Close => "close",
            XaOperation::Start => "start",
            XaOperation::End => "end",
            XaOperation::Prepare => "prepare",
            XaOperation::Commit => "commit",
            XaOperation::Rollback => "rollback",
            XaOperation::Recover => "recover",
        }
    }
}

impl std::fmt::Display for XaOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver interface of an XA resource manager (the `xa_switch_t`).
///
/// Every call receives its own copy of the wire id. Implementations are
/// driven by one caller at a time per connection.
#[async_trait]
pub trait XaSwitch: Send + Sync {
    /// Name of the resource manager.
    fn name(&self) -> &str;

    /// Capability flags: [`Flags::REGISTER`] for dynamic registration,
    /// [`Flags::NOMIGRATE`] when branches cannot move between threads.
    fn flags(&self) -> Flags;

    async fn open(&self, info: &str, rmid: ResourceId, flags: Flags) -> XaCode;

    async fn close(&self, info: &str, rmid: ResourceId, flags: Flags) -> XaCode;

    async fn start(&self, xid: WireXid, rmid: ResourceId, flags: Flags) -> XaCode;

    async fn end(&self, xid: WireXid, rmid: ResourceId, flags: Flags) -> XaCode;

    async fn prepare(&self, xid: WireXid, rmid: ResourceId, flags: Flags) -> XaCode;

    async fn commit(&self, xid: WireXid, rmid: ResourceId, flags: Flags) -> XaCode;

    async fn rollback(&self, xid: WireXid, rmid: ResourceId, flags: Flags) -> XaCode;

    /// Lists branches the resource manager holds in prepared state.
    async fn recover(&self, rmid: ResourceId, flags: Flags) -> Result<Vec<WireXid>, XaCode>;
}
