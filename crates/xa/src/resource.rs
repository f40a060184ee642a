use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::{Flags, ResourceId, WireXid, XaCode, Xid};

use crate::env;
use crate::switch::{XaOperation, XaSwitch};

type XaCall<'a> = Pin<Box<dyn Future<Output = XaCode> + Send + 'a>>;

/// One connection to a resource manager.
///
/// The handle is not transaction scoped: the same resource serves many
/// transactions over its lifetime, one at a time.
pub struct Resource {
    id: ResourceId,
    key: String,
    open_info: String,
    close_info: String,
    switch: Arc<dyn XaSwitch>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("name", &self.switch.name())
            .finish()
    }
}

impl Resource {
    pub fn new(id: ResourceId, key: impl Into<String>, switch: Arc<dyn XaSwitch>) -> Self {
        Self {
            id,
            key: key.into(),
            open_info: String::new(),
            close_info: String::new(),
            switch,
        }
    }

    /// Sets the open string; `${NAME}` references are expanded on open.
    pub fn with_open_info(mut self, info: impl Into<String>) -> Self {
        self.open_info = info.into();
        self
    }

    /// Sets the close string; `${NAME}` references are expanded on close.
    pub fn with_close_info(mut self, info: impl Into<String>) -> Self {
        self.close_info = info.into();
        self
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        self.switch.name()
    }

    /// True when the resource manager registers itself during work instead
    /// of being started by the transaction context.
    pub fn dynamic(&self) -> bool {
        self.switch.flags().contains(Flags::REGISTER)
    }

    /// True when branches may be suspended on one thread and resumed on
    /// another.
    pub fn migrate(&self) -> bool {
        !self.switch.flags().contains(Flags::NOMIGRATE)
    }

    /// Opens the connection. Failures are logged and counted, never fatal.
    #[tracing::instrument(skip(self), fields(rm = %self.id, key = %self.key))]
    pub async fn open(&self) -> XaCode {
        let info = env::expand(&self.open_info);
        let code = self.switch.open(&info, self.id, Flags::NOFLAGS).await;
        metrics::counter!("xa_calls_total", "op" => XaOperation::Open.as_str()).increment(1);
        if code != XaCode::Ok {
            tracing::error!(%code, "failed to open resource");
            metrics::counter!("xa_open_failures_total").increment(1);
        }
        code
    }

    /// Closes the connection. Failures are logged, never fatal.
    #[tracing::instrument(skip(self), fields(rm = %self.id, key = %self.key))]
    pub async fn close(&self) -> XaCode {
        let info = env::expand(&self.close_info);
        let code = self.switch.close(&info, self.id, Flags::NOFLAGS).await;
        metrics::counter!("xa_calls_total", "op" => XaOperation::Close.as_str()).increment(1);
        if code != XaCode::Ok {
            tracing::error!(%code, "failed to close resource");
        }
        code
    }

    /// Starts work on a branch. A duplicate association without the join
    /// flag is retried once as a join.
    #[tracing::instrument(skip(self), fields(rm = %self.id, %xid, %flags))]
    pub async fn start(&self, xid: &Xid, flags: Flags) -> XaCode {
        let wire = xid.to_wire();
        let rmid = self.id;
        let code = self
            .guarded(XaOperation::Start, move |switch| {
                switch.start(wire, rmid, flags)
            })
            .await;

        if code == XaCode::DuplicateId && !flags.contains(Flags::JOIN) {
            tracing::debug!("branch already associated, joining");
            let joined = flags | Flags::JOIN;
            return self
                .guarded(XaOperation::Start, move |switch| {
                    switch.start(wire, rmid, joined)
                })
                .await;
        }
        code
    }

    #[tracing::instrument(skip(self), fields(rm = %self.id, %xid, %flags))]
    pub async fn end(&self, xid: &Xid, flags: Flags) -> XaCode {
        let wire = xid.to_wire();
        let rmid = self.id;
        self.guarded(XaOperation::End, move |switch| switch.end(wire, rmid, flags))
            .await
    }

    /// Prepares a branch. A protocol error is downgraded to read-only when a
    /// recovery scan shows the branch is already prepared, which happens when
    /// another domain shares the same resource manager.
    #[tracing::instrument(skip(self), fields(rm = %self.id, %xid, %flags))]
    pub async fn prepare(&self, xid: &Xid, flags: Flags) -> XaCode {
        let wire = xid.to_wire();
        let rmid = self.id;
        let code = self
            .guarded(XaOperation::Prepare, move |switch| {
                switch.prepare(wire, rmid, flags)
            })
            .await;

        if code == XaCode::Protocol && self.prepared(xid).await {
            tracing::info!("branch already prepared, treating as read-only");
            return XaCode::ReadOnly;
        }
        code
    }

    #[tracing::instrument(skip(self), fields(rm = %self.id, %xid, %flags))]
    pub async fn commit(&self, xid: &Xid, flags: Flags) -> XaCode {
        let wire = xid.to_wire();
        let rmid = self.id;
        self.guarded(XaOperation::Commit, move |switch| {
            switch.commit(wire, rmid, flags)
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(rm = %self.id, %xid, %flags))]
    pub async fn rollback(&self, xid: &Xid, flags: Flags) -> XaCode {
        let wire = xid.to_wire();
        let rmid = self.id;
        self.guarded(XaOperation::Rollback, move |switch| {
            switch.rollback(wire, rmid, flags)
        })
        .await
    }

    /// Lists the branches the resource manager holds in prepared state.
    pub async fn recover(&self) -> Result<Vec<Xid>, XaCode> {
        metrics::counter!("xa_calls_total", "op" => XaOperation::Recover.as_str()).increment(1);
        let wires = self
            .switch
            .recover(self.id, Flags::STARTRSCAN | Flags::ENDRSCAN)
            .await?;
        Ok(wires.iter().filter_map(|wire| to_xid(wire)).collect())
    }

    async fn prepared(&self, xid: &Xid) -> bool {
        match self.recover().await {
            Ok(prepared) => prepared.iter().any(|candidate| candidate == xid),
            Err(code) => {
                tracing::warn!(%code, "recovery scan failed");
                false
            }
        }
    }

    /// Runs `call`; if the resource manager reports a failed connection,
    /// reopens it once and repeats the call. When the reopen fails the
    /// original status is returned.
    async fn guarded<'a, F>(&'a self, operation: XaOperation, call: F) -> XaCode
    where
        F: Fn(&'a dyn XaSwitch) -> XaCall<'a> + Send + Sync,
    {
        metrics::counter!("xa_calls_total", "op" => operation.as_str()).increment(1);
        let code = call(self.switch.as_ref()).await;
        if code != XaCode::ResourceFail {
            return code;
        }

        tracing::warn!(%operation, "resource failed, reopening connection");
        metrics::counter!("xa_reopen_total").increment(1);
        self.close().await;
        if self.open().await != XaCode::Ok {
            return code;
        }
        call(self.switch.as_ref()).await
    }
}

fn to_xid(wire: &WireXid) -> Option<Xid> {
    match wire.to_xid() {
        Ok(xid) => Some(xid),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed id from recovery scan");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryResourceManager;

    fn setup() -> (InMemoryResourceManager, Resource) {
        let rm = InMemoryResourceManager::new("rm-a");
        let resource = Resource::new(ResourceId::new(1), "memory", Arc::new(rm.clone()));
        (rm, resource)
    }

    #[tokio::test]
    async fn duplicate_start_falls_back_to_join() {
        let (rm, resource) = setup();
        let xid = Xid::new();

        assert_eq!(resource.start(&xid, Flags::NOFLAGS).await, XaCode::Ok);
        assert_eq!(resource.start(&xid, Flags::NOFLAGS).await, XaCode::Ok);

        let starts = rm.calls_for(XaOperation::Start);
        assert_eq!(starts.len(), 3);
        assert!(starts[2].flags.contains(Flags::JOIN));
    }

    #[tokio::test]
    async fn duplicate_with_join_flag_is_not_retried() {
        let (rm, resource) = setup();
        let xid = Xid::new();
        rm.fail_next(XaOperation::Start, XaCode::DuplicateId);

        assert_eq!(resource.start(&xid, Flags::JOIN).await, XaCode::DuplicateId);
        assert_eq!(rm.count(XaOperation::Start), 1);
    }

    #[tokio::test]
    async fn resource_failure_reopens_and_retries_once() {
        let (rm, resource) = setup();
        let xid = Xid::new();
        rm.fail_next(XaOperation::Commit, XaCode::ResourceFail);

        assert_eq!(
            resource.commit(&xid, Flags::ONEPHASE).await,
            XaCode::Ok
        );
        assert_eq!(rm.count(XaOperation::Close), 1);
        assert_eq!(rm.count(XaOperation::Open), 1);
        assert_eq!(rm.count(XaOperation::Commit), 2);
    }

    #[tokio::test]
    async fn failed_reopen_returns_original_status() {
        let (rm, resource) = setup();
        let xid = Xid::new();
        rm.fail_next(XaOperation::Rollback, XaCode::ResourceFail);
        rm.fail_next(XaOperation::Open, XaCode::ResourceError);

        assert_eq!(
            resource.rollback(&xid, Flags::NOFLAGS).await,
            XaCode::ResourceFail
        );
        assert_eq!(rm.count(XaOperation::Rollback), 1);
    }

    #[tokio::test]
    async fn second_failure_after_reopen_is_surfaced() {
        let (rm, resource) = setup();
        let xid = Xid::new();
        rm.fail_next(XaOperation::End, XaCode::ResourceFail);
        rm.fail_next(XaOperation::End, XaCode::ResourceFail);

        assert_eq!(
            resource.end(&xid, Flags::SUCCESS).await,
            XaCode::ResourceFail
        );
        assert_eq!(rm.count(XaOperation::End), 2);
    }

    #[tokio::test]
    async fn prepare_twice_is_read_only_when_recover_lists_the_branch() {
        let (rm, resource) = setup();
        let xid = Xid::new();

        assert_eq!(resource.prepare(&xid, Flags::NOFLAGS).await, XaCode::Ok);
        assert_eq!(
            resource.prepare(&xid, Flags::NOFLAGS).await,
            XaCode::ReadOnly
        );
        assert_eq!(rm.count(XaOperation::Recover), 1);
    }

    #[tokio::test]
    async fn protocol_error_for_unprepared_branch_is_surfaced() {
        let (rm, resource) = setup();
        rm.fail_next(XaOperation::Prepare, XaCode::Protocol);

        assert_eq!(
            resource.prepare(&Xid::new(), Flags::NOFLAGS).await,
            XaCode::Protocol
        );
    }

    #[tokio::test]
    async fn open_failure_is_reported_not_fatal() {
        let (rm, resource) = setup();
        rm.fail_next(XaOperation::Open, XaCode::ResourceError);

        assert_eq!(resource.open().await, XaCode::ResourceError);
        assert!(!rm.is_open());
        assert_eq!(resource.open().await, XaCode::Ok);
        assert!(rm.is_open());
    }

    #[tokio::test]
    async fn open_info_is_expanded() {
        let (rm, resource) = setup();
        let resource = resource.with_open_info("db=${XA_SURELY_UNSET_VARIABLE_1234}orders");

        resource.open().await;

        assert_eq!(rm.open_info().as_deref(), Some("db=orders"));
    }

    #[tokio::test]
    async fn capabilities_follow_switch_flags() {
        let (_, fixed) = setup();
        assert!(!fixed.dynamic());
        assert!(fixed.migrate());

        let dynamic = Resource::new(
            ResourceId::new(2),
            "memory",
            Arc::new(InMemoryResourceManager::dynamic("rm-b")),
        );
        assert!(dynamic.dynamic());
    }
}
