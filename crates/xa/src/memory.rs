//! In-memory resource manager for tests and demos.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{Flags, ResourceId, WireXid, XaCode, Xid};

use crate::switch::{XaOperation, XaSwitch};

/// One call observed by [`InMemoryResourceManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub op: XaOperation,
    pub xid: Option<Xid>,
    pub flags: Flags,
}

#[derive(Debug)]
struct InMemoryRmState {
    open: bool,
    open_info: Option<String>,
    associated: HashSet<Xid>,
    prepared: Vec<Xid>,
    calls: Vec<RecordedCall>,
    injected: HashMap<XaOperation, VecDeque<XaCode>>,
    vote: XaCode,
    outcome: XaCode,
    latency: Option<Duration>,
    in_flight: usize,
    max_in_flight: usize,
}

impl Default for InMemoryRmState {
    fn default() -> Self {
        Self {
            open: false,
            open_info: None,
            associated: HashSet::new(),
            prepared: Vec::new(),
            calls: Vec::new(),
            injected: HashMap::new(),
            vote: XaCode::Ok,
            outcome: XaCode::Ok,
            latency: None,
            in_flight: 0,
            max_in_flight: 0,
        }
    }
}

/// A resource manager that keeps its state in memory.
///
/// Clones share state, so a test can hand one clone to the code under test
/// and inspect the recorded calls through another. It behaves like a strict
/// XA resource manager: a second `start` without join is a duplicate, a
/// second `prepare` is a protocol error, and prepared branches are listed by
/// `recover` until committed or rolled back.
#[derive(Debug, Clone)]
pub struct InMemoryResourceManager {
    name: Arc<str>,
    flags: Flags,
    state: Arc<RwLock<InMemoryRmState>>,
}

impl InMemoryResourceManager {
    /// Creates a statically registered resource manager.
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            flags: Flags::NOFLAGS,
            state: Arc::default(),
        }
    }

    /// Creates a resource manager that registers itself dynamically.
    pub fn dynamic(name: &str) -> Self {
        Self {
            flags: Flags::REGISTER,
            ..Self::new(name)
        }
    }

    /// Sets the status returned by every subsequent prepare.
    pub fn set_vote(&self, vote: XaCode) {
        self.state.write().unwrap().vote = vote;
    }

    /// Sets the status returned by every subsequent commit.
    pub fn set_commit_outcome(&self, outcome: XaCode) {
        self.state.write().unwrap().outcome = outcome;
    }

    /// Makes every call take `latency` before it completes.
    pub fn set_latency(&self, latency: Duration) {
        self.state.write().unwrap().latency = Some(latency);
    }

    /// Queues a status to be returned by the next call of `op`, in place of
    /// its normal behaviour.
    pub fn fail_next(&self, op: XaOperation, code: XaCode) {
        self.state
            .write()
            .unwrap()
            .injected
            .entry(op)
            .or_default()
            .push_back(code);
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.read().unwrap().calls.clone()
    }

    pub fn calls_for(&self, op: XaOperation) -> Vec<RecordedCall> {
        self.state
            .read()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    pub fn count(&self, op: XaOperation) -> usize {
        self.calls_for(op).len()
    }

    /// Calls of `op` made for `xid`.
    pub fn count_for(&self, op: XaOperation, xid: &Xid) -> usize {
        self.calls_for(op)
            .iter()
            .filter(|call| call.xid.as_ref() == Some(xid))
            .count()
    }

    pub fn is_open(&self) -> bool {
        self.state.read().unwrap().open
    }

    /// The info string of the last successful open.
    pub fn open_info(&self) -> Option<String> {
        self.state.read().unwrap().open_info.clone()
    }

    /// Branches currently prepared.
    pub fn prepared(&self) -> Vec<Xid> {
        self.state.read().unwrap().prepared.clone()
    }

    /// Highest number of calls that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.read().unwrap().max_in_flight
    }

    /// Forgets recorded calls, keeping branch state.
    pub fn clear_calls(&self) {
        self.state.write().unwrap().calls.clear();
    }

    /// Records the call and returns an injected status, if any.
    fn enter(
        &self,
        op: XaOperation,
        xid: Option<Xid>,
        flags: Flags,
    ) -> (Option<XaCode>, Option<Duration>) {
        let mut state = self.state.write().unwrap();
        state.calls.push(RecordedCall { op, xid, flags });
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        let injected = state.injected.get_mut(&op).and_then(VecDeque::pop_front);
        (injected, state.latency)
    }

    async fn call<F>(
        &self,
        op: XaOperation,
        xid: Option<&WireXid>,
        flags: Flags,
        apply: F,
    ) -> XaCode
    where
        F: FnOnce(&mut InMemoryRmState, Option<Xid>) -> XaCode + Send,
    {
        let xid = xid.and_then(|wire| wire.to_xid().ok());
        let (injected, latency) = self.enter(op, xid.clone(), flags);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write().unwrap();
        state.in_flight -= 1;
        match injected {
            Some(code) => code,
            None => apply(&mut *state, xid),
        }
    }
}

#[async_trait]
impl XaSwitch for InMemoryResourceManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> Flags {
        self.flags
    }

    async fn open(&self, info: &str, _rmid: ResourceId, flags: Flags) -> XaCode {
        let info = info.to_string();
        self.call(XaOperation::Open, None, flags, move |state, _| {
            state.open = true;
            state.open_info = Some(info);
            XaCode::Ok
        })
        .await
    }

    async fn close(&self, _info: &str, _rmid: ResourceId, flags: Flags) -> XaCode {
        self.call(XaOperation::Close, None, flags, |state, _| {
            state.open = false;
            XaCode::Ok
        })
        .await
    }

    async fn start(&self, xid: WireXid, _rmid: ResourceId, flags: Flags) -> XaCode {
        self.call(XaOperation::Start, Some(&xid), flags, |state, xid| {
            let Some(xid) = xid else {
                return XaCode::Invalid;
            };
            let rejoin = flags.contains(Flags::JOIN) || flags.contains(Flags::RESUME);
            if !state.associated.insert(xid) && !rejoin {
                return XaCode::DuplicateId;
            }
            XaCode::Ok
        })
        .await
    }

    async fn end(&self, xid: WireXid, _rmid: ResourceId, flags: Flags) -> XaCode {
        self.call(XaOperation::End, Some(&xid), flags, |state, xid| {
            if let Some(xid) = xid {
                state.associated.remove(&xid);
            }
            XaCode::Ok
        })
        .await
    }

    async fn prepare(&self, xid: WireXid, _rmid: ResourceId, flags: Flags) -> XaCode {
        self.call(XaOperation::Prepare, Some(&xid), flags, |state, xid| {
            let Some(xid) = xid else {
                return XaCode::Invalid;
            };
            if state.prepared.contains(&xid) {
                return XaCode::Protocol;
            }
            if state.vote == XaCode::Ok {
                state.prepared.push(xid);
            }
            state.vote
        })
        .await
    }

    async fn commit(&self, xid: WireXid, _rmid: ResourceId, flags: Flags) -> XaCode {
        self.call(XaOperation::Commit, Some(&xid), flags, |state, xid| {
            if let Some(xid) = xid {
                state.associated.remove(&xid);
                state.prepared.retain(|p| p != &xid);
            }
            state.outcome
        })
        .await
    }

    async fn rollback(&self, xid: WireXid, _rmid: ResourceId, flags: Flags) -> XaCode {
        self.call(XaOperation::Rollback, Some(&xid), flags, |state, xid| {
            if let Some(xid) = xid {
                state.associated.remove(&xid);
                state.prepared.retain(|p| p != &xid);
            }
            XaCode::Ok
        })
        .await
    }

    async fn recover(&self, _rmid: ResourceId, flags: Flags) -> Result<Vec<WireXid>, XaCode> {
        let mut prepared = Vec::new();
        let code = self
            .call(XaOperation::Recover, None, flags, |state, _| {
                prepared = state.prepared.iter().map(Xid::to_wire).collect();
                XaCode::Ok
            })
            .await;
        if code == XaCode::Ok {
            Ok(prepared)
        } else {
            Err(code)
        }
    }
}
