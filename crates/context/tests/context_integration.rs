//! Integration tests for the transaction context against a running
//! coordinator, in-memory resource managers and an in-memory log.

use std::time::Duration;

use common::{CorrelationId, Flags, ProcessHandle, ResourceId, XaCode};
use context::{
    ContextConfig, ProtocolViolation, TransactionContext, TransactionState, TxError,
};
use manager::{Coordinator, ManagerConfig, ManagerHandle, Phase, ResourceConfig};
use transaction_log::{InMemoryTransactionLog, LogState, TransactionLog};
use xa::{InMemoryResourceManager, SwitchRegistry, XaOperation};

struct TestHarness {
    manager: ManagerHandle,
    log: InMemoryTransactionLog,
    registry: SwitchRegistry,
    resources: Vec<ResourceConfig>,
    rms: Vec<InMemoryResourceManager>,
}

impl TestHarness {
    async fn new(statics: usize) -> Self {
        Self::build(statics, 0).await
    }

    /// Static resource managers get the first ids, dynamic ones the rest.
    async fn build(statics: usize, dynamics: usize) -> Self {
        let mut registry = SwitchRegistry::new();
        let mut resources = Vec::new();
        let mut rms = Vec::new();
        for i in 0..statics + dynamics {
            let key = format!("memory-{i}");
            let rm = if i < statics {
                InMemoryResourceManager::new(&format!("rm-{i}"))
            } else {
                InMemoryResourceManager::dynamic(&format!("rm-{i}"))
            };
            registry.register_in_memory(key.clone(), rm.clone());
            resources.push(ResourceConfig::new(key, format!("rm-{i}")));
            rms.push(rm);
        }

        let log = InMemoryTransactionLog::new();
        let config = ManagerConfig::default()
            .with_resources(resources.clone())
            .with_timeout_scan(Duration::from_millis(10));
        let (manager, _task) = Coordinator::spawn(config, log.clone(), &registry)
            .await
            .unwrap();

        Self {
            manager,
            log,
            registry,
            resources,
            rms,
        }
    }

    fn context(&self, process: ProcessHandle) -> TransactionContext<ManagerHandle> {
        TransactionContext::new(
            process,
            ContextConfig::default().with_resources(self.resources.clone()),
            self.manager.clone(),
            &self.registry,
        )
        .unwrap()
    }

    fn id(index: usize) -> ResourceId {
        ResourceId::new(index as i32 + 1)
    }

    async fn wait_for_empty_log(&self) {
        for _ in 0..200 {
            if self.log.is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("log still holds {} entries", self.log.len().await);
    }
}

fn client() -> ProcessHandle {
    ProcessHandle::new(4242, 1)
}

fn server() -> ProcessHandle {
    ProcessHandle::new(4343, 1)
}

#[tokio::test]
async fn test_commit_without_resources_is_local() {
    let harness = TestHarness::new(0).await;
    let mut context = harness.context(client());

    context.begin().await.unwrap();
    context.commit().await.unwrap();

    assert!(context.current().is_null());
    assert_eq!(harness.log.write_count().await, 0);
    let snapshot = harness.manager.snapshot().await.unwrap();
    assert!(snapshot.transactions.is_empty());
}

#[tokio::test]
async fn test_single_resource_commits_one_phase_without_manager() {
    let harness = TestHarness::new(1).await;
    let mut context = harness.context(client());

    let xid = context.begin().await.unwrap();
    context.commit().await.unwrap();

    let rm = &harness.rms[0];
    let commits = rm.calls_for(XaOperation::Commit);
    assert_eq!(commits.len(), 1);
    assert!(commits[0].flags.contains(Flags::ONEPHASE));
    assert_eq!(rm.count_for(XaOperation::Prepare, &xid), 0);
    assert_eq!(harness.log.write_count().await, 0);
}

#[tokio::test]
async fn test_two_resources_prepare_then_commit() {
    let harness = TestHarness::new(2).await;
    let mut context = harness.context(client());

    let xid = context.begin().await.unwrap();
    context.commit().await.unwrap();

    for rm in &harness.rms {
        let ops: Vec<_> = rm
            .calls()
            .into_iter()
            .filter(|call| call.xid.as_ref() == Some(&xid))
            .map(|call| call.op)
            .collect();
        assert_eq!(
            ops,
            vec![
                XaOperation::Start,
                XaOperation::End,
                XaOperation::Prepare,
                XaOperation::Commit
            ]
        );
    }
    assert!(harness.log.is_empty().await);
    assert!(context.current().is_null());
}

#[tokio::test]
async fn test_all_read_only_skips_commit() {
    let harness = TestHarness::new(2).await;
    for rm in &harness.rms {
        rm.set_vote(XaCode::ReadOnly);
    }
    let mut context = harness.context(client());

    let xid = context.begin().await.unwrap();
    context.commit().await.unwrap();

    for rm in &harness.rms {
        assert_eq!(rm.count_for(XaOperation::Prepare, &xid), 1);
        assert_eq!(rm.count_for(XaOperation::Commit, &xid), 0);
    }
}

#[tokio::test]
async fn test_rollback_vote_fails_commit() {
    let harness = TestHarness::new(2).await;
    harness.rms[1].set_vote(XaCode::RollbackDeadlock);
    let mut context = harness.context(client());

    let xid = context.begin().await.unwrap();
    let result = context.commit().await;

    assert!(matches!(
        result,
        Err(TxError::Rollback(XaCode::RollbackDeadlock))
    ));
    assert_eq!(harness.rms[0].count_for(XaOperation::Rollback, &xid), 1);
    assert_eq!(harness.rms[0].count_for(XaOperation::Commit, &xid), 0);
    // A failed commit leaves the transaction current until rolled back.
    assert_eq!(context.current().xid, xid);
    context.rollback().await.unwrap();
    assert!(context.current().is_null());
}

#[tokio::test]
async fn test_rollback_of_distributed_transaction() {
    let harness = TestHarness::new(2).await;
    let mut context = harness.context(client());

    let xid = context.begin().await.unwrap();
    context.rollback().await.unwrap();

    for rm in &harness.rms {
        assert_eq!(rm.count_for(XaOperation::Rollback, &xid), 1);
        assert_eq!(rm.count_for(XaOperation::Prepare, &xid), 0);
    }
    assert!(context.current().is_null());
}

#[tokio::test]
async fn test_dynamic_resource_takes_part_in_commit() {
    let harness = TestHarness::build(1, 1).await;
    let mut context = harness.context(client());

    let xid = context.begin().await.unwrap();
    assert_eq!(
        context.resource_registration(TestHarness::id(1)),
        Ok(xid.clone())
    );
    context.commit().await.unwrap();

    let dynamic = &harness.rms[1];
    assert_eq!(dynamic.count_for(XaOperation::Start, &xid), 0);
    assert_eq!(dynamic.count_for(XaOperation::Prepare, &xid), 1);
    assert_eq!(dynamic.count_for(XaOperation::Commit, &xid), 1);
    assert_eq!(harness.rms[0].count_for(XaOperation::Prepare, &xid), 1);
}

#[tokio::test]
async fn test_suspend_resume_restores_resources() {
    let harness = TestHarness::build(1, 1).await;
    let mut context = harness.context(client());

    let xid = context.begin().await.unwrap();
    context.resource_registration(TestHarness::id(1)).unwrap();
    let before = context.current().resources.clone();

    let suspended = context.suspend().await.unwrap();
    assert_eq!(suspended, xid);
    assert!(context.current().is_null());
    for rm in &harness.rms {
        let ends = rm.calls_for(XaOperation::End);
        assert_eq!(ends.len(), 1);
        assert!(ends[0].flags.contains(Flags::SUSPEND));
    }

    context.resume(&xid).await.unwrap();

    assert_eq!(context.current().xid, xid);
    assert_eq!(context.current().resources, before);
    let starts = harness.rms[0].calls_for(XaOperation::Start);
    assert_eq!(starts.len(), 2);
    assert!(starts[1].flags.contains(Flags::RESUME));

    context.commit().await.unwrap();
    assert_eq!(harness.rms[1].count_for(XaOperation::Commit, &xid), 1);
}

#[tokio::test]
async fn test_server_joins_with_duplicate_start() {
    let harness = TestHarness::new(1).await;
    let mut caller = harness.context(client());
    let mut callee = harness.context(server());
    let rm = &harness.rms[0];

    let xid = caller.begin().await.unwrap();
    let correlation = CorrelationId::new();
    caller.associate(correlation).await.unwrap();

    // The same resource manager is already associated through the caller.
    callee.join(xid.clone(), client()).await;
    let starts = rm.calls_for(XaOperation::Start);
    assert_eq!(starts.len(), 3);
    assert!(starts[2].flags.contains(Flags::JOIN));

    let finalized = callee.finalize(true).await;
    assert_eq!(finalized.xid, xid);
    assert_eq!(finalized.state, TransactionState::Active);

    caller.replied(correlation, &xid, finalized.state).unwrap();
    caller.commit().await.unwrap();

    let commits = rm.calls_for(XaOperation::Commit);
    assert_eq!(commits.len(), 1);
    assert!(commits[0].flags.contains(Flags::ONEPHASE));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_distributed_transaction_is_rolled_back_at_deadline() {
    let harness = TestHarness::new(1).await;
    let mut caller = harness.context(client());
    let mut callee = harness.context(server());
    caller.set_timeout(5).unwrap();

    let xid = caller.begin().await.unwrap();
    caller.associate(CorrelationId::new()).await.unwrap();
    let entry = harness.log.select(&xid).await.unwrap().unwrap();
    assert_eq!(entry.state, LogState::Begin);
    assert_eq!(entry.owner, client());
    assert!(entry.deadline.is_some());

    callee.join(xid.clone(), client()).await;
    callee.finalize(true).await;
    // The caller goes away without committing or rolling back.
    drop(caller);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(harness.rms[0].count_for(XaOperation::Rollback, &xid), 1);
    let snapshot = harness.manager.snapshot().await.unwrap();
    assert_eq!(snapshot.transactions.len(), 1);
    assert_eq!(snapshot.transactions[0].phase, Phase::TimedOut);

    tokio::time::sleep(Duration::from_secs(61)).await;
    let snapshot = harness.manager.snapshot().await.unwrap();
    assert!(snapshot.transactions.is_empty());
    assert!(harness.log.is_empty().await);
}

#[tokio::test]
async fn test_callee_failure_makes_caller_roll_back() {
    let harness = TestHarness::new(2).await;
    let mut caller = harness.context(client());
    let mut callee = harness.context(server());

    let xid = caller.begin().await.unwrap();
    let correlation = CorrelationId::new();
    caller.associate(correlation).await.unwrap();

    callee.join(xid.clone(), client()).await;
    let finalized = callee.finalize(false).await;
    assert_eq!(finalized.state, TransactionState::RollbackOnly);

    caller.replied(correlation, &xid, finalized.state).unwrap();
    assert!(matches!(
        caller.commit().await,
        Err(TxError::Protocol(ProtocolViolation::RollbackOnly))
    ));

    caller.rollback().await.unwrap();
    for rm in &harness.rms {
        assert_eq!(rm.count_for(XaOperation::Rollback, &xid), 1);
        assert_eq!(rm.count_for(XaOperation::Commit, &xid), 0);
    }
}

#[tokio::test]
async fn test_decision_logged_returns_before_commit_completes() {
    let harness = TestHarness::new(2).await;
    for rm in &harness.rms {
        rm.set_latency(Duration::from_millis(200));
    }
    let mut context = harness.context(client());
    context.set_commit_return(1).unwrap();

    let xid = context.begin().await.unwrap();
    context.commit().await.unwrap();

    // Prepared branches are released only when their commit completes.
    assert!(harness.rms.iter().any(|rm| rm.prepared().contains(&xid)));

    harness.wait_for_empty_log().await;
    for rm in &harness.rms {
        assert!(rm.prepared().is_empty());
        assert_eq!(rm.count_for(XaOperation::Commit, &xid), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_interrupts_waiting_commit() {
    let harness = TestHarness::new(2).await;
    let mut context = harness.context(client());
    context.set_timeout(25).unwrap();

    let xid = context.begin().await.unwrap();
    // End, prepare and commit each take ten seconds: the deadline passes
    // while the commit phase is under way.
    harness.rms[0].set_latency(Duration::from_secs(10));
    let result = context.commit().await;

    assert!(matches!(
        result,
        Err(TxError::Protocol(ProtocolViolation::TimedOut))
    ));
    assert_eq!(harness.rms[0].count_for(XaOperation::Prepare, &xid), 1);
    assert_eq!(context.current().xid, xid);
    assert_eq!(context.info().state, TransactionState::TimedOut);
    assert!(matches!(
        context.commit().await,
        Err(TxError::Protocol(ProtocolViolation::TimedOut))
    ));
}
