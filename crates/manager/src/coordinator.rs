//! The coordinator task and its transaction table.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use common::message::{
    BeginReply, BeginRequest, CommitReply, CommitRequest, ConnectReply, DomainReply,
    DomainRequest, InvolvedMessage, ResourceOp, ResourceReply, ResourceRequest, RollbackReply,
    RollbackRequest, Stage,
};
use common::{CodeClass, CorrelationId, Flags, ProcessHandle, ResourceId, XaCode, Xid};
use futures_util::StreamExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use transaction_log::{LogState, TransactionLog};
use xa::SwitchRegistry;

use crate::config::ManagerConfig;
use crate::dispatch::Undelivered;
use crate::error::{ManagerError, Result};
use crate::handle::ManagerHandle;
use crate::message::Message;
use crate::proxy::{ExternalProxy, Instance, ResourceProxy};
use crate::state::{
    AssociationState, ExternalSnapshot, InstanceId, InstanceState, PendingSnapshot, Phase,
    ReplyTarget, Snapshot, Transaction,
};

/// How long a transaction rolled back by the timeout sweep is remembered
/// when its owner never asks about it.
const TIMED_OUT_RETENTION: Duration = Duration::from_secs(60);

/// A resource request waiting for an idle instance, or for room in a
/// remote domain's channel.
#[derive(Debug)]
struct Pending {
    request: ResourceRequest,
    queued: Instant,
}

/// Owns every transaction this process coordinates.
///
/// Runs as a single task: requests, resource replies and timer ticks arrive
/// on one queue and are handled one at a time, so the transaction table
/// needs no lock. Resource ids are assigned in configuration order,
/// starting at 1; remote domains get negative ids as they show up.
pub struct Coordinator<L> {
    config: ManagerConfig,
    log: L,
    inbound: mpsc::Receiver<Message>,
    transactions: HashMap<Xid, Transaction>,
    resources: BTreeMap<ResourceId, ResourceProxy>,
    externals: BTreeMap<ResourceId, ExternalProxy>,
    next_external: i32,
    pending: VecDeque<Pending>,
    /// Replies for requests that could not be delivered, handled once the
    /// current message is done.
    failed: VecDeque<ResourceReply>,
    ticker: Option<JoinHandle<()>>,
}

impl<L> Coordinator<L>
where
    L: TransactionLog + 'static,
{
    /// Starts the resource instances, recovers unfinished transactions from
    /// the log and spawns the coordinator task.
    #[tracing::instrument(skip_all, fields(resources = config.resources.len()))]
    pub async fn spawn(
        config: ManagerConfig,
        log: L,
        registry: &SwitchRegistry,
    ) -> Result<(ManagerHandle, JoinHandle<()>)> {
        config.validate()?;

        // Build every connection before spawning anything, so a bad key
        // leaves nothing running.
        let mut built = Vec::with_capacity(config.resources.len());
        for (position, resource) in config.resources.iter().enumerate() {
            let id = i32::try_from(position + 1)
                .map(ResourceId::new)
                .map_err(|_| ManagerError::Config("too many resources".into()))?;
            let mut connections = Vec::with_capacity(resource.instances);
            for _ in 0..resource.instances {
                connections.push(
                    registry
                        .resource(id, &resource.key)?
                        .with_open_info(resource.openinfo.clone())
                        .with_close_info(resource.closeinfo.clone()),
                );
            }
            built.push((id, resource, connections));
        }

        let (sender, inbound) = mpsc::channel(config.queue_capacity);
        let weak = sender.downgrade();

        let mut resources = BTreeMap::new();
        for (id, resource, connections) in built {
            let instances = connections
                .into_iter()
                .enumerate()
                .map(|(index, connection)| {
                    Instance::spawn(
                        InstanceId { resource: id, index },
                        connection,
                        config.process,
                        weak.clone(),
                    )
                })
                .collect();
            resources.insert(
                id,
                ResourceProxy {
                    id,
                    key: resource.key.clone(),
                    name: resource.name.clone(),
                    instances,
                },
            );
        }

        let scan = config.timeout_scan;
        let mut coordinator = Self {
            config,
            log,
            inbound,
            transactions: HashMap::new(),
            resources,
            externals: BTreeMap::new(),
            next_external: -1,
            pending: VecDeque::new(),
            failed: VecDeque::new(),
            ticker: None,
        };
        coordinator.recover().await?;
        coordinator.ticker = Some(spawn_ticker(weak, scan));

        let task = tokio::spawn(coordinator.run());
        Ok((ManagerHandle::new(sender), task))
    }

    /// Re-drives prepared transactions to commit; presumes abort for the
    /// rest.
    async fn recover(&mut self) -> Result<()> {
        let mut stream = self.log.scan().await?;
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            entries.push(entry?);
        }

        for entry in entries {
            let xid = entry.xid.clone();
            if entry.resources.is_empty() {
                tracing::info!(%xid, state = %entry.state, "forgetting unfinished transaction");
                self.log.remove(&xid).await?;
                continue;
            }

            let mut transaction = Transaction::new(xid.clone(), Some(entry.owner));
            transaction.recovered = true;
            transaction.completion_started = Some(Instant::now());
            for resource in &entry.resources {
                transaction.involve(*resource);
            }

            let op = if entry.state == LogState::Prepared {
                tracing::info!(%xid, resources = entry.resources.len(), "recovering prepared transaction, committing");
                transaction.logged = true;
                transaction.phase = Phase::Committing;
                for association in &mut transaction.associations {
                    association.advance(AssociationState::PrepareReplied);
                    association.result = Some(XaCode::Ok);
                }
                ResourceOp::Commit
            } else {
                tracing::info!(%xid, state = %entry.state, "presuming abort for unfinished transaction");
                transaction.phase = Phase::RollingBack;
                ResourceOp::Rollback
            };

            self.transactions.insert(xid.clone(), transaction);
            for resource in entry.resources {
                self.request(&xid, resource, op, Flags::NOFLAGS).await;
            }
        }
        Ok(())
    }

    async fn run(mut self) {
        tracing::info!(resources = self.resources.len(), "coordinator running");
        self.drain_failed().await;

        while let Some(message) = self.inbound.recv().await {
            if let Message::Shutdown = message {
                break;
            }
            self.handle(message).await;
            self.flush_externals();
            self.drain_failed().await;
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Begin { request, reply } => self.begin(request, reply).await,
            Message::Commit { request, reply } => self.commit(request, reply).await,
            Message::Rollback { request, reply } => self.rollback(request, reply).await,
            Message::Involved(message) => self.involved(message),
            Message::ExternalInvolved {
                xid,
                process,
                channel,
            } => self.external_involved(xid, process, channel),
            Message::Domain { request, reply } => self.domain(request, reply).await,
            Message::Connect { instance, reply } => self.connected(instance, reply).await,
            Message::ResourceReply {
                instance,
                reply,
                elapsed,
            } => {
                if let Some(instance) = instance {
                    self.release(instance, elapsed).await;
                }
                self.resource_reply(reply).await;
            }
            Message::Tick => self.tick().await,
            Message::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Message::Shutdown => {}
        }
    }

    async fn drain_failed(&mut self) {
        while let Some(reply) = self.failed.pop_front() {
            self.resource_reply(reply).await;
        }
    }

    #[tracing::instrument(skip(self, reply), fields(xid = %request.xid, process = %request.process))]
    async fn begin(&mut self, request: BeginRequest, reply: oneshot::Sender<BeginReply>) {
        let status = if request.xid.is_null() {
            XaCode::Invalid
        } else if self.transactions.contains_key(&request.xid) {
            XaCode::DuplicateId
        } else {
            let entry = transaction_log::LogEntry::begin(
                request.xid.clone(),
                request.process,
                request.timeout,
            );
            match self.log.begin(entry).await {
                Ok(()) => {
                    let mut transaction =
                        Transaction::new(request.xid.clone(), Some(request.process));
                    transaction.deadline = request.timeout.map(|timeout| Instant::now() + timeout);
                    self.transactions.insert(request.xid.clone(), transaction);
                    tracing::debug!(timeout = ?request.timeout, "transaction begun");
                    XaCode::Ok
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to log begin");
                    XaCode::ResourceFail
                }
            }
        };

        let _ = reply.send(BeginReply {
            correlation: request.correlation,
            xid: request.xid,
            status,
        });
    }

    #[tracing::instrument(skip(self, reply), fields(xid = %request.xid, resources = request.resources.len()))]
    async fn commit(&mut self, request: CommitRequest, reply: mpsc::Sender<CommitReply>) {
        let xid = request.xid.clone();
        let target = ReplyTarget::Commit {
            correlation: request.correlation,
            sender: reply,
        };
        if xid.is_null() {
            self.notify(target, &xid, XaCode::Invalid, Stage::Error).await;
            return;
        }

        let transaction = self
            .transactions
            .entry(xid.clone())
            .or_insert_with(|| Transaction::new(xid.clone(), Some(request.process)));

        if transaction.phase == Phase::TimedOut {
            tracing::info!("commit of a timed out transaction");
            transaction.target = target;
            self.forget(&xid).await;
            self.finish(&xid, XaCode::RollbackTimeout, Stage::Error).await;
            return;
        }
        let owned_elsewhere = transaction
            .owner
            .is_some_and(|owner| owner != request.process);
        if transaction.phase != Phase::Involved || owned_elsewhere {
            tracing::warn!(phase = ?transaction.phase, "commit refused");
            self.notify(target, &xid, XaCode::Protocol, Stage::Error).await;
            return;
        }

        for resource in &request.resources {
            transaction.involve(*resource);
        }
        transaction.owner = Some(request.process);
        transaction.target = target;
        transaction.completion_started = Some(Instant::now());
        self.start_commit(&xid).await;
    }

    #[tracing::instrument(skip(self, reply), fields(xid = %request.xid, resources = request.resources.len()))]
    async fn rollback(&mut self, request: RollbackRequest, reply: oneshot::Sender<RollbackReply>) {
        let xid = request.xid.clone();
        let target = ReplyTarget::Rollback {
            correlation: request.correlation,
            sender: reply,
        };
        if xid.is_null() {
            self.notify(target, &xid, XaCode::Invalid, Stage::Error).await;
            return;
        }

        let transaction = self
            .transactions
            .entry(xid.clone())
            .or_insert_with(|| Transaction::new(xid.clone(), Some(request.process)));

        if transaction.phase == Phase::TimedOut {
            transaction.target = target;
            self.forget(&xid).await;
            self.finish(&xid, XaCode::Ok, Stage::Error).await;
            return;
        }
        let owned_elsewhere = transaction
            .owner
            .is_some_and(|owner| owner != request.process);
        if !matches!(transaction.phase, Phase::Involved | Phase::Prepared) || owned_elsewhere {
            tracing::warn!(phase = ?transaction.phase, "rollback refused");
            self.notify(target, &xid, XaCode::Protocol, Stage::Error).await;
            return;
        }

        for resource in &request.resources {
            transaction.involve(*resource);
        }
        transaction.target = target;
        transaction.completion_started = Some(Instant::now());
        self.start_rollback(&xid).await;
    }

    fn involved(&mut self, message: InvolvedMessage) {
        if message.xid.is_null() {
            tracing::warn!(process = %message.process, "involvement without a transaction");
            return;
        }
        let transaction = self
            .transactions
            .entry(message.xid.clone())
            .or_insert_with(|| Transaction::new(message.xid.clone(), None));
        if transaction.phase != Phase::Involved {
            tracing::warn!(xid = %message.xid, phase = ?transaction.phase, "late involvement ignored");
            return;
        }
        for resource in message.resources {
            transaction.involve(resource);
        }
        tracing::debug!(xid = %message.xid, process = %message.process, "resources involved");
    }

    fn external_involved(
        &mut self,
        xid: Xid,
        process: ProcessHandle,
        channel: mpsc::Sender<ResourceRequest>,
    ) {
        let known = self
            .externals
            .values_mut()
            .find(|external| external.process == process);
        let id = match known {
            Some(external) => {
                external.channel = channel;
                external.id
            }
            None => {
                let id = ResourceId::new(self.next_external);
                self.next_external -= 1;
                self.externals.insert(
                    id,
                    ExternalProxy {
                        id,
                        process,
                        channel,
                    },
                );
                tracing::info!(resource = %id, %process, "registered remote domain");
                id
            }
        };

        self.involved(InvolvedMessage {
            xid,
            process,
            resources: vec![id],
        });
    }

    /// A request from another domain, where this coordinator acts as a
    /// participant for a remote owner.
    #[tracing::instrument(skip(self, reply), fields(xid = %request.xid, op = %request.op))]
    async fn domain(&mut self, request: DomainRequest, reply: oneshot::Sender<DomainReply>) {
        let xid = request.xid.clone();
        let one_phase = request.flags.contains(Flags::ONEPHASE);
        let target = ReplyTarget::Domain {
            correlation: request.correlation,
            resource: request.resource,
            op: request.op,
            sender: reply,
        };

        let phase = self.transactions.get(&xid).map(|t| t.phase);
        let immediate = match (request.op, phase) {
            (ResourceOp::Prepare, None) => Some(XaCode::ReadOnly),
            (ResourceOp::Commit, None) if one_phase => Some(XaCode::ReadOnly),
            (_, None) => Some(XaCode::NotA),
            (ResourceOp::Prepare, Some(Phase::Involved)) => None,
            (ResourceOp::Commit, Some(Phase::Involved)) if one_phase => None,
            (ResourceOp::Commit, Some(Phase::Prepared)) if !one_phase => None,
            (ResourceOp::Rollback, Some(Phase::Involved | Phase::Prepared)) => None,
            _ => Some(XaCode::Protocol),
        };
        if let Some(status) = immediate {
            tracing::debug!(%status, "answered without resource work");
            self.notify(target, &xid, status, Stage::Error).await;
            return;
        }

        let Some(transaction) = self.transactions.get_mut(&xid) else {
            return;
        };
        transaction.remote = true;
        transaction.target = target;
        transaction.completion_started = Some(Instant::now());

        match request.op {
            ResourceOp::Prepare => self.start_prepare(&xid).await,
            ResourceOp::Commit if one_phase => self.start_commit(&xid).await,
            ResourceOp::Commit => {
                transaction.phase = Phase::Committing;
                let voters = transaction.voted(XaCode::Ok);
                if voters.is_empty() {
                    self.forget(&xid).await;
                    self.finish(&xid, XaCode::Ok, Stage::Commit).await;
                    return;
                }
                for resource in voters {
                    self.request(&xid, resource, ResourceOp::Commit, Flags::NOFLAGS)
                        .await;
                }
            }
            ResourceOp::Rollback => self.start_rollback(&xid).await,
        }
    }

    async fn connected(&mut self, instance: InstanceId, reply: ConnectReply) {
        if reply.status != XaCode::Ok {
            tracing::warn!(%instance, status = %reply.status, "instance connected without an open resource");
        } else {
            tracing::info!(%instance, "instance connected");
        }
        if let Some(slot) = self.instance_mut(instance)
            && slot.state == InstanceState::Started
        {
            slot.state = InstanceState::Idle;
        }
        self.dispatch_pending(instance.resource).await;
    }

    async fn release(&mut self, instance: InstanceId, elapsed: Duration) {
        if let Some(slot) = self.instance_mut(instance) {
            slot.statistics.record(elapsed);
            if slot.state == InstanceState::Busy {
                slot.state = InstanceState::Idle;
            }
        }
        self.dispatch_pending(instance.resource).await;
    }

    async fn resource_reply(&mut self, reply: ResourceReply) {
        let xid = reply.xid.clone();
        let Some(transaction) = self.transactions.get_mut(&xid) else {
            tracing::warn!(%xid, resource = %reply.resource, op = %reply.op, "reply for unknown transaction");
            return;
        };
        let Some(association) = transaction.association_mut(reply.resource) else {
            tracing::warn!(%xid, resource = %reply.resource, "reply from a resource not in the transaction");
            return;
        };
        if !association.advance(AssociationState::replied(reply.op)) {
            tracing::warn!(%xid, resource = %reply.resource, op = %reply.op, "duplicate reply ignored");
            return;
        }
        association.result = Some(reply.status);
        tracing::debug!(%xid, resource = %reply.resource, op = %reply.op, status = %reply.status, "resource replied");

        let phase = transaction.phase;
        match reply.op {
            ResourceOp::Prepare
                if phase == Phase::Preparing
                    && !transaction.awaiting(AssociationState::PrepareRequested) =>
            {
                self.prepared(&xid).await
            }
            ResourceOp::Commit
                if phase == Phase::Committing
                    && !transaction.awaiting(AssociationState::CommitRequested) =>
            {
                self.committed(&xid).await
            }
            ResourceOp::Rollback
                if phase == Phase::RollingBack
                    && !transaction.awaiting(AssociationState::RollbackRequested) =>
            {
                self.rolled_back(&xid).await
            }
            _ => {}
        }
    }

    /// Applies the commit policy: nothing to do, one-phase, or two-phase.
    async fn start_commit(&mut self, xid: &Xid) {
        let Some(transaction) = self.transactions.get_mut(xid) else {
            return;
        };
        let resources = transaction.resources();
        match resources.as_slice() {
            [] => {
                tracing::debug!(%xid, "no resources, nothing to commit");
                self.forget(xid).await;
                self.finish(xid, XaCode::Ok, Stage::Commit).await;
            }
            [resource] => {
                transaction.phase = Phase::Committing;
                metrics::counter!("tm_one_phase_commits_total").increment(1);
                tracing::debug!(%xid, %resource, "one-phase commit");
                self.request(xid, *resource, ResourceOp::Commit, Flags::ONEPHASE)
                    .await;
            }
            _ => self.start_prepare(xid).await,
        }
    }

    async fn start_prepare(&mut self, xid: &Xid) {
        let Some(transaction) = self.transactions.get_mut(xid) else {
            return;
        };
        let resources = transaction.resources();
        if resources.is_empty() {
            self.forget(xid).await;
            self.finish(xid, XaCode::ReadOnly, Stage::Commit).await;
            return;
        }
        transaction.phase = Phase::Preparing;
        tracing::debug!(%xid, resources = resources.len(), "preparing");
        for resource in resources {
            self.request(xid, resource, ResourceOp::Prepare, Flags::NOFLAGS)
                .await;
        }
    }

    /// Every resource voted; decides between read-only, commit and
    /// rollback.
    async fn prepared(&mut self, xid: &Xid) {
        let Some(transaction) = self.transactions.get_mut(xid) else {
            return;
        };
        let vote = XaCode::aggregate(transaction.results_in(AssociationState::PrepareReplied));
        match vote.class() {
            CodeClass::ReadOnly => {
                tracing::info!(%xid, "every resource is read-only, skipping commit phase");
                metrics::counter!("tm_read_only_optimizations_total").increment(1);
                let status = if transaction.prepare_only() {
                    XaCode::ReadOnly
                } else {
                    XaCode::Ok
                };
                self.forget(xid).await;
                self.finish(xid, status, Stage::Commit).await;
            }
            CodeClass::Ok => self.decide_commit(xid).await,
            CodeClass::Rollback | CodeClass::Error => {
                tracing::info!(%xid, %vote, "prepare failed, rolling back");
                transaction.outcome = Some(vote);
                self.start_rollback(xid).await;
            }
        }
    }

    /// Makes the commit decision durable, then commits the ok voters.
    async fn decide_commit(&mut self, xid: &Xid) {
        let Some(transaction) = self.transactions.get(xid) else {
            return;
        };
        let voters = transaction.voted(XaCode::Ok);
        let owner = transaction.owner.unwrap_or(self.config.process);

        if let Err(e) = self.log.prepare(xid, &owner, &voters).await {
            tracing::error!(%xid, error = %e, "failed to log commit decision, rolling back");
            if let Some(transaction) = self.transactions.get_mut(xid) {
                transaction.outcome = Some(XaCode::ResourceFail);
            }
            self.start_rollback(xid).await;
            return;
        }
        let Some(transaction) = self.transactions.get_mut(xid) else {
            return;
        };
        transaction.logged = true;

        if transaction.prepare_only() {
            transaction.phase = Phase::Prepared;
            let target = std::mem::take(&mut transaction.target);
            tracing::info!(%xid, "prepared for remote owner");
            self.notify(target, xid, XaCode::Ok, Stage::Prepare).await;
            return;
        }

        transaction.phase = Phase::Committing;
        let decision = match &transaction.target {
            ReplyTarget::Commit {
                correlation,
                sender,
            } => Some((
                sender.clone(),
                CommitReply {
                    correlation: *correlation,
                    xid: xid.clone(),
                    status: XaCode::Ok,
                    stage: Stage::Prepare,
                },
            )),
            _ => None,
        };
        if let Some((sender, reply)) = decision {
            self.deliver(&sender, reply).await;
        }

        tracing::info!(%xid, resources = voters.len(), "commit decision logged, committing");
        for resource in voters {
            self.request(xid, resource, ResourceOp::Commit, Flags::NOFLAGS)
                .await;
        }
    }

    async fn committed(&mut self, xid: &Xid) {
        let Some(transaction) = self.transactions.get(xid) else {
            return;
        };
        let recovered = transaction.recovered;
        let logged = transaction.logged;
        let status = XaCode::aggregate(
            transaction
                .results_in(AssociationState::CommitReplied)
                .into_iter()
                // Already committed before the restart.
                .map(|code| match code {
                    XaCode::NotA if recovered => XaCode::Ok,
                    other => other,
                }),
        );

        if status.is_success() {
            self.forget(xid).await;
            self.finish(xid, status, Stage::Commit).await;
            return;
        }

        if logged {
            tracing::warn!(%xid, %status, "commit incomplete, keeping log entry");
        } else {
            self.forget(xid).await;
        }
        self.finish(xid, status, Stage::Error).await;
    }

    async fn start_rollback(&mut self, xid: &Xid) {
        let Some(transaction) = self.transactions.get_mut(xid) else {
            return;
        };
        transaction.phase = Phase::RollingBack;
        let targets: Vec<ResourceId> = transaction
            .associations
            .iter()
            .filter(|association| match association.result {
                None => true,
                Some(code) => {
                    code != XaCode::ReadOnly
                        && code != XaCode::NotA
                        && code.class() != CodeClass::Rollback
                }
            })
            .map(|association| association.resource)
            .collect();

        if targets.is_empty() {
            self.rolled_back(xid).await;
            return;
        }
        tracing::debug!(%xid, resources = targets.len(), "rolling back");
        for resource in targets {
            self.request(xid, resource, ResourceOp::Rollback, Flags::NOFLAGS)
                .await;
        }
    }

    async fn rolled_back(&mut self, xid: &Xid) {
        let Some(transaction) = self.transactions.get_mut(xid) else {
            return;
        };
        let status = transaction
            .results_in(AssociationState::RollbackReplied)
            .into_iter()
            .map(|code| match code {
                XaCode::NotA | XaCode::ReadOnly => XaCode::Ok,
                other => other,
            })
            .fold(XaCode::Ok, XaCode::combine);
        let status = transaction
            .outcome
            .map_or(status, |outcome| outcome.combine(status));

        if transaction.outcome == Some(XaCode::RollbackTimeout)
            && matches!(transaction.target, ReplyTarget::None)
        {
            tracing::info!(%xid, "timed out transaction rolled back");
            transaction.phase = Phase::TimedOut;
            return;
        }

        self.forget(xid).await;
        self.finish(xid, status, Stage::Error).await;
    }

    /// Rolls back owned transactions whose deadline passed and prunes
    /// stale records and log entries.
    async fn tick(&mut self) {
        let now = Instant::now();
        let expired: Vec<Xid> = self
            .transactions
            .values()
            .filter(|t| !t.remote && t.phase == Phase::Involved && t.expired(now))
            .map(|t| t.xid.clone())
            .collect();

        for xid in expired {
            tracing::warn!(%xid, "transaction timed out, rolling back");
            if let Err(e) = self.log.timeout(&xid).await {
                tracing::warn!(%xid, error = %e, "failed to log timeout");
            }
            if let Some(transaction) = self.transactions.get_mut(&xid) {
                transaction.outcome = Some(XaCode::RollbackTimeout);
            }
            self.start_rollback(&xid).await;
        }

        let stale: Vec<Xid> = self
            .transactions
            .values()
            .filter(|t| {
                t.phase == Phase::TimedOut
                    && t.deadline
                        .is_some_and(|d| now.saturating_duration_since(d) >= TIMED_OUT_RETENTION)
            })
            .map(|t| t.xid.clone())
            .collect();
        for xid in stale {
            tracing::debug!(%xid, "dropping timed out transaction");
            self.forget(&xid).await;
            self.transactions.remove(&xid);
        }

        match self.log.passed(Utc::now()).await {
            Ok(entries) => {
                for entry in entries {
                    if entry.state != LogState::Prepared
                        && !self.transactions.contains_key(&entry.xid)
                    {
                        tracing::debug!(xid = %entry.xid, "pruning orphaned log entry");
                        self.forget(&entry.xid).await;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to scan log for passed deadlines"),
        }
    }

    /// Moves the association forward and sends the request.
    async fn request(&mut self, xid: &Xid, resource: ResourceId, op: ResourceOp, flags: Flags) {
        if let Some(association) = self
            .transactions
            .get_mut(xid)
            .and_then(|t| t.association_mut(resource))
        {
            association.advance(AssociationState::requested(op));
        }
        self.send(ResourceRequest {
            correlation: CorrelationId::new(),
            xid: xid.clone(),
            resource,
            op,
            flags,
        })
        .await;
    }

    /// Sends to an idle instance, or queues the request until one is.
    async fn send(&mut self, request: ResourceRequest) {
        let resource = request.resource;
        let dispatch = self.config.dispatch;

        if resource.is_external() {
            let Some(external) = self.externals.get(&resource) else {
                tracing::warn!(%resource, "request for unknown remote domain");
                self.fail(request, XaCode::ResourceFail);
                return;
            };
            let channel = external.channel.clone();
            // Keep per-domain order behind anything already waiting.
            if self.waiting(resource) {
                self.queue(request);
                return;
            }
            match dispatch.deliver(&channel, request).await {
                Ok(()) => {}
                Err(Undelivered::Full(request)) => {
                    tracing::debug!(%resource, xid = %request.xid, op = %request.op, "remote domain busy, queueing request");
                    self.queue(request);
                }
                Err(Undelivered::Closed(request)) => {
                    tracing::warn!(%resource, "remote domain unreachable");
                    self.fail(request, XaCode::ResourceFail);
                }
            }
            return;
        }

        let Some(proxy) = self.resources.get_mut(&resource) else {
            tracing::warn!(%resource, "request for unknown resource");
            self.fail(request, XaCode::ResourceError);
            return;
        };
        let alive = proxy.alive();
        let Some(instance) = proxy.idle() else {
            if alive {
                tracing::debug!(%resource, xid = %request.xid, op = %request.op, "instances busy, queueing request");
                self.queue(request);
            } else {
                tracing::error!(%resource, "no instance left to serve request");
                self.fail(request, XaCode::ResourceFail);
            }
            return;
        };

        instance.state = InstanceState::Busy;
        let id = InstanceId {
            resource,
            index: instance.index,
        };
        let delivered = match instance.sender.clone() {
            Some(sender) => dispatch.deliver(&sender, request).await,
            None => Err(Undelivered::Closed(request)),
        };
        if let Err(undelivered) = delivered {
            let request = undelivered.into_inner();
            tracing::error!(instance = %id, "instance is gone");
            if let Some(slot) = self.instance_mut(id) {
                slot.state = InstanceState::Error;
            }
            self.fail(request, XaCode::ResourceFail);
        }
    }

    /// Sends the oldest pending requests for `resource` while it has idle
    /// instances.
    async fn dispatch_pending(&mut self, resource: ResourceId) {
        loop {
            let idle = self
                .resources
                .get_mut(&resource)
                .is_some_and(|proxy| proxy.idle().is_some());
            if !idle {
                return;
            }
            let Some(position) = self
                .pending
                .iter()
                .position(|pending| pending.request.resource == resource)
            else {
                return;
            };
            let Some(pending) = self.pending.remove(position) else {
                return;
            };
            tracing::debug!(%resource, waited = ?pending.queued.elapsed(), "dispatching pending request");
            self.send(pending.request).await;
        }
    }

    fn queue(&mut self, request: ResourceRequest) {
        metrics::counter!("tm_pending_requests_total").increment(1);
        self.pending.push_back(Pending {
            request,
            queued: Instant::now(),
        });
    }

    fn waiting(&self, resource: ResourceId) -> bool {
        self.pending
            .iter()
            .any(|pending| pending.request.resource == resource)
    }

    /// Retries requests queued for remote domains whose channel was full.
    /// Runs after every message, ticks included.
    fn flush_externals(&mut self) {
        let waiting: BTreeSet<ResourceId> = self
            .pending
            .iter()
            .map(|pending| pending.request.resource)
            .filter(|resource| resource.is_external())
            .collect();
        for resource in waiting {
            self.dispatch_external(resource);
        }
    }

    /// Sends queued requests for a remote domain in order until its
    /// channel is full again.
    fn dispatch_external(&mut self, resource: ResourceId) {
        let channel = self
            .externals
            .get(&resource)
            .map(|external| external.channel.clone());

        while let Some(position) = self
            .pending
            .iter()
            .position(|pending| pending.request.resource == resource)
        {
            let Some(pending) = self.pending.remove(position) else {
                return;
            };
            let Some(channel) = channel.as_ref() else {
                self.fail(pending.request, XaCode::ResourceFail);
                continue;
            };
            match channel.try_send(pending.request) {
                Ok(()) => {
                    tracing::debug!(%resource, waited = ?pending.queued.elapsed(), "dispatching pending request");
                }
                Err(TrySendError::Full(request)) => {
                    self.pending.insert(
                        position,
                        Pending {
                            request,
                            queued: pending.queued,
                        },
                    );
                    return;
                }
                Err(TrySendError::Closed(request)) => {
                    tracing::warn!(%resource, "remote domain unreachable");
                    self.fail(request, XaCode::ResourceFail);
                }
            }
        }
    }

    fn fail(&mut self, request: ResourceRequest, status: XaCode) {
        self.failed.push_back(ResourceReply {
            correlation: request.correlation,
            xid: request.xid,
            resource: request.resource,
            op: request.op,
            status,
        });
    }

    fn instance_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.resources
            .get_mut(&id.resource)?
            .instances
            .get_mut(id.index)
    }

    /// Removes the log entry, if any.
    async fn forget(&self, xid: &Xid) {
        if let Err(e) = self.log.remove(xid).await {
            tracing::warn!(%xid, error = %e, "failed to remove log entry");
        }
    }

    /// Drops the record and tells whoever is waiting.
    async fn finish(&mut self, xid: &Xid, status: XaCode, stage: Stage) {
        let Some(transaction) = self.transactions.remove(xid) else {
            return;
        };
        metrics::counter!("tm_transactions_total", "outcome" => status.name()).increment(1);
        if let Some(started) = transaction.completion_started {
            metrics::histogram!("tm_commit_duration_seconds")
                .record(started.elapsed().as_secs_f64());
        }
        tracing::info!(%xid, %status, ?stage, "transaction completed");
        self.notify(transaction.target, xid, status, stage).await;
    }

    async fn notify(&self, target: ReplyTarget, xid: &Xid, status: XaCode, stage: Stage) {
        let delivered = match target {
            ReplyTarget::None => true,
            ReplyTarget::Commit {
                correlation,
                sender,
            } => {
                let reply = CommitReply {
                    correlation,
                    xid: xid.clone(),
                    status,
                    stage,
                };
                return self.deliver(&sender, reply).await;
            }
            ReplyTarget::Rollback {
                correlation,
                sender,
            } => sender
                .send(RollbackReply {
                    correlation,
                    xid: xid.clone(),
                    status,
                })
                .is_ok(),
            ReplyTarget::Domain {
                correlation,
                resource,
                sender,
                ..
            } => sender
                .send(DomainReply {
                    correlation,
                    xid: xid.clone(),
                    resource,
                    status,
                })
                .is_ok(),
        };
        if !delivered {
            tracing::debug!(%xid, "caller no longer waiting");
        }
    }

    async fn deliver(&self, sender: &mpsc::Sender<CommitReply>, reply: CommitReply) {
        let xid = reply.xid.clone();
        if self.config.dispatch.deliver(sender, reply).await.is_err() {
            tracing::debug!(%xid, "caller no longer waiting");
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut transactions: Vec<_> = self
            .transactions
            .values()
            .map(Transaction::snapshot)
            .collect();
        transactions.sort_by(|a, b| a.xid.cmp(&b.xid));

        Snapshot {
            transactions,
            resources: self.resources.values().map(ResourceProxy::snapshot).collect(),
            externals: self
                .externals
                .values()
                .map(|external| ExternalSnapshot {
                    id: external.id,
                    process: external.process,
                })
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|pending| PendingSnapshot {
                    xid: pending.request.xid.clone(),
                    resource: pending.request.resource,
                    op: pending.request.op,
                    queued: pending.queued.elapsed(),
                })
                .collect(),
        }
    }

    async fn shutdown(mut self) {
        tracing::info!("coordinator shutting down");
        self.inbound.close();
        while self.inbound.try_recv().is_ok() {}
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }

        let mut tasks = Vec::new();
        for proxy in self.resources.values_mut() {
            for instance in &mut proxy.instances {
                instance.sender = None;
                instance.state = InstanceState::Shutdown;
                tasks.extend(instance.task.take());
            }
        }
        self.transactions.clear();

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "resource instance task failed");
            }
        }
        tracing::info!("coordinator stopped");
    }
}

/// Sends a tick every `interval` for as long as the coordinator has
/// clients.
fn spawn_ticker(coordinator: mpsc::WeakSender<Message>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;
        loop {
            ticks.tick().await;
            let Some(sender) = coordinator.upgrade() else {
                break;
            };
            if sender.send(Message::Tick).await.is_err() {
                break;
            }
        }
    })
}
