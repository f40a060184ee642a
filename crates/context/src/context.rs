//! The per-process transaction context.

use std::future::Future;
use std::time::Duration;

use common::message::{BeginRequest, CommitRequest, InvolvedMessage, RollbackRequest};
use common::{CorrelationId, Flags, ProcessHandle, ResourceId, XaCode, Xid};
use manager::TransactionManager;
use serde::Serialize;
use tokio::time::Instant;
use xa::{Resource, SwitchRegistry};

use crate::config::{CommitReturn, ContextConfig, Control};
use crate::error::{ProtocolViolation, RegistrationError, Result, TxError};
use crate::transaction::{Transaction, TransactionState};

/// What [`TransactionContext::info`] reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInfo {
    pub xid: Xid,
    pub in_transaction: bool,
    pub state: TransactionState,
    pub timeout: Option<Duration>,
    pub control: Control,
    pub commit_return: CommitReturn,
}

/// Result of [`TransactionContext::finalize`]: the transaction the caller
/// joined, if any, and the state to report back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finalized {
    pub xid: Xid,
    pub state: TransactionState,
}

/// A transaction waiting below the current one.
struct Parked {
    transaction: Transaction,
    /// Put aside by `suspend` and only brought back by `resume`. Otherwise
    /// it is the parent of a nested transaction.
    suspended: bool,
}

/// Transaction control for one process.
///
/// The context owns a stack of transactions whose top is the current one.
/// The stack is never empty: "no transaction" is a null entry. Create one
/// context per process and pass it to whatever serves calls; it holds no
/// global state.
pub struct TransactionContext<M> {
    driver: Driver<M>,
    current: Transaction,
    /// Suspended or stacked transactions, innermost last.
    stacked: Vec<Parked>,
    control: Control,
    timeout: Option<Duration>,
}

/// Resources and the manager, kept apart from the stack so a transaction
/// can be borrowed while they are driven.
struct Driver<M> {
    process: ProcessHandle,
    manager: M,
    resources: Vec<Resource>,
    commit_return: CommitReturn,
}

impl<M: TransactionManager> TransactionContext<M> {
    /// Builds the context's resources from `config`. Resource ids are
    /// assigned from one, in configuration order.
    pub fn new(
        process: ProcessHandle,
        config: ContextConfig,
        manager: M,
        registry: &SwitchRegistry,
    ) -> Result<Self> {
        let mut resources = Vec::with_capacity(config.resources.len());
        for (position, resource) in config.resources.iter().enumerate() {
            let id = i32::try_from(position + 1)
                .map(ResourceId::new)
                .map_err(|_| TxError::Argument("too many resources".into()))?;
            resources.push(
                registry
                    .resource(id, &resource.key)?
                    .with_open_info(resource.openinfo.clone())
                    .with_close_info(resource.closeinfo.clone()),
            );
        }

        Ok(Self {
            driver: Driver {
                process,
                manager,
                resources,
                commit_return: config.commit_return,
            },
            current: Transaction::null(),
            stacked: Vec::new(),
            control: config.control,
            timeout: config.timeout.filter(|timeout| !timeout.is_zero()),
        })
    }

    pub fn process(&self) -> ProcessHandle {
        self.driver.process
    }

    /// The current transaction, possibly a null one.
    pub fn current(&self) -> &Transaction {
        &self.current
    }

    /// Opens every resource. Failures are logged by the resource and do not
    /// stop the others.
    pub async fn open(&self) {
        for resource in &self.driver.resources {
            resource.open().await;
        }
    }

    pub async fn close(&self) {
        for resource in &self.driver.resources {
            resource.close().await;
        }
    }

    /// Begins a transaction and starts every static resource in it.
    ///
    /// With stacked control an active transaction is suspended and the new
    /// one nests inside it; otherwise an active transaction is an error.
    #[tracing::instrument(skip(self), fields(process = %self.driver.process))]
    pub async fn begin(&mut self) -> Result<Xid> {
        if !self.current.is_null() {
            if self.control != Control::Stacked {
                return Err(TxError::Protocol(ProtocolViolation::AlreadyActive));
            }
            self.driver.end(&self.current, Flags::SUSPEND).await;
        } else if !self.current.resources.is_empty() {
            return Err(TxError::Outside);
        }

        let transaction = Transaction::begin(self.driver.process, self.timeout);
        self.driver
            .start(&transaction.xid, Flags::NOFLAGS)
            .await;
        let xid = transaction.xid.clone();
        self.push(transaction);

        metrics::counter!("tx_begin_total").increment(1);
        tracing::info!(%xid, "transaction started");
        Ok(xid)
    }

    /// Commits the current transaction. On success the stack moves on as
    /// the control mode says; on failure the transaction stays current.
    ///
    /// A failed commit leaves the transaction current even when the manager
    /// already rolled it back. Follow it with [`rollback`](Self::rollback)
    /// to clear it before beginning another one.
    #[tracing::instrument(skip(self), fields(xid = %self.current.xid))]
    pub async fn commit(&mut self) -> Result<()> {
        self.driver.commit(&mut self.current).await?;
        self.finish().await
    }

    #[tracing::instrument(skip(self), fields(xid = %self.current.xid))]
    pub async fn rollback(&mut self) -> Result<()> {
        self.driver.rollback(&mut self.current).await?;
        self.finish().await
    }

    /// Suspends the current transaction and returns its id. No transaction
    /// is current afterwards.
    #[tracing::instrument(skip(self), fields(xid = %self.current.xid))]
    pub async fn suspend(&mut self) -> Result<Xid> {
        if self.current.is_null() {
            return Err(TxError::Protocol(ProtocolViolation::NullXid));
        }

        self.driver.end(&self.current, Flags::SUSPEND).await;
        let suspended = std::mem::replace(&mut self.current, Transaction::null());
        let xid = suspended.xid.clone();
        self.stacked.push(Parked {
            transaction: suspended,
            suspended: true,
        });

        tracing::debug!("transaction suspended");
        Ok(xid)
    }

    /// Makes a suspended transaction current again.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&mut self, xid: &Xid) -> Result<()> {
        if xid.is_null() {
            return Err(TxError::Argument("attempt to resume a null xid".into()));
        }
        if !self.current.is_null() {
            return Err(TxError::Protocol(ProtocolViolation::ActiveTransaction));
        }
        if !self.current.resources.is_empty() {
            return Err(TxError::Outside);
        }
        let position = self
            .stacked
            .iter()
            .position(|parked| parked.suspended && &parked.transaction.xid == xid)
            .ok_or_else(|| TxError::Argument(format!("transaction {xid} not suspended")))?;

        self.driver.start(xid, Flags::RESUME).await;
        // The null entry left by suspend is dropped.
        self.current = self.stacked.remove(position).transaction;

        tracing::debug!("transaction resumed");
        Ok(())
    }

    /// Makes `xid`, owned by `owner`, current for the duration of an inbound
    /// call and starts the static resources in it.
    #[tracing::instrument(skip(self))]
    pub async fn join(&mut self, xid: Xid, owner: ProcessHandle) {
        let transaction = Transaction::join(xid, owner);
        if !transaction.is_null() {
            self.driver
                .start(&transaction.xid, Flags::NOFLAGS)
                .await;
        }
        self.push(transaction);
    }

    /// Called by a dynamic resource when it starts work. Returns the id of
    /// the current transaction, null outside one.
    pub fn resource_registration(
        &mut self,
        rmid: ResourceId,
    ) -> std::result::Result<Xid, RegistrationError> {
        if !self
            .driver
            .resource(rmid)
            .is_some_and(|resource| resource.dynamic())
        {
            tracing::error!(%rmid, "registration from unknown or static resource");
            return Err(RegistrationError::Invalid);
        }
        let current = &mut self.current;
        if !current.is_null() && current.expire(Instant::now()) != TransactionState::Active {
            return Err(RegistrationError::Protocol);
        }
        if current.resources.contains(&rmid) {
            return Err(RegistrationError::Resume(current.xid.clone()));
        }
        current.resources.push(rmid);
        Ok(current.xid.clone())
    }

    /// Allowed only outside a global transaction.
    pub fn resource_unregistration(
        &mut self,
        rmid: ResourceId,
    ) -> std::result::Result<(), RegistrationError> {
        if !self.current.is_null() {
            return Err(RegistrationError::Protocol);
        }
        let position = self
            .current
            .resources
            .iter()
            .position(|id| *id == rmid)
            .ok_or(RegistrationError::Protocol)?;
        self.current.resources.remove(position);
        Ok(())
    }

    /// Records a call made inside the current transaction. Until it replies
    /// the transaction cannot commit.
    ///
    /// The first call out of a transaction this process began registers it
    /// with the manager together with what is left of its timeout. From then
    /// on the manager owns the deadline and rolls the transaction back if
    /// this process never finishes it.
    #[tracing::instrument(skip(self), fields(xid = %self.current.xid))]
    pub async fn associate(&mut self, correlation: CorrelationId) -> Result<()> {
        if self.current.is_null() {
            return Ok(());
        }
        match self.current.expire(Instant::now()) {
            TransactionState::Active => {}
            TransactionState::TimedOut => {
                return Err(TxError::Protocol(ProtocolViolation::TimedOut));
            }
            _ => return Err(TxError::Protocol(ProtocolViolation::RollbackOnly)),
        }
        if self.current.local() && self.current.owned_by(&self.driver.process) {
            self.driver.register(&self.current).await?;
        }
        self.current.associate(correlation);
        Ok(())
    }

    /// Applies the reply to a call. The transaction's state escalates to
    /// the state the callee reported. A reply outside any transaction just
    /// releases the call wherever it was recorded.
    pub fn replied(
        &mut self,
        correlation: CorrelationId,
        xid: &Xid,
        state: TransactionState,
    ) -> Result<()> {
        let mut transactions = std::iter::once(&mut self.current)
            .chain(self.stacked.iter_mut().map(|parked| &mut parked.transaction));

        if xid.is_null() {
            for transaction in transactions {
                transaction.replied(&correlation);
            }
            return Ok(());
        }

        let transaction = transactions
            .find(|transaction| &transaction.xid == xid)
            .ok_or(TxError::Protocol(ProtocolViolation::UnknownTransaction))?;
        transaction.escalate(state);
        if !transaction.replied(&correlation) {
            tracing::warn!(%correlation, %xid, "reply for unknown call");
        }
        Ok(())
    }

    /// Reconciles every transaction at the end of an inbound call.
    ///
    /// Transactions with calls still pending become rollback-only. Owned
    /// transactions are committed when `commit` is set and they are still
    /// active, rolled back otherwise. The joined transaction is reported back
    /// with its state, and the manager is told which resources worked in it.
    /// Every transaction is handled even if an earlier one fails; any
    /// failure turns the reported state into `Error`.
    #[tracing::instrument(skip(self))]
    pub async fn finalize(&mut self, commit: bool) -> Finalized {
        let mut transactions: Vec<Transaction> = std::mem::take(&mut self.stacked)
            .into_iter()
            .map(|parked| parked.transaction)
            .collect();
        transactions.push(std::mem::replace(&mut self.current, Transaction::null()));

        let mut failed = false;
        let mut caller: Option<Finalized> = None;

        for mut transaction in transactions {
            if transaction.is_null() {
                continue;
            }
            if transaction.pending() {
                tracing::error!(
                    xid = %transaction.xid,
                    "pending replies associated with transaction, marking rollback-only"
                );
                transaction.escalate(TransactionState::RollbackOnly);
                failed = true;
            }

            if transaction.owned_by(&self.driver.process) {
                let active = transaction.expire(Instant::now()) == TransactionState::Active;
                let result = if commit && active {
                    self.driver.commit(&mut transaction).await
                } else {
                    self.driver.rollback(&mut transaction).await
                };
                if let Err(error) = result {
                    tracing::error!(xid = %transaction.xid, %error, "failed to finish transaction");
                    failed = true;
                }
                continue;
            }

            if let Some(previous) = &caller {
                tracing::warn!(xid = %previous.xid, "more than one joined transaction");
            }
            let state = if commit {
                transaction.state
            } else {
                TransactionState::RollbackOnly
            };
            self.driver.end(&transaction, Flags::SUCCESS).await;
            if let Err(error) = self.driver.involved(&transaction).await {
                tracing::error!(xid = %transaction.xid, %error, "failed to report involved resources");
                failed = true;
            }
            caller = Some(Finalized {
                xid: transaction.xid,
                state,
            });
        }

        let mut finalized = caller.unwrap_or(Finalized {
            xid: Xid::null(),
            state: TransactionState::Active,
        });
        if failed {
            finalized.state = TransactionState::Error;
        }
        finalized
    }

    pub fn info(&mut self) -> TxInfo {
        let state = self.current.expire(Instant::now());
        TxInfo {
            xid: self.current.xid.clone(),
            in_transaction: !self.current.is_null(),
            state,
            timeout: self.timeout,
            control: self.control,
            commit_return: self.driver.commit_return,
        }
    }

    pub fn set_control(&mut self, control: i64) -> Result<()> {
        self.control = Control::try_from(control)?;
        Ok(())
    }

    pub fn set_commit_return(&mut self, commit_return: i64) -> Result<()> {
        self.driver.commit_return = CommitReturn::try_from(commit_return)?;
        Ok(())
    }

    /// Timeout in seconds for transactions begun from now on; `0` disables
    /// it.
    pub fn set_timeout(&mut self, seconds: i64) -> Result<()> {
        let seconds = u64::try_from(seconds).map_err(|_| {
            TxError::Argument(format!("timeout has to be 0 or greater, got {seconds}"))
        })?;
        self.timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        Ok(())
    }

    /// Pushes `transaction` as current. A bare null entry is replaced
    /// rather than kept underneath.
    fn push(&mut self, transaction: Transaction) {
        let previous = std::mem::replace(&mut self.current, transaction);
        if !previous.is_null() || !previous.resources.is_empty() {
            self.stacked.push(Parked {
                transaction: previous,
                suspended: false,
            });
        }
    }

    /// Moves the stack on after the current transaction finished.
    async fn finish(&mut self) -> Result<()> {
        match self.control {
            Control::Unchained => {
                self.current = Transaction::null();
                Ok(())
            }
            Control::Chained => {
                self.current = Transaction::null();
                self.begin().await.map(|_| ())
            }
            Control::Stacked => {
                // Only a parent comes back; suspended entries wait for resume.
                let parent = if self.stacked.last().is_some_and(|parked| !parked.suspended) {
                    self.stacked.pop()
                } else {
                    None
                };
                self.current = parent.map_or_else(Transaction::null, |parked| parked.transaction);
                if !self.current.is_null() {
                    self.driver.start(&self.current.xid, Flags::RESUME).await;
                }
                Ok(())
            }
        }
    }
}

impl<M: TransactionManager> Driver<M> {
    fn resource(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.iter().find(|resource| resource.id() == id)
    }

    fn statics(&self) -> Vec<ResourceId> {
        self.resources
            .iter()
            .filter(|resource| !resource.dynamic())
            .map(Resource::id)
            .collect()
    }

    /// Starts static resources on `xid`. Dynamic ones register themselves.
    async fn start(&self, xid: &Xid, flags: Flags) {
        for resource in self.resources.iter().filter(|resource| !resource.dynamic()) {
            let code = resource.start(xid, flags).await;
            if code != XaCode::Ok {
                tracing::warn!(rm = %resource.id(), %code, "failed to start resource");
            }
        }
    }

    /// Ends every resource involved in `transaction`.
    async fn end(&self, transaction: &Transaction, flags: Flags) {
        if transaction.is_null() {
            return;
        }
        for id in transaction.involved(&self.statics()) {
            if let Some(resource) = self.resource(id) {
                let code = resource.end(&transaction.xid, flags).await;
                if code != XaCode::Ok {
                    tracing::warn!(rm = %id, %code, "failed to end resource");
                }
            }
        }
    }

    /// Tells the manager about a transaction before its first call leaves
    /// the process. A duplicate means the manager already knows it.
    async fn register(&self, transaction: &Transaction) -> Result<()> {
        let timeout = transaction
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let reply = self
            .manager
            .begin(BeginRequest {
                correlation: CorrelationId::new(),
                xid: transaction.xid.clone(),
                process: self.process,
                timeout,
            })
            .await?;
        match reply.status {
            XaCode::Ok | XaCode::DuplicateId => {
                tracing::debug!(?timeout, "transaction registered with manager");
                Ok(())
            }
            status => {
                tracing::error!(%status, "manager refused transaction");
                TxError::from_outcome(status)
            }
        }
    }

    fn ensure_owner(&self, transaction: &Transaction) -> Result<()> {
        if transaction.is_null() {
            return Err(TxError::Protocol(ProtocolViolation::NoTransaction));
        }
        if !transaction.owned_by(&self.process) {
            return Err(TxError::Protocol(ProtocolViolation::NotOwner));
        }
        Ok(())
    }

    async fn commit(&self, transaction: &mut Transaction) -> Result<()> {
        self.ensure_owner(transaction)?;
        match transaction.expire(Instant::now()) {
            TransactionState::Active => {}
            TransactionState::TimedOut => {
                return Err(TxError::Protocol(ProtocolViolation::TimedOut));
            }
            _ => return Err(TxError::Protocol(ProtocolViolation::RollbackOnly)),
        }
        if transaction.pending() {
            return Err(TxError::Protocol(ProtocolViolation::PendingReplies));
        }

        self.end(transaction, Flags::SUCCESS).await;

        let xid = transaction.xid.clone();
        let involved = transaction.involved(&self.statics());

        if transaction.local() && involved.len() <= 1 {
            let Some(id) = involved.first() else {
                metrics::counter!("tx_commit_total", "path" => "local").increment(1);
                tracing::debug!("no resources, nothing to commit");
                return Ok(());
            };
            let resource = self
                .resource(*id)
                .ok_or_else(|| TxError::Fail(format!("resource {id} not known")))?;
            metrics::counter!("tx_commit_total", "path" => "one_phase").increment(1);
            let code = until_deadline(transaction, resource.commit(&xid, Flags::ONEPHASE)).await?;
            tracing::info!(%code, "one-phase commit");
            return TxError::from_outcome(code);
        }

        metrics::counter!("tx_commit_total", "path" => "distributed").increment(1);
        let request = CommitRequest {
            correlation: CorrelationId::new(),
            xid,
            process: self.process,
            resources: involved,
        };
        let replies = self.manager.commit(request).await?;
        let reply = match self.commit_return {
            CommitReturn::Completed => until_deadline(transaction, replies.outcome()).await??,
            CommitReturn::DecisionLogged => {
                until_deadline(transaction, replies.decision()).await??
            }
        };
        tracing::info!(status = %reply.status, stage = ?reply.stage, "commit reply");
        TxError::from_outcome(reply.status)
    }

    async fn rollback(&self, transaction: &mut Transaction) -> Result<()> {
        self.ensure_owner(transaction)?;

        self.end(transaction, Flags::SUCCESS).await;

        let xid = transaction.xid.clone();
        let involved = transaction.involved(&self.statics());

        if transaction.local() && involved.len() <= 1 {
            let Some(id) = involved.first() else {
                return Ok(());
            };
            let resource = self
                .resource(*id)
                .ok_or_else(|| TxError::Fail(format!("resource {id} not known")))?;
            return match resource.rollback(&xid, Flags::NOFLAGS).await {
                XaCode::NotA => Ok(()),
                code => TxError::from_outcome(code),
            };
        }

        let reply = self
            .manager
            .rollback(RollbackRequest {
                correlation: CorrelationId::new(),
                xid,
                process: self.process,
                resources: involved,
            })
            .await?;
        tracing::info!(status = %reply.status, "rollback reply");
        TxError::from_outcome(reply.status)
    }

    /// Tells the manager which resources worked in a transaction owned by
    /// someone else.
    async fn involved(&self, transaction: &Transaction) -> Result<()> {
        let resources = transaction.involved(&self.statics());
        if resources.is_empty() {
            return Ok(());
        }
        self.manager
            .involved(InvolvedMessage {
                xid: transaction.xid.clone(),
                process: self.process,
                resources,
            })
            .await?;
        Ok(())
    }
}

/// Runs `work` until the transaction's deadline. Expiry marks the
/// transaction timed out.
async fn until_deadline<F: Future>(transaction: &mut Transaction, work: F) -> Result<F::Output> {
    let Some(deadline) = transaction.deadline() else {
        return Ok(work.await);
    };
    match tokio::time::timeout_at(deadline, work).await {
        Ok(output) => Ok(output),
        Err(_) => {
            transaction.escalate(TransactionState::TimedOut);
            tracing::warn!(xid = %transaction.xid, "transaction timed out awaiting reply");
            Err(TxError::Protocol(ProtocolViolation::TimedOut))
        }
    }
}
