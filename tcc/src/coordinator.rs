use chrono::Utc;
use std::{future::Future, sync::Arc, time::Duration};
use tcc_store::{Branch, GlobalTransaction, Store, StoreError, TransactionStatus};
use tokio::sync::Notify;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::{
    alert::{AlertSink, LogAlerts},
    caller::BranchCaller,
    config::{to_chrono, CoordinatorConfig},
    error::{Result, TccError},
    registry::{validate_all, BranchDesc},
    state,
    tcc::Tcc,
    trace::{transaction_span, TraceContext},
    transport::Transport,
};

/// Entry point of the TCC protocol.
///
/// Cloning is cheap and every clone shares the same identity, which is the
/// lease owner used by its recovery sweeper.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) id: Uuid,
    pub(crate) store: Store,
    pub(crate) caller: BranchCaller,
    pub(crate) alerts: Box<dyn AlertSink>,
    pub(crate) config: CoordinatorConfig,
    pub(crate) wake: Arc<Notify>,
}

impl Coordinator {
    pub fn new<T: Transport + 'static>(store: Store, transport: T) -> Self {
        let config = CoordinatorConfig::default();

        Self {
            id: Uuid::new_v4(),
            store,
            caller: BranchCaller::new(transport, config.call_timeout),
            alerts: Box::new(LogAlerts),
            config,
            wake: Arc::default(),
        }
    }

    pub fn alerts<A: AlertSink + 'static>(mut self, sink: A) -> Self {
        self.alerts = Box::new(sink);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.caller.timeout = config.call_timeout;
        self.config = config;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Runs a transaction: `f` registers branches and calls their Try through
    /// the [`Tcc`] handle. Returns once the transaction is decided; Confirm or
    /// Cancel is delivered in the background.
    pub async fn tcc<F, Fut>(&self, gid: impl Into<String>, f: F) -> Result<()>
    where
        F: FnOnce(Tcc) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.tcc_traced(gid, TraceContext::new(), f).await
    }

    /// Same as [`Coordinator::tcc`] within an existing trace.
    pub async fn tcc_traced<F, Fut>(
        &self,
        gid: impl Into<String>,
        trace: TraceContext,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(Tcc) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let gid = gid.into();
        let span = transaction_span(&gid, &trace);

        self.run(gid, trace, f).instrument(span).await
    }

    /// Tries an ordered list of branches. Every descriptor is validated before
    /// the transaction is created.
    pub async fn submit(&self, gid: impl Into<String>, branches: Vec<BranchDesc>) -> Result<()> {
        let gid = gid.into();
        validate_all(&gid, &branches)?;

        self.tcc(gid, |tcc| async move {
            for desc in branches {
                tcc.call(desc).await?;
            }

            Ok(())
        })
        .await
    }

    async fn run<F, Fut>(&self, gid: String, trace: TraceContext, f: F) -> Result<()>
    where
        F: FnOnce(Tcc) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if gid.trim().is_empty() {
            return Err(TccError::InvalidGid(gid));
        }

        let mut txn =
            GlobalTransaction::new(&gid, Utc::now()).trace_parent(trace.to_traceparent());
        txn.next_sweep_at = txn.created_at + to_chrono(self.config.prepare_timeout);
        let deadline = txn.next_sweep_at;

        match self.store.insert_transaction(txn).await {
            Err(StoreError::DuplicateTransaction(gid)) => {
                return Err(TccError::DuplicateTransaction(gid))
            }
            res => res?,
        }

        info!("transaction {gid} prepared");

        let tcc = Tcc::new(gid.to_owned(), trace, self.store.clone(), self.caller.clone());
        let outcome = f(tcc.clone()).await;
        let failure = tcc.failure();

        let reason = match (&failure, &outcome) {
            (Some(failure), _) => Some(failure.reason(&gid)),
            (None, Err(e)) => Some(format!("{e:#}")),
            (None, Ok(())) => None,
        };

        if let Some(failure) = failure.clone() {
            let error = failure.into_error(&gid);

            // usage errors fail the transaction without submitting it
            if error.is_usage() {
                if !self
                    .store
                    .transition(
                        &gid,
                        TransactionStatus::Prepared,
                        TransactionStatus::Failed,
                        reason,
                        Utc::now(),
                    )
                    .await?
                {
                    return Err(TccError::PrepareTimeout(gid));
                }

                warn!("transaction {gid} failed: {error}");
                self.wake();

                return Err(error);
            }
        }

        if !self
            .store
            .transition(
                &gid,
                TransactionStatus::Prepared,
                TransactionStatus::Submitted,
                reason.clone(),
                deadline,
            )
            .await?
        {
            warn!("transaction {gid} was failed by recovery while the caller was running");
            return Err(TccError::PrepareTimeout(gid));
        }

        let branches = self.store.read_branches(&gid).await?;
        let decided = state::decide(reason.as_deref(), &branches);

        let status = if self
            .store
            .transition(&gid, TransactionStatus::Submitted, decided, None, Utc::now())
            .await?
        {
            self.wake();
            decided
        } else {
            // decided concurrently by recovery
            self.store
                .get_transaction(&gid)
                .await?
                .map(|txn| txn.status)
                .ok_or_else(|| TccError::NotFound(gid.to_owned()))?
        };

        info!("transaction {gid} {status}");

        match (status, failure, outcome) {
            (TransactionStatus::Succeeded, _, _) => Ok(()),
            (_, Some(failure), _) => Err(failure.into_error(&gid)),
            (_, None, Err(source)) => Err(TccError::Aborted { gid, source }),
            (_, None, Ok(())) => Err(TccError::Aborted {
                gid,
                source: anyhow::anyhow!("not every branch tried successfully"),
            }),
        }
    }

    /// A transaction with its branches.
    pub async fn query(&self, gid: impl AsRef<str>) -> Result<(GlobalTransaction, Vec<Branch>)> {
        let gid = gid.as_ref();

        self.store
            .load(gid)
            .await?
            .ok_or_else(|| TccError::NotFound(gid.to_owned()))
    }

    /// Clears the stalled flag of every branch of `gid` and restarts their
    /// retry window. Returns the number of branches resumed.
    pub async fn resume(&self, gid: impl AsRef<str>) -> Result<usize> {
        let (txn, branches) = self.query(gid).await?;
        let mut resumed = 0;

        for branch in branches.into_iter().filter(|b| b.stalled) {
            let expected = branch.status;
            let branch = Branch {
                stalled: false,
                attempts: 0,
                retry_started_at: None,
                next_attempt_at: None,
                ..branch
            };

            if self.store.update_branch(&branch, expected).await? {
                resumed += 1;
            }
        }

        if resumed > 0 {
            self.store.reschedule(&txn.gid, Utc::now()).await?;
            self.wake();
            info!("resumed {resumed} stalled branch(es) of transaction {}", txn.gid);
        }

        Ok(resumed)
    }

    /// Deletes transactions finished more than `older_than` ago.
    pub async fn purge(&self, older_than: Duration) -> Result<u64> {
        Ok(self.store.purge(Utc::now() - to_chrono(older_than)).await?)
    }

    /// Makes the sweeper of this coordinator run as soon as possible.
    pub fn wake(&self) {
        self.wake.notify_one();
    }
}
