use chrono::Utc;
use futures_util::{future::join_all, stream, StreamExt};
use tcc_store::{Branch, BranchOp, GlobalTransaction, TransactionStatus};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    alert::Alert,
    config::to_chrono,
    coordinator::Coordinator,
    error::{Result, TccError},
    state,
    trace::{sweep_span, TraceContext},
    transport::BranchRequest,
};

/// Running recovery sweeper of one coordinator.
pub struct SweepHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweepHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops the sweeper once its current pass has released its leases.
    pub async fn shutdown(self) {
        self.token.cancel();

        if let Err(err) = self.handle.await {
            tracing::error!("sweeper stopped abnormally '{err}'");
        }
    }
}

impl Coordinator {
    /// Spawns the recovery sweeper on the current tokio runtime.
    pub fn start(&self) -> SweepHandle {
        let token = CancellationToken::new();
        let coordinator = self.clone();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            tracing::info!("coordinator='{}' sweeper started", coordinator.id);

            let mut interval = interval_at(Instant::now(), coordinator.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = coordinator.wake.notified() => {}
                }

                if let Err(err) = coordinator.sweep().await {
                    tracing::error!("coordinator='{}' sweep '{err}'", coordinator.id);
                }
            }

            tracing::info!("coordinator='{}' sweeper stopped", coordinator.id);
        });

        SweepHandle { token, handle }
    }

    /// One recovery pass: claims due transactions and drives each of them as
    /// far as possible. Returns the number of transactions claimed.
    pub async fn sweep(&self) -> Result<usize> {
        let span = sweep_span(&self.id);

        async {
            let now = Utc::now();
            let claimed = self
                .store
                .claim(
                    self.id,
                    now,
                    now + to_chrono(self.config.lease),
                    self.config.batch_size,
                )
                .await?;

            let count = claimed.len();
            if count > 0 {
                tracing::debug!("claimed {count} transaction(s)");
            }

            stream::iter(claimed)
                .for_each_concurrent(self.config.workers, |txn| async move {
                    let gid = txn.gid.to_owned();

                    if let Err(err) = self.drive(txn).await {
                        tracing::error!("gid='{gid}' drive '{err}'");

                        let retry_at = Utc::now() + to_chrono(self.config.sweep_interval);
                        if let Err(err) = self.store.release(&gid, self.id, retry_at).await {
                            tracing::error!("gid='{gid}' release '{err}'");
                        }
                    }
                })
                .await;

            if let Some(retention) = self.config.retention {
                let purged = self.purge(retention).await?;
                if purged > 0 {
                    tracing::info!("purged {purged} finished transaction(s)");
                }
            }

            Ok(count)
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, txn: GlobalTransaction) -> Result<()> {
        let now = Utc::now();
        let gid = txn.gid.to_owned();

        match txn.status {
            TransactionStatus::Prepared => {
                let deadline = txn.created_at + to_chrono(self.config.prepare_timeout);
                if now < deadline {
                    self.store.release(&gid, self.id, deadline).await?;
                    return Ok(());
                }

                tracing::warn!("gid='{gid}' still prepared after the prepare timeout, failing it");
                self.store
                    .transition(
                        &gid,
                        TransactionStatus::Prepared,
                        TransactionStatus::Failed,
                        Some(TccError::PrepareTimeout(gid.to_owned()).to_string()),
                        now,
                    )
                    .await?;
            }
            TransactionStatus::Submitted => {
                let branches = self.store.read_branches(&gid).await?;
                let status = state::decide(txn.reason.as_deref(), &branches);

                if self
                    .store
                    .transition(&gid, TransactionStatus::Submitted, status, None, now)
                    .await?
                {
                    tracing::info!("gid='{gid}' recovered as {status}");
                }
            }
            _ => {}
        }

        // the caller may have moved the transaction concurrently
        let txn = self
            .store
            .get_transaction(&gid)
            .await?
            .ok_or_else(|| TccError::NotFound(gid.to_owned()))?;

        let Some(op) = txn.status.second_phase() else {
            let retry_at = now + to_chrono(self.config.sweep_interval);
            self.store.release(&gid, self.id, retry_at).await?;
            return Ok(());
        };

        let trace = txn
            .trace_parent
            .as_deref()
            .and_then(TraceContext::from_traceparent)
            .unwrap_or_default();

        let due = self
            .store
            .read_branches(&gid)
            .await?
            .into_iter()
            .filter(|b| b.is_due(op, now))
            .collect::<Vec<_>>();

        let results = join_all(due.into_iter().map(|b| self.deliver(b, op, &trace))).await;
        for err in results.into_iter().filter_map(|res| res.err()) {
            tracing::error!("gid='{gid}' {op} '{err}'");
        }

        let branches = self.store.read_branches(&gid).await?;
        let pending = branches
            .iter()
            .filter(|b| b.status.awaits(op))
            .collect::<Vec<_>>();

        if pending.is_empty() {
            self.store.finish(&gid, self.id).await?;
            tracing::info!("gid='{gid}' finished, {op} acknowledged by every branch");
            return Ok(());
        }

        let now = Utc::now();
        let next_sweep_at = pending
            .iter()
            .filter(|b| !b.stalled)
            .map(|b| b.next_attempt_at.unwrap_or(now))
            .min()
            .unwrap_or_else(|| now + to_chrono(self.config.stalled_recheck));

        self.store.release(&gid, self.id, next_sweep_at).await?;

        Ok(())
    }

    /// One Confirm/Cancel attempt. The attempt is persisted before the call,
    /// its outcome after.
    async fn deliver(&self, mut branch: Branch, op: BranchOp, trace: &TraceContext) -> Result<()> {
        let now = Utc::now();
        let pending = branch.status;
        let started_at = *branch.retry_started_at.get_or_insert(now);
        let failed_attempts = u32::try_from(branch.attempts).unwrap_or_default();

        branch.attempts += 1;
        branch.next_attempt_at = Some(now + to_chrono(self.config.retry.delay(failed_attempts)));

        if !self.store.update_branch(&branch, pending).await? {
            tracing::debug!(
                "gid='{}' branch_id='{}' changed before {op}",
                branch.gid,
                branch.branch_id
            );
            return Ok(());
        }

        let request = BranchRequest::new(&branch, op, Some(trace.child().to_traceparent()));

        match self.caller.call(request).await {
            Ok(()) => {
                branch.status = op.success_status();
                branch.next_attempt_at = None;
                branch.last_error = None;

                self.store.update_branch(&branch, pending).await?;

                tracing::info!(
                    "gid='{}' branch_id='{}' {op} acknowledged after {} attempt(s)",
                    branch.gid,
                    branch.branch_id,
                    branch.attempts
                );
            }
            Err(err) => {
                branch.last_error = Some(err.to_string());

                if self.config.retry.exhausted(started_at, Utc::now()) {
                    branch.stalled = true;
                    branch.next_attempt_at = None;
                }

                self.store.update_branch(&branch, pending).await?;

                if branch.stalled {
                    self.alerts
                        .raise(Alert {
                            gid: branch.gid.to_owned(),
                            branch_id: branch.branch_id.to_owned(),
                            op,
                            attempts: branch.attempts,
                            last_error: branch.last_error.to_owned(),
                            raised_at: Utc::now(),
                        })
                        .await;
                } else if err.is_rejected() {
                    tracing::error!(
                        "gid='{}' branch_id='{}' {op} rejected, retrying '{err}'",
                        branch.gid,
                        branch.branch_id
                    );
                } else {
                    tracing::warn!(
                        "gid='{}' branch_id='{}' {op} failed, retrying '{err}'",
                        branch.gid,
                        branch.branch_id
                    );
                }
            }
        }

        Ok(())
    }
}
