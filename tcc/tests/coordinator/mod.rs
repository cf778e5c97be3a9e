use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tcc::{
    Alert, AlertSink, Barrier, BarrierError, Branch, BranchDesc, BranchHandler, BranchOp,
    BranchRequest, BranchStatus, CallError, ConfigBuilder, Coordinator, CoordinatorConfig,
    GlobalTransaction, LocalTransport, RetryPolicy, Store, TccError, TraceContext,
    TransactionStatus,
};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Display, FromStr, Serialize, Deserialize)]
#[display(style = "SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Serialize, Deserialize)]
pub struct Transfer {
    pub amount: i64,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    pub trace_parent: Option<String>,
}

/// Participant behind every `http://bank/{account}/{op}` endpoint.
#[derive(Clone, Default)]
pub struct Bank {
    barrier: Barrier,
    calls: Arc<Mutex<Vec<Call>>>,
    effects: Arc<Mutex<Vec<(String, String, BranchOp)>>>,
    flaky: Arc<Mutex<HashMap<String, usize>>>,
    down: Arc<Mutex<HashSet<String>>>,
    slow: Arc<Mutex<HashMap<String, Duration>>>,
}

impl Bank {
    /// `endpoint` fails `times` calls before answering normally.
    pub fn flaky(&self, endpoint: impl Into<String>, times: usize) {
        self.flaky.lock().insert(endpoint.into(), times);
    }

    pub fn down(&self, endpoint: impl Into<String>) {
        self.down.lock().insert(endpoint.into());
    }

    /// `endpoint` answers only after `delay`.
    pub fn slow(&self, endpoint: impl Into<String>, delay: Duration) {
        self.slow.lock().insert(endpoint.into(), delay);
    }

    pub fn up(&self, endpoint: &str) {
        self.down.lock().remove(endpoint);
    }

    pub fn calls(&self, gid: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.gid == gid)
            .cloned()
            .collect()
    }

    pub fn count(&self, gid: &str, branch_id: &str, op: BranchOp) -> usize {
        self.calls(gid)
            .iter()
            .filter(|c| c.branch_id == branch_id && c.op == op)
            .count()
    }

    pub fn effects(&self, gid: &str) -> Vec<(String, BranchOp)> {
        self.effects
            .lock()
            .iter()
            .filter(|(effect_gid, ..)| effect_gid == gid)
            .map(|(_, branch_id, op)| (branch_id.to_owned(), *op))
            .collect()
    }

    pub fn transport(&self) -> LocalTransport {
        ["out", "in", "fee"]
            .into_iter()
            .flat_map(|account| {
                ["try", "confirm", "cancel"].map(|op| endpoint(account, op))
            })
            .fold(LocalTransport::new(), |transport, endpoint| {
                transport.handler(endpoint, self.clone())
            })
    }
}

#[async_trait]
impl BranchHandler for Bank {
    async fn handle(&self, request: BranchRequest) -> Result<(), CallError> {
        self.calls.lock().push(Call {
            gid: request.gid.to_owned(),
            branch_id: request.branch_id.to_owned(),
            op: request.op,
            trace_parent: request.trace_parent.to_owned(),
        });

        let delay = self.slow.lock().get(&request.endpoint).copied();
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        if let Some(left) = self.flaky.lock().get_mut(&request.endpoint) {
            if *left > 0 {
                *left -= 1;
                return Err(CallError::Unreachable("connection reset".to_owned()));
            }
        }

        if self.down.lock().contains(&request.endpoint) {
            return Err(CallError::Unreachable("connection refused".to_owned()));
        }

        let transfer: Transfer = serde_json::from_slice(&request.payload)
            .map_err(|e| CallError::Rejected(e.to_string()))?;

        let res = self
            .barrier
            .call(&request.gid, &request.branch_id, request.op, || async {
                let outcome: Outcome = transfer.result.parse()?;
                if request.op == BranchOp::Try && outcome == Outcome::Failure {
                    bail!("FAILURE");
                }

                self.effects.lock().push((
                    request.gid.to_owned(),
                    request.branch_id.to_owned(),
                    request.op,
                ));

                Ok(())
            })
            .await;

        match res {
            Ok(_) => Ok(()),
            Err(BarrierError::Busy { .. }) => Err(CallError::Ongoing),
            Err(e) => Err(CallError::Rejected(e.to_string())),
        }
    }
}

#[derive(Clone, Default)]
pub struct Alerts(Arc<Mutex<Vec<Alert>>>);

impl Alerts {
    pub fn raised(&self) -> Vec<Alert> {
        self.0.lock().clone()
    }
}

#[async_trait]
impl AlertSink for Alerts {
    async fn raise(&self, alert: Alert) {
        self.0.lock().push(alert);
    }
}

pub fn endpoint(account: &str, op: &str) -> String {
    format!("http://bank/{account}/{op}")
}

pub fn desc(account: &str, result: Outcome) -> BranchDesc {
    BranchDesc::new(
        endpoint(account, "try"),
        endpoint(account, "confirm"),
        endpoint(account, "cancel"),
    )
    .json(&Transfer {
        amount: 30,
        result: result.to_string(),
    })
    .unwrap()
}

fn config() -> ConfigBuilder {
    ConfigBuilder::new()
        .call_timeout(Duration::from_millis(500))
        .sweep_interval(Duration::from_millis(50))
        .retry(RetryPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed: Duration::from_secs(10),
        })
}

fn coordinator(store: &Store, bank: &Bank, config: CoordinatorConfig) -> Coordinator {
    Coordinator::new(store.clone(), bank.transport()).config(config)
}

async fn wait_finished(
    coordinator: &Coordinator,
    gid: &str,
) -> Result<(GlobalTransaction, Vec<Branch>)> {
    for _ in 0..100 {
        let (txn, branches) = coordinator.query(gid).await?;
        if txn.is_finished() {
            return Ok((txn, branches));
        }

        sleep(Duration::from_millis(50)).await;
    }

    Err(anyhow!("transaction {gid} not finished"))
}

fn statuses(branches: &[Branch]) -> Vec<BranchStatus> {
    branches.iter().map(|b| b.status).collect()
}

fn assert_exclusive(bank: &Bank, gid: &str) {
    let effects = bank.effects(gid);

    for (branch_id, _) in effects.iter() {
        let confirmed = effects.contains(&(branch_id.to_owned(), BranchOp::Confirm));
        let cancelled = effects.contains(&(branch_id.to_owned(), BranchOp::Cancel));
        assert!(!(confirmed && cancelled), "branch {branch_id} confirmed and cancelled");
    }
}

pub async fn test_succeeded(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    coordinator
        .tcc(&gid, |tcc| async move {
            tcc.call(desc("out", Outcome::Success)).await?;
            tcc.call(desc("in", Outcome::Success)).await?;

            Ok(())
        })
        .await?;

    let (txn, branches) = coordinator.query(&gid).await?;
    assert_eq!(txn.status, TransactionStatus::Succeeded);
    assert!(txn.decided_at.is_some());
    assert_eq!(
        branches.iter().map(|b| b.branch_id.as_str()).collect::<Vec<_>>(),
        vec!["01", "02"]
    );

    let (_, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::ConfirmOk, BranchStatus::ConfirmOk]
    );
    assert_eq!(bank.count(&gid, "01", BranchOp::Cancel), 0);
    assert_eq!(bank.count(&gid, "02", BranchOp::Cancel), 0);
    assert_exclusive(&bank, &gid);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_rejected_try(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    let err = coordinator
        .submit(
            &gid,
            vec![
                desc("out", Outcome::Success),
                desc("in", Outcome::Failure),
                desc("fee", Outcome::Success),
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TccError::BranchApplicationError { ref branch_id, .. } if branch_id == "02"
    ));

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert!(txn.reason.is_some());
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::CancelOk, BranchStatus::CancelOk]
    );

    assert_eq!(bank.count(&gid, "01", BranchOp::Confirm), 0);
    assert_eq!(bank.count(&gid, "02", BranchOp::Confirm), 0);
    assert_eq!(bank.count(&gid, "03", BranchOp::Try), 0);
    assert_eq!(
        bank.effects(&gid),
        vec![
            ("01".to_owned(), BranchOp::Try),
            ("01".to_owned(), BranchOp::Cancel)
        ]
    );
    assert_exclusive(&bank, &gid);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_short_circuit(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(store, &bank, config().build());
    let gid = tcc::gid();

    let err = coordinator
        .tcc(&gid, |tcc| async move {
            tcc.call(desc("out", Outcome::Success)).await?;

            let failed = tcc.call(desc("in", Outcome::Failure)).await;
            assert!(matches!(failed, Err(TccError::BranchApplicationError { .. })));

            let skipped = tcc.call(desc("fee", Outcome::Success)).await;
            assert!(matches!(skipped, Err(TccError::AlreadyFailed(_))));

            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TccError::BranchApplicationError { .. }));
    assert_eq!(bank.calls(&gid).len(), 2);

    let (txn, branches) = coordinator.query(&gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::TryOk, BranchStatus::TryFailed]
    );

    Ok(())
}

pub async fn test_unreachable_try(store: &Store) -> Result<()> {
    let bank = Bank::default();
    bank.down(endpoint("in", "try"));

    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    let err = coordinator
        .submit(
            &gid,
            vec![desc("out", Outcome::Success), desc("in", Outcome::Success)],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TccError::EndpointUnreachable { ref branch_id, .. } if branch_id == "02"
    ));

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::CancelOk, BranchStatus::CancelOk]
    );
    assert_eq!(bank.count(&gid, "02", BranchOp::Cancel), 1);
    assert_exclusive(&bank, &gid);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_caller_abort(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    let err = coordinator
        .tcc(&gid, |tcc| async move {
            tcc.call(desc("out", Outcome::Success)).await?;
            bail!("insufficient funds")
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TccError::Aborted { .. }));

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(txn.reason.as_deref(), Some("insufficient funds"));
    assert_eq!(statuses(&branches), vec![BranchStatus::CancelOk]);
    assert_eq!(bank.count(&gid, "01", BranchOp::Confirm), 0);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_usage_errors(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();

    let gid = tcc::gid();
    let err = coordinator
        .submit(
            &gid,
            vec![
                desc("out", Outcome::Success),
                BranchDesc::new("bank out try", endpoint("out", "confirm"), endpoint("out", "cancel")),
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TccError::InvalidEndpoint(ref e) if e == "bank out try"));
    assert!(matches!(coordinator.query(&gid).await, Err(TccError::NotFound(_))));
    assert!(bank.calls(&gid).is_empty());

    let gid = tcc::gid();
    let err = coordinator
        .submit(
            &gid,
            vec![
                desc("out", Outcome::Success).id("transfer"),
                desc("in", Outcome::Success).id("transfer"),
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TccError::DuplicateBranch { ref branch_id, .. } if branch_id == "transfer"));
    assert!(matches!(coordinator.query(&gid).await, Err(TccError::NotFound(_))));

    let gid = tcc::gid();
    let err = coordinator
        .tcc(&gid, |tcc| async move {
            tcc.call(desc("out", Outcome::Success).id("transfer")).await?;
            tcc.call(desc("in", Outcome::Success).id("transfer")).await?;

            Ok(())
        })
        .await
        .unwrap_err();

    assert!(err.is_usage());

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(statuses(&branches), vec![BranchStatus::CancelOk]);

    let err = coordinator
        .tcc(&gid, |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, TccError::DuplicateTransaction(_)));

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_confirm_retry(store: &Store) -> Result<()> {
    let bank = Bank::default();
    bank.flaky(endpoint("in", "confirm"), 3);

    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    coordinator
        .submit(
            &gid,
            vec![desc("out", Outcome::Success), desc("in", Outcome::Success)],
        )
        .await?;

    let (_, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::ConfirmOk, BranchStatus::ConfirmOk]
    );
    assert_eq!(branches[1].attempts, 4);
    assert_eq!(branches[1].last_error, None);
    assert_eq!(bank.count(&gid, "02", BranchOp::Confirm), 4);
    assert_eq!(
        bank.effects(&gid)
            .iter()
            .filter(|(_, op)| *op == BranchOp::Confirm)
            .count(),
        2
    );
    assert_exclusive(&bank, &gid);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_retry_exhausted(store: &Store) -> Result<()> {
    let bank = Bank::default();
    bank.down(endpoint("in", "confirm"));

    let alerts = Alerts::default();
    let mut retry = config().build().retry;
    retry.max_elapsed = Duration::ZERO;

    let coordinator = coordinator(store, &bank, config().retry(retry).build()).alerts(alerts.clone());
    let gid = tcc::gid();

    coordinator
        .submit(
            &gid,
            vec![desc("out", Outcome::Success), desc("in", Outcome::Success)],
        )
        .await?;

    assert_eq!(coordinator.sweep().await?, 1);

    let (txn, branches) = coordinator.query(&gid).await?;
    assert!(!txn.is_finished());
    assert_eq!(branches[0].status, BranchStatus::ConfirmOk);
    assert_eq!(branches[1].status, BranchStatus::TryOk);
    assert!(branches[1].stalled);

    let raised = alerts.raised();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].branch_id, "02");
    assert_eq!(raised[0].op, BranchOp::Confirm);
    assert!(matches!(
        raised[0].error(),
        TccError::RetryBudgetExhausted { attempts: 1, .. }
    ));

    // stalled branches are left alone until resumed
    assert_eq!(coordinator.sweep().await?, 0);
    assert_eq!(bank.count(&gid, "02", BranchOp::Confirm), 1);

    bank.up(&endpoint("in", "confirm"));
    assert_eq!(coordinator.resume(&gid).await?, 1);
    assert_eq!(coordinator.sweep().await?, 1);

    let (txn, branches) = coordinator.query(&gid).await?;
    assert!(txn.is_finished());
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::ConfirmOk, BranchStatus::ConfirmOk]
    );
    assert!(!branches[1].stalled);

    Ok(())
}

pub async fn test_recover_decided(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let crashed = coordinator(store, &bank, config().build());
    let gid = tcc::gid();

    // decided but never driven: no sweeper was running
    crashed
        .submit(
            &gid,
            vec![desc("out", Outcome::Success), desc("in", Outcome::Success)],
        )
        .await?;

    assert!(bank
        .calls(&gid)
        .iter()
        .all(|c| c.op == BranchOp::Try));

    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Succeeded);
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::ConfirmOk, BranchStatus::ConfirmOk]
    );

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_recover_submitted(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let crashed = coordinator(store, &bank, config().build());
    let gid = tcc::gid();

    let interrupted = tokio::time::timeout(
        Duration::from_millis(200),
        crashed.tcc(&gid, |tcc| async move {
            tcc.call(desc("out", Outcome::Success)).await?;
            tcc.call(desc("in", Outcome::Success)).await?;
            futures_util::future::pending::<()>().await;

            Ok(())
        }),
    )
    .await;
    assert!(interrupted.is_err());

    // the caller returned without error right before the crash
    assert!(
        store
            .transition(
                &gid,
                TransactionStatus::Prepared,
                TransactionStatus::Submitted,
                None,
                chrono::Utc::now(),
            )
            .await?
    );

    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Succeeded);
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::ConfirmOk, BranchStatus::ConfirmOk]
    );
    assert_exclusive(&bank, &gid);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_prepare_timeout(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(
        store,
        &bank,
        config().prepare_timeout(Duration::from_millis(200)).build(),
    );
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    let err = coordinator
        .tcc(&gid, |tcc| async move {
            tcc.call(desc("out", Outcome::Success)).await?;
            sleep(Duration::from_millis(800)).await;

            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TccError::PrepareTimeout(_)));

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(statuses(&branches), vec![BranchStatus::CancelOk]);
    assert_eq!(bank.count(&gid, "01", BranchOp::Confirm), 0);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_try_timeout(store: &Store) -> Result<()> {
    let bank = Bank::default();
    bank.slow(endpoint("in", "try"), Duration::from_millis(400));

    let coordinator = coordinator(
        store,
        &bank,
        config().call_timeout(Duration::from_millis(100)).build(),
    );
    let gid = tcc::gid();

    let err = coordinator
        .submit(
            &gid,
            vec![
                desc("out", Outcome::Success),
                desc("in", Outcome::Success),
                desc("fee", Outcome::Success),
            ],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TccError::EndpointUnreachable { ref branch_id, .. } if branch_id == "02"
    ));

    let (txn, branches) = coordinator.query(&gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::TryOk, BranchStatus::TryFailed]
    );
    assert!(branches[1]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("timed out")));
    assert_eq!(bank.count(&gid, "03", BranchOp::Try), 0);

    let sweeper = coordinator.start();

    let (_, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::CancelOk, BranchStatus::CancelOk]
    );
    assert_eq!(bank.count(&gid, "02", BranchOp::Cancel), 1);
    assert_eq!(bank.count(&gid, "01", BranchOp::Confirm), 0);
    assert_eq!(bank.count(&gid, "02", BranchOp::Confirm), 0);
    assert_exclusive(&bank, &gid);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_recover_try_pending(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let gid = tcc::gid();
    let payload = serde_json::to_vec(&Transfer {
        amount: 30,
        result: Outcome::Success.to_string(),
    })?;

    // the caller crashed after the Try of "in" reached the bank but before
    // its outcome was recorded
    store
        .insert_transaction(GlobalTransaction::new(&gid, chrono::Utc::now()))
        .await?;

    for (position, account) in [(1, "out"), (2, "in")] {
        let branch = Branch::new(
            &gid,
            format!("{position:02}"),
            position,
            ["try", "confirm", "cancel"].map(|op| endpoint(account, op)),
            payload.clone(),
        );
        store.insert_branch(branch.clone()).await?;
        bank.handle(BranchRequest::new(&branch, BranchOp::Try, None))
            .await?;

        if account == "out" {
            let tried = Branch {
                status: BranchStatus::TryOk,
                ..branch
            };
            assert!(store.update_branch(&tried, BranchStatus::TryPending).await?);
        }
    }

    let coordinator = coordinator(
        store,
        &bank,
        config().prepare_timeout(Duration::from_millis(200)).build(),
    );
    let sweeper = coordinator.start();

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert!(txn.reason.is_some_and(|r| r.contains("before it was submitted")));
    assert_eq!(
        statuses(&branches),
        vec![BranchStatus::CancelOk, BranchStatus::CancelOk]
    );
    // both reservations are compensated, including the unrecorded one
    let effects = bank.effects(&gid);
    assert_eq!(effects.len(), 4);
    assert!(effects.contains(&("01".to_owned(), BranchOp::Cancel)));
    assert!(effects.contains(&("02".to_owned(), BranchOp::Cancel)));
    assert_eq!(bank.count(&gid, "02", BranchOp::Confirm), 0);
    assert_exclusive(&bank, &gid);

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_late_branch(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(
        store,
        &bank,
        config().prepare_timeout(Duration::from_millis(200)).build(),
    );
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    let err = coordinator
        .tcc(&gid, |tcc| async move {
            tcc.call(desc("out", Outcome::Success)).await?;
            sleep(Duration::from_millis(800)).await;

            let late = tcc.call(desc("in", Outcome::Success)).await;
            assert!(matches!(late, Err(TccError::PrepareTimeout(_))));

            let after = tcc.call(desc("fee", Outcome::Success)).await;
            assert!(matches!(after, Err(TccError::AlreadyFailed(_))));

            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TccError::PrepareTimeout(_)));

    let (txn, branches) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(statuses(&branches), vec![BranchStatus::CancelOk]);
    assert_eq!(bank.count(&gid, "02", BranchOp::Try), 0);
    assert_eq!(bank.count(&gid, "03", BranchOp::Try), 0);
    assert_eq!(
        bank.effects(&gid),
        vec![
            ("01".to_owned(), BranchOp::Try),
            ("01".to_owned(), BranchOp::Cancel)
        ]
    );

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_shared_store(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let first = coordinator(store, &bank, config().build());
    let second = coordinator(store, &bank, config().build());
    let sweepers = vec![first.start(), second.start()];

    let mut gids = Vec::new();
    for i in 0..10 {
        let gid = tcc::gid();
        let caller = if i % 2 == 0 { &first } else { &second };

        caller
            .submit(
                &gid,
                vec![desc("out", Outcome::Success), desc("in", Outcome::Success)],
            )
            .await?;

        gids.push(gid);
    }

    for gid in gids.iter() {
        let (_, branches) = wait_finished(&first, gid).await?;
        assert_eq!(
            statuses(&branches),
            vec![BranchStatus::ConfirmOk, BranchStatus::ConfirmOk]
        );
        assert_eq!(bank.count(gid, "01", BranchOp::Confirm), 1);
        assert_eq!(bank.count(gid, "02", BranchOp::Confirm), 1);
    }

    for sweeper in sweepers {
        sweeper.shutdown().await;
    }

    Ok(())
}

pub async fn test_trace_propagation(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();
    let gid = tcc::gid();
    let trace = TraceContext::new();

    coordinator
        .tcc_traced(&gid, trace.clone(), |tcc| async move {
            tcc.call(desc("out", Outcome::Success)).await?;

            Ok(())
        })
        .await?;

    let (txn, _) = wait_finished(&coordinator, &gid).await?;
    assert_eq!(txn.trace_parent, Some(trace.to_traceparent()));

    let calls = bank.calls(&gid);
    assert_eq!(calls.len(), 2);

    for call in calls {
        let parent = call
            .trace_parent
            .as_deref()
            .and_then(TraceContext::from_traceparent)
            .unwrap();

        assert_eq!(parent.trace_id, trace.trace_id);
        assert_ne!(parent.span_id, trace.span_id);
    }

    sweeper.shutdown().await;

    Ok(())
}

pub async fn test_purge(store: &Store) -> Result<()> {
    let bank = Bank::default();
    let coordinator = coordinator(store, &bank, config().build());
    let sweeper = coordinator.start();
    let gid = tcc::gid();

    coordinator
        .submit(&gid, vec![desc("out", Outcome::Success)])
        .await?;
    wait_finished(&coordinator, &gid).await?;

    assert_eq!(coordinator.purge(Duration::from_secs(3600)).await?, 0);
    sleep(Duration::from_millis(20)).await;
    assert!(coordinator.purge(Duration::ZERO).await? >= 1);
    assert!(matches!(coordinator.query(&gid).await, Err(TccError::NotFound(_))));

    sweeper.shutdown().await;

    Ok(())
}
