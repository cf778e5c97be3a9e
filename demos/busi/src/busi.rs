//! Sample bank service exposing TCC branches for transfers between users.

use axum::{extract::State, routing::post, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tcc::{Barrier, BranchOp};
use tcc_axum::{BranchCall, BranchResponse};
use tokio::net::TcpListener;

pub const TRANS_OUT_UID: u32 = 1;
pub const TRANS_IN_UID: u32 = 2;
pub const INITIAL_BALANCE: i64 = 10000;

/// Longer than the coordinator's default retry window.
pub const BARRIER_RETENTION: Duration = Duration::from_secs(48 * 3600);

const BARRIER_PURGE_INTERVAL: Duration = Duration::from_secs(600);

/// Body of every branch call.
///
/// `trans_out_result` and `trans_in_result` force the answer of the matching
/// Try: `FAILURE` rejects it, `ONGOING` asks to be called again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReqHttp {
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trans_out_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trans_in_result: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub balance: i64,
    /// Amount reserved by Try and not yet confirmed or cancelled.
    pub trading: i64,
}

#[derive(Clone)]
pub struct Busi {
    accounts: Arc<Mutex<HashMap<u32, Balance>>>,
    barrier: Barrier,
}

impl Busi {
    pub fn new() -> Self {
        let busi = Self {
            accounts: Arc::default(),
            barrier: Barrier::new(),
        };

        busi.reset();
        busi
    }

    pub fn reset(&self) {
        let mut accounts = self.accounts.lock();
        accounts.clear();

        for uid in [TRANS_OUT_UID, TRANS_IN_UID] {
            accounts.insert(
                uid,
                Balance {
                    balance: INITIAL_BALANCE,
                    trading: 0,
                },
            );
        }
    }

    pub fn balance(&self, uid: u32) -> Balance {
        self.accounts.lock().get(&uid).copied().unwrap_or_default()
    }

    /// Drops barrier entries of branches idle for at least `older_than`.
    pub fn purge_barrier(&self, older_than: Duration) -> usize {
        self.barrier.purge(older_than)
    }

    fn adjust_trading(&self, uid: u32, amount: i64) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock();
        let account = accounts.entry(uid).or_default();

        if account.balance + account.trading + amount < 0 {
            anyhow::bail!("insufficient balance for user {uid}");
        }

        account.trading += amount;

        Ok(())
    }

    fn adjust_balance(&self, uid: u32, amount: i64) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock();
        let account = accounts.entry(uid).or_default();

        account.trading -= amount;
        account.balance += amount;

        Ok(())
    }

    async fn handle(
        &self,
        call: BranchCall<ReqHttp>,
        uid: u32,
        amount: i64,
        result: Option<&str>,
    ) -> BranchResponse {
        tracing::info!(
            "gid='{}' branch_id='{}' op='{}' uid={uid} amount={amount}",
            call.gid,
            call.branch_id,
            call.op
        );

        if call.op == BranchOp::Try {
            match result {
                Some("FAILURE") => return BranchResponse::Failure("FAILURE".to_owned()),
                Some("ONGOING") => return BranchResponse::Ongoing,
                _ => {}
            }
        }

        self.barrier
            .call(&call.gid, &call.branch_id, call.op, || async {
                match call.op {
                    BranchOp::Try => self.adjust_trading(uid, amount),
                    BranchOp::Confirm => self.adjust_balance(uid, amount),
                    BranchOp::Cancel => self.adjust_trading(uid, -amount),
                }
            })
            .await
            .into()
    }
}

impl Default for Busi {
    fn default() -> Self {
        Self::new()
    }
}

async fn trans_out(State(busi): State<Busi>, call: BranchCall<ReqHttp>) -> BranchResponse {
    let amount = -call.payload.amount;
    let result = call.payload.trans_out_result.clone();

    busi.handle(call, TRANS_OUT_UID, amount, result.as_deref())
        .await
}

async fn trans_in(State(busi): State<Busi>, call: BranchCall<ReqHttp>) -> BranchResponse {
    let amount = call.payload.amount;
    let result = call.payload.trans_in_result.clone();

    busi.handle(call, TRANS_IN_UID, amount, result.as_deref())
        .await
}

pub fn router(busi: Busi) -> Router {
    Router::new()
        .route("/api/busi/trans-out/try", post(trans_out))
        .route("/api/busi/trans-out/confirm", post(trans_out))
        .route("/api/busi/trans-out/revert", post(trans_out))
        .route("/api/busi/trans-in/try", post(trans_in))
        .route("/api/busi/trans-in/confirm", post(trans_in))
        .route("/api/busi/trans-in/revert", post(trans_in))
        .with_state(busi)
}

/// Serves the bank in the background, returns the bound address.
pub async fn serve(busi: Busi, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    let barrier = busi.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(BARRIER_PURGE_INTERVAL);

        loop {
            interval.tick().await;

            let purged = barrier.purge_barrier(BARRIER_RETENTION);
            if purged > 0 {
                tracing::debug!("purged {purged} barrier entries");
            }
        }
    });

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(busi)).await {
            tracing::error!("busi server '{err}'");
        }
    });

    tracing::info!("busi listening on {addr}");

    Ok(addr)
}
