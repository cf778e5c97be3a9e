//! Participant-side guard for branch handlers.
//!
//! A coordinator may deliver the same operation more than once, may send
//! Cancel for a branch whose Try never reached the participant, and a delayed
//! Try may arrive after its Cancel. [`Barrier`] turns these cases into no-ops:
//!
//! - a repeated Try, Confirm or Cancel is answered without running the handler
//! - a Cancel without a prior successful Try is recorded and answered as done
//! - a Try arriving after its Cancel is rejected
//!
//! Entries are kept until [`Barrier::purge`] drops them. The retention must
//! outlast the coordinator's retry window, otherwise a late redelivery runs
//! its handler again.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tcc_store::BranchOp;

#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("try of branch `{branch_id}` in transaction `{gid}` arrived after its cancel")]
    Rejected { gid: String, branch_id: String },

    #[error("{op} of branch `{branch_id}` in transaction `{gid}` is already running")]
    Busy {
        gid: String,
        branch_id: String,
        op: BranchOp,
    },

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

#[derive(Debug, Default)]
struct Entry {
    tried: bool,
    confirmed: bool,
    cancelled: bool,
    running: bool,
    touched: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct Barrier(Arc<Mutex<HashMap<(String, String), Entry>>>);

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `handler` unless the operation already happened for this branch.
    ///
    /// Returns `Ok(None)` when the handler was skipped.
    pub async fn call<T, F, Fut>(
        &self,
        gid: &str,
        branch_id: &str,
        op: BranchOp,
        handler: F,
    ) -> Result<Option<T>, BarrierError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = (gid.to_owned(), branch_id.to_owned());

        {
            let mut entries = self.0.lock();
            let entry = entries.entry(key.clone()).or_default();

            if entry.running {
                return Err(BarrierError::Busy {
                    gid: gid.to_owned(),
                    branch_id: branch_id.to_owned(),
                    op,
                });
            }

            match op {
                BranchOp::Try if entry.cancelled => {
                    return Err(BarrierError::Rejected {
                        gid: gid.to_owned(),
                        branch_id: branch_id.to_owned(),
                    })
                }
                BranchOp::Try if entry.tried => return Ok(None),
                BranchOp::Confirm if entry.confirmed => return Ok(None),
                BranchOp::Cancel if entry.cancelled => return Ok(None),
                BranchOp::Cancel if !entry.tried => {
                    entry.cancelled = true;
                    entry.touched = Some(Instant::now());
                    tracing::debug!("gid='{gid}' branch_id='{branch_id}' null compensation");
                    return Ok(None);
                }
                _ => {}
            }

            entry.running = true;
        }

        let res = handler().await;

        let mut entries = self.0.lock();
        let entry = entries.entry(key).or_default();
        entry.running = false;
        entry.touched = Some(Instant::now());

        let value = res?;

        match op {
            BranchOp::Try => entry.tried = true,
            BranchOp::Confirm => entry.confirmed = true,
            BranchOp::Cancel => entry.cancelled = true,
        }

        Ok(Some(value))
    }

    /// Drops branches idle for at least `older_than`. Returns how many.
    pub fn purge(&self, older_than: Duration) -> usize {
        let mut entries = self.0.lock();
        let before = entries.len();

        entries.retain(|_, entry| {
            entry.running || entry.touched.is_some_and(|at| at.elapsed() < older_than)
        });

        before - entries.len()
    }
}
