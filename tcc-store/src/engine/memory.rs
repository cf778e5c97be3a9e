use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    store::Store,
    transaction::{Branch, BranchStatus, GlobalTransaction, TransactionStatus},
};

pub struct MemoryStore;

impl MemoryStore {
    pub fn create() -> Store {
        Store::new(Memory::default())
    }
}

#[derive(Debug, Default)]
struct State {
    transactions: HashMap<String, GlobalTransaction>,
    branches: HashMap<String, Vec<Branch>>,
}

#[derive(Debug, Clone, Default)]
pub struct Memory(Arc<RwLock<State>>);

#[async_trait]
impl Engine for Memory {
    async fn insert_transaction(&self, txn: GlobalTransaction) -> Result<()> {
        let mut state = self.0.write();

        if state.transactions.contains_key(&txn.gid) {
            return Err(StoreError::DuplicateTransaction(txn.gid));
        }

        state.branches.insert(txn.gid.to_owned(), Vec::new());
        state.transactions.insert(txn.gid.to_owned(), txn);

        Ok(())
    }

    async fn get_transaction(&self, gid: &'_ str) -> Result<Option<GlobalTransaction>> {
        Ok(self.0.read().transactions.get(gid).cloned())
    }

    async fn transition(
        &self,
        gid: &'_ str,
        from: TransactionStatus,
        to: TransactionStatus,
        reason: Option<String>,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.0.write();
        let Some(txn) = state.transactions.get_mut(gid) else {
            return Err(StoreError::TransactionNotFound(gid.to_owned()));
        };

        if txn.status != from {
            return Ok(false);
        }

        let now = Utc::now();

        txn.status = to;
        txn.next_sweep_at = next_sweep_at;
        txn.updated_at = now;

        if reason.is_some() {
            txn.reason = reason;
        }

        if to.is_terminal() {
            txn.decided_at = Some(now);
        }

        Ok(true)
    }

    async fn insert_branch(&self, branch: Branch) -> Result<()> {
        let mut state = self.0.write();
        let Some(txn) = state.transactions.get(&branch.gid) else {
            return Err(StoreError::TransactionNotFound(branch.gid));
        };

        if txn.status != TransactionStatus::Prepared || txn.is_finished() {
            return Err(StoreError::TransactionClosed(branch.gid));
        }

        let branches = state.branches.entry(branch.gid.to_owned()).or_default();

        if branches.iter().any(|b| b.branch_id == branch.branch_id) {
            return Err(StoreError::DuplicateBranch {
                gid: branch.gid,
                branch_id: branch.branch_id,
            });
        }

        branches.push(branch);
        branches.sort_by_key(|b| b.position);

        Ok(())
    }

    async fn read_branches(&self, gid: &'_ str) -> Result<Vec<Branch>> {
        Ok(self.0.read().branches.get(gid).cloned().unwrap_or_default())
    }

    async fn update_branch(&self, branch: &'_ Branch, expected: BranchStatus) -> Result<bool> {
        let mut state = self.0.write();
        let Some(stored) = state
            .branches
            .get_mut(&branch.gid)
            .and_then(|branches| branches.iter_mut().find(|b| b.branch_id == branch.branch_id))
        else {
            return Err(StoreError::BranchNotFound {
                gid: branch.gid.to_owned(),
                branch_id: branch.branch_id.to_owned(),
            });
        };

        if stored.status != expected {
            return Ok(false);
        }

        *stored = Branch {
            updated_at: Utc::now(),
            ..branch.clone()
        };

        Ok(true)
    }

    async fn claim(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u16,
    ) -> Result<Vec<GlobalTransaction>> {
        let mut state = self.0.write();

        let mut due = state
            .transactions
            .values_mut()
            .filter(|txn| txn.is_due(now))
            .collect::<Vec<_>>();

        due.sort_by_key(|txn| txn.next_sweep_at);

        let claimed = due
            .into_iter()
            .take(usize::from(limit))
            .map(|txn| {
                txn.owner = Some(owner);
                txn.lease_until = Some(lease_until);
                txn.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn release(
        &self,
        gid: &'_ str,
        owner: Uuid,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.0.write();

        if let Some(txn) = state.transactions.get_mut(gid) {
            if txn.owner == Some(owner) {
                txn.owner = None;
                txn.lease_until = None;
                txn.next_sweep_at = next_sweep_at;
            }
        }

        Ok(())
    }

    async fn finish(&self, gid: &'_ str, owner: Uuid, finished_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.0.write();

        if let Some(txn) = state.transactions.get_mut(gid) {
            if txn.owner == Some(owner) {
                txn.owner = None;
                txn.lease_until = None;
                txn.finished_at = Some(finished_at);
                txn.updated_at = finished_at;
            }
        }

        Ok(())
    }

    async fn reschedule(&self, gid: &'_ str, next_sweep_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.0.write();
        let Some(txn) = state.transactions.get_mut(gid) else {
            return Err(StoreError::TransactionNotFound(gid.to_owned()));
        };

        txn.next_sweep_at = next_sweep_at;

        Ok(())
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.0.write();

        let expired = state
            .transactions
            .values()
            .filter(|txn| txn.finished_at.is_some_and(|at| at < before))
            .map(|txn| txn.gid.to_owned())
            .collect::<Vec<_>>();

        for gid in expired.iter() {
            state.transactions.remove(gid);
            state.branches.remove(gid);
        }

        Ok(u64::try_from(expired.len())?)
    }
}
