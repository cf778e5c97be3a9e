use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use uuid::Uuid;

use crate::{
    error::Result,
    transaction::{Branch, BranchStatus, GlobalTransaction, TransactionStatus},
};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "pg")]
mod pg;

#[cfg(feature = "memory")]
pub use memory::*;
#[cfg(feature = "pg")]
pub use pg::*;

#[async_trait]
pub trait Engine: DynClone + Send + Sync {
    async fn insert_transaction(&self, txn: GlobalTransaction) -> Result<()>;

    async fn get_transaction(&self, gid: &'_ str) -> Result<Option<GlobalTransaction>>;

    /// Moves `gid` from `from` to `to` only if it is still in `from`.
    async fn transition(
        &self,
        gid: &'_ str,
        from: TransactionStatus,
        to: TransactionStatus,
        reason: Option<String>,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Fails with [`StoreError::TransactionClosed`](crate::StoreError::TransactionClosed)
    /// unless the transaction is still `prepared` and not finished, checked
    /// atomically with the insert.
    async fn insert_branch(&self, branch: Branch) -> Result<()>;

    /// Branches of `gid` in registration order.
    async fn read_branches(&self, gid: &'_ str) -> Result<Vec<Branch>>;

    /// Writes `branch` only if its stored status is still `expected`.
    async fn update_branch(&self, branch: &'_ Branch, expected: BranchStatus) -> Result<bool>;

    /// Leases up to `limit` due transactions to `owner` until `lease_until`.
    async fn claim(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u16,
    ) -> Result<Vec<GlobalTransaction>>;

    async fn release(
        &self,
        gid: &'_ str,
        owner: Uuid,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn finish(&self, gid: &'_ str, owner: Uuid, finished_at: DateTime<Utc>) -> Result<()>;

    async fn reschedule(&self, gid: &'_ str, next_sweep_at: DateTime<Utc>) -> Result<()>;

    /// Deletes transactions finished before `before`, with their branches.
    async fn purge(&self, before: DateTime<Utc>) -> Result<u64>;
}

dyn_clone::clone_trait_object!(Engine);
