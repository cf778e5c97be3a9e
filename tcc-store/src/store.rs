use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::Result,
    transaction::{Branch, BranchStatus, GlobalTransaction, TransactionStatus},
};

#[derive(Clone)]
pub struct Store {
    pub(crate) engine: Box<dyn Engine>,
}

impl Store {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn insert_transaction(&self, txn: GlobalTransaction) -> Result<()> {
        self.engine.insert_transaction(txn).await
    }

    pub async fn get_transaction(&self, gid: impl AsRef<str>) -> Result<Option<GlobalTransaction>> {
        self.engine.get_transaction(gid.as_ref()).await
    }

    /// A transaction together with its branches, if it exists.
    pub async fn load(
        &self,
        gid: impl AsRef<str>,
    ) -> Result<Option<(GlobalTransaction, Vec<Branch>)>> {
        let gid = gid.as_ref();

        let Some(txn) = self.engine.get_transaction(gid).await? else {
            return Ok(None);
        };

        let branches = self.engine.read_branches(gid).await?;

        Ok(Some((txn, branches)))
    }

    pub async fn transition(
        &self,
        gid: impl AsRef<str>,
        from: TransactionStatus,
        to: TransactionStatus,
        reason: Option<String>,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }

        self.engine
            .transition(gid.as_ref(), from, to, reason, next_sweep_at)
            .await
    }

    pub async fn insert_branch(&self, branch: Branch) -> Result<()> {
        self.engine.insert_branch(branch).await
    }

    pub async fn read_branches(&self, gid: impl AsRef<str>) -> Result<Vec<Branch>> {
        self.engine.read_branches(gid.as_ref()).await
    }

    pub async fn update_branch(&self, branch: &Branch, expected: BranchStatus) -> Result<bool> {
        self.engine.update_branch(branch, expected).await
    }

    pub async fn claim(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u16,
    ) -> Result<Vec<GlobalTransaction>> {
        self.engine.claim(owner, now, lease_until, limit).await
    }

    pub async fn release(
        &self,
        gid: impl AsRef<str>,
        owner: Uuid,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<()> {
        self.engine.release(gid.as_ref(), owner, next_sweep_at).await
    }

    pub async fn finish(&self, gid: impl AsRef<str>, owner: Uuid) -> Result<()> {
        self.engine.finish(gid.as_ref(), owner, Utc::now()).await
    }

    pub async fn reschedule(&self, gid: impl AsRef<str>, next_sweep_at: DateTime<Utc>) -> Result<()> {
        self.engine.reschedule(gid.as_ref(), next_sweep_at).await
    }

    pub async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        self.engine.purge(before).await
    }
}
