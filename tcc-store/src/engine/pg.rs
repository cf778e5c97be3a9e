use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::str::FromStr;
use uuid::Uuid;

use crate::{
    engine::Engine,
    error::{Result, StoreError},
    store::Store,
    transaction::{Branch, BranchStatus, GlobalTransaction, TransactionStatus},
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    prefix: Option<String>,
}

impl PgStore {
    pub fn new(pool: &PgPool) -> Store {
        Store::new(Self::engine(pool, None))
    }

    pub fn with_prefix(pool: &PgPool, prefix: impl Into<String>) -> Store {
        Store::new(Self::engine(pool, Some(prefix.into())))
    }

    /// Creates the tables used by a store with the given prefix.
    pub async fn init(pool: &PgPool, prefix: Option<&str>) -> Result<()> {
        let engine = Self::engine(pool, prefix.map(|p| p.to_owned()));
        let table_transaction = engine.table_transaction();
        let table_branch = engine.table_branch();

        let statements = [
            format!(
                r#"
            CREATE TABLE IF NOT EXISTS {table_transaction} (
                gid VARCHAR(128) PRIMARY KEY,
                kind VARCHAR(16) NOT NULL,
                status VARCHAR(16) NOT NULL,
                reason TEXT NULL,
                trace_parent VARCHAR(64) NULL,
                owner UUID NULL,
                lease_until TIMESTAMPTZ NULL,
                next_sweep_at TIMESTAMPTZ NOT NULL,
                decided_at TIMESTAMPTZ NULL,
                finished_at TIMESTAMPTZ NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#
            ),
            format!(
                r#"
            CREATE INDEX IF NOT EXISTS idx_{table_transaction}_sweep
            ON {table_transaction} (next_sweep_at)
            WHERE finished_at IS NULL
            "#
            ),
            format!(
                r#"
            CREATE TABLE IF NOT EXISTS {table_branch} (
                gid VARCHAR(128) NOT NULL REFERENCES {table_transaction} (gid) ON DELETE CASCADE,
                branch_id VARCHAR(64) NOT NULL,
                position INTEGER NOT NULL,
                try_endpoint TEXT NOT NULL,
                confirm_endpoint TEXT NOT NULL,
                cancel_endpoint TEXT NOT NULL,
                payload BYTEA NOT NULL,
                status VARCHAR(16) NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ NULL,
                retry_started_at TIMESTAMPTZ NULL,
                last_error TEXT NULL,
                stalled BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (gid, branch_id)
            )
            "#
            ),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(pool).await?;
        }

        Ok(())
    }

    fn engine(pool: &PgPool, prefix: Option<String>) -> Self {
        Self {
            pool: pool.clone(),
            prefix,
        }
    }

    pub fn table(&self, name: impl Into<String>) -> String {
        format!(
            "{}_{}",
            self.prefix.as_deref().unwrap_or("tcc"),
            name.into()
        )
    }

    pub fn table_transaction(&self) -> String {
        self.table("transaction")
    }

    pub fn table_branch(&self) -> String {
        self.table("branch")
    }

    async fn exists(&self, gid: &str) -> Result<bool> {
        let table_transaction = self.table_transaction();
        let row = sqlx::query_as::<_, (String,)>(
            format!("SELECT gid FROM {table_transaction} WHERE gid = $1").as_str(),
        )
        .bind(gid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }
}

#[async_trait]
impl Engine for PgStore {
    async fn insert_transaction(&self, txn: GlobalTransaction) -> Result<()> {
        let table_transaction = self.table_transaction();

        let res = sqlx::query(
            format!(
                r#"
            INSERT INTO {table_transaction}
                (gid, kind, status, reason, trace_parent, owner, lease_until,
                 next_sweep_at, decided_at, finished_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (gid) DO NOTHING
            "#
            )
            .as_str(),
        )
        .bind(&txn.gid)
        .bind(txn.kind.to_string())
        .bind(txn.status.to_string())
        .bind(&txn.reason)
        .bind(&txn.trace_parent)
        .bind(txn.owner)
        .bind(txn.lease_until)
        .bind(txn.next_sweep_at)
        .bind(txn.decided_at)
        .bind(txn.finished_at)
        .bind(txn.created_at)
        .bind(txn.updated_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::DuplicateTransaction(txn.gid));
        }

        Ok(())
    }

    async fn get_transaction(&self, gid: &'_ str) -> Result<Option<GlobalTransaction>> {
        let table_transaction = self.table_transaction();

        let row = sqlx::query_as::<_, TransactionRow>(
            format!("SELECT * FROM {table_transaction} WHERE gid = $1").as_str(),
        )
        .bind(gid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GlobalTransaction::try_from).transpose()
    }

    async fn transition(
        &self,
        gid: &'_ str,
        from: TransactionStatus,
        to: TransactionStatus,
        reason: Option<String>,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<bool> {
        let table_transaction = self.table_transaction();

        let res = sqlx::query(
            format!(
                r#"
            UPDATE {table_transaction}
            SET status = $3,
                reason = COALESCE($4, reason),
                next_sweep_at = $5,
                decided_at = CASE WHEN $6 THEN $7 ELSE decided_at END,
                updated_at = $7
            WHERE gid = $1 AND status = $2
            "#
            )
            .as_str(),
        )
        .bind(gid)
        .bind(from.to_string())
        .bind(to.to_string())
        .bind(reason)
        .bind(next_sweep_at)
        .bind(to.is_terminal())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }

        if !self.exists(gid).await? {
            return Err(StoreError::TransactionNotFound(gid.to_owned()));
        }

        Ok(false)
    }

    async fn insert_branch(&self, branch: Branch) -> Result<()> {
        let table_transaction = self.table_transaction();
        let table_branch = self.table_branch();

        // the share lock holds off a concurrent transition until this insert commits
        let res = sqlx::query(
            format!(
                r#"
            INSERT INTO {table_branch}
                (gid, branch_id, position, try_endpoint, confirm_endpoint, cancel_endpoint,
                 payload, status, attempts, next_attempt_at, retry_started_at, last_error,
                 stalled, created_at, updated_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            WHERE EXISTS (
                SELECT 1 FROM {table_transaction}
                WHERE gid = $1 AND status = $16 AND finished_at IS NULL
                FOR SHARE
            )
            ON CONFLICT (gid, branch_id) DO NOTHING
            "#
            )
            .as_str(),
        )
        .bind(&branch.gid)
        .bind(&branch.branch_id)
        .bind(branch.position)
        .bind(&branch.try_endpoint)
        .bind(&branch.confirm_endpoint)
        .bind(&branch.cancel_endpoint)
        .bind(&branch.payload)
        .bind(branch.status.to_string())
        .bind(branch.attempts)
        .bind(branch.next_attempt_at)
        .bind(branch.retry_started_at)
        .bind(&branch.last_error)
        .bind(branch.stalled)
        .bind(branch.created_at)
        .bind(branch.updated_at)
        .bind(TransactionStatus::Prepared.to_string())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_transaction(&branch.gid).await? {
            None => Err(StoreError::TransactionNotFound(branch.gid)),
            Some(txn) if txn.status != TransactionStatus::Prepared || txn.is_finished() => {
                Err(StoreError::TransactionClosed(branch.gid))
            }
            Some(_) => Err(StoreError::DuplicateBranch {
                gid: branch.gid,
                branch_id: branch.branch_id,
            }),
        }
    }

    async fn read_branches(&self, gid: &'_ str) -> Result<Vec<Branch>> {
        let table_branch = self.table_branch();

        let rows = sqlx::query_as::<_, BranchRow>(
            format!("SELECT * FROM {table_branch} WHERE gid = $1 ORDER BY position ASC").as_str(),
        )
        .bind(gid)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Branch::try_from).collect()
    }

    async fn update_branch(&self, branch: &'_ Branch, expected: BranchStatus) -> Result<bool> {
        let table_branch = self.table_branch();

        let res = sqlx::query(
            format!(
                r#"
            UPDATE {table_branch}
            SET status = $4,
                attempts = $5,
                next_attempt_at = $6,
                retry_started_at = $7,
                last_error = $8,
                stalled = $9,
                updated_at = $10
            WHERE gid = $1 AND branch_id = $2 AND status = $3
            "#
            )
            .as_str(),
        )
        .bind(&branch.gid)
        .bind(&branch.branch_id)
        .bind(expected.to_string())
        .bind(branch.status.to_string())
        .bind(branch.attempts)
        .bind(branch.next_attempt_at)
        .bind(branch.retry_started_at)
        .bind(&branch.last_error)
        .bind(branch.stalled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 1 {
            return Ok(true);
        }

        let row = sqlx::query_as::<_, (String,)>(
            format!("SELECT branch_id FROM {table_branch} WHERE gid = $1 AND branch_id = $2")
                .as_str(),
        )
        .bind(&branch.gid)
        .bind(&branch.branch_id)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_none() {
            return Err(StoreError::BranchNotFound {
                gid: branch.gid.to_owned(),
                branch_id: branch.branch_id.to_owned(),
            });
        }

        Ok(false)
    }

    async fn claim(
        &self,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u16,
    ) -> Result<Vec<GlobalTransaction>> {
        let table_transaction = self.table_transaction();

        let rows = sqlx::query_as::<_, TransactionRow>(
            format!(
                r#"
            UPDATE {table_transaction}
            SET owner = $1, lease_until = $2
            WHERE gid IN (
                SELECT gid FROM {table_transaction}
                WHERE finished_at IS NULL
                    AND next_sweep_at <= $3
                    AND (lease_until IS NULL OR lease_until < $3)
                ORDER BY next_sweep_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#
            )
            .as_str(),
        )
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .into_iter()
            .map(GlobalTransaction::try_from)
            .collect::<Result<Vec<_>>>()?;

        claimed.sort_by_key(|txn| txn.next_sweep_at);

        Ok(claimed)
    }

    async fn release(
        &self,
        gid: &'_ str,
        owner: Uuid,
        next_sweep_at: DateTime<Utc>,
    ) -> Result<()> {
        let table_transaction = self.table_transaction();

        sqlx::query(
            format!(
                r#"
            UPDATE {table_transaction}
            SET owner = NULL, lease_until = NULL, next_sweep_at = $3
            WHERE gid = $1 AND owner = $2
            "#
            )
            .as_str(),
        )
        .bind(gid)
        .bind(owner)
        .bind(next_sweep_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish(&self, gid: &'_ str, owner: Uuid, finished_at: DateTime<Utc>) -> Result<()> {
        let table_transaction = self.table_transaction();

        sqlx::query(
            format!(
                r#"
            UPDATE {table_transaction}
            SET owner = NULL, lease_until = NULL, finished_at = $3, updated_at = $3
            WHERE gid = $1 AND owner = $2
            "#
            )
            .as_str(),
        )
        .bind(gid)
        .bind(owner)
        .bind(finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reschedule(&self, gid: &'_ str, next_sweep_at: DateTime<Utc>) -> Result<()> {
        let table_transaction = self.table_transaction();

        let res = sqlx::query(
            format!("UPDATE {table_transaction} SET next_sweep_at = $2 WHERE gid = $1").as_str(),
        )
        .bind(gid)
        .bind(next_sweep_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::TransactionNotFound(gid.to_owned()));
        }

        Ok(())
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let table_transaction = self.table_transaction();

        let res = sqlx::query(
            format!(
                "DELETE FROM {table_transaction} WHERE finished_at IS NOT NULL AND finished_at < $1"
            )
            .as_str(),
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    gid: String,
    kind: String,
    status: String,
    reason: Option<String>,
    trace_parent: Option<String>,
    owner: Option<Uuid>,
    lease_until: Option<DateTime<Utc>>,
    next_sweep_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for GlobalTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Self {
            gid: row.gid,
            kind: parse("kind", row.kind)?,
            status: parse("status", row.status)?,
            reason: row.reason,
            trace_parent: row.trace_parent,
            owner: row.owner,
            lease_until: row.lease_until,
            next_sweep_at: row.next_sweep_at,
            decided_at: row.decided_at,
            finished_at: row.finished_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BranchRow {
    gid: String,
    branch_id: String,
    position: i32,
    try_endpoint: String,
    confirm_endpoint: String,
    cancel_endpoint: String,
    payload: Vec<u8>,
    status: String,
    attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    retry_started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    stalled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BranchRow> for Branch {
    type Error = StoreError;

    fn try_from(row: BranchRow) -> Result<Self> {
        Ok(Self {
            gid: row.gid,
            branch_id: row.branch_id,
            position: row.position,
            try_endpoint: row.try_endpoint,
            confirm_endpoint: row.confirm_endpoint,
            cancel_endpoint: row.cancel_endpoint,
            payload: row.payload,
            status: parse("status", row.status)?,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            retry_started_at: row.retry_started_at,
            last_error: row.last_error,
            stalled: row.stalled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse<T: FromStr>(field: &'static str, value: String) -> Result<T> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidValue { field, value })
}
