#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transaction `{0}` already exists")]
    DuplicateTransaction(String),

    #[error("branch `{branch_id}` already registered in transaction `{gid}`")]
    DuplicateBranch { gid: String, branch_id: String },

    #[error("transaction `{0}` not found")]
    TransactionNotFound(String),

    #[error("transaction `{0}` no longer accepts branches")]
    TransactionClosed(String),

    #[error("branch `{branch_id}` not found in transaction `{gid}`")]
    BranchNotFound { gid: String, branch_id: String },

    #[error("invalid {field} `{value}`")]
    InvalidValue { field: &'static str, value: String },

    #[cfg(feature = "pg")]
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("std::num `{0}`")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
