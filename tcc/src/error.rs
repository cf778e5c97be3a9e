use tcc_store::{BranchOp, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TccError {
    #[error("invalid gid `{0}`")]
    InvalidGid(String),

    #[error("invalid endpoint `{0}`")]
    InvalidEndpoint(String),

    #[error("branch `{branch_id}` already registered in transaction `{gid}`")]
    DuplicateBranch { gid: String, branch_id: String },

    #[error("transaction `{0}` already exists")]
    DuplicateTransaction(String),

    #[error("transaction `{0}` not found")]
    NotFound(String),

    #[error("branch `{branch_id}` unreachable: {message}")]
    EndpointUnreachable { branch_id: String, message: String },

    #[error("branch `{branch_id}` rejected: {message}")]
    BranchApplicationError { branch_id: String, message: String },

    #[error("transaction `{0}` already failed, no further branch is tried")]
    AlreadyFailed(String),

    #[error("transaction `{gid}` aborted by caller: {source}")]
    Aborted {
        gid: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("transaction `{0}` was failed by recovery before it was submitted")]
    PrepareTimeout(String),

    #[error("{op} of branch `{branch_id}` in transaction `{gid}` not delivered after {attempts} attempts")]
    RetryBudgetExhausted {
        gid: String,
        branch_id: String,
        op: BranchOp,
        attempts: i32,
    },

    #[error("payload `{0}`")]
    Payload(#[from] serde_json::Error),

    #[error("store `{0}`")]
    Store(#[from] StoreError),
}

impl TccError {
    /// Caller programming errors, raised before any remote call for the branch.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::InvalidGid(_)
                | Self::InvalidEndpoint(_)
                | Self::DuplicateBranch { .. }
                | Self::DuplicateTransaction(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TccError>;
