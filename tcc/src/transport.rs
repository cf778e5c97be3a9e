use async_trait::async_trait;
use dyn_clone::DynClone;
use std::time::Duration;
use tcc_store::{Branch, BranchOp};

/// One remote call to a branch endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchRequest {
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    pub endpoint: String,
    pub payload: Vec<u8>,
    pub trace_parent: Option<String>,
}

impl BranchRequest {
    pub fn new(branch: &Branch, op: BranchOp, trace_parent: Option<String>) -> Self {
        Self {
            gid: branch.gid.to_owned(),
            branch_id: branch.branch_id.to_owned(),
            op,
            endpoint: branch.endpoint(op).to_owned(),
            payload: branch.payload.clone(),
            trace_parent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// Transport failure or an unexpected answer; the call may be retried.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The participant explicitly refused the operation.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The participant has not finished and asks to be called again later.
    #[error("ongoing")]
    Ongoing,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl CallError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

#[async_trait]
pub trait Transport: DynClone + Send + Sync {
    async fn call(&self, request: BranchRequest) -> Result<(), CallError>;
}

dyn_clone::clone_trait_object!(Transport);
