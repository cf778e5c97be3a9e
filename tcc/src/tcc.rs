use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tcc_store::{BranchOp, BranchStatus, Store, StoreError};

use crate::{
    caller::BranchCaller,
    error::{Result, TccError},
    registry::{BranchDesc, BranchRegistry},
    trace::TraceContext,
    transport::{BranchRequest, CallError},
};

/// First failure observed while the caller was running.
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    InvalidEndpoint(String),
    DuplicateBranch { branch_id: String },
    Rejected { branch_id: String, message: String },
    Unreachable { branch_id: String, message: String },
    PrepareTimeout,
    Store(String),
}

impl Failure {
    fn from_error(error: &TccError) -> Self {
        match error {
            TccError::InvalidEndpoint(endpoint) => Self::InvalidEndpoint(endpoint.to_owned()),
            TccError::DuplicateBranch { branch_id, .. } => Self::DuplicateBranch {
                branch_id: branch_id.to_owned(),
            },
            TccError::BranchApplicationError { branch_id, message } => Self::Rejected {
                branch_id: branch_id.to_owned(),
                message: message.to_owned(),
            },
            TccError::EndpointUnreachable { branch_id, message } => Self::Unreachable {
                branch_id: branch_id.to_owned(),
                message: message.to_owned(),
            },
            TccError::PrepareTimeout(_) => Self::PrepareTimeout,
            other => Self::Store(other.to_string()),
        }
    }

    pub fn into_error(self, gid: &str) -> TccError {
        match self {
            Self::InvalidEndpoint(endpoint) => TccError::InvalidEndpoint(endpoint),
            Self::DuplicateBranch { branch_id } => TccError::DuplicateBranch {
                gid: gid.to_owned(),
                branch_id,
            },
            Self::Rejected { branch_id, message } => {
                TccError::BranchApplicationError { branch_id, message }
            }
            Self::Unreachable { branch_id, message } => {
                TccError::EndpointUnreachable { branch_id, message }
            }
            Self::PrepareTimeout => TccError::PrepareTimeout(gid.to_owned()),
            Self::Store(message) => TccError::Store(StoreError::Any(anyhow::anyhow!(message))),
        }
    }

    pub fn reason(&self, gid: &str) -> String {
        self.clone().into_error(gid).to_string()
    }
}

#[derive(Debug, Default)]
struct State {
    position: i32,
    failure: Option<Failure>,
}

/// Handle given to the caller of [`Coordinator::tcc`](crate::Coordinator::tcc).
///
/// Registers branches and runs their Try phase. Once a Try fails, every
/// further branch call fails with [`TccError::AlreadyFailed`].
#[derive(Clone)]
pub struct Tcc {
    gid: String,
    trace: TraceContext,
    registry: BranchRegistry,
    caller: BranchCaller,
    store: Store,
    state: Arc<Mutex<State>>,
}

impl Tcc {
    pub(crate) fn new(gid: String, trace: TraceContext, store: Store, caller: BranchCaller) -> Self {
        Self {
            registry: BranchRegistry::new(store.clone(), &gid),
            gid,
            trace,
            caller,
            store,
            state: Arc::default(),
        }
    }

    pub fn gid(&self) -> &str {
        &self.gid
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    /// Registers a branch carrying `payload` as JSON and calls its Try.
    pub async fn call_branch<P: Serialize + ?Sized>(
        &self,
        payload: &P,
        try_endpoint: impl Into<String>,
        confirm_endpoint: impl Into<String>,
        cancel_endpoint: impl Into<String>,
    ) -> Result<()> {
        let desc =
            BranchDesc::new(try_endpoint, confirm_endpoint, cancel_endpoint).json(payload)?;

        self.call(desc).await
    }

    pub async fn call(&self, desc: BranchDesc) -> Result<()> {
        let position = {
            let mut state = self.state.lock();
            if state.failure.is_some() {
                return Err(TccError::AlreadyFailed(self.gid.to_owned()));
            }

            state.position += 1;
            state.position
        };

        let res = self.try_branch(desc, position).await;

        if let Err(e) = &res {
            self.fail(Failure::from_error(e));
        }

        res
    }

    async fn try_branch(&self, desc: BranchDesc, position: i32) -> Result<()> {
        let branch = self.registry.register(desc, position).await?;

        let request = BranchRequest::new(
            &branch,
            BranchOp::Try,
            Some(self.trace.child().to_traceparent()),
        );

        let res = self.caller.call(request).await;

        let mut updated = branch.clone();
        match &res {
            Ok(()) => updated.status = BranchStatus::TryOk,
            Err(e) => {
                updated.status = BranchStatus::TryFailed;
                updated.last_error = Some(e.to_string());
            }
        }

        // recovery may already have failed the transaction and moved on
        if !self
            .store
            .update_branch(&updated, BranchStatus::TryPending)
            .await?
        {
            return Err(TccError::PrepareTimeout(self.gid.to_owned()));
        }

        res.map_err(|e| match e {
            CallError::Rejected(message) => TccError::BranchApplicationError {
                branch_id: branch.branch_id,
                message,
            },
            other => TccError::EndpointUnreachable {
                branch_id: branch.branch_id,
                message: other.to_string(),
            },
        })
    }

    fn fail(&self, failure: Failure) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(failure);
        }
    }

    pub(crate) fn failure(&self) -> Option<Failure> {
        self.state.lock().failure.clone()
    }
}
