use serde::Serialize;
use std::collections::HashSet;
use tcc_store::{Branch, Store, StoreError};
use validator::Validate;

use crate::error::{Result, TccError};

/// A branch as described by the caller, before it is registered.
#[derive(Debug, Clone, PartialEq, Validate)]
pub struct BranchDesc {
    pub branch_id: Option<String>,

    #[validate(url)]
    pub try_endpoint: String,

    #[validate(url)]
    pub confirm_endpoint: String,

    #[validate(url)]
    pub cancel_endpoint: String,

    pub payload: Vec<u8>,
}

impl BranchDesc {
    pub fn new(
        try_endpoint: impl Into<String>,
        confirm_endpoint: impl Into<String>,
        cancel_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            branch_id: None,
            try_endpoint: try_endpoint.into(),
            confirm_endpoint: confirm_endpoint.into(),
            cancel_endpoint: cancel_endpoint.into(),
            payload: Vec::new(),
        }
    }

    /// Names the branch instead of using its registration position.
    pub fn id(mut self, value: impl Into<String>) -> Self {
        self.branch_id = Some(value.into());
        self
    }

    pub fn payload(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.payload = value.into();
        self
    }

    pub fn json<P: Serialize + ?Sized>(mut self, value: &P) -> Result<Self> {
        self.payload = serde_json::to_vec(value)?;
        Ok(self)
    }

    pub fn check(&self) -> Result<()> {
        let Err(errors) = self.validate() else {
            return Ok(());
        };

        let fields = errors.field_errors();

        let invalid = [
            ("try_endpoint", &self.try_endpoint),
            ("confirm_endpoint", &self.confirm_endpoint),
            ("cancel_endpoint", &self.cancel_endpoint),
        ]
        .into_iter()
        .find(|(field, _)| fields.contains_key(field))
        .map(|(_, endpoint)| endpoint.to_owned())
        .unwrap_or_else(|| errors.to_string());

        Err(TccError::InvalidEndpoint(invalid))
    }

    fn effective_id(&self, position: i32) -> String {
        self.branch_id
            .clone()
            .unwrap_or_else(|| format!("{position:02}"))
    }
}

/// Checks a whole batch of branches before anything is persisted.
pub fn validate_all(gid: &str, branches: &[BranchDesc]) -> Result<()> {
    let mut ids = HashSet::new();

    for (position, desc) in (1..).zip(branches.iter()) {
        desc.check()?;

        let branch_id = desc.effective_id(position);
        if !ids.insert(branch_id.to_owned()) {
            return Err(TccError::DuplicateBranch {
                gid: gid.to_owned(),
                branch_id,
            });
        }
    }

    Ok(())
}

/// Persists the branches of one transaction in registration order.
#[derive(Clone)]
pub(crate) struct BranchRegistry {
    store: Store,
    gid: String,
}

impl BranchRegistry {
    pub fn new(store: Store, gid: impl Into<String>) -> Self {
        Self {
            store,
            gid: gid.into(),
        }
    }

    /// Stores the branch as `try-pending` at the given position. Fails with
    /// [`TccError::PrepareTimeout`] once the transaction left `prepared`.
    pub async fn register(&self, desc: BranchDesc, position: i32) -> Result<Branch> {
        desc.check()?;

        let branch = Branch::new(
            &self.gid,
            desc.effective_id(position),
            position,
            [desc.try_endpoint, desc.confirm_endpoint, desc.cancel_endpoint],
            desc.payload,
        );

        match self.store.insert_branch(branch.clone()).await {
            Ok(()) => Ok(branch),
            Err(StoreError::DuplicateBranch { gid, branch_id }) => {
                Err(TccError::DuplicateBranch { gid, branch_id })
            }
            // failed by recovery while the caller was still running
            Err(StoreError::TransactionClosed(gid)) => Err(TccError::PrepareTimeout(gid)),
            Err(e) => Err(e.into()),
        }
    }
}
