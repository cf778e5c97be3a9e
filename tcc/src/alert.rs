use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use tcc_store::BranchOp;

use crate::error::TccError;

/// A branch whose Confirm/Cancel could not be delivered within the retry window.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn error(&self) -> TccError {
        TccError::RetryBudgetExhausted {
            gid: self.gid.to_owned(),
            branch_id: self.branch_id.to_owned(),
            op: self.op,
            attempts: self.attempts,
        }
    }
}

/// Operator channel for branches that need manual reconciliation.
#[async_trait]
pub trait AlertSink: DynClone + Send + Sync {
    async fn raise(&self, alert: Alert);
}

dyn_clone::clone_trait_object!(AlertSink);

#[derive(Debug, Clone, Default)]
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn raise(&self, alert: Alert) {
        tracing::error!(
            "{}, last error: {}",
            alert.error(),
            alert.last_error.as_deref().unwrap_or("none")
        );
    }
}
