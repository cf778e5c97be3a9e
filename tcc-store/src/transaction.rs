use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize)]
#[display(style = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TransactionKind {
    Tcc,
}

/// Lifecycle of a global transaction.
///
/// `prepared -> submitted -> {succeeded, failed}`, with `prepared -> failed`
/// reserved for transactions abandoned past their prepare timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize)]
#[display(style = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Prepared,
    Submitted,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Prepared, Self::Submitted)
                | (Self::Prepared, Self::Failed)
                | (Self::Submitted, Self::Succeeded)
                | (Self::Submitted, Self::Failed)
        )
    }

    /// Operation the coordinator delivers to branches once this status is reached.
    pub fn second_phase(&self) -> Option<BranchOp> {
        match self {
            Self::Succeeded => Some(BranchOp::Confirm),
            Self::Failed => Some(BranchOp::Cancel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize)]
#[display(style = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum BranchStatus {
    TryPending,
    TryOk,
    TryFailed,
    ConfirmOk,
    CancelOk,
}

impl BranchStatus {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::ConfirmOk | Self::CancelOk)
    }

    /// Whether `op` still has to be delivered to a branch in this status.
    pub fn awaits(&self, op: BranchOp) -> bool {
        match op {
            BranchOp::Try => matches!(self, Self::TryPending),
            BranchOp::Confirm => matches!(self, Self::TryOk),
            BranchOp::Cancel => matches!(self, Self::TryPending | Self::TryOk | Self::TryFailed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromStr, Serialize, Deserialize)]
#[display(style = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum BranchOp {
    Try,
    Confirm,
    Cancel,
}

impl BranchOp {
    /// Status a branch reaches when this operation succeeds.
    pub fn success_status(&self) -> BranchStatus {
        match self {
            Self::Try => BranchStatus::TryOk,
            Self::Confirm => BranchStatus::ConfirmOk,
            Self::Cancel => BranchStatus::CancelOk,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTransaction {
    pub gid: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub reason: Option<String>,
    pub trace_parent: Option<String>,
    pub owner: Option<Uuid>,
    pub lease_until: Option<DateTime<Utc>>,
    pub next_sweep_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GlobalTransaction {
    /// A freshly opened transaction. Recovery first looks at it at `prepare_deadline`.
    pub fn new(gid: impl Into<String>, prepare_deadline: DateTime<Utc>) -> Self {
        let now = Utc::now();

        Self {
            gid: gid.into(),
            kind: TransactionKind::Tcc,
            status: TransactionStatus::Prepared,
            reason: None,
            trace_parent: None,
            owner: None,
            lease_until: None,
            next_sweep_at: prepare_deadline,
            decided_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn trace_parent(mut self, value: impl Into<String>) -> Self {
        self.trace_parent = Some(value.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Claimable by a sweeper at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.finished_at.is_none()
            && self.next_sweep_at <= now
            && self.lease_until.map_or(true, |lease| lease < now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub gid: String,
    pub branch_id: String,
    pub position: i32,
    pub try_endpoint: String,
    pub confirm_endpoint: String,
    pub cancel_endpoint: String,
    pub payload: Vec<u8>,
    pub status: BranchStatus,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub retry_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stalled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(
        gid: impl Into<String>,
        branch_id: impl Into<String>,
        position: i32,
        endpoints: [String; 3],
        payload: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        let [try_endpoint, confirm_endpoint, cancel_endpoint] = endpoints;

        Self {
            gid: gid.into(),
            branch_id: branch_id.into(),
            position,
            try_endpoint,
            confirm_endpoint,
            cancel_endpoint,
            payload,
            status: BranchStatus::TryPending,
            attempts: 0,
            next_attempt_at: None,
            retry_started_at: None,
            last_error: None,
            stalled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn endpoint(&self, op: BranchOp) -> &str {
        match op {
            BranchOp::Try => &self.try_endpoint,
            BranchOp::Confirm => &self.confirm_endpoint,
            BranchOp::Cancel => &self.cancel_endpoint,
        }
    }

    /// Whether a second-phase delivery of `op` may be attempted at `now`.
    pub fn is_due(&self, op: BranchOp, now: DateTime<Utc>) -> bool {
        !self.stalled
            && self.status.awaits(op)
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
