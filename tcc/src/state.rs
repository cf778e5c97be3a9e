use tcc_store::{Branch, BranchStatus, TransactionStatus};

/// Outcome of a submitted transaction.
///
/// `reason` is the failure recorded when the caller returned, if any. The
/// same rule is applied by the caller and by recovery so both reach the same
/// decision for the same stored data.
pub fn decide(reason: Option<&str>, branches: &[Branch]) -> TransactionStatus {
    if reason.is_none() && branches.iter().all(|b| b.status == BranchStatus::TryOk) {
        TransactionStatus::Succeeded
    } else {
        TransactionStatus::Failed
    }
}
