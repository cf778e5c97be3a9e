//! HTTP binding of the TCC branch protocol.
//!
//! The coordinator side uses [`HttpTransport`]. Participants served by axum
//! extract calls with [`BranchCall`] and answer with [`BranchResponse`].
//!
//! | answer    | status |
//! |-----------|--------|
//! | success   | 2xx    |
//! | `FAILURE` | 409    |
//! | `ONGOING` | 425    |
//!
//! Any other status is treated as a transport failure and retried.

mod branch;
mod transport;

pub use branch::*;
pub use transport::*;

pub const HEADER_GID: &str = "x-tcc-gid";
pub const HEADER_BRANCH_ID: &str = "x-tcc-branch-id";
pub const HEADER_OP: &str = "x-tcc-op";
pub const HEADER_TRACEPARENT: &str = "traceparent";
