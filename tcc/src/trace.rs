//! Trace context propagation and span helpers.
//!
//! Every global transaction carries a W3C trace context. It is stored with
//! the transaction so that Confirm/Cancel calls issued later by the recovery
//! engine still belong to the trace that started the transaction. Each branch
//! call gets a child span id and is sent as a `traceparent` header.
//!
//! # Spans
//!
//! - `tcc.transaction` - a caller-driven transaction
//! - `tcc.branch` - one Try/Confirm/Cancel call
//! - `tcc.sweep` - one recovery pass

use tcc_store::BranchOp;
use tracing::{info_span, Span};
use uuid::Uuid;

/// Span names.
pub mod span_names {
    pub const TRANSACTION: &str = "tcc.transaction";
    pub const BRANCH: &str = "tcc.branch";
    pub const SWEEP: &str = "tcc.sweep";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// 16 lowercase hex characters.
    pub span_id: String,
    pub sampled: bool,
}

impl TraceContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            sampled: true,
        }
    }

    /// Same trace, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.to_owned(),
            span_id: new_span_id(),
            sampled: self.sampled,
        }
    }

    /// Parses `{version}-{trace_id}-{parent_id}-{flags}`, version `00` only.
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let parts = header.trim().split('-').collect::<Vec<_>>();
        let [version, trace_id, span_id, flags] = parts.as_slice() else {
            return None;
        };

        if *version != "00" || !is_hex(trace_id, 32) || !is_hex(span_id, 16) || !is_hex(flags, 2) {
            return None;
        }

        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }

        let flags = u8::from_str_radix(flags, 16).ok()?;

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
            sampled: flags & 0x01 == 0x01,
        })
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn transaction_span(gid: &str, trace: &TraceContext) -> Span {
    info_span!(
        target: "tcc",
        "tcc.transaction",
        gid = %gid,
        trace_id = %trace.trace_id,
        otel.name = span_names::TRANSACTION,
    )
}

pub fn branch_span(gid: &str, branch_id: &str, op: BranchOp, endpoint: &str) -> Span {
    info_span!(
        target: "tcc",
        "tcc.branch",
        gid = %gid,
        branch_id = %branch_id,
        op = %op,
        endpoint = %endpoint,
        otel.name = span_names::BRANCH,
    )
}

pub fn sweep_span(owner: &Uuid) -> Span {
    info_span!(
        target: "tcc",
        "tcc.sweep",
        owner = %owner,
        otel.name = span_names::SWEEP,
    )
}
