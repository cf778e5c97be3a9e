//! Try-Confirm-Cancel distributed transaction coordinator.
//!
//! A caller opens a global transaction with [`Coordinator::tcc`], registers
//! branches and runs their Try through the [`Tcc`] handle. Once the caller
//! returns, the outcome is stored durably and the recovery sweeper started
//! with [`Coordinator::start`] delivers Confirm or Cancel to every branch
//! until each acknowledges it.

#![forbid(unsafe_code)]

mod alert;
mod barrier;
mod caller;
mod config;
mod coordinator;
mod error;
mod local;
mod recovery;
mod registry;
mod retry;
mod state;
mod tcc;
mod trace;
mod transport;

pub use alert::*;
pub use barrier::*;
pub use caller::*;
pub use config::{
    ConfigBuilder, CoordinatorConfig, BATCH_SIZE, CALL_TIMEOUT, LEASE, PREPARE_TIMEOUT,
    STALLED_RECHECK, SWEEP_INTERVAL, WORKERS,
};
pub use coordinator::*;
pub use error::*;
pub use local::*;
pub use recovery::*;
pub use registry::{validate_all, BranchDesc};
pub use retry::*;
pub use state::decide;
pub use tcc::Tcc;
pub use trace::*;
pub use transport::*;

pub use tcc_store::{
    Branch, BranchOp, BranchStatus, GlobalTransaction, Store, StoreError, TransactionKind,
    TransactionStatus,
};

#[cfg(feature = "memory")]
pub use tcc_store::MemoryStore;

#[cfg(feature = "pg")]
pub use tcc_store::PgStore;

/// A new globally unique transaction id.
pub fn gid() -> String {
    nanoid::nanoid!()
}
