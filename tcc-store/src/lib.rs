#![forbid(unsafe_code)]

mod engine;
mod error;
mod store;
mod transaction;

pub use engine::*;
pub use error::*;
pub use store::*;
pub use transaction::*;
