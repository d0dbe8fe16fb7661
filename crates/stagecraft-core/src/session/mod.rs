//! Run history
//!
//! Persists finished pipeline runs so they can be inspected later.

mod store;

pub use store::{RunRecord, RunStore};
