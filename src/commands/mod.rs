//! Command implementations for buscount.

pub mod count;

pub use crate::bus::verify_sorted;
pub use count::{CountCommand, RunSummary};
