//! Ledger-tracked property objects
//!
//! This crate re-exports all the components of the jigs system.

pub use jigs_core::*;
pub use jigs_runtime::*;
