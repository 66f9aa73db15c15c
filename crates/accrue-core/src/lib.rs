//! # accrue-core
//! Foundation types, accrual math and store traits for the accrue reward engine.

pub mod accrual;
pub mod constants;
pub mod cycle;
pub mod error;
pub mod ledger;
pub mod memory_store;
pub mod policy;
pub mod traits;
pub mod types;
