//! Integration test suite for the accrue engine.
//!
//! Scenario tests replay the reference reward walkthroughs end to end,
//! concurrency tests race owners' operations on a multi-threaded runtime,
//! and adversarial tests drive random operation sequences and check the
//! ledger invariants after every step.

pub mod helpers;
