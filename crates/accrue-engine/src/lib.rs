//! # accrue-engine
//! Session lifecycle, settlement, ledger reconciliation, cycle caps and
//! referral commissions over an abstract [`RewardStore`](accrue_core::traits::RewardStore).

pub mod cycle;
pub mod engine;
pub mod ledger;
pub mod locks;
pub mod referral;
pub mod retry;
pub mod session;
pub mod settlement;

pub use engine::{AccrualView, RewardEngine, TickReport};
pub use ledger::{ReconcileOutcome, ReconcileReport};
pub use retry::RetryPolicy;
pub use session::{Observation, RolloverOutcome, Settlement};
pub use settlement::ClaimReceipt;
