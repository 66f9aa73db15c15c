//! Cycle cap arithmetic.
//!
//! A stake's cumulative return is capped at [`CYCLE_CAP_BPS`] of its
//! principal. These functions are pure; the engine's cycle enforcer
//! persists their results.
//!
//! # Invariants
//!
//! * `cycle_progress_bps <= CYCLE_CAP_BPS`
//! * `total_earned <= cycle_cap_total(amount)`
//! * `is_active` goes from `true` to `false` at most once

use crate::constants::{BPS_PRECISION, CYCLE_CAP_BPS};
use crate::policy::RewardPolicy;
use crate::types::{PayoutTarget, Stake};

/// Result of crediting an earning to a stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStep {
    /// Portion of the earning that counted toward the cycle.
    pub credited: u64,
    /// This step took the stake to its cap.
    pub completed: bool,
}

/// Total return a stake may earn over its cycle.
pub fn cycle_cap_total(amount: u64) -> u64 {
    let cap = amount as u128 * CYCLE_CAP_BPS as u128 / BPS_PRECISION as u128;
    cap.min(u64::MAX as u128) as u64
}

/// What the stake may still earn before its cycle completes.
pub fn cycle_headroom(stake: &Stake) -> u64 {
    if !stake.is_active {
        return 0;
    }
    cycle_cap_total(stake.amount).saturating_sub(stake.total_earned)
}

/// `total_earned / amount` in basis points, capped at [`CYCLE_CAP_BPS`].
pub fn progress_bps(total_earned: u64, amount: u64) -> u64 {
    if amount == 0 {
        return CYCLE_CAP_BPS;
    }
    let p = total_earned as u128 * BPS_PRECISION as u128 / amount as u128;
    p.min(CYCLE_CAP_BPS as u128) as u64
}

/// Credit `amount` to an active stake, clamping at the cap.
///
/// Returns `completed == true` only on the step that flips `is_active`;
/// crediting an inactive stake is a no-op.
pub fn apply_earning(stake: &mut Stake, amount: u64) -> CycleStep {
    if !stake.is_active {
        return CycleStep {
            credited: 0,
            completed: false,
        };
    }
    let credited = amount.min(cycle_headroom(stake));
    stake.total_earned += credited;
    stake.cycle_progress_bps = progress_bps(stake.total_earned, stake.amount);

    let completed = stake.cycle_progress_bps >= CYCLE_CAP_BPS;
    if completed {
        stake.is_active = false;
    }
    CycleStep { credited, completed }
}

/// Split a stake's principal into its cycle payouts. Zero shares are omitted.
pub fn split_principal(amount: u64, policy: &RewardPolicy) -> Vec<(PayoutTarget, u64)> {
    let share = |bps: u64| (amount as u128 * bps as u128 / BPS_PRECISION as u128) as u64;
    [
        (PayoutTarget::Reinvestment, share(policy.payout_reinvest_bps)),
        (PayoutTarget::Pool, share(policy.payout_pool_bps)),
        (PayoutTarget::Reputation, share(policy.payout_reputation_bps)),
    ]
    .into_iter()
    .filter(|(_, v)| *v > 0)
    .collect()
}
