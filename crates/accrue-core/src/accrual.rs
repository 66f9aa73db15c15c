//! Accrual calculator: maps a rate snapshot and elapsed time to an earned amount.
//!
//! Pure computation, no storage, no IO. Two pluggable strategies produce a
//! daily rate; the calculator turns that into a [`RateTier`] snapshot for a
//! session, and [`RateTier::accrued`] evaluates
//! `min(daily_rate * t / 86400, session_cap)` with `u128` intermediates.
//!
//! Per-second rates are never materialized as integers. Multiplying before
//! dividing keeps the result exact to the base unit and keeps
//! `accrued(t)` non-decreasing in `t`.

use crate::constants::{BPS_PRECISION, SECONDS_PER_DAY};
use crate::cycle;
use crate::policy::RewardPolicy;
use crate::types::{Entitlements, RateTier, Stake, StrategyKind};

/// Inputs a strategy may consult when a session opens.
#[derive(Debug, Clone, Copy)]
pub struct AccrualContext<'a> {
    pub now: u64,
    pub entitlements: &'a Entitlements,
    pub stake: Option<&'a Stake>,
    /// Active referred owners (for the referral boost).
    pub active_referrals: u32,
}

/// A rate formula selected per owner.
pub trait AccrualStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Base units earned per full day.
    fn daily_rate(&self, policy: &RewardPolicy, ctx: &AccrualContext<'_>) -> u64;

    /// Additional ceiling on a single session, applied on top of the
    /// duration-scaled session cap.
    ///
    /// Default implementation: no extra limit.
    fn session_limit(&self, _policy: &RewardPolicy, _ctx: &AccrualContext<'_>) -> u64 {
        u64::MAX
    }
}

/// `daily = dailyBaseRate * rateMultiplier`, where the multiplier reflects upgrades.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedEmission;

impl AccrualStrategy for FixedEmission {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FixedEmission
    }

    fn daily_rate(&self, policy: &RewardPolicy, ctx: &AccrualContext<'_>) -> u64 {
        mul_bps(policy.fixed_daily_base_rate, ctx.entitlements.rate_multiplier_bps)
    }
}

/// `daily = stake * tieredROI * timeMultiplier * referralBoost`, capped at
/// `min(stake * 3%, globalDailyMax)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercentageOfStake;

impl AccrualStrategy for PercentageOfStake {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PercentageOfStake
    }

    fn daily_rate(&self, policy: &RewardPolicy, ctx: &AccrualContext<'_>) -> u64 {
        let Some(stake) = ctx.stake.filter(|s| s.is_active) else {
            return 0;
        };
        let days = stake.days_staked(ctx.now);
        let roi = policy.roi_bps_for_day(days) as u128;
        let time = policy.time_multiplier_bps(days) as u128;
        let boost = policy.referral_boost_bps(ctx.active_referrals) as u128;
        let bps = BPS_PRECISION as u128;

        let daily = stake.amount as u128 * roi * time * boost / (bps * bps * bps);
        let daily = daily.min(u64::MAX as u128) as u64;
        daily.min(policy.stake_daily_cap(stake.amount))
    }

    /// A session may not carry the stake past its cycle cap.
    fn session_limit(&self, _policy: &RewardPolicy, ctx: &AccrualContext<'_>) -> u64 {
        ctx.stake.map(cycle::cycle_headroom).unwrap_or(0)
    }
}

static FIXED_EMISSION: FixedEmission = FixedEmission;
static PERCENTAGE_OF_STAKE: PercentageOfStake = PercentageOfStake;

/// Pick the strategy for an owner: stakers earn on their stake, everyone
/// else mines at the fixed emission rate.
pub fn select_strategy(stake: Option<&Stake>) -> &'static dyn AccrualStrategy {
    match stake {
        Some(_) => &PERCENTAGE_OF_STAKE,
        None => &FIXED_EMISSION,
    }
}

/// Builds [`RateTier`] snapshots under a policy.
#[derive(Debug, Clone, Default)]
pub struct AccrualCalculator {
    policy: RewardPolicy,
}

impl AccrualCalculator {
    pub fn new(policy: RewardPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    /// Snapshot the rate and cap for a session of `duration_secs`.
    pub fn rate_tier(
        &self,
        strategy: &dyn AccrualStrategy,
        ctx: &AccrualContext<'_>,
        duration_secs: u64,
    ) -> RateTier {
        let session_cap = self
            .policy
            .session_cap_for(duration_secs)
            .min(strategy.session_limit(&self.policy, ctx));
        RateTier {
            strategy: strategy.kind(),
            daily_rate: strategy.daily_rate(&self.policy, ctx),
            session_cap,
        }
    }
}

impl RateTier {
    /// Amount earned after `elapsed_secs`, never above the session cap.
    pub fn accrued(&self, elapsed_secs: u64) -> u64 {
        accrued(self.daily_rate, elapsed_secs, self.session_cap)
    }

    /// Seconds of accrual needed to reach `amount`, or `None` if unreachable
    /// within the cap.
    pub fn secs_to_reach(&self, amount: u64) -> Option<u64> {
        if amount == 0 {
            return Some(0);
        }
        if amount > self.session_cap || self.daily_rate == 0 {
            return None;
        }
        let secs = (amount as u128 * SECONDS_PER_DAY as u128).div_ceil(self.daily_rate as u128);
        Some(secs.min(u64::MAX as u128) as u64)
    }
}

/// `min(daily_rate * elapsed / 86400, cap)` in exact integer arithmetic.
pub fn accrued(daily_rate: u64, elapsed_secs: u64, cap: u64) -> u64 {
    let raw = daily_rate as u128 * elapsed_secs as u128 / SECONDS_PER_DAY as u128;
    raw.min(cap as u128) as u64
}

fn mul_bps(value: u64, bps: u64) -> u64 {
    let v = value as u128 * bps as u128 / BPS_PRECISION as u128;
    v.min(u64::MAX as u128) as u64
}
