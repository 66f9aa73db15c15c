//! Engine constants. All monetary values in base units (1 unit = 10^8 base units).
//!
//! These are the defaults behind [`RewardPolicy`](crate::policy::RewardPolicy);
//! a deployment may override any of them through configuration.

/// Base units per display unit.
pub const UNIT: u64 = 100_000_000;

/// Basis-point denominator (10,000 = 100% = 1.0×).
pub const BPS_PRECISION: u64 = 10_000;

pub const SECONDS_PER_DAY: u64 = 86_400;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Duration of a regular mining session (24 hours).
pub const BASE_SESSION_SECS: u64 = SECONDS_PER_DAY;

/// Duration of a session when the extended-session entitlement is held (48 hours).
pub const EXTENDED_SESSION_SECS: u64 = 2 * SECONDS_PER_DAY;

/// Ceiling on what a single 24-hour session can accrue. Scales linearly with
/// session length, so a 48-hour session may accrue twice this.
pub const BASE_SESSION_CAP: u64 = 50 * UNIT;

// ---------------------------------------------------------------------------
// Fixed-emission strategy
// ---------------------------------------------------------------------------

/// Daily emission for an owner with no upgrades.
pub const FIXED_DAILY_BASE_RATE: u64 = 50 * UNIT;

/// Multiplier for an owner without upgrades.
pub const BASE_RATE_MULTIPLIER_BPS: u64 = BPS_PRECISION;

/// Bonus granted by a rig upgrade (+25%).
pub const RIG_UPGRADE_BONUS_BPS: u64 = 2_500;

// ---------------------------------------------------------------------------
// Percentage-of-stake strategy
// ---------------------------------------------------------------------------

/// Daily ROI by week since stake start: week 1, 2, 3, and 4 onward.
///
/// | Week | BPS | Daily ROI |
/// |------|-----|-----------|
/// | 1    | 100 | 1.0%      |
/// | 2    | 150 | 1.5%      |
/// | 3    | 200 | 2.0%      |
/// | 4+   | 250 | 2.5%      |
pub const ROI_TIERS_BPS: [u64; 4] = [100, 150, 200, 250];

/// Time multiplier while the stake is at most 7 days old.
pub const TIME_MULTIPLIER_WEEK_BPS: u64 = 10_000;

/// Time multiplier while the stake is at most 30 days old.
pub const TIME_MULTIPLIER_MONTH_BPS: u64 = 11_000;

/// Time multiplier once the stake is older than 30 days.
pub const TIME_MULTIPLIER_LONG_BPS: u64 = 12_500;

/// Boost per active referred owner (+5%).
pub const REFERRAL_BOOST_STEP_BPS: u64 = 500;

/// Maximum referral boost (+50%).
pub const REFERRAL_BOOST_MAX_BPS: u64 = 5_000;

/// A stake never earns more than this share of its principal per day (3%).
pub const STAKE_DAILY_CAP_BPS: u64 = 300;

/// Absolute ceiling on daily stake earnings regardless of principal.
pub const GLOBAL_DAILY_MAX: u64 = 1_000 * UNIT;

/// Smallest accepted deposit.
pub const MIN_STAKE: u64 = UNIT;

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Cooldown after a successful claim (30 minutes).
pub const CLAIM_COOLDOWN_SECS: u64 = 1_800;

/// Live accrual at which an automatic claim fires.
pub const AUTO_CLAIM_THRESHOLD: u64 = 10 * UNIT;

// ---------------------------------------------------------------------------
// Cycles
// ---------------------------------------------------------------------------

/// Cumulative return cap per stake (300% of principal).
pub const CYCLE_CAP_BPS: u64 = 30_000;

/// Share of principal credited to the owner's reinvestment balance at cycle end.
pub const PAYOUT_REINVEST_BPS: u64 = 2_000;

/// Share of principal credited to the global pool at cycle end.
pub const PAYOUT_POOL_BPS: u64 = 1_000;

/// Share of principal credited to the owner's reputation balance at cycle end.
pub const PAYOUT_REPUTATION_BPS: u64 = 1_000;

// ---------------------------------------------------------------------------
// Referrals
// ---------------------------------------------------------------------------

/// Sponsor commission on a referred owner's deposit (5%).
pub const REFERRAL_COMMISSION_BPS: u64 = 500;

/// Minimum sponsor commission per qualifying event.
pub const REFERRAL_MIN_REWARD: u64 = UNIT;

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Largest tolerated difference between a cached aggregate and the event fold.
pub const RECONCILE_EPSILON: u64 = 100;

/// Owner id under which global pool payouts are booked.
pub const POOL_OWNER: &str = "__pool__";
