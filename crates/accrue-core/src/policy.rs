//! Tunable reward policy.
//!
//! Every field defaults to the matching value in [`crate::constants`]. The
//! node deserializes this from its config file, so any subset of fields may
//! be overridden.

use serde::{Deserialize, Serialize};

use crate::constants::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardPolicy {
    pub base_session_secs: u64,
    pub extended_session_secs: u64,
    pub base_session_cap: u64,
    pub fixed_daily_base_rate: u64,
    pub roi_tiers_bps: Vec<u64>,
    pub time_multiplier_week_bps: u64,
    pub time_multiplier_month_bps: u64,
    pub time_multiplier_long_bps: u64,
    pub referral_boost_step_bps: u64,
    pub referral_boost_max_bps: u64,
    pub stake_daily_cap_bps: u64,
    pub global_daily_max: u64,
    pub min_stake: u64,
    pub claim_cooldown_secs: u64,
    pub auto_claim_threshold: u64,
    pub payout_reinvest_bps: u64,
    pub payout_pool_bps: u64,
    pub payout_reputation_bps: u64,
    pub referral_commission_bps: u64,
    pub referral_min_reward: u64,
    pub reconcile_epsilon: u64,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            base_session_secs: BASE_SESSION_SECS,
            extended_session_secs: EXTENDED_SESSION_SECS,
            base_session_cap: BASE_SESSION_CAP,
            fixed_daily_base_rate: FIXED_DAILY_BASE_RATE,
            roi_tiers_bps: ROI_TIERS_BPS.to_vec(),
            time_multiplier_week_bps: TIME_MULTIPLIER_WEEK_BPS,
            time_multiplier_month_bps: TIME_MULTIPLIER_MONTH_BPS,
            time_multiplier_long_bps: TIME_MULTIPLIER_LONG_BPS,
            referral_boost_step_bps: REFERRAL_BOOST_STEP_BPS,
            referral_boost_max_bps: REFERRAL_BOOST_MAX_BPS,
            stake_daily_cap_bps: STAKE_DAILY_CAP_BPS,
            global_daily_max: GLOBAL_DAILY_MAX,
            min_stake: MIN_STAKE,
            claim_cooldown_secs: CLAIM_COOLDOWN_SECS,
            auto_claim_threshold: AUTO_CLAIM_THRESHOLD,
            payout_reinvest_bps: PAYOUT_REINVEST_BPS,
            payout_pool_bps: PAYOUT_POOL_BPS,
            payout_reputation_bps: PAYOUT_REPUTATION_BPS,
            referral_commission_bps: REFERRAL_COMMISSION_BPS,
            referral_min_reward: REFERRAL_MIN_REWARD,
            reconcile_epsilon: RECONCILE_EPSILON,
        }
    }
}

impl RewardPolicy {
    /// Session length for an owner with or without the extended entitlement.
    pub fn session_duration(&self, extended: bool) -> u64 {
        if extended {
            self.extended_session_secs
        } else {
            self.base_session_secs
        }
    }

    /// Session cap scaled to the session's length (base cap per 24 hours).
    pub fn session_cap_for(&self, duration_secs: u64) -> u64 {
        let scaled = self.base_session_cap as u128 * duration_secs as u128
            / self.base_session_secs.max(1) as u128;
        scaled.min(u64::MAX as u128) as u64
    }

    /// Daily ROI for the week the stake is in (0-based days since start).
    pub fn roi_bps_for_day(&self, days_since_start: u64) -> u64 {
        if self.roi_tiers_bps.is_empty() {
            return 0;
        }
        let week = (days_since_start / 7) as usize;
        let idx = week.min(self.roi_tiers_bps.len() - 1);
        self.roi_tiers_bps[idx]
    }

    /// Time multiplier for the total days staked.
    pub fn time_multiplier_bps(&self, days_staked: u64) -> u64 {
        match days_staked {
            0..=7 => self.time_multiplier_week_bps,
            8..=30 => self.time_multiplier_month_bps,
            _ => self.time_multiplier_long_bps,
        }
    }

    /// `1 + min(step * referrals, max)` in basis points.
    pub fn referral_boost_bps(&self, active_referrals: u32) -> u64 {
        let boost = self
            .referral_boost_step_bps
            .saturating_mul(active_referrals as u64)
            .min(self.referral_boost_max_bps);
        BPS_PRECISION + boost
    }

    /// Per-day ceiling on stake earnings: `min(stake * 3%, global max)`.
    pub fn stake_daily_cap(&self, stake_amount: u64) -> u64 {
        let share = stake_amount as u128 * self.stake_daily_cap_bps as u128 / BPS_PRECISION as u128;
        (share.min(u64::MAX as u128) as u64).min(self.global_daily_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cap_doubles_for_extended() {
        let p = RewardPolicy::default();
        assert_eq!(p.session_cap_for(p.base_session_secs), BASE_SESSION_CAP);
        assert_eq!(p.session_cap_for(p.extended_session_secs), 2 * BASE_SESSION_CAP);
    }

    #[test]
    fn roi_bands_by_week() {
        let p = RewardPolicy::default();
        assert_eq!(p.roi_bps_for_day(0), 100);
        assert_eq!(p.roi_bps_for_day(6), 100);
        assert_eq!(p.roi_bps_for_day(7), 150);
        assert_eq!(p.roi_bps_for_day(14), 200);
        assert_eq!(p.roi_bps_for_day(21), 250);
        assert_eq!(p.roi_bps_for_day(365), 250);
    }

    #[test]
    fn empty_roi_table_yields_zero() {
        let p = RewardPolicy {
            roi_tiers_bps: Vec::new(),
            ..RewardPolicy::default()
        };
        assert_eq!(p.roi_bps_for_day(3), 0);
    }

    #[test]
    fn time_multiplier_boundaries() {
        let p = RewardPolicy::default();
        assert_eq!(p.time_multiplier_bps(7), 10_000);
        assert_eq!(p.time_multiplier_bps(8), 11_000);
        assert_eq!(p.time_multiplier_bps(30), 11_000);
        assert_eq!(p.time_multiplier_bps(31), 12_500);
    }

    #[test]
    fn referral_boost_caps_at_fifty_percent() {
        let p = RewardPolicy::default();
        assert_eq!(p.referral_boost_bps(0), 10_000);
        assert_eq!(p.referral_boost_bps(3), 11_500);
        assert_eq!(p.referral_boost_bps(10), 15_000);
        assert_eq!(p.referral_boost_bps(1_000), 15_000);
    }

    #[test]
    fn stake_daily_cap_uses_smaller_bound() {
        let p = RewardPolicy::default();
        assert_eq!(p.stake_daily_cap(100 * UNIT), 3 * UNIT);
        assert_eq!(p.stake_daily_cap(1_000_000 * UNIT), GLOBAL_DAILY_MAX);
    }

    #[test]
    fn partial_override_from_json() {
        let p: RewardPolicy = serde_json::from_str(r#"{"claim_cooldown_secs": 60}"#).unwrap();
        assert_eq!(p.claim_cooldown_secs, 60);
        assert_eq!(p.base_session_cap, BASE_SESSION_CAP);
    }
}
