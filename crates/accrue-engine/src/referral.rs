//! Referral registration and commission propagation.
//!
//! Each owner has at most one sponsor. A qualifying event by the referred
//! owner (a deposit) credits the sponsor with
//! `max(referral_min_reward, amount * referral_commission_bps)` and
//! activates the edge. Commission ids derive from `(referred, trigger)`,
//! so replaying a trigger never pays twice.

use std::sync::Arc;

use tracing::{debug, info};

use accrue_core::constants::BPS_PRECISION;
use accrue_core::error::{EngineError, ValidationError};
use accrue_core::policy::RewardPolicy;
use accrue_core::traits::RewardStore;
use accrue_core::types::{EarningEvent, Hash256, OwnerId, ReferralEdge, ReferralStatus, TeamMemberView};

use crate::ledger::LedgerService;
use crate::locks::OwnerLocks;

pub struct ReferralPropagator {
    store: Arc<dyn RewardStore>,
    ledger: Arc<LedgerService>,
    locks: Arc<OwnerLocks>,
    policy: RewardPolicy,
}

impl ReferralPropagator {
    pub fn new(
        store: Arc<dyn RewardStore>,
        ledger: Arc<LedgerService>,
        locks: Arc<OwnerLocks>,
        policy: RewardPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            locks,
            policy,
        }
    }

    /// Commission owed on a qualifying amount.
    pub fn commission(&self, amount: u64) -> u64 {
        let pct = amount as u128 * self.policy.referral_commission_bps as u128 / BPS_PRECISION as u128;
        (pct.min(u64::MAX as u128) as u64).max(self.policy.referral_min_reward)
    }

    /// Create the pending edge `sponsor → referred`.
    ///
    /// Registering the same pair again returns the stored edge.
    pub async fn register(
        &self,
        sponsor: &OwnerId,
        referred: &OwnerId,
        now: u64,
    ) -> Result<ReferralEdge, EngineError> {
        for owner in [sponsor, referred] {
            if owner.is_pool() {
                return Err(ValidationError::ReservedOwner(owner.clone()).into());
            }
        }
        if sponsor == referred {
            return Err(ValidationError::SelfReferral.into());
        }

        let _guard = self.locks.lock(referred).await;
        if let Some(existing) = self.store.fetch_referral_edge(referred).await? {
            if &existing.sponsor == sponsor {
                return Ok(existing);
            }
            return Err(ValidationError::AlreadyReferred {
                referred: referred.clone(),
                sponsor: existing.sponsor,
            }
            .into());
        }

        let edge = ReferralEdge {
            sponsor: sponsor.clone(),
            referred: referred.clone(),
            status: ReferralStatus::Pending,
            created_at: now,
            activated_at: None,
        };
        self.store.put_referral_edge(&edge).await?;
        info!(sponsor = %sponsor, referred = %referred, "referral registered");
        Ok(edge)
    }

    /// Pay the sponsor of `referred` for a qualifying event.
    ///
    /// Takes the sponsor's lock; the caller must not hold any owner lock.
    /// Returns the commission event if `referred` has a sponsor.
    pub async fn on_qualifying_event(
        &self,
        referred: &OwnerId,
        amount: u64,
        trigger: &Hash256,
        now: u64,
    ) -> Result<Option<EarningEvent>, EngineError> {
        let Some(edge) = self.store.fetch_referral_edge(referred).await? else {
            return Ok(None);
        };
        let sponsor = edge.sponsor.clone();
        let bonus = self.commission(amount);
        let event = EarningEvent::referral_bonus(&sponsor, referred, trigger, bonus, now);

        let _guard = self.locks.lock(&sponsor).await;
        if self.ledger.record(&event).await? {
            info!(sponsor = %sponsor, referred = %referred, amount = bonus, "referral commission paid");
        } else {
            debug!(sponsor = %sponsor, referred = %referred, trigger = %trigger, "commission already paid");
        }

        if edge.status == ReferralStatus::Pending {
            let active = ReferralEdge {
                status: ReferralStatus::Active,
                activated_at: Some(now),
                ..edge
            };
            self.store.put_referral_edge(&active).await?;
        }
        Ok(Some(event))
    }

    /// The sponsor's referred owners with their lifetime earnings.
    pub async fn team(&self, sponsor: &OwnerId) -> Result<Vec<TeamMemberView>, EngineError> {
        let mut team = Vec::new();
        for edge in self.store.referrals_of(sponsor).await? {
            let balance = self.store.fetch_balance(&edge.referred).await?;
            team.push(TeamMemberView {
                owner: edge.referred,
                status: edge.status,
                joined_at: edge.created_at,
                activated_at: edge.activated_at,
                total_earned: balance.total_earned,
            });
        }
        Ok(team)
    }
}
