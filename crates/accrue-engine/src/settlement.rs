//! Claim and settlement coordinator.
//!
//! A claim runs under the owner's lock:
//!
//! 1. reject while the cooldown is running
//! 2. validate the amount against `claimable + live accrual`
//! 3. settle live accrual (`mining_complete`), then append the `claim`
//!
//! The session stays open with its baseline moved to the claim time.
//! Automatic claims use `try_lock` and skip owners that are busy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use accrue_core::error::{EngineError, NotEligible, ValidationError};
use accrue_core::policy::RewardPolicy;
use accrue_core::traits::RewardStore;
use accrue_core::types::{Balance, EarningEvent, OwnerId};

use crate::ledger::LedgerService;
use crate::locks::OwnerLocks;
use crate::session::SessionManager;

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub amount: u64,
    /// Live accrual settled into claimable as part of this claim.
    pub settled: u64,
    pub balance: Balance,
    pub cooldown_until: u64,
}

pub struct SettlementCoordinator {
    store: Arc<dyn RewardStore>,
    ledger: Arc<LedgerService>,
    sessions: Arc<SessionManager>,
    locks: Arc<OwnerLocks>,
    policy: RewardPolicy,
}

impl SettlementCoordinator {
    pub fn new(
        store: Arc<dyn RewardStore>,
        ledger: Arc<LedgerService>,
        sessions: Arc<SessionManager>,
        locks: Arc<OwnerLocks>,
        policy: RewardPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            sessions,
            locks,
            policy,
        }
    }

    /// User-initiated claim. Waits for the owner's lock.
    pub async fn claim(&self, owner: &OwnerId, requested: u64, now: u64) -> Result<ClaimReceipt, EngineError> {
        let _guard = self.locks.lock(owner).await;
        self.claim_locked(owner, requested, now).await
    }

    /// Claim everything once live accrual reaches the auto-claim threshold.
    ///
    /// Returns `None` when the owner is busy, below the threshold, cooling
    /// down, or has no session.
    pub async fn maybe_auto_claim(&self, owner: &OwnerId, now: u64) -> Result<Option<ClaimReceipt>, EngineError> {
        let Some(_guard) = self.locks.try_lock(owner) else {
            debug!(owner = %owner, "auto-claim skipped, owner busy");
            return Ok(None);
        };
        let Some(session) = self.store.fetch_active_session(owner).await? else {
            return Ok(None);
        };
        let live = session.live_accrued(now);
        if live < self.policy.auto_claim_threshold {
            return Ok(None);
        }
        let balance = self.store.fetch_balance(owner).await?;
        if balance.cooldown_remaining(now) > 0 {
            return Ok(None);
        }
        let amount = balance.claimable.saturating_add(live);
        let receipt = self.claim_locked(owner, amount, now).await?;
        info!(owner = %owner, amount = receipt.amount, "auto-claim");
        Ok(Some(receipt))
    }

    async fn claim_locked(&self, owner: &OwnerId, requested: u64, now: u64) -> Result<ClaimReceipt, EngineError> {
        if owner.is_pool() {
            return Err(ValidationError::ReservedOwner(owner.clone()).into());
        }
        let balance = self.store.fetch_balance(owner).await?;
        let remaining_secs = balance.cooldown_remaining(now);
        if remaining_secs > 0 {
            return Err(NotEligible::CooldownActive { remaining_secs }.into());
        }
        if requested == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }

        let mut session = self.store.fetch_active_session(owner).await?;
        if session.as_ref().is_some_and(|s| s.is_expired(now)) {
            self.sessions.rollover(owner, now).await?;
            session = self.store.fetch_active_session(owner).await?;
        }
        let live = session.as_ref().map_or(0, |s| s.live_accrued(now));
        let balance = self.store.fetch_balance(owner).await?;
        let available = balance.claimable.saturating_add(live);
        if available == 0 {
            return Err(NotEligible::NothingToClaim.into());
        }
        if requested > available {
            return Err(ValidationError::ExceedsAvailable { requested, available }.into());
        }

        let mut settled = 0;
        if let Some(session) = session.filter(|_| live > 0) {
            settled = self.sessions.settle_live(session, now).await?.amount;
        }

        let balance = self.store.fetch_balance(owner).await?;
        if requested > balance.claimable {
            return Err(ValidationError::ExceedsAvailable {
                requested,
                available: balance.claimable,
            }
            .into());
        }
        let event = EarningEvent::claim(owner, requested, now, balance.events_applied);
        self.ledger.record(&event).await?;

        let balance = self.store.fetch_balance(owner).await?;
        info!(owner = %owner, amount = requested, settled, claimable = balance.claimable, "claim");
        Ok(ClaimReceipt {
            amount: requested,
            settled,
            cooldown_until: balance.cooldown_until,
            balance,
        })
    }
}
