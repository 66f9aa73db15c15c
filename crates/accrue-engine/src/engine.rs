//! The reward engine: one entry point over sessions, settlement, ledger,
//! cycles and referrals.
//!
//! Every operation reads the store fresh; nothing about an owner is cached
//! in memory besides its lock slot. Mutations run under the owner's lock
//! and inside the retry policy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use accrue_core::accrual::AccrualCalculator;
use accrue_core::error::{EngineError, NotEligible, StoreError, ValidationError};
use accrue_core::policy::RewardPolicy;
use accrue_core::traits::{Clock, RewardStore, SystemClock};
use accrue_core::types::{
    Balance, Entitlements, Hash256, OwnerId, ReferralEdge, Session, Stake, StrategyKind, TeamMemberView,
};

use crate::cycle::CycleEnforcer;
use crate::ledger::{LedgerService, ReconcileOutcome, ReconcileReport};
use crate::locks::OwnerLocks;
use crate::referral::ReferralPropagator;
use crate::retry::RetryPolicy;
use crate::session::{RolloverOutcome, SessionManager, Settlement};
use crate::settlement::{ClaimReceipt, SettlementCoordinator};

/// What an observer sees for an owner at some instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualView {
    pub owner: OwnerId,
    /// Accrued in the active session and not yet settled.
    pub live_accrued: u64,
    /// Seconds until the active session ends (0 with no session).
    pub session_countdown: u64,
    pub claimable: u64,
    pub cooldown_remaining: u64,
    pub session_id: Option<Hash256>,
    pub strategy: Option<StrategyKind>,
}

/// Totals for one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub owners: usize,
    pub rolled_over: usize,
    pub auto_claims: usize,
    pub errors: usize,
}

pub struct RewardEngine {
    store: Arc<dyn RewardStore>,
    clock: Arc<dyn Clock>,
    policy: RewardPolicy,
    retry: RetryPolicy,
    locks: Arc<OwnerLocks>,
    ledger: Arc<LedgerService>,
    sessions: Arc<SessionManager>,
    settlement: SettlementCoordinator,
    referrals: ReferralPropagator,
}

impl RewardEngine {
    pub fn new(store: Arc<dyn RewardStore>, policy: RewardPolicy) -> Self {
        let locks = Arc::new(OwnerLocks::new());
        let ledger = Arc::new(LedgerService::new(store.clone(), &policy));
        let cycle = Arc::new(CycleEnforcer::new(store.clone(), ledger.clone(), policy.clone()));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            ledger.clone(),
            cycle,
            AccrualCalculator::new(policy.clone()),
        ));
        let settlement = SettlementCoordinator::new(
            store.clone(),
            ledger.clone(),
            sessions.clone(),
            locks.clone(),
            policy.clone(),
        );
        let referrals = ReferralPropagator::new(store.clone(), ledger.clone(), locks.clone(), policy.clone());
        Self {
            store,
            clock: Arc::new(SystemClock),
            policy,
            retry: RetryPolicy::default(),
            locks,
            ledger,
            sessions,
            settlement,
            referrals,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Current time from the engine's clock.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn RewardStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Live accrual, countdown, claimable balance and cooldown for `owner`.
    ///
    /// An expired session is rolled over if the owner's lock is free;
    /// otherwise the settled figure of the expired session is reported.
    pub async fn observe_accrual(&self, owner: &OwnerId, now: u64) -> Result<AccrualView, EngineError> {
        let mut session = self.store.fetch_active_session(owner).await?;
        if session.as_ref().is_some_and(|s| s.is_expired(now)) {
            if let Some(_guard) = self.locks.try_lock(owner) {
                let sessions = &self.sessions;
                self.retry
                    .run("rollover", move || sessions.rollover(owner, now))
                    .await?;
                session = self.store.fetch_active_session(owner).await?;
            } else {
                debug!(owner = %owner, "rollover in progress elsewhere, reporting settled figure");
            }
        }
        let balance = self.store.fetch_balance(owner).await?;
        Ok(AccrualView {
            owner: owner.clone(),
            live_accrued: session.as_ref().map_or(0, |s| s.live_accrued(now)),
            session_countdown: session.as_ref().map_or(0, |s| s.remaining_secs(now)),
            claimable: balance.claimable,
            cooldown_remaining: balance.cooldown_remaining(now),
            session_id: session.as_ref().map(|s| s.id),
            strategy: session.as_ref().map(|s| s.rate.strategy),
        })
    }

    pub async fn balance(&self, owner: &OwnerId) -> Result<Balance, EngineError> {
        Ok(self.store.fetch_balance(owner).await?)
    }

    pub async fn active_session(&self, owner: &OwnerId) -> Result<Option<Session>, EngineError> {
        Ok(self.store.fetch_active_session(owner).await?)
    }

    pub async fn stake(&self, owner: &OwnerId) -> Result<Option<Stake>, EngineError> {
        Ok(self.store.fetch_stake(owner).await?)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn start_session(&self, owner: &OwnerId, now: u64) -> Result<Session, EngineError> {
        let _guard = self.locks.lock(owner).await;
        let sessions = &self.sessions;
        self.retry.run("start_session", move || sessions.start(owner, now)).await
    }

    /// Roll the owner's session over if it has ended. Idempotent.
    pub async fn rollover_if_expired(&self, owner: &OwnerId, now: u64) -> Result<RolloverOutcome, EngineError> {
        let _guard = self.locks.lock(owner).await;
        let sessions = &self.sessions;
        self.retry.run("rollover", move || sessions.rollover(owner, now)).await
    }

    /// Settle and end the active session without a successor.
    pub async fn complete_session(&self, owner: &OwnerId, now: u64) -> Result<Settlement, EngineError> {
        let _guard = self.locks.lock(owner).await;
        let sessions = &self.sessions;
        self.retry
            .run("complete_session", move || sessions.manual_complete(owner, now))
            .await
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    pub async fn claim(&self, owner: &OwnerId, amount: u64, now: u64) -> Result<ClaimReceipt, EngineError> {
        let settlement = &self.settlement;
        self.retry
            .run("claim", move || settlement.claim(owner, amount, now))
            .await
    }

    pub async fn maybe_auto_claim(&self, owner: &OwnerId, now: u64) -> Result<Option<ClaimReceipt>, EngineError> {
        self.settlement.maybe_auto_claim(owner, now).await
    }

    // ------------------------------------------------------------------
    // Stakes and referrals
    // ------------------------------------------------------------------

    /// Open a stake. Replaying the same `deposit_ref` returns the stake it
    /// created. The sponsor, if any, is credited after the owner's lock is
    /// released.
    pub async fn deposit(
        &self,
        owner: &OwnerId,
        amount: u64,
        deposit_ref: &str,
        now: u64,
    ) -> Result<Stake, EngineError> {
        if owner.is_pool() {
            return Err(ValidationError::ReservedOwner(owner.clone()).into());
        }
        if amount == 0 {
            return Err(ValidationError::NonPositiveAmount.into());
        }
        if amount < self.policy.min_stake {
            return Err(ValidationError::BelowMinimum {
                amount,
                minimum: self.policy.min_stake,
            }
            .into());
        }

        let stake = self
            .retry
            .run("deposit", move || self.deposit_locked(owner, amount, deposit_ref, now))
            .await?;

        let referrals = &self.referrals;
        let trigger = &stake.id;
        let principal = stake.amount;
        self.retry
            .run("referral", move || referrals.on_qualifying_event(owner, principal, trigger, now))
            .await?;
        Ok(stake)
    }

    async fn deposit_locked(
        &self,
        owner: &OwnerId,
        amount: u64,
        deposit_ref: &str,
        now: u64,
    ) -> Result<Stake, EngineError> {
        let _guard = self.locks.lock(owner).await;
        let id = Stake::derive_id(owner, deposit_ref);
        if let Some(existing) = self.store.fetch_stake_by_id(&id).await? {
            debug!(owner = %owner, stake = %id, "deposit replayed");
            return Ok(existing);
        }
        if self.store.fetch_stake(owner).await?.is_some_and(|s| s.is_active) {
            return Err(NotEligible::StakeActive.into());
        }
        let stake = match self.store.update_stake(&Stake::new(owner.clone(), deposit_ref, amount, now)).await {
            Ok(s) => s,
            Err(e @ StoreError::VersionConflict { .. }) => return Err(EngineError::Conflict(e.to_string())),
            Err(e) => return Err(e.into()),
        };
        info!(owner = %owner, stake = %stake.id, amount, "stake opened");
        Ok(stake)
    }

    pub async fn register_referral(
        &self,
        sponsor: &OwnerId,
        referred: &OwnerId,
        now: u64,
    ) -> Result<ReferralEdge, EngineError> {
        let referrals = &self.referrals;
        self.retry
            .run("register_referral", move || referrals.register(sponsor, referred, now))
            .await
    }

    pub async fn team(&self, sponsor: &OwnerId) -> Result<Vec<TeamMemberView>, EngineError> {
        self.referrals.team(sponsor).await
    }

    // ------------------------------------------------------------------
    // Entitlements
    // ------------------------------------------------------------------

    pub async fn entitlements(&self, owner: &OwnerId) -> Result<Entitlements, EngineError> {
        Ok(self.store.fetch_entitlements(owner).await?)
    }

    /// Replace an owner's entitlements. Takes effect at the next session.
    pub async fn set_entitlements(&self, entitlements: &Entitlements) -> Result<(), EngineError> {
        if entitlements.owner.is_pool() {
            return Err(ValidationError::ReservedOwner(entitlements.owner.clone()).into());
        }
        let _guard = self.locks.lock(&entitlements.owner).await;
        self.store.put_entitlements(entitlements).await?;
        info!(owner = %entitlements.owner, "entitlements updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reconciliation and maintenance
    // ------------------------------------------------------------------

    pub async fn reconcile(&self, owner: &OwnerId, now: u64) -> Result<ReconcileOutcome, EngineError> {
        let _guard = self.locks.lock(owner).await;
        let ledger = &self.ledger;
        self.retry.run("reconcile", move || ledger.reconcile(owner, now)).await
    }

    /// Reconcile every known owner, one lock at a time.
    pub async fn reconcile_all(&self, now: u64) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();
        for owner in self.store.owners().await? {
            report.owners_checked += 1;
            match self.reconcile(&owner, now).await {
                Ok(ReconcileOutcome::Consistent) => {}
                Ok(ReconcileOutcome::Refreshed) => report.refreshed += 1,
                Ok(ReconcileOutcome::Corrected(_)) => report.corrected += 1,
                Err(e) => {
                    warn!(owner = %owner, "reconcile failed: {e}");
                    report.failed += 1;
                }
            }
        }
        if report.corrected > 0 {
            info!(corrected = report.corrected, owners = report.owners_checked, "reconciliation pass");
        }
        Ok(report)
    }

    /// One maintenance pass: roll over expired sessions and fire
    /// threshold auto-claims for every owner.
    pub async fn tick(&self, now: u64) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();
        for owner in self.store.owners().await? {
            if owner.is_pool() {
                continue;
            }
            report.owners += 1;
            match self.rollover_if_expired(&owner, now).await {
                Ok(RolloverOutcome::RolledOver { .. }) => report.rolled_over += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(owner = %owner, "rollover failed: {e}");
                    report.errors += 1;
                    continue;
                }
            }
            match self.maybe_auto_claim(&owner, now).await {
                Ok(Some(_)) => report.auto_claims += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(owner = %owner, "auto-claim failed: {e}");
                    report.errors += 1;
                }
            }
        }
        self.locks.prune();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrue_core::constants::{MIN_STAKE, UNIT};
    use accrue_core::memory_store::MemoryStore;
    use accrue_core::traits::ManualClock;
    use accrue_core::types::{EventKind, ReferralStatus};

    const T0: u64 = 1_700_000_000;
    const DAY: u64 = 86_400;

    fn engine() -> (Arc<MemoryStore>, RewardEngine) {
        let store = Arc::new(MemoryStore::new());
        let engine = RewardEngine::new(store.clone(), RewardPolicy::default())
            .with_clock(Arc::new(ManualClock::new(T0)))
            .with_retry(RetryPolicy::immediate(3));
        (store, engine)
    }

    fn alice() -> OwnerId {
        OwnerId::new("alice")
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn observe_without_session_is_zero() {
        let (_store, engine) = engine();
        let v = engine.observe_accrual(&alice(), T0).await.unwrap();
        assert_eq!(v.live_accrued, 0);
        assert_eq!(v.session_countdown, 0);
        assert_eq!(v.session_id, None);
    }

    #[tokio::test]
    async fn observe_rolls_over_expired_session() {
        let (store, engine) = engine();
        let first = engine.start_session(&alice(), T0).await.unwrap();
        let v = engine.observe_accrual(&alice(), T0 + DAY + 60).await.unwrap();
        assert_eq!(v.claimable, 50 * UNIT);
        assert_ne!(v.session_id, Some(first.id));
        assert_eq!(v.session_countdown, DAY);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn observe_with_busy_owner_reports_settled_figure() {
        let (store, engine) = engine();
        engine.start_session(&alice(), T0).await.unwrap();
        let _held = engine.locks.lock(&alice()).await;
        let v = engine.observe_accrual(&alice(), T0 + DAY + 60).await.unwrap();
        assert_eq!(v.live_accrued, 50 * UNIT);
        assert_eq!(v.session_countdown, 0);
        assert_eq!(store.event_count(), 0);
    }

    // ------------------------------------------------------------------
    // Deposits
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn deposit_validates_amount() {
        let (_store, engine) = engine();
        assert_eq!(
            engine.deposit(&alice(), 0, "d", T0).await.unwrap_err(),
            EngineError::Validation(ValidationError::NonPositiveAmount)
        );
        assert_eq!(
            engine.deposit(&alice(), MIN_STAKE - 1, "d", T0).await.unwrap_err(),
            EngineError::Validation(ValidationError::BelowMinimum {
                amount: MIN_STAKE - 1,
                minimum: MIN_STAKE
            })
        );
        assert!(matches!(
            engine.deposit(&OwnerId::pool(), UNIT, "d", T0).await.unwrap_err(),
            EngineError::Validation(ValidationError::ReservedOwner(_))
        ));
    }

    #[tokio::test]
    async fn deposit_is_idempotent_and_exclusive() {
        let (_store, engine) = engine();
        let a = engine.deposit(&alice(), 100 * UNIT, "d1", T0).await.unwrap();
        let b = engine.deposit(&alice(), 100 * UNIT, "d1", T0 + 5).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            engine.deposit(&alice(), 100 * UNIT, "d2", T0).await.unwrap_err(),
            EngineError::NotEligible(NotEligible::StakeActive)
        );
    }

    #[tokio::test]
    async fn deposit_switches_next_session_to_stake_strategy() {
        let (_store, engine) = engine();
        engine.deposit(&alice(), 100 * UNIT, "d1", T0).await.unwrap();
        let s = engine.start_session(&alice(), T0).await.unwrap();
        assert_eq!(s.rate.strategy, StrategyKind::PercentageOfStake);
        assert_eq!(s.rate.daily_rate, UNIT);
    }

    #[tokio::test]
    async fn deposit_pays_sponsor_once() {
        let (store, engine) = engine();
        engine.register_referral(&"sponsor".into(), &alice(), T0).await.unwrap();
        engine.deposit(&alice(), 100 * UNIT, "d1", T0).await.unwrap();
        engine.deposit(&alice(), 100 * UNIT, "d1", T0 + 1).await.unwrap();

        let sponsor = engine.balance(&"sponsor".into()).await.unwrap();
        assert_eq!(sponsor.total_earned, 5 * UNIT);
        let events = store.events_for_owner(&"sponsor".into()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ReferralBonus);

        let team = engine.team(&"sponsor".into()).await.unwrap();
        assert_eq!(team.len(), 1);
        assert_eq!(team[0].status, ReferralStatus::Active);
    }

    // ------------------------------------------------------------------
    // Entitlements and maintenance
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn rig_upgrade_raises_next_session_rate() {
        let (_store, engine) = engine();
        let mut e = engine.entitlements(&alice()).await.unwrap();
        e.rate_multiplier_bps = 12_500;
        engine.set_entitlements(&e).await.unwrap();
        let s = engine.start_session(&alice(), T0).await.unwrap();
        assert_eq!(s.rate.daily_rate, 62 * UNIT + UNIT / 2);
    }

    #[tokio::test]
    async fn tick_rolls_over_and_auto_claims() {
        let (_store, engine) = engine();
        engine.start_session(&alice(), T0).await.unwrap();
        engine.start_session(&"bob".into(), T0 + DAY / 2).await.unwrap();

        let report = engine.tick(T0 + DAY + 10).await.unwrap();
        assert_eq!(report.owners, 2);
        assert_eq!(report.rolled_over, 1);
        // Bob has accrued past the threshold; Alice's new session has not.
        assert_eq!(report.auto_claims, 1);
        assert_eq!(report.errors, 0);

        let bob = engine.balance(&"bob".into()).await.unwrap();
        assert!(bob.claimed >= 10 * UNIT);
        let alice_balance = engine.balance(&alice()).await.unwrap();
        assert_eq!(alice_balance.claimable, 50 * UNIT);
    }

    #[tokio::test]
    async fn reconcile_all_is_clean_after_normal_activity() {
        let (_store, engine) = engine();
        engine.start_session(&alice(), T0).await.unwrap();
        engine.claim(&alice(), 10 * UNIT, T0 + DAY / 2).await.unwrap();
        let report = engine.reconcile_all(T0 + DAY).await.unwrap();
        assert_eq!(report.corrected, 0);
        assert_eq!(report.refreshed, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn reconcile_all_counts_corrections() {
        let (store, engine) = engine();
        engine.start_session(&alice(), T0).await.unwrap();
        engine.rollover_if_expired(&alice(), T0 + DAY).await.unwrap();
        let mut b = store.fetch_balance(&alice()).await.unwrap();
        b.claimable = 0;
        store.force_balance(b);

        let report = engine.reconcile_all(T0 + DAY + 1).await.unwrap();
        assert_eq!(report.corrected, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.owners_checked, 1);
    }

    #[tokio::test]
    async fn engine_clock_is_injectable() {
        let (_store, engine) = engine();
        assert_eq!(engine.now(), T0);
    }
}
