//! Shared fixtures for the integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use accrue_core::error::StoreError;
use accrue_core::memory_store::MemoryStore;
use accrue_core::policy::RewardPolicy;
use accrue_core::traits::{ManualClock, RewardStore};
use accrue_core::types::{
    Balance, Discrepancy, EarningEvent, Entitlements, EventKind, Hash256, OwnerId, ReferralEdge, Session,
    Stake,
};
use accrue_engine::{RetryPolicy, RewardEngine};

/// 2023-11-14T22:13:20Z.
pub const T0: u64 = 1_700_000_000;
pub const HOUR: u64 = 3_600;
pub const DAY: u64 = 86_400;

pub fn owner(name: &str) -> OwnerId {
    OwnerId::new(name)
}

/// An engine over a [`MemoryStore`] with a manual clock and sleep-free retries.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub engine: Arc<RewardEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(RewardPolicy::default())
    }

    pub fn with_policy(policy: RewardPolicy) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let engine = Arc::new(engine_over(store.clone(), clock.clone(), policy));
        Self { store, clock, engine }
    }

    /// A second engine over the same store, with its own owner locks.
    /// Stands in for another process.
    pub fn peer(&self) -> Arc<RewardEngine> {
        Arc::new(engine_over(
            self.store.clone(),
            self.clock.clone(),
            self.engine.policy().clone(),
        ))
    }

    pub fn now(&self) -> u64 {
        self.engine.now()
    }

    pub async fn events_of(&self, owner: &OwnerId, kind: EventKind) -> Vec<EarningEvent> {
        self.store
            .events_for_owner(owner)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Sum of the owner's events that count toward lifetime earnings.
    pub async fn earned_from_events(&self, owner: &OwnerId) -> u64 {
        self.store
            .events_for_owner(owner)
            .await
            .unwrap_or_default()
            .iter()
            .filter(|e| e.kind.contributes_to_earnings())
            .map(|e| e.amount)
            .sum()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn engine_over(store: Arc<dyn RewardStore>, clock: Arc<ManualClock>, policy: RewardPolicy) -> RewardEngine {
    RewardEngine::new(store, policy)
        .with_clock(clock)
        .with_retry(RetryPolicy::immediate(4))
}

/// A policy where a 100-unit stake earns its full principal each day, so a
/// cycle completes in three sessions.
pub fn fast_cycle_policy() -> RewardPolicy {
    RewardPolicy {
        roi_tiers_bps: vec![10_000],
        time_multiplier_week_bps: 10_000,
        time_multiplier_month_bps: 10_000,
        time_multiplier_long_bps: 10_000,
        stake_daily_cap_bps: 10_000,
        global_daily_max: u64::MAX,
        base_session_cap: u64::MAX / 4,
        ..RewardPolicy::default()
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// Wraps a store and fails selected calls with [`StoreError::Transient`].
pub struct FlakyStore {
    inner: Arc<dyn RewardStore>,
    fail_any: AtomicU32,
    fail_session_updates: AtomicU32,
    fail_session_creates: AtomicU32,
    fail_stake_updates: AtomicU32,
    fail_entitlement_writes: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn RewardStore>) -> Self {
        Self {
            inner,
            fail_any: AtomicU32::new(0),
            fail_session_updates: AtomicU32::new(0),
            fail_session_creates: AtomicU32::new(0),
            fail_stake_updates: AtomicU32::new(0),
            fail_entitlement_writes: AtomicU32::new(0),
        }
    }

    /// Fail the next `n` calls of any kind.
    pub fn fail_next(&self, n: u32) {
        self.fail_any.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `update_session` calls; everything else succeeds.
    pub fn fail_session_updates(&self, n: u32) {
        self.fail_session_updates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `create_session` calls.
    pub fn fail_session_creates(&self, n: u32) {
        self.fail_session_creates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `update_stake` calls.
    pub fn fail_stake_updates(&self, n: u32) {
        self.fail_stake_updates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `put_entitlements` calls.
    pub fn fail_entitlement_writes(&self, n: u32) {
        self.fail_entitlement_writes.store(n, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicU32, what: &str) -> Result<(), StoreError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StoreError::Transient(format!("injected failure in {what}")));
        }
        Ok(())
    }

    fn check(&self, what: &str) -> Result<(), StoreError> {
        Self::trip(&self.fail_any, what)
    }
}

#[async_trait]
impl RewardStore for FlakyStore {
    async fn fetch_active_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError> {
        self.check("fetch_active_session")?;
        self.inner.fetch_active_session(owner).await
    }

    async fn fetch_session(&self, id: &Hash256) -> Result<Option<Session>, StoreError> {
        self.check("fetch_session")?;
        self.inner.fetch_session(id).await
    }

    async fn fetch_latest_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError> {
        self.check("fetch_latest_session")?;
        self.inner.fetch_latest_session(owner).await
    }

    async fn create_session(&self, session: &Session) -> Result<Session, StoreError> {
        self.check("create_session")?;
        Self::trip(&self.fail_session_creates, "create_session")?;
        self.inner.create_session(session).await
    }

    async fn update_session(&self, session: &Session) -> Result<Session, StoreError> {
        self.check("update_session")?;
        Self::trip(&self.fail_session_updates, "update_session")?;
        self.inner.update_session(session).await
    }

    async fn append_earning_event(&self, event: &EarningEvent) -> Result<bool, StoreError> {
        self.check("append_earning_event")?;
        self.inner.append_earning_event(event).await
    }

    async fn fetch_earning_event(&self, id: &Hash256) -> Result<Option<EarningEvent>, StoreError> {
        self.check("fetch_earning_event")?;
        self.inner.fetch_earning_event(id).await
    }

    async fn events_for_owner(&self, owner: &OwnerId) -> Result<Vec<EarningEvent>, StoreError> {
        self.check("events_for_owner")?;
        self.inner.events_for_owner(owner).await
    }

    async fn fetch_balance(&self, owner: &OwnerId) -> Result<Balance, StoreError> {
        self.check("fetch_balance")?;
        self.inner.fetch_balance(owner).await
    }

    async fn store_balance(&self, balance: &Balance) -> Result<Balance, StoreError> {
        self.check("store_balance")?;
        self.inner.store_balance(balance).await
    }

    async fn fetch_stake(&self, owner: &OwnerId) -> Result<Option<Stake>, StoreError> {
        self.check("fetch_stake")?;
        self.inner.fetch_stake(owner).await
    }

    async fn fetch_stake_by_id(&self, id: &Hash256) -> Result<Option<Stake>, StoreError> {
        self.check("fetch_stake_by_id")?;
        self.inner.fetch_stake_by_id(id).await
    }

    async fn update_stake(&self, stake: &Stake) -> Result<Stake, StoreError> {
        self.check("update_stake")?;
        Self::trip(&self.fail_stake_updates, "update_stake")?;
        self.inner.update_stake(stake).await
    }

    async fn fetch_referral_edge(&self, referred: &OwnerId) -> Result<Option<ReferralEdge>, StoreError> {
        self.check("fetch_referral_edge")?;
        self.inner.fetch_referral_edge(referred).await
    }

    async fn put_referral_edge(&self, edge: &ReferralEdge) -> Result<(), StoreError> {
        self.check("put_referral_edge")?;
        self.inner.put_referral_edge(edge).await
    }

    async fn fetch_referral_count(&self, sponsor: &OwnerId) -> Result<u32, StoreError> {
        self.check("fetch_referral_count")?;
        self.inner.fetch_referral_count(sponsor).await
    }

    async fn referrals_of(&self, sponsor: &OwnerId) -> Result<Vec<ReferralEdge>, StoreError> {
        self.check("referrals_of")?;
        self.inner.referrals_of(sponsor).await
    }

    async fn fetch_entitlements(&self, owner: &OwnerId) -> Result<Entitlements, StoreError> {
        self.check("fetch_entitlements")?;
        self.inner.fetch_entitlements(owner).await
    }

    async fn put_entitlements(&self, entitlements: &Entitlements) -> Result<(), StoreError> {
        self.check("put_entitlements")?;
        Self::trip(&self.fail_entitlement_writes, "put_entitlements")?;
        self.inner.put_entitlements(entitlements).await
    }

    async fn record_discrepancy(&self, discrepancy: &Discrepancy) -> Result<(), StoreError> {
        self.check("record_discrepancy")?;
        self.inner.record_discrepancy(discrepancy).await
    }

    async fn discrepancies(&self, owner: &OwnerId) -> Result<Vec<Discrepancy>, StoreError> {
        self.check("discrepancies")?;
        self.inner.discrepancies(owner).await
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        self.check("owners")?;
        self.inner.owners().await
    }
}
