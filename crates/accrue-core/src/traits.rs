//! Trait interfaces for the accrue engine.
//!
//! - [`RewardStore`]: persistence of sessions, events, balances, stakes and
//!   referrals (accrue-core ships [`MemoryStore`](crate::memory_store::MemoryStore),
//!   accrue-node ships a RocksDB implementation)
//! - [`Clock`]: source of "now", so tests can drive time explicitly

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StoreError;
use crate::types::{
    Balance, Discrepancy, EarningEvent, Entitlements, Hash256, OwnerId, ReferralEdge, Session, Stake,
};

/// Durable state behind the engine.
///
/// Every versioned write is a compare-and-swap: the entity passed in carries
/// the version the caller read (0 for a new entity), the store rejects the
/// write with [`StoreError::VersionConflict`] if the stored version differs,
/// and returns the committed copy with its version incremented.
#[async_trait]
pub trait RewardStore: Send + Sync {
    // --- sessions ---

    /// The owner's `Active` session, if any.
    async fn fetch_active_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError>;

    /// A session by id, in any status.
    async fn fetch_session(&self, id: &Hash256) -> Result<Option<Session>, StoreError>;

    /// The owner's most recently created session, in any status.
    async fn fetch_latest_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError>;

    /// Insert a new `Active` session.
    ///
    /// Fails with [`StoreError::SessionExists`] if the owner already has an
    /// active session or a session with this id exists.
    async fn create_session(&self, session: &Session) -> Result<Session, StoreError>;

    /// CAS update. Moving a session out of `Active` releases the owner's
    /// active slot.
    async fn update_session(&self, session: &Session) -> Result<Session, StoreError>;

    // --- events ---

    /// Append an event. Returns `false` if an event with this id already
    /// exists, in which case nothing is written.
    async fn append_earning_event(&self, event: &EarningEvent) -> Result<bool, StoreError>;

    async fn fetch_earning_event(&self, id: &Hash256) -> Result<Option<EarningEvent>, StoreError>;

    /// All of an owner's events in append order.
    async fn events_for_owner(&self, owner: &OwnerId) -> Result<Vec<EarningEvent>, StoreError>;

    // --- balances ---

    /// Cached balance, or a zero balance at version 0.
    async fn fetch_balance(&self, owner: &OwnerId) -> Result<Balance, StoreError>;

    /// CAS update of the cached balance.
    async fn store_balance(&self, balance: &Balance) -> Result<Balance, StoreError>;

    // --- stakes ---

    /// The owner's current (most recently deposited) stake.
    async fn fetch_stake(&self, owner: &OwnerId) -> Result<Option<Stake>, StoreError>;

    async fn fetch_stake_by_id(&self, id: &Hash256) -> Result<Option<Stake>, StoreError>;

    /// CAS update. Writing a version-0 stake creates it and makes it the
    /// owner's current stake.
    async fn update_stake(&self, stake: &Stake) -> Result<Stake, StoreError>;

    // --- referrals ---

    /// The edge whose referred owner is `referred`.
    async fn fetch_referral_edge(&self, referred: &OwnerId) -> Result<Option<ReferralEdge>, StoreError>;

    /// Insert or replace an edge.
    async fn put_referral_edge(&self, edge: &ReferralEdge) -> Result<(), StoreError>;

    /// Number of `Active` edges sponsored by `sponsor`.
    async fn fetch_referral_count(&self, sponsor: &OwnerId) -> Result<u32, StoreError>;

    /// Every edge sponsored by `sponsor`, ordered by referred owner.
    async fn referrals_of(&self, sponsor: &OwnerId) -> Result<Vec<ReferralEdge>, StoreError>;

    // --- entitlements ---

    /// Stored entitlements, or the defaults for a new owner.
    async fn fetch_entitlements(&self, owner: &OwnerId) -> Result<Entitlements, StoreError>;

    async fn put_entitlements(&self, entitlements: &Entitlements) -> Result<(), StoreError>;

    // --- reconciliation ---

    async fn record_discrepancy(&self, discrepancy: &Discrepancy) -> Result<(), StoreError>;

    async fn discrepancies(&self, owner: &OwnerId) -> Result<Vec<Discrepancy>, StoreError>;

    /// Every owner with any stored state, sorted.
    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError>;
}

/// Source of the current Unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
