//! In-memory [`RewardStore`] for tests and embedding.
//!
//! All state lives behind one `parking_lot::RwLock`, so each trait call is
//! atomic with respect to every other call. Version checks behave exactly
//! like the persistent store's.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

use crate::error::StoreError;
use crate::traits::RewardStore;
use crate::types::{
    Balance, Discrepancy, EarningEvent, Entitlements, Hash256, OwnerId, ReferralEdge, ReferralStatus,
    Session, Stake,
};

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<Hash256, Session>,
    /// Owner → id of its `Active` session.
    active_sessions: HashMap<OwnerId, Hash256>,
    /// Owner → id of its most recently created session.
    latest_sessions: HashMap<OwnerId, Hash256>,
    events: HashMap<Hash256, EarningEvent>,
    /// Owner → event ids in append order.
    owner_events: HashMap<OwnerId, Vec<Hash256>>,
    balances: HashMap<OwnerId, Balance>,
    stakes: HashMap<Hash256, Stake>,
    /// Owner → id of its current stake.
    owner_stake: HashMap<OwnerId, Hash256>,
    /// Referred owner → edge.
    referrals: HashMap<OwnerId, ReferralEdge>,
    entitlements: HashMap<OwnerId, Entitlements>,
    discrepancies: HashMap<OwnerId, Vec<Discrepancy>>,
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events across all owners.
    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }

    /// Total number of sessions ever created, in any status.
    pub fn session_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Overwrite a cached balance without a version check.
    ///
    /// Only useful for simulating drift.
    pub fn force_balance(&self, balance: Balance) {
        self.inner.write().balances.insert(balance.owner.clone(), balance);
    }
}

fn check_version(entity: &'static str, expected: u64, found: u64) -> Result<(), StoreError> {
    if expected != found {
        return Err(StoreError::VersionConflict { entity, expected, found });
    }
    Ok(())
}

#[async_trait]
impl RewardStore for MemoryStore {
    async fn fetch_active_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .active_sessions
            .get(owner)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn fetch_session(&self, id: &Hash256) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.read().sessions.get(id).cloned())
    }

    async fn fetch_latest_session(&self, owner: &OwnerId) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .latest_sessions
            .get(owner)
            .and_then(|id| inner.sessions.get(id))
            .cloned())
    }

    async fn create_session(&self, session: &Session) -> Result<Session, StoreError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.active_sessions.get(&session.owner) {
            return Err(StoreError::SessionExists {
                owner: session.owner.clone(),
                existing: *existing,
            });
        }
        if inner.sessions.contains_key(&session.id) {
            return Err(StoreError::SessionExists {
                owner: session.owner.clone(),
                existing: session.id,
            });
        }
        let mut committed = session.clone();
        committed.version = 1;
        if committed.is_active() {
            inner.active_sessions.insert(committed.owner.clone(), committed.id);
        }
        inner.latest_sessions.insert(committed.owner.clone(), committed.id);
        inner.sessions.insert(committed.id, committed.clone());
        Ok(committed)
    }

    async fn update_session(&self, session: &Session) -> Result<Session, StoreError> {
        let mut inner = self.inner.write();
        let stored = inner
            .sessions
            .get(&session.id)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown session {}", session.id)))?;
        check_version("session", session.version, stored.version)?;

        let mut committed = session.clone();
        committed.version += 1;
        if !committed.is_active() && inner.active_sessions.get(&committed.owner) == Some(&committed.id) {
            inner.active_sessions.remove(&committed.owner);
        }
        inner.sessions.insert(committed.id, committed.clone());
        Ok(committed)
    }

    async fn append_earning_event(&self, event: &EarningEvent) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if inner.events.contains_key(&event.id) {
            return Ok(false);
        }
        inner.events.insert(event.id, event.clone());
        inner.owner_events.entry(event.owner.clone()).or_default().push(event.id);
        Ok(true)
    }

    async fn fetch_earning_event(&self, id: &Hash256) -> Result<Option<EarningEvent>, StoreError> {
        Ok(self.inner.read().events.get(id).cloned())
    }

    async fn events_for_owner(&self, owner: &OwnerId) -> Result<Vec<EarningEvent>, StoreError> {
        let inner = self.inner.read();
        let Some(ids) = inner.owner_events.get(owner) else {
            return Ok(Vec::new());
        };
        ids.iter()
            .map(|id| {
                inner
                    .events
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::Corrupt(format!("dangling event index {id}")))
            })
            .collect()
    }

    async fn fetch_balance(&self, owner: &OwnerId) -> Result<Balance, StoreError> {
        Ok(self
            .inner
            .read()
            .balances
            .get(owner)
            .cloned()
            .unwrap_or_else(|| Balance::new(owner.clone())))
    }

    async fn store_balance(&self, balance: &Balance) -> Result<Balance, StoreError> {
        let mut inner = self.inner.write();
        let found = inner.balances.get(&balance.owner).map(|b| b.version).unwrap_or(0);
        check_version("balance", balance.version, found)?;
        let mut committed = balance.clone();
        committed.version += 1;
        inner.balances.insert(committed.owner.clone(), committed.clone());
        Ok(committed)
    }

    async fn fetch_stake(&self, owner: &OwnerId) -> Result<Option<Stake>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .owner_stake
            .get(owner)
            .and_then(|id| inner.stakes.get(id))
            .cloned())
    }

    async fn fetch_stake_by_id(&self, id: &Hash256) -> Result<Option<Stake>, StoreError> {
        Ok(self.inner.read().stakes.get(id).cloned())
    }

    async fn update_stake(&self, stake: &Stake) -> Result<Stake, StoreError> {
        let mut inner = self.inner.write();
        let found = inner.stakes.get(&stake.id).map(|s| s.version).unwrap_or(0);
        check_version("stake", stake.version, found)?;
        let mut committed = stake.clone();
        committed.version += 1;
        if stake.version == 0 {
            inner.owner_stake.insert(committed.owner.clone(), committed.id);
        }
        inner.stakes.insert(committed.id, committed.clone());
        Ok(committed)
    }

    async fn fetch_referral_edge(&self, referred: &OwnerId) -> Result<Option<ReferralEdge>, StoreError> {
        Ok(self.inner.read().referrals.get(referred).cloned())
    }

    async fn put_referral_edge(&self, edge: &ReferralEdge) -> Result<(), StoreError> {
        self.inner.write().referrals.insert(edge.referred.clone(), edge.clone());
        Ok(())
    }

    async fn fetch_referral_count(&self, sponsor: &OwnerId) -> Result<u32, StoreError> {
        let count = self
            .inner
            .read()
            .referrals
            .values()
            .filter(|e| &e.sponsor == sponsor && e.status == ReferralStatus::Active)
            .count();
        Ok(count as u32)
    }

    async fn referrals_of(&self, sponsor: &OwnerId) -> Result<Vec<ReferralEdge>, StoreError> {
        let mut edges: Vec<_> = self
            .inner
            .read()
            .referrals
            .values()
            .filter(|e| &e.sponsor == sponsor)
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.referred.cmp(&b.referred));
        Ok(edges)
    }

    async fn fetch_entitlements(&self, owner: &OwnerId) -> Result<Entitlements, StoreError> {
        Ok(self
            .inner
            .read()
            .entitlements
            .get(owner)
            .cloned()
            .unwrap_or_else(|| Entitlements::new(owner.clone())))
    }

    async fn put_entitlements(&self, entitlements: &Entitlements) -> Result<(), StoreError> {
        self.inner
            .write()
            .entitlements
            .insert(entitlements.owner.clone(), entitlements.clone());
        Ok(())
    }

    async fn record_discrepancy(&self, discrepancy: &Discrepancy) -> Result<(), StoreError> {
        self.inner
            .write()
            .discrepancies
            .entry(discrepancy.owner.clone())
            .or_default()
            .push(discrepancy.clone());
        Ok(())
    }

    async fn discrepancies(&self, owner: &OwnerId) -> Result<Vec<Discrepancy>, StoreError> {
        Ok(self.inner.read().discrepancies.get(owner).cloned().unwrap_or_default())
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, StoreError> {
        let inner = self.inner.read();
        let mut set = BTreeSet::new();
        set.extend(inner.balances.keys().cloned());
        set.extend(inner.active_sessions.keys().cloned());
        set.extend(inner.latest_sessions.keys().cloned());
        set.extend(inner.owner_stake.keys().cloned());
        set.extend(inner.owner_events.keys().cloned());
        set.extend(inner.entitlements.keys().cloned());
        for edge in inner.referrals.values() {
            set.insert(edge.sponsor.clone());
            set.insert(edge.referred.clone());
        }
        Ok(set.into_iter().collect())
    }
}
