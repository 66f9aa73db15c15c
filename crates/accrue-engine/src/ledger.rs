//! Ledger and reconciliation service.
//!
//! Every balance change goes through [`LedgerService::record`]: the event is
//! validated against the cached balance, appended, and folded into the
//! cache. Reconciliation recomputes the fold over the full event history
//! and overwrites the cache when they disagree.

use std::sync::Arc;

use tracing::{debug, info, warn};

use accrue_core::error::{EngineError, StoreError};
use accrue_core::ledger::{apply_event, diff_balances, fold_events, needs_refresh};
use accrue_core::policy::RewardPolicy;
use accrue_core::traits::RewardStore;
use accrue_core::types::{Balance, Discrepancy, EarningEvent, OwnerId};

/// Result of reconciling one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Cache matched the fold.
    Consistent,
    /// Cache lagged the fold by less than the reporting threshold (for
    /// example a missed event fold after a crash) and was refreshed.
    Refreshed,
    /// Drift beyond the threshold was recorded and corrected.
    Corrected(Vec<Discrepancy>),
}

impl ReconcileOutcome {
    pub fn drift_detected(&self) -> bool {
        matches!(self, Self::Corrected(_))
    }
}

/// Totals for a full reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub owners_checked: usize,
    pub refreshed: usize,
    pub corrected: usize,
    pub failed: usize,
}

pub struct LedgerService {
    store: Arc<dyn RewardStore>,
    cooldown_secs: u64,
    epsilon: u64,
}

impl LedgerService {
    pub fn new(store: Arc<dyn RewardStore>, policy: &RewardPolicy) -> Self {
        Self {
            store,
            cooldown_secs: policy.claim_cooldown_secs,
            epsilon: policy.reconcile_epsilon,
        }
    }

    /// Append `event` and fold it into the owner's cached balance.
    ///
    /// Returns `true` if the event was new. A duplicate id writes nothing;
    /// the cache is then brought level with the ledger in case an earlier
    /// attempt appended the event but never folded it.
    pub async fn record(&self, event: &EarningEvent) -> Result<bool, EngineError> {
        let mut next = self.store.fetch_balance(&event.owner).await?;
        apply_event(&mut next, event, self.cooldown_secs)?;

        if !self.store.append_earning_event(event).await? {
            debug!(owner = %event.owner, id = %event.id, kind = event.kind.name(), "duplicate event ignored");
            self.refresh(&event.owner).await?;
            return Ok(false);
        }

        match self.store.store_balance(&next).await {
            Ok(_) => {}
            Err(StoreError::VersionConflict { .. }) => {
                // Someone else folded in between; rebuild from the ledger.
                self.refresh(&event.owner).await?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(owner = %event.owner, kind = event.kind.name(), amount = event.amount, "event recorded");
        Ok(true)
    }

    /// Recompute the fold and overwrite the cache if it differs at all.
    pub async fn refresh(&self, owner: &OwnerId) -> Result<Balance, EngineError> {
        for _ in 0..2 {
            let (cached, events) = self.load(owner).await?;
            let computed = self.fold(owner, &events)?;
            if !needs_refresh(&cached, &computed) {
                return Ok(cached);
            }
            match self.store.store_balance(&with_version(computed, cached.version)).await {
                Ok(b) => return Ok(b),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(format!("balance of {owner} kept changing during refresh")))
    }

    /// Compare the cache with the fold, record drift, and correct it.
    ///
    /// Drift is measured against the fold of the events the cache claims
    /// to have applied; events appended after those are folded in without
    /// being reported, since another writer may still be folding them.
    pub async fn reconcile(&self, owner: &OwnerId, now: u64) -> Result<ReconcileOutcome, EngineError> {
        let (cached, events) = self.load(owner).await?;
        let computed = self.fold(owner, &events)?;
        if !needs_refresh(&cached, &computed) {
            return Ok(ReconcileOutcome::Consistent);
        }

        let applied = usize::try_from(cached.events_applied).unwrap_or(usize::MAX);
        let reference = if applied < events.len() {
            self.fold(owner, &events[..applied])?
        } else {
            computed.clone()
        };
        let drift = diff_balances(&cached, &reference, self.epsilon, now);
        for d in &drift {
            warn!(
                owner = %owner,
                field = ?d.field,
                cached = d.cached,
                computed = d.computed,
                "DriftDetected"
            );
            self.store.record_discrepancy(d).await?;
        }
        self.store
            .store_balance(&with_version(computed, cached.version))
            .await?;

        if drift.is_empty() {
            debug!(owner = %owner, "balance cache refreshed");
            Ok(ReconcileOutcome::Refreshed)
        } else {
            info!(owner = %owner, fields = drift.len(), "balance corrected from ledger");
            Ok(ReconcileOutcome::Corrected(drift))
        }
    }

    async fn load(&self, owner: &OwnerId) -> Result<(Balance, Vec<EarningEvent>), EngineError> {
        let cached = self.store.fetch_balance(owner).await?;
        let events = self.store.events_for_owner(owner).await?;
        Ok((cached, events))
    }

    fn fold(&self, owner: &OwnerId, events: &[EarningEvent]) -> Result<Balance, EngineError> {
        fold_events(owner, events, self.cooldown_secs)
            .map_err(|e| EngineError::Store(format!("ledger for {owner} does not fold: {e}")))
    }
}

fn with_version(mut balance: Balance, version: u64) -> Balance {
    balance.version = version;
    balance
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrue_core::constants::UNIT;
    use accrue_core::error::ValidationError;
    use accrue_core::memory_store::MemoryStore;
    use accrue_core::types::{BalanceField, Hash256};

    fn setup() -> (Arc<MemoryStore>, LedgerService) {
        let store = Arc::new(MemoryStore::new());
        let ledger = LedgerService::new(store.clone(), &RewardPolicy::default());
        (store, ledger)
    }

    fn bonus(owner: &str, n: u8, amount: u64) -> EarningEvent {
        let trigger = Hash256::derive("test", &[&[n]]);
        EarningEvent::referral_bonus(&owner.into(), &"referred".into(), &trigger, amount, 10)
    }

    // ------------------------------------------------------------------
    // record
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn record_appends_and_folds() {
        let (store, ledger) = setup();
        assert!(ledger.record(&bonus("alice", 1, 5 * UNIT)).await.unwrap());
        let b = store.fetch_balance(&"alice".into()).await.unwrap();
        assert_eq!(b.claimable, 5 * UNIT);
        assert_eq!(b.events_applied, 1);
        assert_eq!(b.version, 1);
    }

    #[tokio::test]
    async fn duplicate_is_not_folded_twice() {
        let (store, ledger) = setup();
        let ev = bonus("alice", 1, 5 * UNIT);
        assert!(ledger.record(&ev).await.unwrap());
        assert!(!ledger.record(&ev).await.unwrap());
        let b = store.fetch_balance(&"alice".into()).await.unwrap();
        assert_eq!(b.total_earned, 5 * UNIT);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn invalid_claim_is_never_appended() {
        let (store, ledger) = setup();
        let claim = EarningEvent::claim(&"alice".into(), UNIT, 10, 0);
        let err = ledger.record(&claim).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::Validation(ValidationError::ExceedsAvailable { requested: UNIT, available: 0 })
        );
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_after_lost_fold_heals_cache() {
        let (store, ledger) = setup();
        let ev = bonus("alice", 1, 5 * UNIT);
        // Simulate a crash between append and fold.
        store.append_earning_event(&ev).await.unwrap();
        assert!(!ledger.record(&ev).await.unwrap());
        let b = store.fetch_balance(&"alice".into()).await.unwrap();
        assert_eq!(b.claimable, 5 * UNIT);
    }

    // ------------------------------------------------------------------
    // reconcile
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn consistent_owner_is_left_alone() {
        let (_store, ledger) = setup();
        ledger.record(&bonus("alice", 1, UNIT)).await.unwrap();
        let out = ledger.reconcile(&"alice".into(), 100).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Consistent);
    }

    #[tokio::test]
    async fn drift_is_recorded_and_corrected() {
        let (store, ledger) = setup();
        ledger.record(&bonus("alice", 1, 5 * UNIT)).await.unwrap();
        let mut tampered = store.fetch_balance(&"alice".into()).await.unwrap();
        tampered.total_earned = 9 * UNIT;
        store.force_balance(tampered);

        let out = ledger.reconcile(&"alice".into(), 100).await.unwrap();
        let ReconcileOutcome::Corrected(drift) = out else {
            panic!("expected correction, got {out:?}");
        };
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].field, BalanceField::TotalEarned);
        assert_eq!(drift[0].detected_at, 100);

        let b = store.fetch_balance(&"alice".into()).await.unwrap();
        assert_eq!(b.total_earned, 5 * UNIT);
        assert_eq!(store.discrepancies(&"alice".into()).await.unwrap().len(), 1);
        assert_eq!(
            ledger.reconcile(&"alice".into(), 200).await.unwrap(),
            ReconcileOutcome::Consistent
        );
    }

    #[tokio::test]
    async fn sub_epsilon_drift_is_refreshed_silently() {
        let (store, ledger) = setup();
        ledger.record(&bonus("alice", 1, 5 * UNIT)).await.unwrap();
        let mut tampered = store.fetch_balance(&"alice".into()).await.unwrap();
        tampered.claimable += 1;
        store.force_balance(tampered);

        let out = ledger.reconcile(&"alice".into(), 100).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Refreshed);
        assert!(store.discrepancies(&"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unfolded_tail_is_refreshed_not_reported() {
        let (store, ledger) = setup();
        ledger.record(&bonus("alice", 1, UNIT)).await.unwrap();
        store.append_earning_event(&bonus("alice", 2, 40 * UNIT)).await.unwrap();

        let out = ledger.reconcile(&"alice".into(), 100).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Refreshed);
        assert!(store.discrepancies(&"alice".into()).await.unwrap().is_empty());
        let b = store.fetch_balance(&"alice".into()).await.unwrap();
        assert_eq!(b.claimable, 41 * UNIT);
        assert_eq!(b.events_applied, 2);
    }
}
