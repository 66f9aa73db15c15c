//! Cycle cap enforcement.
//!
//! Credits stake-backed earnings to the owner's current stake. The first
//! credit that reaches the cap books the principal split as
//! `cycle_payout` events and then deactivates the stake.
//!
//! Each credit carries the id of the earning event it comes from. The stake
//! remembers the last one it absorbed, so replaying a settlement after a
//! failed stake write credits it exactly once.

use std::sync::Arc;

use tracing::{debug, info};

use accrue_core::cycle::{apply_earning, split_principal};
use accrue_core::error::{EngineError, StoreError};
use accrue_core::policy::RewardPolicy;
use accrue_core::traits::RewardStore;
use accrue_core::types::{EarningEvent, Hash256, OwnerId, PayoutTarget, Stake};

use crate::ledger::LedgerService;

/// What a credit did to the stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleOutcome {
    pub credited: u64,
    /// This credit completed the cycle.
    pub completed: bool,
}

pub struct CycleEnforcer {
    store: Arc<dyn RewardStore>,
    ledger: Arc<LedgerService>,
    policy: RewardPolicy,
}

impl CycleEnforcer {
    pub fn new(store: Arc<dyn RewardStore>, ledger: Arc<LedgerService>, policy: RewardPolicy) -> Self {
        Self { store, ledger, policy }
    }

    /// Credit `amount` of stake-backed earnings from event `source` to
    /// `owner`'s current stake.
    ///
    /// A missing or already-completed stake is a no-op. A `source` the stake
    /// already absorbed credits nothing and reports the outcome it had.
    pub async fn credit(
        &self,
        owner: &OwnerId,
        source: &Hash256,
        amount: u64,
        now: u64,
    ) -> Result<CycleOutcome, EngineError> {
        if amount == 0 {
            return Ok(CycleOutcome::default());
        }
        for _ in 0..2 {
            let Some(stake) = self.store.fetch_stake(owner).await? else {
                return Ok(CycleOutcome::default());
            };
            match self.credit_stake(stake, source, amount, now).await {
                Err(EngineError::Conflict(msg)) => {
                    debug!(owner = %owner, "stake changed during credit, re-reading: {msg}");
                    continue;
                }
                other => return other,
            }
        }
        Err(EngineError::Conflict(format!("stake of {owner} kept changing")))
    }

    async fn credit_stake(
        &self,
        stake: Stake,
        source: &Hash256,
        amount: u64,
        now: u64,
    ) -> Result<CycleOutcome, EngineError> {
        if stake.last_credited == *source {
            debug!(owner = %stake.owner, event = %source, "event already credited to stake");
            return Ok(CycleOutcome {
                credited: 0,
                completed: !stake.is_active,
            });
        }
        let mut next = stake;
        let step = apply_earning(&mut next, amount);
        if step.credited == 0 && !step.completed {
            return Ok(CycleOutcome::default());
        }
        next.last_credited = *source;

        if step.completed {
            self.book_payouts(&next, now).await?;
        }
        match self.store.update_stake(&next).await {
            Ok(committed) => {
                if step.completed {
                    info!(
                        owner = %committed.owner,
                        stake = %committed.id,
                        total_earned = committed.total_earned,
                        "stake cycle complete"
                    );
                }
                Ok(CycleOutcome {
                    credited: step.credited,
                    completed: step.completed,
                })
            }
            Err(e @ StoreError::VersionConflict { .. }) => Err(EngineError::Conflict(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Append the principal split. Ids derive from the stake and target, so a
    /// repeat after a lost stake write books nothing new.
    async fn book_payouts(&self, stake: &Stake, now: u64) -> Result<(), EngineError> {
        for (target, amount) in split_principal(stake.amount, &self.policy) {
            let recipient = match target {
                PayoutTarget::Pool => OwnerId::pool(),
                PayoutTarget::Reinvestment | PayoutTarget::Reputation => stake.owner.clone(),
            };
            let event = EarningEvent::cycle_payout(&recipient, &stake.id, target, amount, now);
            self.ledger.record(&event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrue_core::constants::{CYCLE_CAP_BPS, UNIT};
    use accrue_core::memory_store::MemoryStore;
    use accrue_core::types::EventKind;

    fn setup() -> (Arc<MemoryStore>, CycleEnforcer) {
        let store = Arc::new(MemoryStore::new());
        let policy = RewardPolicy::default();
        let ledger = Arc::new(LedgerService::new(store.clone(), &policy));
        let enforcer = CycleEnforcer::new(store.clone(), ledger, policy);
        (store, enforcer)
    }

    async fn seed_stake(store: &MemoryStore, amount: u64, earned: u64) -> Stake {
        let mut s = Stake::new("alice".into(), "d1", amount, 0);
        s.total_earned = earned;
        store.update_stake(&s).await.unwrap()
    }

    fn event(n: u8) -> Hash256 {
        Hash256::derive("event", &[[n].as_slice()])
    }

    #[tokio::test]
    async fn credit_below_cap_only_tracks_progress() {
        let (store, enforcer) = setup();
        seed_stake(&store, 100 * UNIT, 0).await;
        let out = enforcer.credit(&"alice".into(), &event(1), 50 * UNIT, 10).await.unwrap();
        assert_eq!(out, CycleOutcome { credited: 50 * UNIT, completed: false });
        let s = store.fetch_stake(&"alice".into()).await.unwrap().unwrap();
        assert_eq!(s.cycle_progress_bps, 5_000);
        assert!(s.is_active);
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn reaching_cap_splits_principal_once() {
        let (store, enforcer) = setup();
        seed_stake(&store, 100 * UNIT, 299 * UNIT).await;

        let out = enforcer.credit(&"alice".into(), &event(1), 2 * UNIT, 10).await.unwrap();
        assert_eq!(out, CycleOutcome { credited: UNIT, completed: true });

        let s = store.fetch_stake(&"alice".into()).await.unwrap().unwrap();
        assert!(!s.is_active);
        assert_eq!(s.cycle_progress_bps, CYCLE_CAP_BPS);

        let alice = store.fetch_balance(&"alice".into()).await.unwrap();
        assert_eq!(alice.reinvestment, 20 * UNIT);
        assert_eq!(alice.reputation, 10 * UNIT);
        let pool = store.fetch_balance(&OwnerId::pool()).await.unwrap();
        assert_eq!(pool.pool, 10 * UNIT);

        // A later credit changes nothing.
        let again = enforcer.credit(&"alice".into(), &event(2), 5 * UNIT, 20).await.unwrap();
        assert_eq!(again, CycleOutcome::default());
        assert_eq!(store.event_count(), 3);
    }

    #[tokio::test]
    async fn payouts_are_idempotent_across_lost_stake_write() {
        let (store, enforcer) = setup();
        let stake = seed_stake(&store, 100 * UNIT, 299 * UNIT).await;
        // Payouts booked, stake write lost.
        enforcer.book_payouts(&stake, 10).await.unwrap();
        enforcer.credit(&"alice".into(), &event(1), UNIT, 11).await.unwrap();
        let events = store.events_for_owner(&"alice".into()).await.unwrap();
        let payouts = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::CyclePayout(_)))
            .count();
        assert_eq!(payouts, 2);
        assert_eq!(store.event_count(), 3);
    }

    #[tokio::test]
    async fn repeated_event_credits_once() {
        let (store, enforcer) = setup();
        seed_stake(&store, 100 * UNIT, 0).await;
        enforcer.credit(&"alice".into(), &event(1), 10 * UNIT, 10).await.unwrap();
        let again = enforcer.credit(&"alice".into(), &event(1), 10 * UNIT, 11).await.unwrap();
        assert_eq!(again, CycleOutcome::default());
        enforcer.credit(&"alice".into(), &event(2), 10 * UNIT, 12).await.unwrap();
        let s = store.fetch_stake(&"alice".into()).await.unwrap().unwrap();
        assert_eq!(s.total_earned, 20 * UNIT);
        assert_eq!(s.last_credited, event(2));
    }

    #[tokio::test]
    async fn repeated_completing_event_still_reports_completion() {
        let (store, enforcer) = setup();
        seed_stake(&store, 100 * UNIT, 299 * UNIT).await;
        let first = enforcer.credit(&"alice".into(), &event(1), 2 * UNIT, 10).await.unwrap();
        assert!(first.completed);
        let again = enforcer.credit(&"alice".into(), &event(1), 2 * UNIT, 11).await.unwrap();
        assert_eq!(again, CycleOutcome { credited: 0, completed: true });
        assert_eq!(store.event_count(), 3);
    }

    #[tokio::test]
    async fn no_stake_is_noop() {
        let (_store, enforcer) = setup();
        let out = enforcer.credit(&"nobody".into(), &event(1), UNIT, 0).await.unwrap();
        assert_eq!(out, CycleOutcome::default());
    }
}
