//! Session lifecycle manager.
//!
//! Drives the per-owner state machine
//!
//! ```text
//! NONE --start--> ACTIVE --(now >= end)--> EXPIRED --rollover--> ACTIVE (new)
//!                   |                                    \
//!                   +--manual_complete--> NONE            +--> NONE (cycle complete / not eligible)
//! ```
//!
//! A rolled-over session is marked `RolledOver` before its successor is
//! opened. If opening fails, the owner's latest session stays `RolledOver`
//! with nothing active, and the next rollover opens the successor. A
//! session that ends without one is marked `Completed`.
//!
//! Every mutating method here expects the caller to hold the owner's lock
//! from [`OwnerLocks`](crate::locks::OwnerLocks). Cross-process races are
//! still resolved by deterministic ids and version checks.

use std::sync::Arc;

use tracing::{debug, info};

use accrue_core::accrual::{AccrualCalculator, AccrualContext, select_strategy};
use accrue_core::error::{EngineError, NotEligible, StoreError, ValidationError};
use accrue_core::traits::RewardStore;
use accrue_core::types::{
    EarningEvent, Hash256, OwnerId, Session, SessionStatus, StrategyKind,
};

use crate::cycle::{CycleEnforcer, CycleOutcome};
use crate::ledger::LedgerService;

/// What an observer sees for a session at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Live { accrued: u64, remaining_secs: u64 },
    /// The session has ended and awaits rollover.
    Expired { final_accrued: u64 },
}

/// Result of moving a session's live accrual into the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// The session as committed after settlement.
    pub session: Session,
    /// Amount moved to claimable (0 if nothing had accrued).
    pub amount: u64,
    pub cycle: CycleOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloverOutcome {
    NoSession,
    NotExpired { remaining_secs: u64 },
    /// Another writer rolled the session over first.
    Superseded,
    RolledOver {
        previous: Hash256,
        settled: u64,
        cycle_completed: bool,
        successor: Option<Session>,
    },
}

pub struct SessionManager {
    store: Arc<dyn RewardStore>,
    ledger: Arc<LedgerService>,
    cycle: Arc<CycleEnforcer>,
    calculator: AccrualCalculator,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn RewardStore>,
        ledger: Arc<LedgerService>,
        cycle: Arc<CycleEnforcer>,
        calculator: AccrualCalculator,
    ) -> Self {
        Self {
            store,
            ledger,
            cycle,
            calculator,
        }
    }

    pub fn calculator(&self) -> &AccrualCalculator {
        &self.calculator
    }

    /// Open a session for an owner with none active.
    pub async fn start(&self, owner: &OwnerId, now: u64) -> Result<Session, EngineError> {
        if owner.is_pool() {
            return Err(ValidationError::ReservedOwner(owner.clone()).into());
        }
        if self.store.fetch_active_session(owner).await?.is_some() {
            return Err(EngineError::AlreadyActive);
        }
        let previous = self
            .store
            .fetch_latest_session(owner)
            .await?
            .map_or(Hash256::ZERO, |s| s.id);
        self.open(owner, now, &previous).await
    }

    /// Check eligibility, snapshot the rate, and create the session.
    ///
    /// Quota is spent before the session is created and is tagged with the
    /// session id, so a retried open does not spend it twice.
    async fn open(&self, owner: &OwnerId, now: u64, previous: &Hash256) -> Result<Session, EngineError> {
        let id = Session::derive_id(owner, now, previous);
        let stored = self.store.fetch_entitlements(owner).await?;
        let mut entitlements = stored.clone();
        if !entitlements.spend_quota(&id) {
            return Err(NotEligible::QuotaExhausted.into());
        }
        let stake = self.store.fetch_stake(owner).await?;
        if stake.as_ref().is_some_and(|s| !s.is_active) {
            return Err(NotEligible::CycleComplete.into());
        }
        let active_referrals = self.store.fetch_referral_count(owner).await?;
        let balance = self.store.fetch_balance(owner).await?;

        let policy = self.calculator.policy();
        let duration = policy.session_duration(entitlements.extended_session);
        let strategy = select_strategy(stake.as_ref());
        let ctx = AccrualContext {
            now,
            entitlements: &entitlements,
            stake: stake.as_ref(),
            active_referrals,
        };
        let rate = self.calculator.rate_tier(strategy, &ctx, duration);

        if entitlements != stored {
            self.store.put_entitlements(&entitlements).await?;
        }
        let session = Session {
            id,
            owner: owner.clone(),
            start: now,
            end: now + duration,
            rate,
            baseline: now.max(balance.last_claim_at.unwrap_or(0)),
            settled: 0,
            status: SessionStatus::Active,
            version: 0,
        };
        let committed = self.store.create_session(&session).await?;
        info!(
            owner = %owner,
            session = %committed.id,
            strategy = ?committed.rate.strategy,
            daily_rate = committed.rate.daily_rate,
            end = committed.end,
            sessions_remaining = entitlements.sessions_remaining,
            "session opened"
        );
        Ok(committed)
    }

    /// Live view of a session at `now`.
    pub fn observe(&self, session: &Session, now: u64) -> Observation {
        if session.is_expired(now) {
            Observation::Expired {
                final_accrued: session.live_accrued(session.end),
            }
        } else {
            Observation::Live {
                accrued: session.live_accrued(now),
                remaining_secs: session.remaining_secs(now),
            }
        }
    }

    /// Move the session's live accrual into the ledger and advance its baseline.
    ///
    /// If an earlier attempt already appended this settlement's event, the
    /// session is rolled forward to match that event instead of computing a
    /// new amount.
    async fn settle(&self, session: Session, now: u64) -> Result<Settlement, EngineError> {
        let id = EarningEvent::mining_complete_id(&session);
        let event = match self.store.fetch_earning_event(&id).await? {
            Some(existing) => existing,
            None => {
                let amount = session.live_accrued(now);
                if amount == 0 {
                    return Ok(Settlement {
                        session,
                        amount: 0,
                        cycle: CycleOutcome::default(),
                    });
                }
                EarningEvent::mining_complete(&session, amount, now.min(session.end))
            }
        };

        let fresh = self.ledger.record(&event).await?;
        let event = if fresh {
            event
        } else {
            debug!(owner = %session.owner, session = %session.id, "rolling forward existing settlement");
            self.store.fetch_earning_event(&id).await?.unwrap_or(event)
        };

        // Credit on every attempt; the stake skips an event it already absorbed.
        let cycle = if session.rate.strategy == StrategyKind::PercentageOfStake {
            self.cycle.credit(&session.owner, &event.id, event.amount, now).await?
        } else {
            CycleOutcome::default()
        };

        let mut next = session;
        next.settled += event.amount;
        next.baseline = next.baseline.max(event.timestamp);
        let committed = self.store.update_session(&next).await?;
        debug!(owner = %committed.owner, session = %committed.id, amount = event.amount, "settled accrual");
        Ok(Settlement {
            session: committed,
            amount: event.amount,
            cycle,
        })
    }

    /// Settle live accrual on an active session (the claim path).
    ///
    /// If the settlement completes the stake's cycle, the session is
    /// completed as well.
    pub async fn settle_live(&self, session: Session, now: u64) -> Result<Settlement, EngineError> {
        let mut settlement = self.settle(session, now).await?;
        if settlement.cycle.completed && settlement.session.is_active() {
            let mut done = settlement.session.clone();
            done.status = SessionStatus::Completed;
            settlement.session = self.store.update_session(&done).await?;
            info!(owner = %done.owner, session = %done.id, "session completed at cycle cap");
        }
        Ok(settlement)
    }

    /// Settle an expired session and open its successor.
    ///
    /// With no active session, finishes an earlier rollover whose successor
    /// was never opened.
    pub async fn rollover(&self, owner: &OwnerId, now: u64) -> Result<RolloverOutcome, EngineError> {
        let Some(session) = self.store.fetch_active_session(owner).await? else {
            return self.resume(owner, now).await;
        };
        if !session.is_expired(now) {
            return Ok(RolloverOutcome::NotExpired {
                remaining_secs: session.remaining_secs(now),
            });
        }

        let settlement = self.settle(session, now).await?;
        let mut terminal = settlement.session;
        terminal.status = if settlement.cycle.completed {
            SessionStatus::Completed
        } else {
            SessionStatus::RolledOver
        };
        let terminal = match self.store.update_session(&terminal).await {
            Ok(committed) => committed,
            Err(StoreError::VersionConflict { .. }) => {
                debug!(owner = %owner, session = %terminal.id, "rollover lost to another writer");
                return Ok(RolloverOutcome::Superseded);
            }
            Err(e) => return Err(e.into()),
        };

        let successor = if settlement.cycle.completed {
            None
        } else {
            self.open_successor(&terminal, now).await?
        };
        info!(
            owner = %owner,
            session = %terminal.id,
            settled = settlement.amount,
            successor = successor.is_some(),
            "session rolled over"
        );
        Ok(RolloverOutcome::RolledOver {
            previous: terminal.id,
            settled: settlement.amount,
            cycle_completed: settlement.cycle.completed,
            successor,
        })
    }

    /// Open the session that follows a `RolledOver` one. If the owner is no
    /// longer eligible, the rolled-over session is marked `Completed` instead.
    async fn open_successor(&self, terminal: &Session, now: u64) -> Result<Option<Session>, EngineError> {
        let owner = &terminal.owner;
        match self.open(owner, now, &terminal.id).await {
            Ok(s) => Ok(Some(s)),
            Err(EngineError::NotEligible(reason)) => {
                info!(owner = %owner, "no successor session: {reason}");
                let mut done = terminal.clone();
                done.status = SessionStatus::Completed;
                match self.store.update_session(&done).await {
                    Ok(_) | Err(StoreError::VersionConflict { .. }) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Err(EngineError::AlreadyActive) => {
                debug!(owner = %owner, "successor already opened");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Open the missing successor of the owner's latest session, if that
    /// session was rolled over and nothing replaced it.
    async fn resume(&self, owner: &OwnerId, now: u64) -> Result<RolloverOutcome, EngineError> {
        let Some(last) = self.store.fetch_latest_session(owner).await? else {
            return Ok(RolloverOutcome::NoSession);
        };
        if last.status != SessionStatus::RolledOver {
            return Ok(RolloverOutcome::NoSession);
        }
        info!(owner = %owner, session = %last.id, "resuming interrupted rollover");
        let successor = self.open_successor(&last, now).await?;
        Ok(RolloverOutcome::RolledOver {
            previous: last.id,
            settled: 0,
            cycle_completed: false,
            successor,
        })
    }

    /// Settle and end the active session without opening a new one.
    pub async fn manual_complete(&self, owner: &OwnerId, now: u64) -> Result<Settlement, EngineError> {
        let Some(session) = self.store.fetch_active_session(owner).await? else {
            return Err(NotEligible::NoActiveSession.into());
        };
        let mut settlement = self.settle(session, now).await?;
        if settlement.session.is_active() {
            let mut done = settlement.session.clone();
            done.status = SessionStatus::Completed;
            settlement.session = self.store.update_session(&done).await?;
        }
        info!(owner = %owner, session = %settlement.session.id, settled = settlement.amount, "session completed");
        Ok(settlement)
    }
}
