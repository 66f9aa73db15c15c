//! Balance fold over the event ledger.
//!
//! A [`Balance`] is never mutated directly: it is the result of applying
//! [`EarningEvent`]s one at a time with [`apply_event`]. Reconciliation
//! recomputes the fold from scratch and compares it field by field with
//! the cached aggregate.

use crate::error::ValidationError;
use crate::types::{Balance, BalanceField, Discrepancy, EarningEvent, EventKind, OwnerId, PayoutTarget};

/// Apply one event to a balance.
///
/// A claim larger than `claimable` is rejected and leaves the balance
/// untouched. On success `events_applied` is incremented; `version` is
/// left to the store.
pub fn apply_event(
    balance: &mut Balance,
    event: &EarningEvent,
    cooldown_secs: u64,
) -> Result<(), ValidationError> {
    let amount = event.amount;
    match event.kind {
        EventKind::MiningComplete | EventKind::ReferralBonus => {
            let claimable = checked_add(balance.claimable, amount)?;
            let total = checked_add(balance.total_earned, amount)?;
            balance.claimable = claimable;
            balance.total_earned = total;
        }
        EventKind::Claim => {
            if amount > balance.claimable {
                return Err(ValidationError::ExceedsAvailable {
                    requested: amount,
                    available: balance.claimable,
                });
            }
            let claimed = checked_add(balance.claimed, amount)?;
            balance.claimable -= amount;
            balance.claimed = claimed;
            balance.last_claim_at = Some(event.timestamp);
            balance.cooldown_until = event.timestamp.saturating_add(cooldown_secs);
        }
        EventKind::CyclePayout(PayoutTarget::Reinvestment) => {
            balance.reinvestment = checked_add(balance.reinvestment, amount)?;
        }
        EventKind::CyclePayout(PayoutTarget::Pool) => {
            balance.pool = checked_add(balance.pool, amount)?;
        }
        EventKind::CyclePayout(PayoutTarget::Reputation) => {
            balance.reputation = checked_add(balance.reputation, amount)?;
        }
    }
    balance.events_applied += 1;
    Ok(())
}

/// Recompute an owner's balance from its events, in ledger order.
pub fn fold_events<'a, I>(owner: &OwnerId, events: I, cooldown_secs: u64) -> Result<Balance, ValidationError>
where
    I: IntoIterator<Item = &'a EarningEvent>,
{
    let mut balance = Balance::new(owner.clone());
    for event in events {
        apply_event(&mut balance, event, cooldown_secs)?;
    }
    Ok(balance)
}

/// Fields where `cached` and `computed` differ by more than `epsilon`.
pub fn diff_balances(cached: &Balance, computed: &Balance, epsilon: u64, now: u64) -> Vec<Discrepancy> {
    let pairs = [
        (BalanceField::TotalEarned, cached.total_earned, computed.total_earned),
        (BalanceField::Claimable, cached.claimable, computed.claimable),
        (BalanceField::Claimed, cached.claimed, computed.claimed),
        (BalanceField::Reinvestment, cached.reinvestment, computed.reinvestment),
        (BalanceField::Reputation, cached.reputation, computed.reputation),
        (BalanceField::Pool, cached.pool, computed.pool),
    ];
    pairs
        .into_iter()
        .filter(|(_, c, f)| c.abs_diff(*f) > epsilon)
        .map(|(field, c, f)| Discrepancy {
            owner: cached.owner.clone(),
            field,
            cached: c,
            computed: f,
            detected_at: now,
        })
        .collect()
}

/// Whether the cached aggregate is out of step with the fold at all,
/// including sub-epsilon differences and missed events.
pub fn needs_refresh(cached: &Balance, computed: &Balance) -> bool {
    cached.events_applied != computed.events_applied
        || cached.claimable != computed.claimable
        || cached.claimed != computed.claimed
        || cached.total_earned != computed.total_earned
        || cached.reinvestment != computed.reinvestment
        || cached.reputation != computed.reputation
        || cached.pool != computed.pool
        || cached.last_claim_at != computed.last_claim_at
        || cached.cooldown_until != computed.cooldown_until
}

fn checked_add(a: u64, b: u64) -> Result<u64, ValidationError> {
    a.checked_add(b).ok_or(ValidationError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CLAIM_COOLDOWN_SECS, UNIT};
    use crate::types::Hash256;
    use proptest::prelude::*;

    fn owner() -> OwnerId {
        OwnerId::new("alice")
    }

    fn earn(amount: u64, n: u8) -> EarningEvent {
        let trigger = Hash256::derive("t", &[&[n]]);
        EarningEvent::referral_bonus(&owner(), &"bob".into(), &trigger, amount, 100)
    }

    // ------------------------------------------------------------------
    // apply_event
    // ------------------------------------------------------------------

    #[test]
    fn earning_adds_to_claimable_and_total() {
        let mut b = Balance::new(owner());
        apply_event(&mut b, &earn(5 * UNIT, 1), CLAIM_COOLDOWN_SECS).unwrap();
        assert_eq!(b.claimable, 5 * UNIT);
        assert_eq!(b.total_earned, 5 * UNIT);
        assert_eq!(b.events_applied, 1);
    }

    #[test]
    fn claim_moves_funds_and_sets_cooldown() {
        let mut b = Balance::new(owner());
        apply_event(&mut b, &earn(5 * UNIT, 1), CLAIM_COOLDOWN_SECS).unwrap();
        let claim = EarningEvent::claim(&owner(), 2 * UNIT, 1_000, 1);
        apply_event(&mut b, &claim, CLAIM_COOLDOWN_SECS).unwrap();
        assert_eq!(b.claimable, 3 * UNIT);
        assert_eq!(b.claimed, 2 * UNIT);
        assert_eq!(b.total_earned, 5 * UNIT);
        assert_eq!(b.last_claim_at, Some(1_000));
        assert_eq!(b.cooldown_until, 1_000 + CLAIM_COOLDOWN_SECS);
    }

    #[test]
    fn overdrawn_claim_is_rejected_without_side_effects() {
        let mut b = Balance::new(owner());
        apply_event(&mut b, &earn(UNIT, 1), CLAIM_COOLDOWN_SECS).unwrap();
        let before = b.clone();
        let claim = EarningEvent::claim(&owner(), 2 * UNIT, 1_000, 1);
        let err = apply_event(&mut b, &claim, CLAIM_COOLDOWN_SECS).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ExceedsAvailable { requested: 2 * UNIT, available: UNIT }
        );
        assert_eq!(b, before);
    }

    #[test]
    fn payouts_go_to_their_buckets() {
        let stake_id = Hash256::derive("stake", &[b"s"]);
        let mut b = Balance::new(owner());
        for (target, amt) in [
            (PayoutTarget::Reinvestment, 20),
            (PayoutTarget::Pool, 10),
            (PayoutTarget::Reputation, 7),
        ] {
            let ev = EarningEvent::cycle_payout(&owner(), &stake_id, target, amt, 0);
            apply_event(&mut b, &ev, CLAIM_COOLDOWN_SECS).unwrap();
        }
        assert_eq!((b.reinvestment, b.pool, b.reputation), (20, 10, 7));
        assert_eq!(b.total_earned, 0);
        assert_eq!(b.claimable, 0);
    }

    #[test]
    fn overflow_is_reported() {
        let mut b = Balance::new(owner());
        b.claimable = u64::MAX;
        let err = apply_event(&mut b, &earn(1, 1), CLAIM_COOLDOWN_SECS).unwrap_err();
        assert_eq!(err, ValidationError::Overflow);
    }

    // ------------------------------------------------------------------
    // Reconciliation helpers
    // ------------------------------------------------------------------

    #[test]
    fn diff_respects_epsilon() {
        let cached = Balance::new(owner());
        let mut computed = Balance::new(owner());
        computed.claimable = 50;
        assert!(diff_balances(&cached, &computed, 100, 0).is_empty());
        assert!(needs_refresh(&cached, &computed));

        computed.total_earned = 500;
        let d = diff_balances(&cached, &computed, 100, 9);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].field, BalanceField::TotalEarned);
        assert_eq!((d[0].cached, d[0].computed, d[0].detected_at), (0, 500, 9));
    }

    #[test]
    fn fold_matches_incremental_application() {
        let events = vec![earn(3 * UNIT, 1), earn(UNIT, 2), EarningEvent::claim(&owner(), UNIT, 50, 2)];
        let mut incremental = Balance::new(owner());
        for e in &events {
            apply_event(&mut incremental, e, 60).unwrap();
        }
        let folded = fold_events(&owner(), &events, 60).unwrap();
        assert_eq!(folded, incremental);
        assert!(!needs_refresh(&incremental, &folded));
    }

    proptest! {
        #[test]
        fn claimable_never_negative_and_totals_add_up(
            ops in proptest::collection::vec((any::<bool>(), 1u64..=1_000 * UNIT), 1..60),
        ) {
            let mut b = Balance::new(owner());
            let mut earned = 0u64;
            for (i, (is_claim, amount)) in ops.into_iter().enumerate() {
                let ev = if is_claim {
                    EarningEvent::claim(&owner(), amount, i as u64, i as u64)
                } else {
                    earn(amount, i as u8)
                };
                if apply_event(&mut b, &ev, 60).is_ok() && !is_claim {
                    earned += amount;
                }
                prop_assert_eq!(b.claimable + b.claimed, b.total_earned);
            }
            prop_assert_eq!(b.total_earned, earned);
        }
    }
}
