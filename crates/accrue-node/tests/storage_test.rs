//! RocksStore against the RewardStore contract, plus a full engine run on disk.

use std::sync::Arc;

use accrue_core::constants::UNIT;
use accrue_core::error::StoreError;
use accrue_core::policy::RewardPolicy;
use accrue_core::traits::RewardStore;
use accrue_core::types::{
    Balance, BalanceField, Discrepancy, EarningEvent, Entitlements, Hash256, OwnerId, RateTier,
    ReferralEdge, ReferralStatus, Session, SessionStatus, Stake, StrategyKind,
};
use accrue_engine::RewardEngine;
use accrue_node_lib::storage::RocksStore;

const T0: u64 = 1_700_000_000;
const DAY: u64 = 86_400;

fn temp_store() -> (RocksStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(dir.path().join("rewards")).unwrap();
    (store, dir)
}

fn alice() -> OwnerId {
    OwnerId::new("alice")
}

fn session(owner: &OwnerId, start: u64) -> Session {
    Session {
        id: Session::derive_id(owner, start, &Hash256::ZERO),
        owner: owner.clone(),
        start,
        end: start + DAY,
        rate: RateTier {
            strategy: StrategyKind::FixedEmission,
            daily_rate: 50 * UNIT,
            session_cap: 50 * UNIT,
        },
        baseline: start,
        settled: 0,
        status: SessionStatus::Active,
        version: 0,
    }
}

fn edge(sponsor: &str, referred: &str, status: ReferralStatus) -> ReferralEdge {
    ReferralEdge {
        sponsor: sponsor.into(),
        referred: referred.into(),
        status,
        created_at: T0,
        activated_at: None,
    }
}

// ------------------------------------------------------------------
// Sessions
// ------------------------------------------------------------------

#[tokio::test]
async fn session_slot_is_exclusive() {
    let (store, _dir) = temp_store();
    let s = store.create_session(&session(&alice(), T0)).await.unwrap();
    assert_eq!(s.version, 1);
    let err = store.create_session(&session(&alice(), T0 + 5)).await.unwrap_err();
    assert!(matches!(err, StoreError::SessionExists { existing, .. } if existing == s.id));
    assert_eq!(store.fetch_active_session(&alice()).await.unwrap(), Some(s));
}

#[tokio::test]
async fn rollover_frees_slot_and_keeps_history() {
    let (store, _dir) = temp_store();
    let mut s = store.create_session(&session(&alice(), T0)).await.unwrap();
    s.status = SessionStatus::RolledOver;
    let s = store.update_session(&s).await.unwrap();
    assert!(store.fetch_active_session(&alice()).await.unwrap().is_none());
    assert_eq!(store.fetch_session(&s.id).await.unwrap(), Some(s.clone()));
    assert_eq!(store.fetch_latest_session(&alice()).await.unwrap(), Some(s));
    let next = store.create_session(&session(&alice(), T0 + DAY)).await.unwrap();
    assert_eq!(store.fetch_latest_session(&alice()).await.unwrap(), Some(next));
}

#[tokio::test]
async fn stale_session_update_conflicts() {
    let (store, _dir) = temp_store();
    let s = store.create_session(&session(&alice(), T0)).await.unwrap();
    let mut a = s.clone();
    a.settled = UNIT;
    store.update_session(&a).await.unwrap();
    let err = store.update_session(&s).await.unwrap_err();
    assert_eq!(err, StoreError::VersionConflict { entity: "session", expected: 1, found: 2 });
}

#[tokio::test]
async fn updating_unknown_session_is_corrupt() {
    let (store, _dir) = temp_store();
    let err = store.update_session(&session(&alice(), T0)).await.unwrap_err();
    assert!(matches!(err, StoreError::Corrupt(_)));
}

// ------------------------------------------------------------------
// Events
// ------------------------------------------------------------------

#[tokio::test]
async fn events_are_deduplicated_and_ordered() {
    let (store, _dir) = temp_store();
    // Sequence numbers past 255 must still sort after earlier ones.
    let evs: Vec<_> = (0..300).map(|i| EarningEvent::claim(&alice(), UNIT, T0 + i, i)).collect();
    for ev in &evs {
        assert!(store.append_earning_event(ev).await.unwrap());
    }
    assert!(!store.append_earning_event(&evs[3]).await.unwrap());
    assert_eq!(store.events_for_owner(&alice()).await.unwrap(), evs);
    assert_eq!(store.event_count().unwrap(), 300);
    assert_eq!(store.fetch_earning_event(&evs[7].id).await.unwrap(), Some(evs[7].clone()));
}

#[tokio::test]
async fn owner_event_logs_do_not_bleed() {
    let (store, _dir) = temp_store();
    let al = EarningEvent::claim(&"al".into(), UNIT, T0, 0);
    let alice_ev = EarningEvent::claim(&alice(), UNIT, T0, 0);
    store.append_earning_event(&alice_ev).await.unwrap();
    store.append_earning_event(&al).await.unwrap();
    assert_eq!(store.events_for_owner(&"al".into()).await.unwrap(), vec![al]);
    assert_eq!(store.events_for_owner(&alice()).await.unwrap(), vec![alice_ev]);
    assert!(store.events_for_owner(&"bob".into()).await.unwrap().is_empty());
}

// ------------------------------------------------------------------
// Balances, stakes, entitlements
// ------------------------------------------------------------------

#[tokio::test]
async fn balance_defaults_and_cas() {
    let (store, _dir) = temp_store();
    let b = store.fetch_balance(&alice()).await.unwrap();
    assert_eq!(b, Balance::new(alice()));
    let mut next = b.clone();
    next.claimable = 3 * UNIT;
    let committed = store.store_balance(&next).await.unwrap();
    assert_eq!(committed.version, 1);
    assert!(matches!(
        store.store_balance(&next).await.unwrap_err(),
        StoreError::VersionConflict { entity: "balance", .. }
    ));
    assert_eq!(store.fetch_balance(&alice()).await.unwrap(), committed);
}

#[tokio::test]
async fn stake_creation_and_lookup() {
    let (store, _dir) = temp_store();
    let first = store.update_stake(&Stake::new(alice(), "d1", 100 * UNIT, T0)).await.unwrap();
    assert_eq!(store.fetch_stake(&alice()).await.unwrap(), Some(first.clone()));

    let mut progressed = first.clone();
    progressed.total_earned = UNIT;
    let progressed = store.update_stake(&progressed).await.unwrap();
    assert_eq!(progressed.version, 2);
    assert!(store.update_stake(&first).await.is_err());

    let second = store.update_stake(&Stake::new(alice(), "d2", 5 * UNIT, T0 + 9)).await.unwrap();
    assert_eq!(store.fetch_stake(&alice()).await.unwrap(), Some(second));
    assert_eq!(store.fetch_stake_by_id(&first.id).await.unwrap(), Some(progressed));
}

#[tokio::test]
async fn entitlements_default_then_persist() {
    let (store, _dir) = temp_store();
    let mut ent = store.fetch_entitlements(&alice()).await.unwrap();
    assert_eq!(ent, Entitlements::new(alice()));
    ent.unrestricted_mining = false;
    ent.sessions_remaining = 2;
    store.put_entitlements(&ent).await.unwrap();
    assert_eq!(store.fetch_entitlements(&alice()).await.unwrap(), ent);
}

// ------------------------------------------------------------------
// Referrals, discrepancies, owners
// ------------------------------------------------------------------

#[tokio::test]
async fn sponsor_index_tracks_edges() {
    let (store, _dir) = temp_store();
    store.put_referral_edge(&edge("s", "carol", ReferralStatus::Pending)).await.unwrap();
    store.put_referral_edge(&edge("s", "bob", ReferralStatus::Active)).await.unwrap();
    store.put_referral_edge(&edge("t", "dave", ReferralStatus::Active)).await.unwrap();

    let team: Vec<_> = store
        .referrals_of(&"s".into())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.referred)
        .collect();
    assert_eq!(team, vec![OwnerId::new("bob"), OwnerId::new("carol")]);
    assert_eq!(store.fetch_referral_count(&"s".into()).await.unwrap(), 1);

    store.put_referral_edge(&edge("s", "carol", ReferralStatus::Active)).await.unwrap();
    assert_eq!(store.fetch_referral_count(&"s".into()).await.unwrap(), 2);
    assert_eq!(store.referrals_of(&"s".into()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn discrepancies_accumulate_per_owner() {
    let (store, _dir) = temp_store();
    let d = |owner: &str, cached| Discrepancy {
        owner: owner.into(),
        field: BalanceField::Claimable,
        cached,
        computed: 0,
        detected_at: T0,
    };
    store.record_discrepancy(&d("alice", 1)).await.unwrap();
    store.record_discrepancy(&d("bob", 2)).await.unwrap();
    store.record_discrepancy(&d("alice", 3)).await.unwrap();
    let found: Vec<_> = store
        .discrepancies(&alice())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.cached)
        .collect();
    assert_eq!(found, vec![1, 3]);
}

#[tokio::test]
async fn owners_unions_every_record_kind() {
    let (store, _dir) = temp_store();
    store.create_session(&session(&"a".into(), T0)).await.unwrap();
    store.append_earning_event(&EarningEvent::claim(&"b".into(), 1, T0, 0)).await.unwrap();
    store.update_stake(&Stake::new("c".into(), "d", UNIT, T0)).await.unwrap();
    store.put_referral_edge(&edge("d", "e", ReferralStatus::Pending)).await.unwrap();
    let owners: Vec<String> = store.owners().await.unwrap().into_iter().map(|o| o.0).collect();
    assert_eq!(owners, vec!["a", "b", "c", "d", "e"]);
}

// ------------------------------------------------------------------
// Persistence and engine integration
// ------------------------------------------------------------------

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rewards");
    let ev = EarningEvent::claim(&alice(), UNIT, T0, 0);
    {
        let store = RocksStore::open(&path).unwrap();
        store.create_session(&session(&alice(), T0)).await.unwrap();
        store.append_earning_event(&ev).await.unwrap();
    }
    let store = RocksStore::open(&path).unwrap();
    assert!(store.fetch_active_session(&alice()).await.unwrap().is_some());
    assert!(!store.append_earning_event(&ev).await.unwrap());
    // The per-owner sequence continues where it stopped.
    let next = EarningEvent::claim(&alice(), UNIT, T0 + 1, 1);
    store.append_earning_event(&next).await.unwrap();
    assert_eq!(store.events_for_owner(&alice()).await.unwrap(), vec![ev, next]);
}

#[tokio::test]
async fn engine_runs_on_rocks_store() {
    let (store, _dir) = temp_store();
    let store = Arc::new(store);
    let engine = RewardEngine::new(store.clone(), RewardPolicy::default());

    engine.deposit(&alice(), 100 * UNIT, "dep-1", T0).await.unwrap();
    engine.start_session(&alice(), T0).await.unwrap();
    let receipt = engine.claim(&alice(), UNIT, T0 + DAY).await.unwrap();
    assert_eq!(receipt.amount, UNIT);
    assert_eq!(receipt.balance.claimable, 0);

    let outcome = engine.reconcile(&alice(), T0 + DAY + 1).await.unwrap();
    assert!(!outcome.drift_detected());
    let events = store.events_for_owner(&alice()).await.unwrap();
    let earned: u64 = events
        .iter()
        .filter(|e| e.kind.contributes_to_earnings())
        .map(|e| e.amount)
        .sum();
    assert_eq!(earned, store.fetch_balance(&alice()).await.unwrap().total_earned);
}
