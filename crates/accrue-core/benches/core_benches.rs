//! Criterion benchmarks for accrue-core hot paths.
//!
//! Covers: accrual evaluation, id derivation, balance folding,
//! and session serialization.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use accrue_core::accrual::{AccrualCalculator, AccrualContext, PercentageOfStake};
use accrue_core::constants::UNIT;
use accrue_core::ledger::fold_events;
use accrue_core::types::{
    EarningEvent, Entitlements, Hash256, OwnerId, RateTier, Session, SessionStatus, Stake,
    StrategyKind,
};

fn sample_session() -> Session {
    let owner = OwnerId::new("bench");
    Session {
        id: Session::derive_id(&owner, 1_700_000_000, &Hash256::ZERO),
        owner,
        start: 1_700_000_000,
        end: 1_700_086_400,
        rate: RateTier {
            strategy: StrategyKind::FixedEmission,
            daily_rate: 50 * UNIT,
            session_cap: 50 * UNIT,
        },
        baseline: 1_700_000_000,
        settled: 0,
        status: SessionStatus::Active,
        version: 1,
    }
}

fn bench_accrual(c: &mut Criterion) {
    let session = sample_session();
    c.bench_function("live_accrued", |b| {
        b.iter(|| black_box(&session).live_accrued(black_box(1_700_043_200)))
    });

    let owner = OwnerId::new("bench");
    let ent = Entitlements::new(owner.clone());
    let stake = Stake::new(owner, "bench", 1_000 * UNIT, 0);
    let calc = AccrualCalculator::default();
    c.bench_function("rate_tier_percentage_of_stake", |b| {
        b.iter(|| {
            let ctx = AccrualContext {
                now: black_box(20 * 86_400),
                entitlements: &ent,
                stake: Some(&stake),
                active_referrals: 3,
            };
            calc.rate_tier(&PercentageOfStake, &ctx, 86_400)
        })
    });
}

fn bench_derive_id(c: &mut Criterion) {
    let owner = OwnerId::new("bench");
    c.bench_function("session_derive_id", |b| {
        b.iter(|| Session::derive_id(black_box(&owner), black_box(42), &Hash256::ZERO))
    });
}

fn bench_fold(c: &mut Criterion) {
    let owner = OwnerId::new("bench");
    let events: Vec<_> = (0..1_000u64)
        .map(|i| {
            let trigger = Hash256::derive("bench", &[&i.to_le_bytes()]);
            EarningEvent::referral_bonus(&owner, &"u".into(), &trigger, UNIT, i)
        })
        .collect();

    c.bench_function("fold_1000_events", |b| {
        b.iter(|| fold_events(&owner, black_box(&events), 1_800))
    });
}

fn bench_session_serde(c: &mut Criterion) {
    let session = sample_session();
    let encoded =
        bincode::encode_to_vec(&session, bincode::config::standard()).expect("encode failed");

    c.bench_function("session_serialization", |b| {
        b.iter(|| bincode::encode_to_vec(black_box(&session), bincode::config::standard()))
    });

    c.bench_function("session_deserialization", |b| {
        b.iter(|| {
            let (decoded, _): (Session, usize) =
                bincode::decode_from_slice(black_box(&encoded), bincode::config::standard())
                    .expect("decode failed");
            decoded
        })
    });
}

criterion_group!(
    benches,
    bench_accrual,
    bench_derive_id,
    bench_fold,
    bench_session_serde,
);
criterion_main!(benches);
