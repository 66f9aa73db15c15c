//! Core engine types: sessions, stakes, earning events, balances, referrals.
//!
//! All monetary values are in base units (1 unit = 10^8 base units).
//! All timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::POOL_OWNER;

/// A 32-byte identifier.
///
/// Every id in the engine is a BLAKE3 digest of the inputs that define the
/// logical action (see [`Hash256::derive`]), so replaying an action yields
/// the same id and the store can reject the duplicate.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used as the "no previous session" marker.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Domain-separated BLAKE3 digest over length-prefixed parts.
    ///
    /// Length prefixes keep `("ab", "c")` and `("a", "bc")` distinct.
    pub fn derive(domain: &str, parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(domain.len() as u64).to_le_bytes());
        hasher.update(domain.as_bytes());
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Opaque owner identifier.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The account that receives the pool share of cycle payouts.
    pub fn pool() -> Self {
        Self(POOL_OWNER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_pool(&self) -> bool {
        self.0 == POOL_OWNER
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Which accrual formula a session was opened with.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum StrategyKind {
    /// Flat daily emission scaled by owned upgrades.
    FixedEmission,
    /// Tiered daily ROI on the owner's stake.
    PercentageOfStake,
}

/// Rate snapshot taken when a session opens.
///
/// A session accrues against this snapshot for its whole lifetime, so tier
/// changes (a new ROI week, a new referral) take effect at the next session.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RateTier {
    pub strategy: StrategyKind,
    /// Base units earned per full day.
    pub daily_rate: u64,
    /// Ceiling on the total a session can accrue.
    pub session_cap: u64,
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum SessionStatus {
    Active,
    /// Expired and settled; a successor may have been opened.
    RolledOver,
    /// Ended by `manual_complete`; no successor.
    Completed,
}

/// A time-boxed earning window.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Session {
    pub id: Hash256,
    pub owner: OwnerId,
    pub start: u64,
    /// Always `start + duration`.
    pub end: u64,
    pub rate: RateTier,
    /// Live accrual is measured from here. Starts at `max(start, last_claim_at)`
    /// and moves to the claim time whenever live accrual is settled.
    pub baseline: u64,
    /// Amount of this session already moved into claimable balance.
    pub settled: u64,
    pub status: SessionStatus,
    /// Optimistic concurrency version, bumped by the store on every write.
    pub version: u64,
}

impl Session {
    /// Deterministic session id. `previous` is the owner's latest session
    /// (or [`Hash256::ZERO`] for the first), so concurrent opens after the
    /// same session derive the same id and a restart in the same second
    /// after a completion does not.
    pub fn derive_id(owner: &OwnerId, start: u64, previous: &Hash256) -> Hash256 {
        Hash256::derive(
            "session",
            &[owner.as_str().as_bytes(), &start.to_le_bytes(), previous.as_bytes()],
        )
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.end
    }

    pub fn duration(&self) -> u64 {
        self.end - self.start
    }

    /// Seconds until the session ends, 0 once expired.
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.end.saturating_sub(now)
    }

    /// Accrued-but-unsettled amount at `now`.
    ///
    /// Time is clamped to `end`, and the result never exceeds what is left
    /// of the session cap after earlier settlements.
    pub fn live_accrued(&self, now: u64) -> u64 {
        let effective_now = now.min(self.end);
        let elapsed = effective_now.saturating_sub(self.baseline);
        let headroom = self.rate.session_cap.saturating_sub(self.settled);
        self.rate.accrued(elapsed).min(headroom)
    }
}

// ---------------------------------------------------------------------------
// Stakes
// ---------------------------------------------------------------------------

/// A deposited principal earning a percentage return until the cycle cap.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Stake {
    pub id: Hash256,
    pub owner: OwnerId,
    /// Principal in base units.
    pub amount: u64,
    pub start_date: u64,
    /// Cumulative stake-backed earnings, never above the cycle cap.
    pub total_earned: u64,
    /// Flips to false exactly once, when the cycle cap is reached.
    pub is_active: bool,
    /// `total_earned / amount` in basis points (30,000 = 300%).
    pub cycle_progress_bps: u64,
    /// Id of the last earning event credited to this stake.
    #[serde(default)]
    pub last_credited: Hash256,
    pub version: u64,
}

impl Stake {
    /// Deterministic stake id for a deposit reference, so a replayed deposit
    /// maps onto the stake it already created.
    pub fn derive_id(owner: &OwnerId, deposit_ref: &str) -> Hash256 {
        Hash256::derive("stake", &[owner.as_str().as_bytes(), deposit_ref.as_bytes()])
    }

    pub fn new(owner: OwnerId, deposit_ref: &str, amount: u64, now: u64) -> Self {
        Self {
            id: Self::derive_id(&owner, deposit_ref),
            owner,
            amount,
            start_date: now,
            total_earned: 0,
            is_active: true,
            cycle_progress_bps: 0,
            last_credited: Hash256::ZERO,
            version: 0,
        }
    }

    /// Whole days since the stake started.
    pub fn days_staked(&self, now: u64) -> u64 {
        now.saturating_sub(self.start_date) / crate::constants::SECONDS_PER_DAY
    }

    /// Cycle progress as a percentage (display only).
    pub fn cycle_progress_percent(&self) -> f64 {
        self.cycle_progress_bps as f64 / 100.0
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Destination of one share of a completed cycle's principal.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum PayoutTarget {
    Reinvestment,
    Pool,
    Reputation,
}

impl PayoutTarget {
    pub const ALL: [PayoutTarget; 3] = [Self::Reinvestment, Self::Pool, Self::Reputation];

    fn tag(&self) -> &'static str {
        match self {
            Self::Reinvestment => "reinvestment",
            Self::Pool => "pool",
            Self::Reputation => "reputation",
        }
    }
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum EventKind {
    /// Session accrual moved into claimable balance.
    MiningComplete,
    /// Claimable balance paid out.
    Claim,
    /// Sponsor commission.
    ReferralBonus,
    /// One share of a completed cycle's principal.
    CyclePayout(PayoutTarget),
}

impl EventKind {
    /// Whether events of this kind count toward `Balance::total_earned`.
    pub fn contributes_to_earnings(&self) -> bool {
        matches!(self, Self::MiningComplete | Self::ReferralBonus)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MiningComplete => "mining_complete",
            Self::Claim => "claim",
            Self::ReferralBonus => "referral_bonus",
            Self::CyclePayout(_) => "cycle_payout",
        }
    }
}

/// One immutable ledger entry.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct EarningEvent {
    pub id: Hash256,
    pub owner: OwnerId,
    pub kind: EventKind,
    pub amount: u64,
    pub timestamp: u64,
    /// The session, stake, or triggering event this entry settles.
    pub correlation_id: Hash256,
}

impl EarningEvent {
    /// Settlement of a session. `settled_before` distinguishes successive
    /// partial settlements of the same session.
    pub fn mining_complete(session: &Session, amount: u64, timestamp: u64) -> Self {
        Self {
            id: Self::mining_complete_id(session),
            owner: session.owner.clone(),
            kind: EventKind::MiningComplete,
            amount,
            timestamp,
            correlation_id: session.id,
        }
    }

    /// Id of the next settlement of `session`, given what it has settled so far.
    pub fn mining_complete_id(session: &Session) -> Hash256 {
        Hash256::derive(
            "mining_complete",
            &[session.id.as_bytes(), &session.settled.to_le_bytes()],
        )
    }

    /// A claim. `sequence` is the owner's applied-event count at claim time,
    /// which is unique per committed balance state.
    pub fn claim(owner: &OwnerId, amount: u64, timestamp: u64, sequence: u64) -> Self {
        let id = Hash256::derive(
            "claim",
            &[owner.as_str().as_bytes(), &timestamp.to_le_bytes(), &sequence.to_le_bytes()],
        );
        Self {
            id,
            owner: owner.clone(),
            kind: EventKind::Claim,
            amount,
            timestamp,
            correlation_id: id,
        }
    }

    /// Sponsor commission, unique per `(referred, trigger)`.
    pub fn referral_bonus(
        sponsor: &OwnerId,
        referred: &OwnerId,
        trigger: &Hash256,
        amount: u64,
        timestamp: u64,
    ) -> Self {
        let id = Hash256::derive(
            "referral_bonus",
            &[referred.as_str().as_bytes(), trigger.as_bytes()],
        );
        Self {
            id,
            owner: sponsor.clone(),
            kind: EventKind::ReferralBonus,
            amount,
            timestamp,
            correlation_id: *trigger,
        }
    }

    /// One share of a completed cycle, unique per `(stake, target)`.
    pub fn cycle_payout(
        owner: &OwnerId,
        stake_id: &Hash256,
        target: PayoutTarget,
        amount: u64,
        timestamp: u64,
    ) -> Self {
        let id = Hash256::derive("cycle_payout", &[stake_id.as_bytes(), target.tag().as_bytes()]);
        Self {
            id,
            owner: owner.clone(),
            kind: EventKind::CyclePayout(target),
            amount,
            timestamp,
            correlation_id: *stake_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

/// Cached aggregate of an owner's events. Always reproducible as a fold
/// over those events (see [`crate::ledger::fold_events`]).
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Balance {
    pub owner: OwnerId,
    pub claimable: u64,
    pub claimed: u64,
    /// Sum of events that contribute to earnings.
    pub total_earned: u64,
    pub reinvestment: u64,
    pub reputation: u64,
    /// Pool share held by this account (non-zero only for the pool owner).
    pub pool: u64,
    pub last_claim_at: Option<u64>,
    pub cooldown_until: u64,
    /// Number of events folded into this aggregate.
    pub events_applied: u64,
    pub version: u64,
}

impl Balance {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            claimable: 0,
            claimed: 0,
            total_earned: 0,
            reinvestment: 0,
            reputation: 0,
            pool: 0,
            last_claim_at: None,
            cooldown_until: 0,
            events_applied: 0,
            version: 0,
        }
    }

    /// Seconds of cooldown left at `now`, 0 if a claim is allowed.
    pub fn cooldown_remaining(&self, now: u64) -> u64 {
        self.cooldown_until.saturating_sub(now)
    }
}

/// A field of [`Balance`] checked during reconciliation.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum BalanceField {
    TotalEarned,
    Claimable,
    Claimed,
    Reinvestment,
    Reputation,
    Pool,
}

/// Drift between a cached aggregate and the event fold.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Discrepancy {
    pub owner: OwnerId,
    pub field: BalanceField,
    pub cached: u64,
    pub computed: u64,
    pub detected_at: u64,
}

// ---------------------------------------------------------------------------
// Referrals and entitlements
// ---------------------------------------------------------------------------

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum ReferralStatus {
    Pending,
    Active,
}

/// Sponsor relationship. Keyed by the referred owner: each owner has at most one sponsor.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ReferralEdge {
    pub sponsor: OwnerId,
    pub referred: OwnerId,
    pub status: ReferralStatus,
    pub created_at: u64,
    pub activated_at: Option<u64>,
}

/// One row of a sponsor's team listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TeamMemberView {
    pub owner: OwnerId,
    pub status: ReferralStatus,
    pub joined_at: u64,
    pub activated_at: Option<u64>,
    pub total_earned: u64,
}

/// Upgrades and quota that shape an owner's sessions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Entitlements {
    pub owner: OwnerId,
    /// Fixed-emission multiplier (10,000 = 1.0×).
    pub rate_multiplier_bps: u64,
    /// Sessions last 48 hours instead of 24.
    pub extended_session: bool,
    /// Sessions may be opened without consuming quota.
    pub unrestricted_mining: bool,
    /// Remaining session quota when mining is restricted.
    pub sessions_remaining: u32,
    /// Session the last quota unit was spent on.
    #[serde(default)]
    pub quota_spent_on: Option<Hash256>,
}

impl Entitlements {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            rate_multiplier_bps: crate::constants::BASE_RATE_MULTIPLIER_BPS,
            extended_session: false,
            unrestricted_mining: true,
            sessions_remaining: 0,
            quota_spent_on: None,
        }
    }

    pub fn can_open_session(&self) -> bool {
        self.unrestricted_mining || self.sessions_remaining > 0
    }

    /// Spend one unit of quota on `session`. Spending twice on the same
    /// session costs one unit. Returns false if quota is exhausted.
    pub fn spend_quota(&mut self, session: &Hash256) -> bool {
        if self.unrestricted_mining || self.quota_spent_on == Some(*session) {
            return true;
        }
        if self.sessions_remaining == 0 {
            return false;
        }
        self.sessions_remaining -= 1;
        self.quota_spent_on = Some(*session);
        true
    }
}
