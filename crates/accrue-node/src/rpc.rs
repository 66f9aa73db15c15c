//! JSON-RPC server for the accrue node.
//!
//! Uses jsonrpsee 0.24. Every mutating method reads "now" from the engine's
//! clock; callers never supply timestamps.
//!
//! Error codes:
//!
//! | code     | meaning                         |
//! |----------|---------------------------------|
//! | `-32602` | invalid amount or owner         |
//! | `-10`    | not eligible (cooldown, quota)  |
//! | `-11`    | session already active          |
//! | `-12`    | concurrent modification         |
//! | `-13`    | store unavailable, retry later  |
//! | `-1`     | anything else                   |

use std::sync::Arc;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use accrue_core::error::EngineError;
use accrue_core::types::{
    Balance, Discrepancy, Entitlements, OwnerId, ReferralEdge, Session, SessionStatus, Stake, StrategyKind,
    TeamMemberView,
};
use accrue_engine::{AccrualView, ClaimReceipt, ReconcileOutcome, RewardEngine, RolloverOutcome, Settlement};

use crate::error::NodeError;

pub const INVALID_PARAMS: i32 = -32602;
pub const NOT_ELIGIBLE: i32 = -10;
pub const ALREADY_ACTIVE: i32 = -11;
pub const CONFLICT: i32 = -12;
pub const STORE_UNAVAILABLE: i32 = -13;
pub const OTHER: i32 = -1;

/// JSON representation of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJson {
    /// Session id as hex.
    pub id: String,
    pub owner: String,
    pub start: u64,
    pub end: u64,
    pub strategy: StrategyKind,
    /// Rate snapshot taken at open, base units per day.
    pub daily_rate: u64,
    pub session_cap: u64,
    /// Accrual start for the unsettled remainder.
    pub baseline: u64,
    /// Already moved to claimable.
    pub settled: u64,
    pub status: SessionStatus,
}

impl From<&Session> for SessionJson {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.to_string(),
            owner: s.owner.to_string(),
            start: s.start,
            end: s.end,
            strategy: s.rate.strategy,
            daily_rate: s.rate.daily_rate,
            session_cap: s.rate.session_cap,
            baseline: s.baseline,
            settled: s.settled,
            status: s.status,
        }
    }
}

/// JSON representation of a live accrual reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualJson {
    pub owner: String,
    /// Unsettled accrual of the active session.
    pub live_accrued: u64,
    /// Seconds until the active session ends.
    pub session_countdown: u64,
    pub claimable: u64,
    pub cooldown_remaining: u64,
    /// Active session id as hex.
    pub session_id: Option<String>,
    pub strategy: Option<StrategyKind>,
}

impl From<AccrualView> for AccrualJson {
    fn from(v: AccrualView) -> Self {
        Self {
            owner: v.owner.to_string(),
            live_accrued: v.live_accrued,
            session_countdown: v.session_countdown,
            claimable: v.claimable,
            cooldown_remaining: v.cooldown_remaining,
            session_id: v.session_id.map(|id| id.to_string()),
            strategy: v.strategy,
        }
    }
}

/// JSON representation of a claim receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimJson {
    pub amount: u64,
    /// Live accrual settled as part of the claim.
    pub settled: u64,
    /// Claimable balance after the claim.
    pub claimable: u64,
    pub claimed: u64,
    pub cooldown_until: u64,
}

impl From<ClaimReceipt> for ClaimJson {
    fn from(r: ClaimReceipt) -> Self {
        Self {
            amount: r.amount,
            settled: r.settled,
            claimable: r.balance.claimable,
            claimed: r.balance.claimed,
            cooldown_until: r.cooldown_until,
        }
    }
}

/// JSON representation of a rollover attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverJson {
    /// One of `no_session`, `not_expired`, `superseded`, `rolled_over`.
    pub outcome: String,
    pub remaining_secs: Option<u64>,
    /// Id of the session that was closed, as hex.
    pub previous: Option<String>,
    pub settled: u64,
    pub cycle_completed: bool,
    pub successor: Option<SessionJson>,
}

impl From<RolloverOutcome> for RolloverJson {
    fn from(o: RolloverOutcome) -> Self {
        let empty = |outcome: &str| Self {
            outcome: outcome.to_string(),
            remaining_secs: None,
            previous: None,
            settled: 0,
            cycle_completed: false,
            successor: None,
        };
        match o {
            RolloverOutcome::NoSession => empty("no_session"),
            RolloverOutcome::NotExpired { remaining_secs } => Self {
                remaining_secs: Some(remaining_secs),
                ..empty("not_expired")
            },
            RolloverOutcome::Superseded => empty("superseded"),
            RolloverOutcome::RolledOver {
                previous,
                settled,
                cycle_completed,
                successor,
            } => Self {
                previous: Some(previous.to_string()),
                settled,
                cycle_completed,
                successor: successor.as_ref().map(SessionJson::from),
                ..empty("rolled_over")
            },
        }
    }
}

/// JSON representation of a manual session completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementJson {
    pub session: SessionJson,
    pub settled: u64,
    pub cycle_completed: bool,
}

impl From<Settlement> for SettlementJson {
    fn from(s: Settlement) -> Self {
        Self {
            session: SessionJson::from(&s.session),
            settled: s.amount,
            cycle_completed: s.cycle.completed,
        }
    }
}

/// JSON representation of a stake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeJson {
    /// Stake id as hex.
    pub id: String,
    pub owner: String,
    pub amount: u64,
    pub start_date: u64,
    pub total_earned: u64,
    pub is_active: bool,
    /// Progress toward the 300% cycle cap.
    pub cycle_progress_percent: f64,
}

impl From<&Stake> for StakeJson {
    fn from(s: &Stake) -> Self {
        Self {
            id: s.id.to_string(),
            owner: s.owner.to_string(),
            amount: s.amount,
            start_date: s.start_date,
            total_earned: s.total_earned,
            is_active: s.is_active,
            cycle_progress_percent: s.cycle_progress_percent(),
        }
    }
}

/// JSON representation of a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileJson {
    /// One of `consistent`, `refreshed`, `corrected`.
    pub outcome: String,
    pub discrepancies: Vec<Discrepancy>,
}

impl From<ReconcileOutcome> for ReconcileJson {
    fn from(o: ReconcileOutcome) -> Self {
        let (outcome, discrepancies) = match o {
            ReconcileOutcome::Consistent => ("consistent", Vec::new()),
            ReconcileOutcome::Refreshed => ("refreshed", Vec::new()),
            ReconcileOutcome::Corrected(found) => ("corrected", found),
        };
        Self {
            outcome: outcome.to_string(),
            discrepancies,
        }
    }
}

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// Map an engine error onto its JSON-RPC error code.
pub fn engine_error(e: EngineError) -> ErrorObjectOwned {
    let code = match &e {
        EngineError::Validation(_) => INVALID_PARAMS,
        EngineError::NotEligible(_) => NOT_ELIGIBLE,
        EngineError::AlreadyActive => ALREADY_ACTIVE,
        EngineError::Conflict(_) => CONFLICT,
        EngineError::TransientStore(_) => STORE_UNAVAILABLE,
        EngineError::Store(_) => OTHER,
    };
    rpc_error(code, &e.to_string())
}

/// Validate an owner id from a request.
pub fn parse_owner(raw: &str) -> Result<OwnerId, ErrorObjectOwned> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(rpc_error(INVALID_PARAMS, "owner must not be empty"));
    }
    Ok(OwnerId::new(trimmed))
}

/// The accrue JSON-RPC interface.
#[rpc(server)]
pub trait AccrueRpc {
    /// Live accrual, countdown, claimable balance and cooldown.
    /// Rolls an expired session over if the owner is not busy.
    #[method(name = "observeaccrual")]
    async fn observe_accrual(&self, owner: String) -> Result<AccrualJson, ErrorObjectOwned>;

    /// Opens a mining session.
    #[method(name = "startsession")]
    async fn start_session(&self, owner: String) -> Result<SessionJson, ErrorObjectOwned>;

    /// Claims `amount` base units, settling live accrual first.
    #[method(name = "claim")]
    async fn claim(&self, owner: String, amount: u64) -> Result<ClaimJson, ErrorObjectOwned>;

    /// Settles and replaces the owner's session if it has ended.
    #[method(name = "rolloverifexpired")]
    async fn rollover_if_expired(&self, owner: String) -> Result<RolloverJson, ErrorObjectOwned>;

    /// Ends the active session early and settles it.
    #[method(name = "completesession")]
    async fn complete_session(&self, owner: String) -> Result<SettlementJson, ErrorObjectOwned>;

    /// Opens a stake. `deposit_ref` makes the call idempotent.
    #[method(name = "deposit")]
    async fn deposit(&self, owner: String, amount: u64, deposit_ref: String) -> Result<StakeJson, ErrorObjectOwned>;

    /// Returns the owner's current stake, if any.
    #[method(name = "getstake")]
    async fn get_stake(&self, owner: String) -> Result<Option<StakeJson>, ErrorObjectOwned>;

    /// Records `sponsor` as the sponsor of `referred`.
    #[method(name = "registerreferral")]
    async fn register_referral(&self, sponsor: String, referred: String) -> Result<ReferralEdge, ErrorObjectOwned>;

    /// Returns the owner's cached balance.
    #[method(name = "getbalance")]
    async fn get_balance(&self, owner: String) -> Result<Balance, ErrorObjectOwned>;

    /// Returns the sponsor's referred owners.
    #[method(name = "getteam")]
    async fn get_team(&self, sponsor: String) -> Result<Vec<TeamMemberView>, ErrorObjectOwned>;

    /// Recomputes the owner's balance from events and corrects drift.
    #[method(name = "reconcile")]
    async fn reconcile(&self, owner: String) -> Result<ReconcileJson, ErrorObjectOwned>;

    #[method(name = "getentitlements")]
    async fn get_entitlements(&self, owner: String) -> Result<Entitlements, ErrorObjectOwned>;

    /// Replaces the owner's entitlements. Applies from the next session.
    #[method(name = "setentitlements")]
    async fn set_entitlements(&self, entitlements: Entitlements) -> Result<Entitlements, ErrorObjectOwned>;
}

/// Implementation of the accrue JSON-RPC server.
pub struct RpcServerImpl {
    engine: Arc<RewardEngine>,
}

impl RpcServerImpl {
    /// Create a new RPC server implementation wrapping the given engine.
    pub fn new(engine: Arc<RewardEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl AccrueRpcServer for RpcServerImpl {
    async fn observe_accrual(&self, owner: String) -> Result<AccrualJson, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        let view = self
            .engine
            .observe_accrual(&owner, self.engine.now())
            .await
            .map_err(engine_error)?;
        Ok(view.into())
    }

    async fn start_session(&self, owner: String) -> Result<SessionJson, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        let session = self
            .engine
            .start_session(&owner, self.engine.now())
            .await
            .map_err(engine_error)?;
        Ok(SessionJson::from(&session))
    }

    async fn claim(&self, owner: String, amount: u64) -> Result<ClaimJson, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        let receipt = self
            .engine
            .claim(&owner, amount, self.engine.now())
            .await
            .map_err(engine_error)?;
        Ok(receipt.into())
    }

    async fn rollover_if_expired(&self, owner: String) -> Result<RolloverJson, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        let outcome = self
            .engine
            .rollover_if_expired(&owner, self.engine.now())
            .await
            .map_err(engine_error)?;
        Ok(outcome.into())
    }

    async fn complete_session(&self, owner: String) -> Result<SettlementJson, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        let settlement = self
            .engine
            .complete_session(&owner, self.engine.now())
            .await
            .map_err(engine_error)?;
        Ok(settlement.into())
    }

    async fn deposit(&self, owner: String, amount: u64, deposit_ref: String) -> Result<StakeJson, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        if deposit_ref.is_empty() {
            return Err(rpc_error(INVALID_PARAMS, "deposit_ref must not be empty"));
        }
        let stake = self
            .engine
            .deposit(&owner, amount, &deposit_ref, self.engine.now())
            .await
            .map_err(engine_error)?;
        Ok(StakeJson::from(&stake))
    }

    async fn get_stake(&self, owner: String) -> Result<Option<StakeJson>, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        let stake = self.engine.stake(&owner).await.map_err(engine_error)?;
        Ok(stake.as_ref().map(StakeJson::from))
    }

    async fn register_referral(&self, sponsor: String, referred: String) -> Result<ReferralEdge, ErrorObjectOwned> {
        let sponsor = parse_owner(&sponsor)?;
        let referred = parse_owner(&referred)?;
        self.engine
            .register_referral(&sponsor, &referred, self.engine.now())
            .await
            .map_err(engine_error)
    }

    async fn get_balance(&self, owner: String) -> Result<Balance, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        self.engine.balance(&owner).await.map_err(engine_error)
    }

    async fn get_team(&self, sponsor: String) -> Result<Vec<TeamMemberView>, ErrorObjectOwned> {
        let sponsor = parse_owner(&sponsor)?;
        self.engine.team(&sponsor).await.map_err(engine_error)
    }

    async fn reconcile(&self, owner: String) -> Result<ReconcileJson, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        let outcome = self
            .engine
            .reconcile(&owner, self.engine.now())
            .await
            .map_err(engine_error)?;
        Ok(outcome.into())
    }

    async fn get_entitlements(&self, owner: String) -> Result<Entitlements, ErrorObjectOwned> {
        let owner = parse_owner(&owner)?;
        self.engine.entitlements(&owner).await.map_err(engine_error)
    }

    async fn set_entitlements(&self, entitlements: Entitlements) -> Result<Entitlements, ErrorObjectOwned> {
        let owner = parse_owner(entitlements.owner.as_str())?;
        let entitlements = Entitlements { owner, ..entitlements };
        self.engine
            .set_entitlements(&entitlements)
            .await
            .map_err(engine_error)?;
        Ok(entitlements)
    }
}

/// Start the JSON-RPC server on the given address.
///
/// Returns a [`ServerHandle`] that can be used to stop the server.
pub async fn start_rpc_server(addr: &str, engine: Arc<RewardEngine>) -> Result<ServerHandle, NodeError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| NodeError::Rpc(e.to_string()))?;

    let rpc_impl = RpcServerImpl::new(engine);
    let handle = server.start(rpc_impl.into_rpc());

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrue_core::error::{NotEligible, ValidationError};
    use accrue_core::memory_store::MemoryStore;
    use accrue_core::policy::RewardPolicy;
    use accrue_core::traits::ManualClock;
    use accrue_core::types::{Hash256, RateTier};

    const T0: u64 = 1_700_000_000;

    fn rpc() -> (Arc<ManualClock>, RpcServerImpl) {
        let clock = Arc::new(ManualClock::new(T0));
        let engine = RewardEngine::new(Arc::new(MemoryStore::new()), RewardPolicy::default()).with_clock(clock.clone());
        (clock, RpcServerImpl::new(Arc::new(engine)))
    }

    // ------------------------------------------------------------------
    // Error mapping
    // ------------------------------------------------------------------

    #[test]
    fn engine_errors_map_to_codes() {
        let cases = [
            (EngineError::Validation(ValidationError::NonPositiveAmount), INVALID_PARAMS),
            (
                EngineError::NotEligible(NotEligible::CooldownActive { remaining_secs: 5 }),
                NOT_ELIGIBLE,
            ),
            (EngineError::AlreadyActive, ALREADY_ACTIVE),
            (EngineError::Conflict("x".into()), CONFLICT),
            (EngineError::TransientStore("x".into()), STORE_UNAVAILABLE),
            (EngineError::Store("x".into()), OTHER),
        ];
        for (err, code) in cases {
            assert_eq!(engine_error(err).code(), code);
        }
    }

    #[test]
    fn cooldown_message_carries_remaining_seconds() {
        let err = engine_error(NotEligible::CooldownActive { remaining_secs: 1_200 }.into());
        assert!(err.message().contains("1200"), "{}", err.message());
    }

    #[test]
    fn parse_owner_rejects_blank() {
        assert_eq!(parse_owner("  ").unwrap_err().code(), INVALID_PARAMS);
        assert_eq!(parse_owner(" alice ").unwrap(), OwnerId::new("alice"));
    }

    // ------------------------------------------------------------------
    // JSON shapes
    // ------------------------------------------------------------------

    #[test]
    fn session_json_uses_hex_id() {
        let owner = OwnerId::new("alice");
        let session = Session {
            id: Session::derive_id(&owner, T0, &Hash256::ZERO),
            owner,
            start: T0,
            end: T0 + 86_400,
            rate: RateTier {
                strategy: StrategyKind::FixedEmission,
                daily_rate: 5,
                session_cap: 5,
            },
            baseline: T0,
            settled: 0,
            status: SessionStatus::Active,
            version: 1,
        };
        let json = serde_json::to_value(SessionJson::from(&session)).unwrap();
        assert_eq!(json["id"].as_str().unwrap().len(), 64);
        assert_eq!(json["owner"], "alice");
        assert_eq!(json["end"], T0 + 86_400);
    }

    #[test]
    fn rollover_json_outcomes() {
        assert_eq!(RolloverJson::from(RolloverOutcome::NoSession).outcome, "no_session");
        let j = RolloverJson::from(RolloverOutcome::NotExpired { remaining_secs: 9 });
        assert_eq!(j.outcome, "not_expired");
        assert_eq!(j.remaining_secs, Some(9));
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn start_then_observe() {
        let (clock, rpc) = rpc();
        let session = rpc.start_session("alice".into()).await.unwrap();
        assert_eq!(session.start, T0);

        clock.advance(43_200);
        let view = rpc.observe_accrual("alice".into()).await.unwrap();
        assert_eq!(view.live_accrued, 25 * accrue_core::constants::UNIT);
        assert_eq!(view.session_countdown, 43_200);
        assert_eq!(view.session_id, Some(session.id));
    }

    #[tokio::test]
    async fn second_start_is_already_active() {
        let (_clock, rpc) = rpc();
        rpc.start_session("alice".into()).await.unwrap();
        let err = rpc.start_session("alice".into()).await.unwrap_err();
        assert_eq!(err.code(), ALREADY_ACTIVE);
    }

    #[tokio::test]
    async fn claim_over_available_is_invalid_params() {
        let (clock, rpc) = rpc();
        rpc.start_session("alice".into()).await.unwrap();
        clock.advance(600);
        let err = rpc.claim("alice".into(), 1_000 * accrue_core::constants::UNIT).await.unwrap_err();
        assert_eq!(err.code(), INVALID_PARAMS);
    }

    #[tokio::test]
    async fn empty_deposit_ref_is_rejected() {
        let (_clock, rpc) = rpc();
        let err = rpc.deposit("alice".into(), 100, String::new()).await.unwrap_err();
        assert_eq!(err.code(), INVALID_PARAMS);
    }

    #[tokio::test]
    async fn entitlements_round_trip_through_handlers() {
        let (_clock, rpc) = rpc();
        let mut ent = rpc.get_entitlements("bob".into()).await.unwrap();
        assert!(ent.unrestricted_mining);
        ent.extended_session = true;
        rpc.set_entitlements(ent.clone()).await.unwrap();
        assert_eq!(rpc.get_entitlements("bob".into()).await.unwrap(), ent);
    }
}
