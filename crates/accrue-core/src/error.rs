//! Error types for the accrue engine.
use thiserror::Error;

use crate::types::{Hash256, OwnerId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("amount must be greater than zero")] NonPositiveAmount,
    #[error("amount {requested} exceeds available {available}")] ExceedsAvailable { requested: u64, available: u64 },
    #[error("amount {amount} below minimum {minimum}")] BelowMinimum { amount: u64, minimum: u64 },
    #[error("owner cannot refer themselves")] SelfReferral,
    #[error("{referred} is already referred by {sponsor}")] AlreadyReferred { referred: OwnerId, sponsor: OwnerId },
    #[error("reserved owner id: {0}")] ReservedOwner(OwnerId),
    #[error("arithmetic overflow")] Overflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotEligible {
    #[error("claim cooldown active, {remaining_secs}s remaining")] CooldownActive { remaining_secs: u64 },
    #[error("session quota exhausted")] QuotaExhausted,
    #[error("no active session")] NoActiveSession,
    #[error("stake cycle complete; deposit again to resume")] CycleComplete,
    #[error("a stake is still cycling")] StakeActive,
    #[error("nothing to claim")] NothingToClaim,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient store failure: {0}")] Transient(String),
    #[error("{entity} version conflict: expected {expected}, found {found}")] VersionConflict { entity: &'static str, expected: u64, found: u64 },
    #[error("owner {owner} already has active session {existing}")] SessionExists { owner: OwnerId, existing: Hash256 },
    #[error("corrupt record: {0}")] Corrupt(String),
    #[error("backend: {0}")] Backend(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] NotEligible(#[from] NotEligible),
    #[error("owner already has an active session")] AlreadyActive,
    #[error("conflict: {0}")] Conflict(String),
    #[error("store unavailable, retry later: {0}")] TransientStore(String),
    #[error("store: {0}")] Store(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => Self::TransientStore(msg),
            StoreError::VersionConflict { .. } => Self::Conflict(e.to_string()),
            StoreError::SessionExists { .. } => Self::AlreadyActive,
            StoreError::Corrupt(_) | StoreError::Backend(_) => Self::Store(e.to_string()),
        }
    }
}

impl EngineError {
    /// Whether the caller may usefully retry the request as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::TransientStore(_))
    }
}
