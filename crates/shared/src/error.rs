use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    clock::ClockEventKind,
    domain::{ClockId, ClockState, LobbyId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidTransition,
    ClockNotActive,
    LobbyPaused,
    AlreadyRunning,
    Conflict,
    StoreUnavailable,
    DuplicateId,
    Validation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Every way a clock or lobby transition can be refused.
///
/// Messages name the violated invariant so an interface can show them as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GametimeError {
    #[error("lobby {0} does not exist")]
    LobbyNotFound(LobbyId),
    #[error("no lobby contains clock {0}")]
    ClockNotFound(ClockId),
    #[error("cannot {attempted} a clock that is {state}")]
    InvalidTransition {
        state: ClockState,
        attempted: ClockEventKind,
    },
    #[error("clock {0} does not have the turn")]
    ClockNotActive(ClockId),
    #[error("lobby {0} is not running")]
    LobbyPaused(LobbyId),
    #[error("lobby {0} is already running")]
    AlreadyRunning(LobbyId),
    #[error("lobby {0} was changed by someone else; reload and try again")]
    Conflict(LobbyId),
    #[error("lobby store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("id {0} is already in use")]
    DuplicateId(String),
    #[error("{0}")]
    Validation(String),
}

impl GametimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LobbyNotFound(_) | Self::ClockNotFound(_) => ErrorCode::NotFound,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::ClockNotActive(_) => ErrorCode::ClockNotActive,
            Self::LobbyPaused(_) => ErrorCode::LobbyPaused,
            Self::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Self::DuplicateId(_) => ErrorCode::DuplicateId,
            Self::Validation(_) => ErrorCode::Validation,
        }
    }

    /// Only a lost compare-and-swap is worth re-reading and recomputing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<GametimeError> for ApiError {
    fn from(value: GametimeError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
