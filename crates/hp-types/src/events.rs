//! Searcher events delivered to an external decision-maker.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::RequestId;

/// Why a trial stopped before its searcher asked it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitedReason {
    /// The trial failed.
    Errored,
    /// The user stopped the trial.
    UserCanceled,
    /// The trial reported its hyperparameters as invalid.
    InvalidHp,
    /// The trial found its hyperparameters invalid during initialization.
    InitInvalidHp,
}

impl fmt::Display for ExitedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Errored => f.write_str("errored"),
            Self::UserCanceled => f.write_str("user canceled"),
            Self::InvalidHp => f.write_str("invalid hyperparameters"),
            Self::InitInvalidHp => f.write_str("invalid hyperparameters at init"),
        }
    }
}

/// Exit reason as published on the event wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventExitedReason {
    Errored,
    UserRequestedStop,
    InvalidHp,
    InitInvalidHp,
}

impl From<ExitedReason> for EventExitedReason {
    fn from(reason: ExitedReason) -> Self {
        match reason {
            ExitedReason::Errored => Self::Errored,
            ExitedReason::UserCanceled => Self::UserRequestedStop,
            ExitedReason::InvalidHp => Self::InvalidHp,
            ExitedReason::InitInvalidHp => Self::InitInvalidHp,
        }
    }
}

/// Payload of a searcher event, one variant per lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearcherEventKind {
    InitialOperations {},
    TrialCreated {
        request_id: RequestId,
    },
    TrialProgress {
        request_id: RequestId,
        partial_units: f64,
    },
    ValidationCompleted {
        request_id: RequestId,
        validate_after_length: u64,
        metric: f64,
    },
    TrialExitedEarly {
        request_id: RequestId,
        exited_reason: EventExitedReason,
    },
    TrialClosed {
        request_id: RequestId,
    },
}

/// A queued event with its queue-scoped id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherEvent {
    pub id: i32,
    #[serde(flatten)]
    pub event: SearcherEventKind,
}
