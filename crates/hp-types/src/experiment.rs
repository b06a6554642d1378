//! Experiment model and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ExperimentConfig;
use crate::errors::ExperimentError;
use crate::ids::{ExperimentId, JobId, UserId};

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentState {
    Active,
    Paused,
    StoppingCompleted,
    StoppingCanceled,
    StoppingError,
    Completed,
    Canceled,
    Error,
}

impl ExperimentState {
    /// States from which the experiment is winding down its trials.
    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            Self::StoppingCompleted | Self::StoppingCanceled | Self::StoppingError
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Error)
    }

    /// The terminal state a stopping state settles into, if this is one.
    pub fn terminal_for_stopping(self) -> Option<Self> {
        match self {
            Self::StoppingCompleted => Some(Self::Completed),
            Self::StoppingCanceled => Some(Self::Canceled),
            Self::StoppingError => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the permitted-transition table allows `self -> to`.
    pub fn can_transition_to(self, to: Self) -> bool {
        use ExperimentState::*;
        match self {
            Active => matches!(to, Paused | StoppingCompleted | StoppingCanceled | StoppingError),
            Paused => matches!(to, Active | StoppingCompleted | StoppingCanceled | StoppingError),
            StoppingCompleted => matches!(to, Completed | Error),
            StoppingCanceled => matches!(to, Canceled | Error),
            StoppingError => matches!(to, Error),
            Completed | Canceled | Error => false,
        }
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::StoppingCompleted => "STOPPING_COMPLETED",
            Self::StoppingCanceled => "STOPPING_CANCELED",
            Self::StoppingError => "STOPPING_ERROR",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A state change together with the human-readable reason behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWithReason {
    pub state: ExperimentState,
    pub reason: String,
}

impl StateWithReason {
    pub fn new(state: ExperimentState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
        }
    }
}

/// A hyperparameter-search campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub job_id: JobId,
    pub config: ExperimentConfig,
    pub state: ExperimentState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub owner_id: UserId,
    pub username: String,
    /// Fraction of the search completed, as last persisted.
    pub progress: Option<f64>,
}

impl Experiment {
    pub fn new(id: ExperimentId, config: ExperimentConfig, owner_id: UserId, username: &str) -> Self {
        Self {
            id,
            job_id: JobId::new(),
            config,
            state: ExperimentState::Active,
            start_time: Utc::now(),
            end_time: None,
            owner_id,
            username: username.to_string(),
            progress: None,
        }
    }

    /// Move to `state`. Returns `Ok(false)` when already there, and an error
    /// when the transition table forbids the move.
    pub fn transition(&mut self, state: ExperimentState) -> Result<bool, ExperimentError> {
        if self.state == state {
            return Ok(false);
        }
        if !self.state.can_transition_to(state) {
            return Err(ExperimentError::IllegalTransition {
                experiment_id: self.id,
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        if state.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(true)
    }
}
