//! Operations issued by search methods to control trial execution.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hparams::HParamSample;
use crate::ids::RequestId;

/// Unit in which training length is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Records,
    Batches,
    Epochs,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Records => f.write_str("records"),
            Self::Batches => f.write_str("batches"),
            Self::Epochs => f.write_str("epochs"),
        }
    }
}

/// An amount of training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Length {
    pub unit: Unit,
    pub units: u64,
}

impl Length {
    pub fn new(unit: Unit, units: u64) -> Self {
        Self { unit, units }
    }

    pub fn batches(units: u64) -> Self {
        Self::new(Unit::Batches, units)
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.units, self.unit)
    }
}

/// Points a new trial at the latest checkpoint of an earlier trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub request_id: RequestId,
}

/// Create a new trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Create {
    pub request_id: RequestId,
    pub trial_seed: u32,
    pub hparams: HParamSample,
    /// Warm-start source overriding the experiment-wide checkpoint.
    #[serde(default)]
    pub checkpoint: Option<CheckpointRef>,
}

impl Create {
    pub fn new(request_id: RequestId, trial_seed: u32, hparams: HParamSample) -> Self {
        Self {
            request_id,
            trial_seed,
            hparams,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, source: RequestId) -> Self {
        self.checkpoint = Some(CheckpointRef { request_id: source });
        self
    }
}

/// Train a trial until `length` in total, then validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidateAfter {
    pub request_id: RequestId,
    pub length: Length,
}

impl ValidateAfter {
    pub fn new(request_id: RequestId, length: Length) -> Self {
        Self { request_id, length }
    }
}

impl fmt::Display for ValidateAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidateAfter({}, {})", self.request_id, self.length)
    }
}

/// The sole vocabulary a search method has for controlling execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Create(Create),
    ValidateAfter(ValidateAfter),
    Close { request_id: RequestId },
    /// Stop the experiment; `failure` selects the error path.
    Shutdown {
        #[serde(default)]
        failure: bool,
    },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create(op) => write!(f, "Create({})", op.request_id),
            Self::ValidateAfter(op) => op.fmt(f),
            Self::Close { request_id } => write!(f, "Close({request_id})"),
            Self::Shutdown { failure } => write!(f, "Shutdown(failure: {failure})"),
        }
    }
}

/// Per-trial bookkeeping of the operations issued to it.
///
/// At most one `op` is outstanding at a time; `closed` implies `complete`
/// once the trial has exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSearcherState {
    pub create: Create,
    #[serde(default)]
    pub op: Option<ValidateAfter>,
    pub complete: bool,
    pub closed: bool,
}

impl TrialSearcherState {
    pub fn new(create: Create) -> Self {
        Self {
            create,
            op: None,
            complete: true,
            closed: false,
        }
    }

    /// The outstanding operation, if one has been issued and not completed.
    pub fn outstanding(&self) -> Option<&ValidateAfter> {
        self.op.as_ref().filter(|_| !self.complete)
    }
}
