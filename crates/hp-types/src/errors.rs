use thiserror::Error;

use crate::experiment::ExperimentState;

/// Main error type for the hp orchestrator
#[derive(Error, Debug)]
pub enum HpError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Experiment error: {0}")]
    Experiment(#[from] ExperimentError),

    #[error("Searcher error: {0}")]
    Searcher(#[from] SearcherError),

    #[error("Event queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Resource manager error: {0}")]
    ResourceManager(#[from] ResourceManagerError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HpError {
    /// Client-caused failures that left the experiment untouched.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Queue(_))
    }

    /// Commands rejected because of the experiment's current state.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Experiment(ExperimentError::IncompatibleState { .. })
        )
    }
}

/// Local, client-caused failures. Reported to the caller; no state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("no such trial")]
    NoSuchTrial,

    #[error("trial has no state")]
    TrialHasNoState,

    #[error("expected op {expected} but received op {received}")]
    UnexpectedOperation { expected: String, received: String },

    #[error("received op {op} which was previously completed")]
    OperationAlreadyCompleted { op: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("experiment does not use custom search")]
    NotCustomSearch,

    #[error("trial {request_id} already exists")]
    DuplicateTrial { request_id: String },
}

/// Experiment lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExperimentError {
    #[error("experiment in incompatible state {state}")]
    IncompatibleState { state: ExperimentState },

    #[error("illegal transition from {from} to {to} for experiment {experiment_id}")]
    IllegalTransition {
        experiment_id: i64,
        from: ExperimentState,
        to: ExperimentState,
    },

    #[error("experiment is already in a terminal state")]
    AlreadyTerminal,

    #[error("experiment {experiment_id} has stopped")]
    Stopped { experiment_id: i64 },
}

/// Errors returned by search methods. The controller treats all of them as
/// fatal to the experiment.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearcherError {
    #[error("search method failed: {message}")]
    MethodFailed { message: String },

    #[error("failed to snapshot searcher: {message}")]
    Snapshot { message: String },

    #[error("failed to restore searcher snapshot: {message}")]
    Restore { message: String },

    #[error("unknown trial {request_id}")]
    UnknownTrial { request_id: String },

    #[error("invalid hyperparameter space: {message}")]
    InvalidSpace { message: String },
}

/// Errors from the custom searcher event queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("event {0} not found")]
    EventNotFound(i32),
}

/// Persistence errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("record not found: {what}")]
    NotFound { what: String },

    #[error("write failed: {message}")]
    WriteFailed { message: String },

    #[error("corrupt snapshot: {message}")]
    CorruptSnapshot { message: String },
}

/// Errors surfaced by the cluster resource manager.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceManagerError {
    #[error("invalid resource pool name {0}")]
    InvalidResourcePool(String),

    #[error("resource manager does not support setting resource pools")]
    ResourcePoolsUnsupported,

    #[error("request rejected by resource manager: {reason}")]
    Rejected { reason: String },

    #[error("resource manager unavailable")]
    Unavailable,
}

/// Checkpoint resolution errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("no checkpoint found for source trial {trial_id}")]
    NoneForTrial { trial_id: i64 },

    #[error("no checkpoint found with UUID {uuid}")]
    NoneWithUuid { uuid: String },

    #[error("invalid source checkpoint UUID: {value}")]
    InvalidUuid { value: String },

    #[error("invalid request ID in Create operation: {request_id}")]
    InvalidRequestId { request_id: String },

    #[error("failed to get checkpoint: {message}")]
    LookupFailed { message: String },
}

/// Result type alias for hp operations
pub type HpResult<T> = Result<T, HpError>;

/// Macro for creating validation errors on a named field
#[macro_export]
macro_rules! invalid_value {
    ($field:expr, $($arg:tt)*) => {
        $crate::errors::ValidationError::InvalidValue {
            field: $field.to_string(),
            message: format!($($arg)*),
        }
    };
}
