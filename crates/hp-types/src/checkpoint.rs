//! Checkpoints produced by trials, used for warm starts and garbage collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::ids::{ExperimentId, RequestId, TrialId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointState {
    Active,
    Completed,
    Error,
    Deleted,
}

/// Persisted training state of a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub uuid: Uuid,
    pub experiment_id: ExperimentId,
    pub trial_id: TrialId,
    pub request_id: RequestId,
    pub state: CheckpointState,
    pub total_batches: u64,
    /// Validation metric at the time of the checkpoint, if one was taken.
    pub searcher_metric: Option<f64>,
    pub reported_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Checkpoint {
    pub fn new(experiment_id: ExperimentId, trial_id: TrialId, request_id: RequestId, total_batches: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            experiment_id,
            trial_id,
            request_id,
            state: CheckpointState::Completed,
            total_batches,
            searcher_metric: None,
            reported_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, metric: f64) -> Self {
        self.searcher_metric = Some(metric);
        self
    }
}

/// A trial record as stored by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: TrialId,
    pub experiment_id: ExperimentId,
    pub request_id: RequestId,
    /// Whether the trial reached a terminal state before the last shutdown.
    pub terminal: bool,
}
