//! Checkpoint garbage collection after an experiment shuts down.

use async_trait::async_trait;
use hp_types::{
    Checkpoint, CheckpointState, CheckpointStorageConfig, ExperimentId, HpResult, JobId, TrialId,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::info;
use uuid::Uuid;

/// Work order for one GC task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcRequest {
    /// `<experiment id>.<uuid>`, unique per GC run.
    pub task_id: String,
    pub experiment_id: ExperimentId,
    pub job_id: JobId,
    pub to_delete: Vec<Uuid>,
}

impl GcRequest {
    pub fn new(experiment_id: ExperimentId, job_id: JobId, to_delete: Vec<Uuid>) -> Self {
        Self {
            task_id: format!("{experiment_id}.{}", Uuid::new_v4()),
            experiment_id,
            job_id,
            to_delete,
        }
    }
}

/// Executes GC requests. Runs detached from the experiment that asked.
#[async_trait]
pub trait CheckpointGc: Send + Sync {
    async fn collect(&self, request: GcRequest) -> HpResult<()>;
}

/// Logs what would be deleted. Used when no storage backend is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCheckpointGc;

#[async_trait]
impl CheckpointGc for LoggingCheckpointGc {
    async fn collect(&self, request: GcRequest) -> HpResult<()> {
        info!(
            task_id = %request.task_id,
            experiment_id = request.experiment_id,
            checkpoints = request.to_delete.len(),
            "checkpoint gc requested"
        );
        Ok(())
    }
}

/// Pick the checkpoints the retention policy does not keep.
///
/// Kept: the `save_experiment_best` best across the experiment, and per trial
/// the `save_trial_best` best plus the `save_trial_latest` most trained.
/// Checkpoints without a metric never count as "best". Already deleted
/// checkpoints are never selected.
pub fn select_checkpoints_to_gc(
    checkpoints: &[Checkpoint],
    policy: &CheckpointStorageConfig,
    smaller_is_better: bool,
) -> Vec<Uuid> {
    let live: Vec<&Checkpoint> = checkpoints
        .iter()
        .filter(|c| c.state != CheckpointState::Deleted)
        .collect();

    let by_metric = |a: &&Checkpoint, b: &&Checkpoint| {
        let (a, b) = (a.searcher_metric.unwrap_or(f64::NAN), b.searcher_metric.unwrap_or(f64::NAN));
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        if smaller_is_better {
            ord
        } else {
            ord.reverse()
        }
    };

    let mut keep: HashSet<Uuid> = HashSet::new();

    let mut scored: Vec<&Checkpoint> = live.iter().copied().filter(|c| c.searcher_metric.is_some()).collect();
    scored.sort_by(by_metric);
    keep.extend(scored.iter().take(policy.save_experiment_best).map(|c| c.uuid));

    let mut per_trial: BTreeMap<TrialId, Vec<&Checkpoint>> = BTreeMap::new();
    for checkpoint in live.iter().copied() {
        per_trial.entry(checkpoint.trial_id).or_default().push(checkpoint);
    }
    for mut trial_checkpoints in per_trial.into_values() {
        let mut scored: Vec<&Checkpoint> = trial_checkpoints
            .iter()
            .copied()
            .filter(|c| c.searcher_metric.is_some())
            .collect();
        scored.sort_by(by_metric);
        keep.extend(scored.iter().take(policy.save_trial_best).map(|c| c.uuid));

        trial_checkpoints.sort_by(|a, b| (b.total_batches, b.reported_at).cmp(&(a.total_batches, a.reported_at)));
        keep.extend(trial_checkpoints.iter().take(policy.save_trial_latest).map(|c| c.uuid));
    }

    live.iter()
        .filter(|c| !keep.contains(&c.uuid))
        .map(|c| c.uuid)
        .collect()
}
