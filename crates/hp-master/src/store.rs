//! Persistence seam for experiments: state, config, snapshots, trials and
//! checkpoints.

use async_trait::async_trait;
use hp_types::{
    Checkpoint, Experiment, ExperimentConfig, ExperimentId, ExperimentState, JobId, JobPosition,
    RequestId, StoreError, TrialId, TrialRecord,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage used by the controller.
///
/// Writes are best-effort from the controller's point of view: failures are
/// logged and in-memory state stays authoritative.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn save_experiment_state(&self, experiment: &Experiment) -> StoreResult<()>;

    async fn save_experiment_config(
        &self,
        experiment_id: ExperimentId,
        config: &ExperimentConfig,
    ) -> StoreResult<()>;

    async fn save_experiment_progress(
        &self,
        experiment_id: ExperimentId,
        progress: Option<f64>,
    ) -> StoreResult<()>;

    async fn save_snapshot(
        &self,
        experiment_id: ExperimentId,
        snapshot: serde_json::Value,
    ) -> StoreResult<()>;

    async fn load_snapshot(&self, experiment_id: ExperimentId) -> StoreResult<Option<serde_json::Value>>;

    async fn delete_snapshots(&self, experiment_id: ExperimentId) -> StoreResult<()>;

    async fn trial_by_request_id(
        &self,
        experiment_id: ExperimentId,
        request_id: RequestId,
    ) -> StoreResult<Option<TrialRecord>>;

    async fn latest_checkpoint_for_trial(&self, trial_id: TrialId) -> StoreResult<Option<Checkpoint>>;

    async fn checkpoint_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<Checkpoint>>;

    async fn experiment_checkpoints(&self, experiment_id: ExperimentId) -> StoreResult<Vec<Checkpoint>>;

    async fn job_position(&self, job_id: &JobId) -> StoreResult<JobPosition>;

    async fn update_job_position(&self, job_id: &JobId, position: JobPosition) -> StoreResult<()>;

    async fn delete_user_session(&self, experiment_id: ExperimentId) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct Tables {
    states: HashMap<ExperimentId, ExperimentState>,
    configs: HashMap<ExperimentId, ExperimentConfig>,
    progress: HashMap<ExperimentId, Option<f64>>,
    snapshots: HashMap<ExperimentId, serde_json::Value>,
    trials: Vec<TrialRecord>,
    checkpoints: Vec<Checkpoint>,
    job_positions: HashMap<JobId, JobPosition>,
    sessions: HashMap<ExperimentId, String>,
}

/// In-process [`ExperimentStore`]. Writes can be made to fail for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert_trial(&self, record: TrialRecord) {
        self.tables.write().trials.push(record);
    }

    pub fn insert_checkpoint(&self, checkpoint: Checkpoint) {
        self.tables.write().checkpoints.push(checkpoint);
    }

    pub fn insert_session(&self, experiment_id: ExperimentId, token: &str) {
        self.tables.write().sessions.insert(experiment_id, token.to_string());
    }

    pub fn state(&self, experiment_id: ExperimentId) -> Option<ExperimentState> {
        self.tables.read().states.get(&experiment_id).copied()
    }

    pub fn config(&self, experiment_id: ExperimentId) -> Option<ExperimentConfig> {
        self.tables.read().configs.get(&experiment_id).cloned()
    }

    pub fn progress(&self, experiment_id: ExperimentId) -> Option<f64> {
        self.tables.read().progress.get(&experiment_id).copied().flatten()
    }

    pub fn snapshot(&self, experiment_id: ExperimentId) -> Option<serde_json::Value> {
        self.tables.read().snapshots.get(&experiment_id).cloned()
    }

    pub fn has_session(&self, experiment_id: ExperimentId) -> bool {
        self.tables.read().sessions.contains_key(&experiment_id)
    }

    fn check_write(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed {
                message: "store is read-only".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn save_experiment_state(&self, experiment: &Experiment) -> StoreResult<()> {
        self.check_write()?;
        self.tables.write().states.insert(experiment.id, experiment.state);
        Ok(())
    }

    async fn save_experiment_config(
        &self,
        experiment_id: ExperimentId,
        config: &ExperimentConfig,
    ) -> StoreResult<()> {
        self.check_write()?;
        self.tables.write().configs.insert(experiment_id, config.clone());
        Ok(())
    }

    async fn save_experiment_progress(
        &self,
        experiment_id: ExperimentId,
        progress: Option<f64>,
    ) -> StoreResult<()> {
        self.check_write()?;
        self.tables.write().progress.insert(experiment_id, progress);
        Ok(())
    }

    async fn save_snapshot(
        &self,
        experiment_id: ExperimentId,
        snapshot: serde_json::Value,
    ) -> StoreResult<()> {
        self.check_write()?;
        self.tables.write().snapshots.insert(experiment_id, snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, experiment_id: ExperimentId) -> StoreResult<Option<serde_json::Value>> {
        Ok(self.snapshot(experiment_id))
    }

    async fn delete_snapshots(&self, experiment_id: ExperimentId) -> StoreResult<()> {
        self.check_write()?;
        self.tables.write().snapshots.remove(&experiment_id);
        Ok(())
    }

    async fn trial_by_request_id(
        &self,
        experiment_id: ExperimentId,
        request_id: RequestId,
    ) -> StoreResult<Option<TrialRecord>> {
        Ok(self
            .tables
            .read()
            .trials
            .iter()
            .find(|t| t.experiment_id == experiment_id && t.request_id == request_id)
            .cloned())
    }

    async fn latest_checkpoint_for_trial(&self, trial_id: TrialId) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .checkpoints
            .iter()
            .filter(|c| c.trial_id == trial_id)
            .max_by_key(|c| (c.total_batches, c.reported_at))
            .cloned())
    }

    async fn checkpoint_by_uuid(&self, uuid: Uuid) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .checkpoints
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned())
    }

    async fn experiment_checkpoints(&self, experiment_id: ExperimentId) -> StoreResult<Vec<Checkpoint>> {
        Ok(self
            .tables
            .read()
            .checkpoints
            .iter()
            .filter(|c| c.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    async fn job_position(&self, job_id: &JobId) -> StoreResult<JobPosition> {
        Ok(self
            .tables
            .read()
            .job_positions
            .get(job_id)
            .copied()
            .unwrap_or_default())
    }

    async fn update_job_position(&self, job_id: &JobId, position: JobPosition) -> StoreResult<()> {
        self.check_write()?;
        self.tables.write().job_positions.insert(job_id.clone(), position);
        Ok(())
    }

    async fn delete_user_session(&self, experiment_id: ExperimentId) -> StoreResult<()> {
        self.check_write()?;
        self.tables.write().sessions.remove(&experiment_id);
        Ok(())
    }
}
