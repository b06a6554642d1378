//! The per-experiment state machine.
//!
//! An [`ExperimentController`] owns the searcher, the trial searcher state of
//! every trial and the handles of live trials. It is driven one message at a
//! time by the task started in [`crate::handle::spawn_experiment`], so none of
//! its state is shared.

use hp_searcher::Searcher;
use hp_types::{
    invalid_value, trial_task_id, validate_max_slots, validate_name, validate_priority,
    validate_weight, Checkpoint, CheckpointError, Create, Experiment, ExperimentError,
    ExperimentState, ExitedReason, HpError, HpResult, JobId, JobPosition, JobSummary, Operation,
    RequestId, ResourceManagerError, SearcherError, SearcherEvent, StateWithReason, StoreError,
    TrialId, TrialSearcherState, ValidateAfter, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::checkpoint_gc::{select_checkpoints_to_gc, CheckpointGc, GcRequest};
use crate::config::ControllerConfig;
use crate::handle::{ExperimentHandle, ExperimentMessage};
use crate::jobs::JobRegistry;
use crate::resource_manager::ResourceManager;
use crate::store::ExperimentStore;
use crate::trial::{TrialHandle, TrialLauncher, TrialNotice, TrialSpec};

/// Persisted form of a running experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub searcher_state: serde_json::Value,
    #[serde(default)]
    pub trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
}

/// External services an experiment depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ExperimentStore>,
    pub rm: Arc<dyn ResourceManager>,
    pub launcher: Arc<dyn TrialLauncher>,
    pub gc: Arc<dyn CheckpointGc>,
    pub jobs: JobRegistry,
}

pub struct ExperimentController {
    experiment: Experiment,
    searcher: Searcher,
    trial_searcher_state: BTreeMap<RequestId, TrialSearcherState>,
    trials: BTreeMap<RequestId, Box<dyn TrialHandle>>,
    warm_start: Option<Checkpoint>,
    deps: Collaborators,
    settings: ControllerConfig,
    handle: ExperimentHandle,
    restored: bool,
    started: bool,
    stop_requested: bool,
    terminated: bool,
}

impl ExperimentController {
    /// Validates the config, then resolves the resource pool and the
    /// experiment-wide warm start checkpoint; any of them failing aborts
    /// creation.
    pub async fn new(
        mut experiment: Experiment,
        deps: Collaborators,
        settings: ControllerConfig,
        handle: ExperimentHandle,
    ) -> HpResult<Self> {
        experiment.config.validate()?;
        let resources = &experiment.config.resources;
        match deps
            .rm
            .validate_resource_pool(&resources.resource_pool, resources.slots_per_trial)
            .await
        {
            Ok(()) | Err(ResourceManagerError::ResourcePoolsUnsupported) => {}
            Err(err) => {
                return Err(HpError::Config(format!("cannot create an experiment: {err}")));
            }
        }

        let searcher = Searcher::from_config(&experiment.config)?;
        let warm_start = checkpoint_from_trial_or_uuid(
            deps.store.as_ref(),
            experiment.config.searcher.source_trial_id,
            experiment.config.searcher.source_checkpoint_uuid.as_deref(),
        )
        .await?;
        if experiment.progress.is_none() {
            experiment.progress = Some(0.0);
        }

        Ok(Self {
            experiment,
            searcher,
            trial_searcher_state: BTreeMap::new(),
            trials: BTreeMap::new(),
            warm_start,
            deps,
            settings,
            handle,
            restored: false,
            started: false,
            stop_requested: false,
            terminated: false,
        })
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn state(&self) -> ExperimentState {
        self.experiment.state
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn into_experiment(self) -> Experiment {
        self.experiment
    }

    pub fn live_trials(&self) -> usize {
        self.trials.len()
    }

    pub fn trial_state(&self, request_id: &RequestId) -> Option<&TrialSearcherState> {
        self.trial_searcher_state.get(request_id)
    }

    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    pub fn snapshot(&self) -> HpResult<serde_json::Value> {
        let snapshot = ExperimentSnapshot {
            searcher_state: self.searcher.snapshot()?,
            trial_searcher_state: self.trial_searcher_state.clone(),
        };
        Ok(serde_json::to_value(snapshot)?)
    }

    /// Load a snapshot taken by a previous run. Must happen before `start`,
    /// which then relaunches trials instead of asking for initial operations.
    pub fn restore(&mut self, snapshot: serde_json::Value) -> HpResult<()> {
        let snapshot: ExperimentSnapshot =
            serde_json::from_value(snapshot).map_err(|e| StoreError::CorruptSnapshot {
                message: e.to_string(),
            })?;
        self.searcher.restore(snapshot.searcher_state)?;
        self.trial_searcher_state = snapshot.trial_searcher_state;
        self.restored = true;
        Ok(())
    }

    /// Apply scheduling settings, register the job, then take either the
    /// restore path or the fresh path.
    pub async fn start(&mut self) {
        if self.started {
            warn!("experiment already started");
            return;
        }
        self.started = true;
        if let Err(err) = self.pre_start().await {
            error!(error = %err, "experiment failed to start");
            self.update_state(ExperimentState::StoppingError, format!("failed to start: {err}"))
                .await;
        }
        self.reap().await;
    }

    async fn pre_start(&mut self) -> HpResult<()> {
        let resources = self.experiment.config.resources.clone();
        if let Err(err) = self
            .deps
            .rm
            .set_group_max_slots(&self.experiment.job_id, resources.max_slots)
            .await
        {
            warn!(error = %err, "failed to forward max slots");
        }
        self.set_weight(resources.weight).await?;
        self.set_priority(resources.priority, true).await?;

        self.deps
            .jobs
            .register(self.experiment.job_id.clone(), self.handle.clone());

        if self.restored {
            let position = self.deps.store.job_position(&self.experiment.job_id).await?;
            if !position.is_unset() {
                if let Err(err) = self
                    .deps
                    .rm
                    .recover_job_position(&self.experiment.job_id, position, &resources.resource_pool)
                    .await
                {
                    warn!(error = %err, %position, "failed to recover job position");
                }
            }
            self.restore_trials().await;
            return Ok(());
        }

        let ops = self.searcher.initial_operations().map_err(|e| SearcherError::MethodFailed {
            message: format!("failed to generate initial operations: {e}"),
        })?;
        self.process_operations(Ok(ops)).await;
        Ok(())
    }

    /// Handle one inbox message to completion.
    pub async fn handle(&mut self, message: ExperimentMessage) {
        match message {
            ExperimentMessage::TrialCreated { request_id } => {
                let ops = self.searcher.trial_created(request_id);
                self.process_operations(ops).await;
            }
            ExperimentMessage::TrialCompleteOperation { op, metric, reply } => {
                let _ = reply.send(self.trial_complete_operation(op, metric).await);
            }
            ExperimentMessage::TrialReportEarlyExit {
                request_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.trial_report_early_exit(request_id, reason).await);
            }
            ExperimentMessage::TrialReportProgress {
                request_id,
                partial_units,
            } => self.trial_report_progress(request_id, partial_units).await,
            ExperimentMessage::TrialGetSearcherState { request_id, reply } => {
                let state = self
                    .trial_searcher_state
                    .get(&request_id)
                    .cloned()
                    .ok_or_else(|| ValidationError::TrialHasNoState.into());
                let _ = reply.send(state);
            }
            ExperimentMessage::TrialClosed { request_id } => self.trial_closed(request_id).await,
            ExperimentMessage::TrialFailed { request_id, error } => {
                error!(%request_id, %error, "trial failed unexpectedly");
                self.trial_closed(request_id).await;
            }

            ExperimentMessage::Activate { reply } => {
                let _ = reply.send(
                    self.request_state(ExperimentState::Active, "user requested activation")
                        .await,
                );
            }
            ExperimentMessage::Pause { reply } => {
                let _ = reply.send(
                    self.request_state(ExperimentState::Paused, "user requested pause")
                        .await,
                );
            }
            ExperimentMessage::Cancel { reply } => {
                let _ = reply.send(self.request_stop("user requested cancellation").await);
            }
            ExperimentMessage::Kill { reply } => {
                let _ = reply.send(self.request_stop("user requested kill").await);
            }

            ExperimentMessage::SetName { name, reply } => {
                let _ = reply.send(self.set_name(name).await);
            }
            ExperimentMessage::SetResourcePool { pool, reply } => {
                let _ = reply.send(self.set_resource_pool(pool).await);
            }
            ExperimentMessage::SetPriority { priority, reply } => {
                let _ = reply.send(self.set_priority(Some(priority), true).await);
            }
            ExperimentMessage::SetWeight { weight, reply } => {
                let result = self.set_weight(weight).await;
                if let Err(err) = &result {
                    warn!(error = %err, weight, "failed to set weight");
                }
                let _ = reply.send(result);
            }
            ExperimentMessage::SetMaxSlots { max_slots, reply } => {
                let _ = reply.send(self.set_max_slots(max_slots).await);
            }
            ExperimentMessage::NotifyPriorityChange { priority, reply } => {
                let _ = reply.send(self.set_priority(Some(priority), false).await);
            }
            ExperimentMessage::RegisterJobPosition { job_id, position } => {
                self.register_job_position(&job_id, position).await;
            }
            ExperimentMessage::GetJob { reply } => {
                let _ = reply.send(Ok(self.job_summary()));
            }
            ExperimentMessage::Describe { reply } => {
                let _ = reply.send(Ok(self.experiment.clone()));
            }

            ExperimentMessage::GetSearcherEvents { reply } => {
                let _ = reply.send(self.searcher_events());
            }
            ExperimentMessage::AckSearcherEvents { up_to, reply } => {
                let _ = reply.send(self.ack_searcher_events(up_to).await);
            }
            ExperimentMessage::SubmitOperations { operations, reply } => {
                let _ = reply.send(self.submit_operations(operations).await);
            }
            ExperimentMessage::SetSearcherProgress { progress, reply } => {
                let _ = reply.send(self.set_searcher_progress(progress).await);
            }
        }
        self.reap().await;
    }

    async fn trial_complete_operation(&mut self, op: ValidateAfter, metric: f64) -> HpResult<()> {
        let request_id = op.request_id;
        let Some(state) = self.trial_searcher_state.get_mut(&request_id) else {
            return Err(ValidationError::NoSuchTrial.into());
        };
        if state.op != Some(op) {
            return Err(ValidationError::UnexpectedOperation {
                expected: state
                    .op
                    .map(|recorded| recorded.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                received: op.to_string(),
            }
            .into());
        }
        if state.complete {
            return Err(ValidationError::OperationAlreadyCompleted { op: op.to_string() }.into());
        }

        state.complete = true;
        let state = state.clone();
        self.notify_trial(request_id, TrialNotice::SearcherState(state)).await;
        let ops = self.searcher.validation_completed(request_id, metric, &op);
        self.process_operations(ops).await;
        Ok(())
    }

    async fn trial_report_early_exit(&mut self, request_id: RequestId, reason: ExitedReason) -> HpResult<()> {
        let Some(state) = self.trial_searcher_state.get_mut(&request_id) else {
            return Err(ValidationError::TrialHasNoState.into());
        };
        state.complete = true;
        state.closed = true;
        let state = state.clone();
        self.notify_trial(request_id, TrialNotice::SearcherState(state)).await;
        let ops = self.searcher.trial_exited_early(request_id, reason);
        self.process_operations(ops).await;
        Ok(())
    }

    async fn trial_report_progress(&mut self, request_id: RequestId, partial_units: f64) {
        self.searcher.set_trial_progress(request_id, partial_units);
        let progress = self.searcher.progress();
        self.experiment.progress = Some(progress);
        if let Err(err) = self
            .deps
            .store
            .save_experiment_progress(self.experiment.id, Some(progress))
            .await
        {
            error!(error = %err, "failed to save experiment progress");
        }
        // The custom searcher queued an event that must survive a restart.
        if self.searcher.event_queue().is_some() {
            self.snapshot_and_save().await;
        }
    }

    /// Normal close or unexpected failure of a live trial. A trial is closed
    /// at most once; later reports for it are dropped.
    async fn trial_closed(&mut self, request_id: RequestId) {
        if self.trials.remove(&request_id).is_none() {
            warn!(%request_id, "ignoring close of a trial that is not live");
            return;
        }
        self.searcher_trial_closed(request_id).await;
    }

    async fn searcher_trial_closed(&mut self, request_id: RequestId) {
        let ops = self.searcher.trial_closed(request_id);
        self.process_operations(ops).await;
        self.check_terminate();
    }

    async fn request_state(&mut self, state: ExperimentState, reason: &str) -> HpResult<()> {
        if self.update_state(state, reason).await {
            Ok(())
        } else {
            Err(ExperimentError::IncompatibleState {
                state: self.experiment.state,
            }
            .into())
        }
    }

    /// Cancel and kill: both stop cooperatively, and both are acknowledged
    /// without change once the experiment is already stopping.
    async fn request_stop(&mut self, reason: &str) -> HpResult<()> {
        let state = self.experiment.state;
        if state.is_stopping() || state.is_terminal() {
            return Ok(());
        }
        self.request_state(ExperimentState::StoppingCanceled, reason).await
    }

    async fn set_name(&mut self, name: String) -> HpResult<()> {
        validate_name(&name)?;
        self.experiment.config.name = name;
        self.save_config_logged().await;
        Ok(())
    }

    async fn set_max_slots(&mut self, max_slots: Option<usize>) -> HpResult<()> {
        validate_max_slots(max_slots)?;
        self.experiment.config.resources.max_slots = max_slots;
        self.save_config_logged().await;
        if let Err(err) = self
            .deps
            .rm
            .set_group_max_slots(&self.experiment.job_id, max_slots)
            .await
        {
            warn!(error = %err, "failed to forward max slots");
        }
        Ok(())
    }

    /// `forward` is false when the resource manager itself reported the
    /// change.
    async fn set_priority(&mut self, priority: Option<i32>, forward: bool) -> HpResult<()> {
        let Some(priority) = priority else {
            return Ok(());
        };
        validate_priority(priority)?;
        let old = self.experiment.config.resources.priority;
        self.experiment.config.resources.priority = Some(priority);

        let mut result = self.save_config().await;
        if result.is_ok() && forward {
            result = self
                .deps
                .rm
                .set_group_priority(&self.experiment.job_id, priority)
                .await
                .map_err(HpError::from);
        }
        if let Err(err) = result {
            self.experiment.config.resources.priority = old;
            self.save_config_logged().await;
            return Err(err);
        }
        Ok(())
    }

    async fn set_weight(&mut self, weight: f64) -> HpResult<()> {
        validate_weight(weight)?;
        let old = self.experiment.config.resources.weight;
        self.experiment.config.resources.weight = weight;
        if let Err(err) = self.save_config().await {
            self.experiment.config.resources.weight = old;
            return Err(err);
        }
        if let Err(err) = self
            .deps
            .rm
            .set_group_weight(&self.experiment.job_id, weight)
            .await
        {
            self.experiment.config.resources.weight = old;
            self.save_config_logged().await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn set_resource_pool(&mut self, pool: String) -> HpResult<()> {
        match self.deps.rm.validate_resource_pool(&pool, 0).await {
            Ok(()) => {}
            Err(ResourceManagerError::ResourcePoolsUnsupported) => {
                return Err(ResourceManagerError::ResourcePoolsUnsupported.into());
            }
            Err(_) => return Err(ResourceManagerError::InvalidResourcePool(pool).into()),
        }

        let old = std::mem::replace(&mut self.experiment.config.resources.resource_pool, pool.clone());
        if let Err(err) = self.save_config().await {
            self.experiment.config.resources.resource_pool = old;
            return Err(err);
        }
        if let Err(err) = self.deps.rm.move_job(&self.experiment.job_id, &pool).await {
            self.experiment.config.resources.resource_pool = old;
            self.save_config_logged().await;
            return Err(err.into());
        }
        self.notify_all(TrialNotice::ResourcePool(pool)).await;
        Ok(())
    }

    async fn register_job_position(&mut self, job_id: &JobId, position: JobPosition) {
        if let Err(err) = self.deps.store.update_job_position(job_id, position).await {
            error!(error = %err, %job_id, "persisting job position failed");
        }
    }

    fn job_summary(&self) -> JobSummary {
        let config = &self.experiment.config;
        JobSummary {
            job_id: self.experiment.job_id.clone(),
            entity_id: self.experiment.id.to_string(),
            submission_time: self.experiment.start_time,
            owner_id: self.experiment.owner_id,
            username: self.experiment.username.clone(),
            progress: self.searcher.progress(),
            name: config.name.clone(),
            priority: config
                .resources
                .priority
                .unwrap_or(self.settings.default_priority),
            weight: config.resources.weight,
            resource_pool: config.resources.resource_pool.clone(),
        }
    }

    fn searcher_events(&self) -> HpResult<Vec<SearcherEvent>> {
        let queue = self
            .searcher
            .event_queue()
            .ok_or(ValidationError::NotCustomSearch)?;
        Ok(queue.events().to_vec())
    }

    async fn ack_searcher_events(&mut self, up_to: i32) -> HpResult<()> {
        let queue = self
            .searcher
            .event_queue_mut()
            .ok_or(ValidationError::NotCustomSearch)?;
        queue.remove_up_to(up_to)?;
        self.snapshot_and_save().await;
        Ok(())
    }

    /// Operations decided by an external searcher. Rejected as a whole if
    /// any of them names a trial that neither exists nor is created earlier
    /// in the same batch, or creates a trial that already exists.
    async fn submit_operations(&mut self, operations: Vec<Operation>) -> HpResult<()> {
        if self.searcher.event_queue().is_none() {
            return Err(ValidationError::NotCustomSearch.into());
        }
        let state = self.experiment.state;
        if state.is_stopping() || state.is_terminal() {
            return Err(ExperimentError::IncompatibleState { state }.into());
        }

        let mut known: BTreeSet<RequestId> = self.trial_searcher_state.keys().copied().collect();
        for op in &operations {
            match op {
                Operation::Create(create) => {
                    if !known.insert(create.request_id) {
                        return Err(ValidationError::DuplicateTrial {
                            request_id: create.request_id.to_string(),
                        }
                        .into());
                    }
                }
                Operation::ValidateAfter(ValidateAfter { request_id, .. })
                | Operation::Close { request_id } => {
                    if !known.contains(request_id) {
                        return Err(ValidationError::NoSuchTrial.into());
                    }
                }
                Operation::Shutdown { .. } => {}
            }
        }

        self.searcher.record(&operations);
        self.process_operations(Ok(operations)).await;
        Ok(())
    }

    async fn set_searcher_progress(&mut self, progress: f64) -> HpResult<()> {
        if self.searcher.event_queue().is_none() {
            return Err(ValidationError::NotCustomSearch.into());
        }
        if !(0.0..=1.0).contains(&progress) {
            return Err(invalid_value!("progress", "must be within [0, 1], got {progress}").into());
        }
        self.searcher.set_custom_progress(progress)?;
        self.experiment.progress = Some(progress);
        if let Err(err) = self
            .deps
            .store
            .save_experiment_progress(self.experiment.id, Some(progress))
            .await
        {
            error!(error = %err, "failed to save experiment progress");
        }
        self.snapshot_and_save().await;
        Ok(())
    }

    /// Execute one batch from a single searcher call. Dropped while
    /// stopping; a searcher error is fatal.
    async fn process_operations(&mut self, ops: Result<Vec<Operation>, SearcherError>) {
        if self.experiment.state.is_stopping() {
            return;
        }
        let ops = match ops {
            Ok(ops) => ops,
            Err(err) => {
                error!(error = %err, "searcher failed");
                self.update_state(ExperimentState::StoppingError, format!("encountered error {err}"))
                    .await;
                return;
            }
        };
        self.execute(ops).await;
        self.snapshot_and_save().await;
    }

    async fn execute(&mut self, ops: Vec<Operation>) {
        let mut updated: BTreeSet<RequestId> = BTreeSet::new();
        for op in ops {
            debug!(%op, "handling searcher op");
            match op {
                Operation::Create(create) => {
                    let request_id = create.request_id;
                    let checkpoint = match self.checkpoint_for_create(&create).await {
                        Ok(checkpoint) => checkpoint,
                        Err(err) => {
                            error!(error = %err, %request_id, "checkpoint resolution failed");
                            self.update_state(
                                ExperimentState::StoppingError,
                                format!("hp search unable to get checkpoint for new trial with error {err}"),
                            )
                            .await;
                            return;
                        }
                    };
                    let state = TrialSearcherState::new(create);
                    self.trial_searcher_state.insert(request_id, state.clone());
                    if let Err(err) = self.launch(state, checkpoint, false).await {
                        error!(error = %err, %request_id, "trial launch failed");
                        self.trial_searcher_state.remove(&request_id);
                        self.update_state(
                            ExperimentState::StoppingError,
                            format!("failed to launch trial {request_id}: {err}"),
                        )
                        .await;
                        return;
                    }
                }
                Operation::ValidateAfter(validate) => {
                    let Some(state) = self.trial_searcher_state.get_mut(&validate.request_id) else {
                        self.unknown_trial(validate.request_id).await;
                        return;
                    };
                    state.op = Some(validate);
                    state.complete = false;
                    updated.insert(validate.request_id);
                }
                Operation::Close { request_id } => {
                    let Some(state) = self.trial_searcher_state.get_mut(&request_id) else {
                        self.unknown_trial(request_id).await;
                        return;
                    };
                    state.closed = true;
                    updated.insert(request_id);
                }
                Operation::Shutdown { failure: true } => {
                    self.update_state(ExperimentState::StoppingError, "hp search failed")
                        .await;
                }
                Operation::Shutdown { failure: false } => {
                    self.update_state(ExperimentState::StoppingCompleted, "hp search completed")
                        .await;
                }
            }
        }

        for request_id in updated {
            if let Some(state) = self.trial_searcher_state.get(&request_id).cloned() {
                self.notify_trial(request_id, TrialNotice::SearcherState(state)).await;
            }
        }
    }

    async fn unknown_trial(&mut self, request_id: RequestId) {
        let err = SearcherError::UnknownTrial {
            request_id: request_id.to_string(),
        };
        error!(error = %err, "searcher referenced a trial it never created");
        self.update_state(ExperimentState::StoppingError, format!("encountered error {err}"))
            .await;
    }

    async fn launch(
        &mut self,
        searcher_state: TrialSearcherState,
        warm_start: Option<Checkpoint>,
        restored: bool,
    ) -> HpResult<()> {
        let request_id = searcher_state.create.request_id;
        let spec = TrialSpec {
            experiment_id: self.experiment.id,
            job_id: self.experiment.job_id.clone(),
            request_id,
            task_id: trial_task_id(self.experiment.id, request_id),
            experiment_state: self.experiment.state,
            searcher_state,
            config: self.experiment.config.clone(),
            warm_start,
            restored,
        };
        let trial = self.deps.launcher.launch(spec, self.handle.clone()).await?;
        self.trials.insert(request_id, trial);
        Ok(())
    }

    /// A checkpoint named by the operation wins over the experiment-wide
    /// one.
    async fn checkpoint_for_create(&self, create: &Create) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(reference) = &create.checkpoint else {
            return Ok(self.warm_start.clone());
        };
        let invalid = || CheckpointError::InvalidRequestId {
            request_id: reference.request_id.to_string(),
        };
        let trial = self
            .deps
            .store
            .trial_by_request_id(self.experiment.id, reference.request_id)
            .await
            .map_err(|_| invalid())?
            .ok_or_else(invalid)?;
        checkpoint_from_trial_or_uuid(self.deps.store.as_ref(), Some(trial.id), None).await
    }

    async fn restore_trials(&mut self) {
        let states: Vec<TrialSearcherState> = self.trial_searcher_state.values().cloned().collect();
        let mut replay = Vec::new();
        for state in states {
            let request_id = state.create.request_id;
            let checkpoint = match self.checkpoint_for_create(&state.create).await {
                Ok(checkpoint) => checkpoint,
                Err(err) => {
                    error!(error = %err, %request_id, "failed getting checkpoint to restore");
                    self.update_state(
                        ExperimentState::StoppingError,
                        format!("failed getting checkpoint to restore with error {err}"),
                    )
                    .await;
                    return;
                }
            };

            match self
                .deps
                .store
                .trial_by_request_id(self.experiment.id, request_id)
                .await
            {
                Ok(Some(record)) if record.terminal => {
                    debug!(%request_id, trial_id = record.id, "trial was terminal before restart");
                    if !self.searcher.is_trial_closed(&request_id) {
                        replay.push(request_id);
                    }
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, %request_id, "failed to restore trial");
                    continue;
                }
            }

            debug!(%request_id, "restoring trial");
            if let Err(err) = self.launch(state, checkpoint, true).await {
                error!(error = %err, %request_id, "trial relaunch failed");
                self.update_state(
                    ExperimentState::StoppingError,
                    format!("failed to relaunch trial {request_id}: {err}"),
                )
                .await;
                return;
            }
        }

        // Closes that happened after the last snapshot.
        for request_id in replay {
            self.searcher_trial_closed(request_id).await;
        }
        self.check_terminate();
    }

    /// The single place state changes. Returns false if the transition is
    /// not permitted; a transition to the current state is accepted as a
    /// no-op.
    async fn update_state(&mut self, state: ExperimentState, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        match self.experiment.transition(state) {
            Err(err) => {
                error!(error = %err, "error transitioning experiment state");
                return false;
            }
            Ok(false) => return true,
            Ok(true) => {}
        }

        info!(%state, %reason, "experiment state changed");
        self.deps.jobs.state_changed(&self.experiment.job_id, state);
        self.notify_all(TrialNotice::ExperimentState(StateWithReason::new(state, reason)))
            .await;
        if let Err(err) = self.deps.store.save_experiment_state(&self.experiment).await {
            error!(error = %err, "error saving experiment state");
        }
        self.check_terminate();
        true
    }

    fn check_terminate(&mut self) {
        if self.experiment.state.is_stopping() && self.trials.is_empty() {
            self.stop_requested = true;
        }
    }

    async fn reap(&mut self) {
        if self.stop_requested && !self.terminated {
            self.shutdown().await;
        }
    }

    async fn shutdown(&mut self) {
        self.terminated = true;
        let id = self.experiment.id;
        let store = Arc::clone(&self.deps.store);

        if matches!(
            self.experiment.state,
            ExperimentState::Completed | ExperimentState::StoppingCompleted
        ) {
            self.experiment.progress = Some(1.0);
            if let Err(err) = store.save_experiment_progress(id, Some(1.0)).await {
                error!(error = %err, "failed to save final progress");
            }
        }

        self.deps.jobs.unregister(&self.experiment.job_id);

        let Some(terminal) = self.experiment.state.terminal_for_stopping() else {
            error!(state = %self.experiment.state, "{}", ExperimentError::AlreadyTerminal);
            return;
        };
        match self.experiment.transition(terminal) {
            Ok(true) => {}
            Ok(false) => error!("{}", ExperimentError::AlreadyTerminal),
            Err(err) => error!(error = %err, "error transitioning experiment state"),
        }
        self.deps.jobs.state_changed(&self.experiment.job_id, self.experiment.state);
        if let Err(err) = store.save_experiment_state(&self.experiment).await {
            error!(error = %err, "error saving experiment state");
        }
        info!(state = %self.experiment.state, "experiment state changed");

        if self.settings.checkpoint_gc {
            self.schedule_checkpoint_gc().await;
        }

        if let Err(err) = store.delete_snapshots(id).await {
            error!(error = %err, "failure to delete snapshots for experiment");
        }
        if let Err(err) = store.delete_user_session(id).await {
            error!(error = %err, "failure to delete user session for experiment");
        }
        info!("experiment shut down successfully");
    }

    async fn schedule_checkpoint_gc(&self) {
        let checkpoints = match self.deps.store.experiment_checkpoints(self.experiment.id).await {
            Ok(checkpoints) => checkpoints,
            Err(err) => {
                error!(error = %err, "failed to list checkpoints for gc");
                Vec::new()
            }
        };
        let config = &self.experiment.config;
        let to_delete = select_checkpoints_to_gc(
            &checkpoints,
            &config.checkpoint_storage,
            config.searcher.smaller_is_better,
        );
        let request = GcRequest::new(self.experiment.id, self.experiment.job_id.clone(), to_delete);
        let gc: Arc<dyn CheckpointGc> = Arc::clone(&self.deps.gc);
        tokio::spawn(
            async move {
                let task_id = request.task_id.clone();
                if let Err(err) = gc.collect(request).await {
                    error!(error = %err, %task_id, "checkpoint gc failed");
                }
            }
            .in_current_span(),
        );
    }

    async fn save_config(&self) -> HpResult<()> {
        self.deps
            .store
            .save_experiment_config(self.experiment.id, &self.experiment.config)
            .await
            .map_err(HpError::from)
    }

    async fn save_config_logged(&self) {
        if let Err(err) = self.save_config().await {
            error!(error = %err, "failed to save experiment config");
        }
    }

    async fn snapshot_and_save(&self) {
        let snapshot = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(error = %err, "failed to snapshot experiment");
                return;
            }
        };
        if let Err(err) = self.deps.store.save_snapshot(self.experiment.id, snapshot).await {
            error!(error = %err, "failed to save experiment snapshot");
        }
    }

    async fn notify_trial(&self, request_id: RequestId, notice: TrialNotice) {
        if let Some(trial) = self.trials.get(&request_id) {
            if let Err(err) = trial.notify(notice).await {
                warn!(error = %err, %request_id, "failed to notify trial");
            }
        }
    }

    async fn notify_all(&self, notice: TrialNotice) {
        for (request_id, trial) in &self.trials {
            if let Err(err) = trial.notify(notice.clone()).await {
                warn!(error = %err, %request_id, "failed to notify trial");
            }
        }
    }
}

/// Resolve a warm start source. A trial id wins over a checkpoint uuid;
/// neither yields `None`.
async fn checkpoint_from_trial_or_uuid(
    store: &dyn ExperimentStore,
    trial_id: Option<TrialId>,
    checkpoint_uuid: Option<&str>,
) -> Result<Option<Checkpoint>, CheckpointError> {
    if let Some(trial_id) = trial_id {
        let checkpoint = store
            .latest_checkpoint_for_trial(trial_id)
            .await
            .map_err(|e| CheckpointError::LookupFailed {
                message: format!("failed to get checkpoint for source trial {trial_id}: {e}"),
            })?;
        return checkpoint
            .map(Some)
            .ok_or(CheckpointError::NoneForTrial { trial_id });
    }
    if let Some(raw) = checkpoint_uuid {
        let uuid = uuid::Uuid::parse_str(raw).map_err(|_| CheckpointError::InvalidUuid {
            value: raw.to_string(),
        })?;
        let checkpoint = store
            .checkpoint_by_uuid(uuid)
            .await
            .map_err(|e| CheckpointError::LookupFailed {
                message: format!("failed to get source checkpoint {uuid}: {e}"),
            })?;
        return checkpoint.map(Some).ok_or(CheckpointError::NoneWithUuid {
            uuid: uuid.to_string(),
        });
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint_gc::LoggingCheckpointGc;
    use crate::handle::{spawn_experiment, Reply};
    use crate::jobs::JobEvent;
    use crate::resource_manager::{MemoryResourceManager, RmCall};
    use crate::store::MemoryStore;
    use crate::trial::{RecordingLauncher, SimulatedLauncher};
    use hp_types::{
        EventExitedReason, ExperimentConfig, HParamSample, HyperparameterSpace, Length, QueueError,
        ResourcesConfig, SearcherConfig, SearcherEventKind, TrialRecord,
    };
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        controller: ExperimentController,
        store: Arc<MemoryStore>,
        rm: Arc<MemoryResourceManager>,
        launcher: RecordingLauncher,
        jobs: JobRegistry,
        _inbox: mpsc::Receiver<ExperimentMessage>,
    }

    async fn build(
        experiment: Experiment,
        store: Arc<MemoryStore>,
        rm: Arc<MemoryResourceManager>,
    ) -> HpResult<Harness> {
        let launcher = RecordingLauncher::new();
        let jobs = JobRegistry::new();
        let deps = Collaborators {
            store: store.clone(),
            rm: rm.clone(),
            launcher: Arc::new(launcher.clone()),
            gc: Arc::new(LoggingCheckpointGc),
            jobs: jobs.clone(),
        };
        let (handle, inbox) = ExperimentHandle::channel(experiment.id, 16);
        let controller =
            ExperimentController::new(experiment, deps, ControllerConfig::default(), handle).await?;
        Ok(Harness {
            controller,
            store,
            rm,
            launcher,
            jobs,
            _inbox: inbox,
        })
    }

    async fn started(config: ExperimentConfig) -> Harness {
        let mut h = build(
            Experiment::new(1, config, 7, "alice"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryResourceManager::new(["default", "gpu"])),
        )
        .await
        .unwrap();
        h.controller.start().await;
        h
    }

    async fn ask<T>(
        controller: &mut ExperimentController,
        message: impl FnOnce(Reply<T>) -> ExperimentMessage,
    ) -> HpResult<T> {
        let (reply, rx) = oneshot::channel();
        controller.handle(message(reply)).await;
        rx.await.expect("controller dropped the reply")
    }

    async fn submit(h: &mut Harness, operations: Vec<Operation>) -> HpResult<()> {
        ask(&mut h.controller, |reply| ExperimentMessage::SubmitOperations { operations, reply }).await
    }

    async fn complete(h: &mut Harness, op: ValidateAfter, metric: f64) -> HpResult<()> {
        ask(&mut h.controller, |reply| ExperimentMessage::TrialCompleteOperation { op, metric, reply })
            .await
    }

    fn custom() -> ExperimentConfig {
        ExperimentConfig::new("custom", SearcherConfig::custom())
    }

    fn random(max_trials: usize) -> ExperimentConfig {
        ExperimentConfig::new("random", SearcherConfig::random(max_trials, Length::batches(10)))
            .with_hyperparameters(HyperparameterSpace::new().add_int("layers", 1, 4))
            .with_seed(3)
    }

    fn create(request_id: RequestId) -> Operation {
        Operation::Create(Create::new(request_id, 1, HParamSample::new()))
    }

    fn validate(request_id: RequestId, units: u64) -> ValidateAfter {
        ValidateAfter::new(request_id, Length::batches(units))
    }

    fn event_kinds(controller: &ExperimentController) -> Vec<SearcherEventKind> {
        controller
            .searcher()
            .event_queue()
            .expect("custom search")
            .events()
            .iter()
            .map(|e| e.event.clone())
            .collect()
    }

    #[tokio::test]
    async fn fresh_custom_experiment_only_queues_initial_event() {
        let h = started(custom()).await;
        assert_eq!(h.controller.state(), ExperimentState::Active);
        assert!(h.launcher.launched().is_empty());
        assert_eq!(event_kinds(&h.controller), vec![SearcherEventKind::InitialOperations {}]);
        assert!(h.store.snapshot(1).is_some());
        assert_eq!(h.jobs.len(), 1);
        assert_eq!(
            h.rm.calls(),
            vec![RmCall::SetMaxSlots(None), RmCall::SetWeight(1.0)]
        );
    }

    #[tokio::test]
    async fn create_launches_once_and_validate_after_reopens_the_trial() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();

        assert_ok!(submit(&mut h, vec![create(r1)]).await);
        assert_eq!(h.launcher.launched().len(), 1);
        let created = h.controller.trial_state(&r1).cloned().unwrap();
        assert!(created.complete);
        assert_eq!(created.op, None);

        let op = validate(r1, 100);
        assert_ok!(submit(&mut h, vec![Operation::ValidateAfter(op)]).await);
        let updated = h.controller.trial_state(&r1).cloned().unwrap();
        assert_eq!(updated.create, created.create);
        assert_eq!(updated.op, Some(op));
        assert!(!updated.complete);

        assert_eq!(h.launcher.launched().len(), 1);
        assert_eq!(
            h.launcher.notices_for(r1),
            vec![TrialNotice::SearcherState(updated.clone())]
        );

        let snapshot: ExperimentSnapshot = serde_json::from_value(h.store.snapshot(1).unwrap()).unwrap();
        assert_eq!(snapshot.trial_searcher_state.get(&r1), Some(&updated));
    }

    #[tokio::test]
    async fn bad_completions_are_rejected_without_state_change() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        let op = validate(r1, 100);
        assert_ok!(submit(&mut h, vec![create(r1), Operation::ValidateAfter(op)]).await);
        let before = h.controller.trial_state(&r1).cloned();
        let events_before = event_kinds(&h.controller);

        let err = complete(&mut h, validate(RequestId::new(), 100), 0.1).await.unwrap_err();
        assert!(matches!(err, HpError::Validation(ValidationError::NoSuchTrial)));

        let err = complete(&mut h, validate(r1, 200), 0.1).await.unwrap_err();
        assert!(matches!(err, HpError::Validation(ValidationError::UnexpectedOperation { .. })));
        assert!(err.is_validation());

        assert_eq!(h.controller.trial_state(&r1).cloned(), before);
        assert_eq!(event_kinds(&h.controller), events_before);

        assert_ok!(complete(&mut h, op, 0.1).await);
        assert!(h.controller.trial_state(&r1).unwrap().complete);
        assert_eq!(
            event_kinds(&h.controller).last(),
            Some(&SearcherEventKind::ValidationCompleted {
                request_id: r1,
                validate_after_length: 100,
                metric: 0.1,
            })
        );

        let after = h.controller.trial_state(&r1).cloned();
        let err = complete(&mut h, op, 0.1).await.unwrap_err();
        assert!(matches!(
            err,
            HpError::Validation(ValidationError::OperationAlreadyCompleted { .. })
        ));
        assert_eq!(h.controller.trial_state(&r1).cloned(), after);
    }

    #[tokio::test]
    async fn a_trial_has_at_most_one_outstanding_operation() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        let first = validate(r1, 100);
        let second = validate(r1, 200);
        assert_ok!(submit(&mut h, vec![create(r1), Operation::ValidateAfter(first)]).await);
        assert_ok!(submit(&mut h, vec![Operation::ValidateAfter(second)]).await);

        let state = h.controller.trial_state(&r1).unwrap();
        assert_eq!(state.outstanding(), Some(&second));
        assert_err!(complete(&mut h, first, 0.5).await);
        assert_ok!(complete(&mut h, second, 0.5).await);
        assert_eq!(h.controller.trial_state(&r1).unwrap().outstanding(), None);
    }

    #[tokio::test]
    async fn canceled_experiment_waits_for_its_last_trial() {
        let mut h = started(random(1)).await;
        let launched = h.launcher.launched();
        assert_eq!(launched.len(), 1);
        let r1 = launched[0].request_id;

        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Cancel { reply }).await);
        assert_eq!(h.controller.state(), ExperimentState::StoppingCanceled);
        assert!(!h.controller.is_terminated());
        assert_eq!(h.controller.live_trials(), 1);
        assert!(h.launcher.notices_for(r1).contains(&TrialNotice::ExperimentState(
            StateWithReason::new(ExperimentState::StoppingCanceled, "user requested cancellation")
        )));

        h.controller
            .handle(ExperimentMessage::TrialClosed { request_id: r1 })
            .await;
        assert_eq!(h.controller.state(), ExperimentState::Canceled);
        assert!(h.controller.is_terminated());
        assert_eq!(h.store.state(1), Some(ExperimentState::Canceled));
        assert!(h.store.snapshot(1).is_none());
        assert!(h.jobs.is_empty());
    }

    #[tokio::test]
    async fn random_search_completes_after_its_trials_close() {
        let mut h = started(random(1)).await;
        let r1 = h.launcher.launched()[0].request_id;
        h.store.insert_session(1, "token");

        h.controller
            .handle(ExperimentMessage::TrialCreated { request_id: r1 })
            .await;
        h.controller
            .handle(ExperimentMessage::TrialReportProgress {
                request_id: r1,
                partial_units: 5.0,
            })
            .await;
        assert_eq!(h.store.progress(1), Some(0.5));

        assert_ok!(complete(&mut h, validate(r1, 10), 0.25).await);
        assert!(h.controller.trial_state(&r1).unwrap().closed);
        assert_eq!(h.controller.state(), ExperimentState::Active);

        h.controller
            .handle(ExperimentMessage::TrialClosed { request_id: r1 })
            .await;
        assert_eq!(h.controller.state(), ExperimentState::Completed);
        assert_eq!(h.store.progress(1), Some(1.0));
        assert_eq!(h.store.state(1), Some(ExperimentState::Completed));
        assert!(!h.store.has_session(1));
        assert!(h.controller.experiment().end_time.is_some());
    }

    #[tokio::test]
    async fn failed_trial_is_treated_as_closed() {
        let mut h = started(random(1)).await;
        let r1 = h.launcher.launched()[0].request_id;
        h.controller
            .handle(ExperimentMessage::TrialFailed {
                request_id: r1,
                error: "container exited with 137".into(),
            })
            .await;
        assert_eq!(h.controller.live_trials(), 0);
        assert!(h.controller.searcher().is_trial_closed(&r1));
        assert!(h.controller.is_terminated());
    }

    #[tokio::test]
    async fn state_commands_follow_the_transition_table() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);

        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Pause { reply }).await);
        assert_eq!(h.controller.state(), ExperimentState::Paused);
        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Pause { reply }).await);
        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Activate { reply }).await);
        assert_eq!(h.controller.state(), ExperimentState::Active);

        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Kill { reply }).await);
        assert_eq!(h.controller.state(), ExperimentState::StoppingCanceled);

        let err = ask(&mut h.controller, |reply| ExperimentMessage::Activate { reply })
            .await
            .unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(
            err.to_string(),
            "Experiment error: experiment in incompatible state STOPPING_CANCELED"
        );
        assert_eq!(h.controller.state(), ExperimentState::StoppingCanceled);

        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Cancel { reply }).await);
        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Kill { reply }).await);
        assert_eq!(h.controller.state(), ExperimentState::StoppingCanceled);
    }

    #[tokio::test]
    async fn terminal_experiment_still_acknowledges_cancel() {
        let mut h = started(custom()).await;
        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Cancel { reply }).await);
        assert_eq!(h.controller.state(), ExperimentState::Canceled);

        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::Cancel { reply }).await);
        let err = ask(&mut h.controller, |reply| ExperimentMessage::Pause { reply })
            .await
            .unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn rejected_priority_is_rolled_back_everywhere() {
        let config = custom().with_resources(ResourcesConfig {
            priority: Some(10),
            ..Default::default()
        });
        let mut h = started(config).await;
        assert_eq!(h.store.config(1).unwrap().resources.priority, Some(10));

        h.rm.reject_priority(true);
        let err = ask(&mut h.controller, |reply| ExperimentMessage::SetPriority { priority: 20, reply })
            .await
            .unwrap_err();
        assert!(matches!(err, HpError::ResourceManager(_)));
        assert_eq!(h.controller.experiment().config.resources.priority, Some(10));
        assert_eq!(h.store.config(1).unwrap().resources.priority, Some(10));

        h.rm.reject_priority(false);
        assert_ok!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetPriority { priority: 20, reply }).await
        );
        assert_eq!(h.store.config(1).unwrap().resources.priority, Some(20));
        assert_eq!(h.rm.calls().last(), Some(&RmCall::SetPriority(20)));
    }

    #[tokio::test]
    async fn priority_reported_by_resource_manager_is_not_forwarded() {
        let mut h = started(custom()).await;
        h.rm.reject_priority(true);
        assert_ok!(
            ask(&mut h.controller, |reply| ExperimentMessage::NotifyPriorityChange {
                priority: 30,
                reply
            })
            .await
        );
        assert_eq!(h.controller.experiment().config.resources.priority, Some(30));
        assert!(!h.rm.calls().contains(&RmCall::SetPriority(30)));
    }

    #[tokio::test]
    async fn rejected_weight_is_rolled_back() {
        let mut h = started(custom()).await;
        h.rm.reject_weight(true);
        assert_err!(ask(&mut h.controller, |reply| ExperimentMessage::SetWeight { weight: 3.0, reply }).await);
        assert_eq!(h.controller.experiment().config.resources.weight, 1.0);
        assert_eq!(h.store.config(1).unwrap().resources.weight, 1.0);

        let err = ask(&mut h.controller, |reply| ExperimentMessage::SetWeight { weight: -1.0, reply })
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn resource_pool_changes_are_validated_and_propagated() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);

        let err = ask(&mut h.controller, |reply| ExperimentMessage::SetResourcePool {
            pool: "tpu".into(),
            reply,
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            HpError::ResourceManager(ResourceManagerError::InvalidResourcePool(_))
        ));

        h.rm.reject_moves(true);
        assert_err!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetResourcePool {
                pool: "gpu".into(),
                reply,
            })
            .await
        );
        assert_eq!(h.controller.experiment().config.resources.resource_pool, "default");
        assert_eq!(h.store.config(1).unwrap().resources.resource_pool, "default");
        assert!(h.launcher.notices_for(r1).is_empty());

        h.rm.reject_moves(false);
        assert_ok!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetResourcePool {
                pool: "gpu".into(),
                reply,
            })
            .await
        );
        assert_eq!(h.store.config(1).unwrap().resources.resource_pool, "gpu");
        assert_eq!(
            h.launcher.notices_for(r1),
            vec![TrialNotice::ResourcePool("gpu".into())]
        );
    }

    #[tokio::test]
    async fn pool_changes_refused_without_pool_support() {
        let mut h = build(
            Experiment::new(1, custom(), 7, "alice"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryResourceManager::without_pools()),
        )
        .await
        .unwrap();
        h.controller.start().await;
        let err = ask(&mut h.controller, |reply| ExperimentMessage::SetResourcePool {
            pool: "other".into(),
            reply,
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            HpError::ResourceManager(ResourceManagerError::ResourcePoolsUnsupported)
        ));
    }

    #[tokio::test]
    async fn unknown_pool_blocks_creation() {
        let config = custom().with_resources(ResourcesConfig {
            resource_pool: "nowhere".into(),
            ..Default::default()
        });
        let result = build(
            Experiment::new(1, config, 7, "alice"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryResourceManager::default()),
        )
        .await;
        assert!(matches!(result, Err(HpError::Config(_))));
    }

    #[tokio::test]
    async fn name_and_max_slots_patches() {
        let mut h = started(custom()).await;
        let err = ask(&mut h.controller, |reply| ExperimentMessage::SetName {
            name: "  ".into(),
            reply,
        })
        .await
        .unwrap_err();
        assert!(err.is_validation());
        assert_ok!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetName {
                name: "renamed".into(),
                reply,
            })
            .await
        );
        assert_eq!(h.store.config(1).unwrap().name, "renamed");

        assert_err!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetMaxSlots {
                max_slots: Some(0),
                reply,
            })
            .await
        );
        assert_ok!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetMaxSlots {
                max_slots: Some(4),
                reply,
            })
            .await
        );
        assert_eq!(h.rm.calls().last(), Some(&RmCall::SetMaxSlots(Some(4))));
        assert_eq!(h.controller.experiment().config.resources.max_slots, Some(4));
    }

    #[tokio::test]
    async fn job_summary_uses_default_priority() {
        let mut h = started(custom()).await;
        let job = ask(&mut h.controller, |reply| ExperimentMessage::GetJob { reply })
            .await
            .unwrap();
        assert_eq!(job.priority, 42);
        assert_eq!(job.entity_id, "1");
        assert_eq!(job.name, "custom");
        assert_eq!(job.resource_pool, "default");
        assert_eq!(job.username, "alice");
        assert_eq!(job.progress, hp_searcher::CUSTOM_SEARCH_DEFAULT_PROGRESS);

        let position = JobPosition(dec!(1.5));
        h.controller
            .handle(ExperimentMessage::RegisterJobPosition {
                job_id: job.job_id.clone(),
                position,
            })
            .await;
        assert_eq!(h.store.job_position(&job.job_id).await.unwrap(), position);
    }

    #[tokio::test]
    async fn early_exit_closes_the_trial() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);

        let err = ask(&mut h.controller, |reply| ExperimentMessage::TrialReportEarlyExit {
            request_id: RequestId::new(),
            reason: ExitedReason::Errored,
            reply,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HpError::Validation(ValidationError::TrialHasNoState)));

        assert_ok!(
            ask(&mut h.controller, |reply| ExperimentMessage::TrialReportEarlyExit {
                request_id: r1,
                reason: ExitedReason::UserCanceled,
                reply,
            })
            .await
        );
        let state = h.controller.trial_state(&r1).unwrap();
        assert!(state.complete && state.closed);
        assert_eq!(
            event_kinds(&h.controller).last(),
            Some(&SearcherEventKind::TrialExitedEarly {
                request_id: r1,
                exited_reason: EventExitedReason::UserRequestedStop,
            })
        );
    }

    #[tokio::test]
    async fn searcher_state_lookup() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);

        let state = ask(&mut h.controller, |reply| ExperimentMessage::TrialGetSearcherState {
            request_id: r1,
            reply,
        })
        .await
        .unwrap();
        assert_eq!(state.create.request_id, r1);

        assert_err!(
            ask(&mut h.controller, |reply| ExperimentMessage::TrialGetSearcherState {
                request_id: RequestId::new(),
                reply,
            })
            .await
        );
    }

    #[tokio::test]
    async fn progress_reports_persist_custom_events() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);
        h.controller
            .handle(ExperimentMessage::TrialReportProgress {
                request_id: r1,
                partial_units: 5.0,
            })
            .await;

        assert_eq!(h.store.progress(1), Some(0.99));
        let snapshot = h.store.snapshot(1).unwrap();
        let events = &snapshot["searcher_state"]["search_method_state"]["searcher_event_queue"]["events"];
        assert_eq!(events.as_array().map(Vec::len), Some(2));
        assert_eq!(events[1]["trial_progress"]["partial_units"], 5.0);
    }

    #[tokio::test]
    async fn custom_client_channel_round_trip() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);
        h.controller
            .handle(ExperimentMessage::TrialCreated { request_id: r1 })
            .await;

        let events = ask(&mut h.controller, |reply| ExperimentMessage::GetSearcherEvents { reply })
            .await
            .unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);

        assert_ok!(ask(&mut h.controller, |reply| ExperimentMessage::AckSearcherEvents { up_to: 1, reply }).await);
        let err = ask(&mut h.controller, |reply| ExperimentMessage::AckSearcherEvents { up_to: 1, reply })
            .await
            .unwrap_err();
        assert!(matches!(err, HpError::Queue(QueueError::EventNotFound(1))));
        assert_eq!(event_kinds(&h.controller), vec![SearcherEventKind::TrialCreated { request_id: r1 }]);

        let err = submit(&mut h, vec![Operation::Close {
            request_id: RequestId::new(),
        }])
        .await
        .unwrap_err();
        assert!(matches!(err, HpError::Validation(ValidationError::NoSuchTrial)));

        assert_ok!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetSearcherProgress { progress: 0.4, reply })
                .await
        );
        assert_eq!(h.store.progress(1), Some(0.4));
        assert_err!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetSearcherProgress { progress: 1.5, reply })
                .await
        );
    }

    #[tokio::test]
    async fn client_shutdown_completes_an_idle_experiment() {
        let mut h = started(custom()).await;
        assert_ok!(submit(&mut h, vec![Operation::Shutdown { failure: false }]).await);
        assert_eq!(h.controller.state(), ExperimentState::Completed);
        assert_eq!(h.store.progress(1), Some(1.0));
    }

    #[tokio::test]
    async fn client_channel_needs_custom_search() {
        let mut h = started(random(1)).await;
        let err = ask(&mut h.controller, |reply| ExperimentMessage::GetSearcherEvents { reply })
            .await
            .unwrap_err();
        assert!(matches!(err, HpError::Validation(ValidationError::NotCustomSearch)));
        assert_err!(submit(&mut h, vec![]).await);
        assert_err!(
            ask(&mut h.controller, |reply| ExperimentMessage::SetSearcherProgress { progress: 0.5, reply })
                .await
        );
    }

    #[tokio::test]
    async fn missing_operation_checkpoint_is_fatal() {
        let mut h = started(custom()).await;
        let create = Create::new(RequestId::new(), 1, HParamSample::new()).with_checkpoint(RequestId::new());
        assert_ok!(submit(&mut h, vec![Operation::Create(create)]).await);
        assert!(h.launcher.launched().is_empty());
        assert_eq!(h.controller.state(), ExperimentState::Error);
        assert!(h.controller.is_terminated());
    }

    #[tokio::test]
    async fn warm_start_sources() {
        let store = Arc::new(MemoryStore::new());
        let source = Checkpoint::new(1, 7, RequestId::new(), 500);
        store.insert_checkpoint(source.clone());

        let config = ExperimentConfig::new("warm", SearcherConfig::custom().with_source_trial(7));
        let mut h = build(
            Experiment::new(1, config, 7, "alice"),
            store.clone(),
            Arc::new(MemoryResourceManager::default()),
        )
        .await
        .unwrap();
        h.controller.start().await;

        let plain = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(plain)]).await);
        assert_eq!(h.launcher.launched()[0].warm_start.as_ref(), Some(&source));

        // A checkpoint named by the operation overrides the experiment-wide one.
        let parent = RequestId::new();
        store.insert_trial(TrialRecord {
            id: 9,
            experiment_id: 1,
            request_id: parent,
            terminal: true,
        });
        let own = Checkpoint::new(1, 9, parent, 50);
        store.insert_checkpoint(own.clone());
        let child = Create::new(RequestId::new(), 2, HParamSample::new()).with_checkpoint(parent);
        assert_ok!(submit(&mut h, vec![Operation::Create(child)]).await);
        assert_eq!(h.launcher.launched()[1].warm_start.as_ref(), Some(&own));
    }

    #[tokio::test]
    async fn missing_warm_start_checkpoint_blocks_creation() {
        let config = ExperimentConfig::new("warm", SearcherConfig::custom().with_source_trial(7));
        let result = build(
            Experiment::new(1, config, 7, "alice"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryResourceManager::default()),
        )
        .await;
        assert!(matches!(
            result,
            Err(HpError::Checkpoint(CheckpointError::NoneForTrial { trial_id: 7 }))
        ));

        let config = ExperimentConfig::new("warm", SearcherConfig::custom().with_source_checkpoint("nope"));
        let result = build(
            Experiment::new(1, config, 7, "alice"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryResourceManager::default()),
        )
        .await;
        assert!(matches!(
            result,
            Err(HpError::Checkpoint(CheckpointError::InvalidUuid { .. }))
        ));
    }

    #[tokio::test]
    async fn failing_start_stops_with_error() {
        let rm = Arc::new(MemoryResourceManager::default());
        rm.reject_weight(true);
        let mut h = build(Experiment::new(1, custom(), 7, "alice"), Arc::new(MemoryStore::new()), rm)
            .await
            .unwrap();
        h.controller.start().await;
        assert_eq!(h.controller.state(), ExperimentState::Error);
        assert!(h.controller.is_terminated());
    }

    #[tokio::test]
    async fn invalid_hyperparameters_block_creation() {
        let config = ExperimentConfig::new("bad", SearcherConfig::random(3, Length::batches(10)))
            .with_hyperparameters(HyperparameterSpace::new().add_int("layers", 5, 1));
        let result = build(
            Experiment::new(1, config, 7, "alice"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryResourceManager::default()),
        )
        .await;
        assert!(matches!(
            result,
            Err(HpError::Validation(ValidationError::InvalidValue { .. }))
        ));
    }

    #[tokio::test]
    async fn creating_an_existing_trial_is_rejected() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1), Operation::ValidateAfter(validate(r1, 100))]).await);
        let before = h.controller.trial_state(&r1).cloned().unwrap();

        let err = submit(&mut h, vec![create(r1)]).await.unwrap_err();
        assert!(matches!(
            err,
            HpError::Validation(ValidationError::DuplicateTrial { .. })
        ));

        let r2 = RequestId::new();
        let err = submit(&mut h, vec![create(r2), create(r2)]).await.unwrap_err();
        assert!(err.is_validation());

        assert_eq!(h.launcher.launched().len(), 1);
        assert_eq!(h.controller.live_trials(), 1);
        assert_eq!(h.controller.trial_state(&r1), Some(&before));
        assert!(h.controller.trial_state(&r2).is_none());
        assert_eq!(h.controller.searcher().trials_requested(), 1);
        assert_eq!(h.controller.state(), ExperimentState::Active);
    }

    #[tokio::test]
    async fn late_close_after_failure_keeps_the_concurrency_cap() {
        let config = ExperimentConfig::new(
            "random",
            SearcherConfig::random(3, Length::batches(10)).with_max_concurrent_trials(1),
        )
        .with_seed(3);
        let mut h = started(config).await;
        let r1 = h.launcher.launched()[0].request_id;

        h.controller
            .handle(ExperimentMessage::TrialFailed {
                request_id: r1,
                error: "container exited with 137".into(),
            })
            .await;
        assert_eq!(h.launcher.launched().len(), 2);
        assert_eq!(h.controller.live_trials(), 1);

        h.controller
            .handle(ExperimentMessage::TrialClosed { request_id: r1 })
            .await;
        assert_eq!(h.launcher.launched().len(), 2);
        assert_eq!(h.controller.live_trials(), 1);
        assert_eq!(h.controller.state(), ExperimentState::Active);
    }

    #[tokio::test]
    async fn custom_queue_records_each_close_once() {
        let mut h = started(custom()).await;
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);
        for _ in 0..2 {
            h.controller
                .handle(ExperimentMessage::TrialClosed { request_id: r1 })
                .await;
        }
        let closes = event_kinds(&h.controller)
            .into_iter()
            .filter(|kind| matches!(kind, SearcherEventKind::TrialClosed { .. }))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(h.controller.live_trials(), 0);
    }

    #[tokio::test]
    async fn failed_launch_stops_with_error() {
        let mut h = started(custom()).await;
        h.launcher.set_fail_launches(true);
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);

        assert_eq!(h.controller.state(), ExperimentState::Error);
        assert!(h.controller.is_terminated());
        assert_eq!(h.controller.live_trials(), 0);
        assert!(h.controller.trial_state(&r1).is_none());
        assert!(h.launcher.launched().is_empty());
        assert!(h.jobs.is_empty());
    }

    #[tokio::test]
    async fn failed_relaunch_on_restore_stops_with_error() {
        let store = Arc::new(MemoryStore::new());
        let rm = Arc::new(MemoryResourceManager::default());
        let experiment = Experiment::new(1, custom(), 7, "alice");

        let mut first = build(experiment.clone(), store.clone(), rm.clone()).await.unwrap();
        first.controller.start().await;
        let open = RequestId::new();
        assert_ok!(submit(&mut first, vec![create(open)]).await);
        let snapshot = store.snapshot(1).unwrap();
        drop(first);

        let mut second = build(experiment, store.clone(), rm).await.unwrap();
        second.launcher.set_fail_launches(true);
        second.controller.restore(snapshot).unwrap();
        second.controller.start().await;

        assert_eq!(second.controller.state(), ExperimentState::Error);
        assert!(second.controller.is_terminated());
        assert_eq!(second.controller.live_trials(), 0);
        assert!(second.launcher.launched().is_empty());
        assert_eq!(store.state(1), Some(ExperimentState::Error));
    }

    #[tokio::test]
    async fn persistence_failures_do_not_change_decisions() {
        let mut h = started(custom()).await;
        h.store.set_fail_writes(true);
        let r1 = RequestId::new();
        assert_ok!(submit(&mut h, vec![create(r1)]).await);
        assert_eq!(h.launcher.launched().len(), 1);
        assert!(h.controller.trial_state(&r1).is_some());
    }

    #[tokio::test]
    async fn restore_relaunches_open_trials_and_replays_missed_closes() {
        let store = Arc::new(MemoryStore::new());
        let rm = Arc::new(MemoryResourceManager::default());
        let experiment = Experiment::new(1, custom(), 7, "alice");

        let mut first = build(experiment.clone(), store.clone(), rm.clone()).await.unwrap();
        first.controller.start().await;
        let (open, finished) = (RequestId::new(), RequestId::new());
        let op = validate(open, 100);
        assert_ok!(
            submit(
                &mut first,
                vec![create(open), Operation::ValidateAfter(op), create(finished)]
            )
            .await
        );
        store.insert_trial(TrialRecord {
            id: 2,
            experiment_id: 1,
            request_id: finished,
            terminal: true,
        });
        store
            .update_job_position(&experiment.job_id, JobPosition(dec!(2.5)))
            .await
            .unwrap();
        let snapshot = store.snapshot(1).unwrap();
        drop(first);

        let mut second = build(experiment, store.clone(), rm.clone()).await.unwrap();
        second.controller.restore(snapshot).unwrap();
        second.controller.start().await;

        let launched = second.launcher.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].request_id, open);
        assert!(launched[0].restored);
        assert_eq!(launched[0].searcher_state.outstanding(), Some(&op));

        assert_eq!(
            event_kinds(&second.controller),
            vec![
                SearcherEventKind::InitialOperations {},
                SearcherEventKind::TrialClosed { request_id: finished },
            ]
        );
        assert!(rm
            .calls()
            .contains(&RmCall::RecoverJobPosition(JobPosition(dec!(2.5)))));
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_rejected() {
        let mut h = build(
            Experiment::new(1, custom(), 7, "alice"),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryResourceManager::default()),
        )
        .await
        .unwrap();
        let err = h.controller.restore(serde_json::json!({"trial_searcher_state": 3})).unwrap_err();
        assert!(matches!(err, HpError::Store(StoreError::CorruptSnapshot { .. })));
    }

    #[tokio::test]
    async fn spawned_random_search_runs_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let (jobs, job_events) = JobRegistry::with_events();
        let deps = Collaborators {
            store: store.clone(),
            rm: Arc::new(MemoryResourceManager::default()),
            launcher: Arc::new(SimulatedLauncher),
            gc: Arc::new(LoggingCheckpointGc),
            jobs,
        };
        let running = spawn_experiment(
            Experiment::new(5, random(3), 1, "bob"),
            deps,
            ControllerConfig::default(),
        )
        .await
        .unwrap();

        let experiment = tokio::time::timeout(Duration::from_secs(10), running.wait())
            .await
            .expect("experiment did not finish")
            .unwrap();
        assert_eq!(experiment.state, ExperimentState::Completed);
        assert_eq!(experiment.progress, Some(1.0));
        assert_eq!(store.state(5), Some(ExperimentState::Completed));

        let events: Vec<JobEvent> = job_events.try_iter().collect();
        assert!(matches!(events.first(), Some(JobEvent::Registered { experiment_id: 5, .. })));
        assert!(events.iter().any(|e| matches!(e, JobEvent::Unregistered { .. })));
        assert!(events.contains(&JobEvent::StateChanged {
            job_id: experiment.job_id.clone(),
            state: ExperimentState::Completed,
        }));
    }
}
