//! Stateful facade over a single search method.

use hp_types::{
    ExitedReason, ExperimentConfig, HyperparameterSpace, Operation, RequestId, SearcherError,
    Unit, ValidateAfter,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::method::{new_search_method, SearchContext, SearchMethod, SearchMethodType, SearcherResult};
use crate::queue::SearcherEventQueue;

/// Everything the searcher persists between restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherState {
    pub search_method_type: SearchMethodType,
    pub trials_requested: usize,
    pub trials_closed: BTreeSet<RequestId>,
    pub failures: BTreeSet<RequestId>,
    /// Partial units reported per trial.
    pub trial_progress: BTreeMap<RequestId, f64>,
    pub rng: ChaCha8Rng,
    /// Opaque state of the search method.
    pub search_method_state: serde_json::Value,
}

/// Bridges trial lifecycle events to the active [`SearchMethod`] and keeps
/// the bookkeeping every method shares.
///
/// Errors returned by the mutating calls are fatal to the experiment.
pub struct Searcher {
    hparams: HyperparameterSpace,
    method: Box<dyn SearchMethod>,
    trials_requested: usize,
    trials_closed: BTreeSet<RequestId>,
    failures: BTreeSet<RequestId>,
    trial_progress: BTreeMap<RequestId, f64>,
    rng: ChaCha8Rng,
}

impl Searcher {
    pub fn new(seed: u32, method: Box<dyn SearchMethod>, hparams: HyperparameterSpace) -> Self {
        Self {
            hparams,
            method,
            trials_requested: 0,
            trials_closed: BTreeSet::new(),
            failures: BTreeSet::new(),
            trial_progress: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(u64::from(seed)),
        }
    }

    /// Searcher for `config`, seeded from its reproducibility section.
    pub fn from_config(config: &ExperimentConfig) -> SearcherResult<Self> {
        let method = new_search_method(config)?;
        Ok(Self::new(
            config.reproducibility.experiment_seed,
            method,
            config.hyperparameters.clone(),
        ))
    }

    pub fn method_type(&self) -> SearchMethodType {
        self.method.method_type()
    }

    pub fn unit(&self) -> Unit {
        self.method.unit()
    }

    pub fn initial_operations(&mut self) -> SearcherResult<Vec<Operation>> {
        let (method, mut ctx) = self.split();
        let ops = method.initial_operations(&mut ctx).map_err(|e| wrap("initial operations", e))?;
        self.record(&ops);
        Ok(ops)
    }

    pub fn trial_created(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>> {
        self.trial_progress.entry(request_id).or_insert(0.0);
        let (method, mut ctx) = self.split();
        let ops = method
            .trial_created(&mut ctx, request_id)
            .map_err(|e| wrap("trial created", e))?;
        self.record(&ops);
        Ok(ops)
    }

    pub fn validation_completed(
        &mut self,
        request_id: RequestId,
        metric: f64,
        op: &ValidateAfter,
    ) -> SearcherResult<Vec<Operation>> {
        let (method, mut ctx) = self.split();
        let ops = method
            .validation_completed(&mut ctx, request_id, metric, op)
            .map_err(|e| wrap("validation completed", e))?;
        self.record(&ops);
        Ok(ops)
    }

    pub fn trial_exited_early(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SearcherResult<Vec<Operation>> {
        match reason {
            ExitedReason::Errored => {
                self.failures.insert(request_id);
            }
            ExitedReason::UserCanceled => {}
            ExitedReason::InvalidHp | ExitedReason::InitInvalidHp => {
                // No training happened worth counting toward progress.
                self.trial_progress.remove(&request_id);
            }
        }
        let (method, mut ctx) = self.split();
        let ops = method
            .trial_exited_early(&mut ctx, request_id, reason)
            .map_err(|e| wrap("trial exited early", e))?;
        self.record(&ops);
        Ok(ops)
    }

    /// Closing an already closed trial is a no-op.
    pub fn trial_closed(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>> {
        if !self.trials_closed.insert(request_id) {
            debug!(%request_id, "trial already closed");
            return Ok(Vec::new());
        }
        let (method, mut ctx) = self.split();
        let mut ops = method
            .trial_closed(&mut ctx, request_id)
            .map_err(|e| wrap("trial closed", e))?;
        self.record(&ops);

        if self.method.shuts_down_when_drained() && self.trials_requested == self.trials_closed.len() {
            let failure = self.failures.len() >= self.trials_requested;
            debug!(failure, "all requested trials closed, shutting down search");
            ops.push(Operation::Shutdown { failure });
        }
        Ok(ops)
    }

    /// Record `partial_units` of training for a trial. Produces no
    /// operations.
    pub fn set_trial_progress(&mut self, request_id: RequestId, partial_units: f64) {
        self.trial_progress.insert(request_id, partial_units);
        self.method.trial_progress(request_id, partial_units);
    }

    /// Progress pushed by an external decision-maker.
    pub fn set_custom_progress(&mut self, progress: f64) -> SearcherResult<()> {
        self.method.set_progress(progress)
    }

    /// Fraction of the search completed, in [0, 1].
    pub fn progress(&self) -> f64 {
        self.method
            .progress(&self.trial_progress, &self.trials_closed)
            .clamp(0.0, 1.0)
    }

    pub fn is_trial_closed(&self, request_id: &RequestId) -> bool {
        self.trials_closed.contains(request_id)
    }

    pub fn trials_requested(&self) -> usize {
        self.trials_requested
    }

    pub fn event_queue(&self) -> Option<&SearcherEventQueue> {
        self.method.event_queue()
    }

    pub fn event_queue_mut(&mut self) -> Option<&mut SearcherEventQueue> {
        self.method.event_queue_mut()
    }

    /// Account for operations decided outside a hook (custom search
    /// submissions).
    pub fn record(&mut self, ops: &[Operation]) {
        self.trials_requested += ops
            .iter()
            .filter(|op| matches!(op, Operation::Create(_)))
            .count();
    }

    pub fn snapshot(&self) -> SearcherResult<serde_json::Value> {
        let state = SearcherState {
            search_method_type: self.method.method_type(),
            trials_requested: self.trials_requested,
            trials_closed: self.trials_closed.clone(),
            failures: self.failures.clone(),
            trial_progress: self.trial_progress.clone(),
            rng: self.rng.clone(),
            search_method_state: self.method.snapshot()?,
        };
        serde_json::to_value(state).map_err(|e| SearcherError::Snapshot {
            message: e.to_string(),
        })
    }

    pub fn restore(&mut self, state: serde_json::Value) -> SearcherResult<()> {
        if state.is_null() {
            return Ok(());
        }
        let state: SearcherState = serde_json::from_value(state).map_err(|e| SearcherError::Restore {
            message: e.to_string(),
        })?;
        if state.search_method_type != self.method.method_type() {
            return Err(SearcherError::Restore {
                message: format!(
                    "snapshot is for {:?} search but experiment uses {:?}",
                    state.search_method_type,
                    self.method.method_type()
                ),
            });
        }
        self.method.restore(state.search_method_state)?;
        self.trials_requested = state.trials_requested;
        self.trials_closed = state.trials_closed;
        self.failures = state.failures;
        self.trial_progress = state.trial_progress;
        self.rng = state.rng;
        Ok(())
    }

    fn split(&mut self) -> (&mut dyn SearchMethod, SearchContext<'_>) {
        (
            self.method.as_mut(),
            SearchContext {
                rng: &mut self.rng,
                hparams: &self.hparams,
            },
        )
    }
}

fn wrap(event: &str, err: SearcherError) -> SearcherError {
    match err {
        SearcherError::MethodFailed { message } => SearcherError::MethodFailed {
            message: format!("error while handling {event}: {message}"),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_types::{Length, SearcherConfig, SearcherEventKind};
    use serde_json::json;

    fn random_config(max_trials: usize) -> ExperimentConfig {
        ExperimentConfig::new("sweep", SearcherConfig::random(max_trials, Length::batches(10)))
            .with_hyperparameters(
                HyperparameterSpace::new()
                    .add_double("dropout", 0.0, 0.5, None)
                    .add_categorical("act", vec![json!("relu"), json!("tanh")]),
            )
            .with_seed(1234)
    }

    fn create_ids(ops: &[Operation]) -> Vec<RequestId> {
        ops.iter()
            .filter_map(|op| match op {
                Operation::Create(create) => Some(create.request_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn same_seed_same_initial_operations() {
        let mut a = Searcher::from_config(&random_config(3)).unwrap();
        let mut b = Searcher::from_config(&random_config(3)).unwrap();
        assert_eq!(a.initial_operations().unwrap(), b.initial_operations().unwrap());
        assert_eq!(a.trials_requested(), 3);
    }

    #[test]
    fn shutdown_once_every_requested_trial_closed() {
        let mut searcher = Searcher::from_config(&random_config(2)).unwrap();
        let ids = create_ids(&searcher.initial_operations().unwrap());
        assert_eq!(ids.len(), 2);

        let ops = searcher.trial_closed(ids[0]).unwrap();
        assert!(!ops.iter().any(|op| matches!(op, Operation::Shutdown { .. })));
        let ops = searcher.trial_closed(ids[1]).unwrap();
        assert_eq!(ops.last(), Some(&Operation::Shutdown { failure: false }));
    }

    #[test]
    fn shutdown_reports_failure_when_every_trial_errored() {
        let mut searcher = Searcher::from_config(&random_config(1)).unwrap();
        let id = create_ids(&searcher.initial_operations().unwrap())[0];
        searcher.trial_exited_early(id, ExitedReason::Errored).unwrap();
        let ops = searcher.trial_closed(id).unwrap();
        assert_eq!(ops.last(), Some(&Operation::Shutdown { failure: true }));
    }

    #[test]
    fn repeated_close_does_not_free_a_concurrency_slot() {
        let config = ExperimentConfig::new(
            "sweep",
            SearcherConfig::random(3, Length::batches(10)).with_max_concurrent_trials(1),
        )
        .with_seed(1234);
        let mut searcher = Searcher::from_config(&config).unwrap();
        let first = create_ids(&searcher.initial_operations().unwrap());
        assert_eq!(first.len(), 1);

        let second = create_ids(&searcher.trial_closed(first[0]).unwrap());
        assert_eq!(second.len(), 1);
        assert!(searcher.trial_closed(first[0]).unwrap().is_empty());
        assert_eq!(searcher.trials_requested(), 2);
    }

    #[test]
    fn progress_tracks_reports_and_closures() {
        let mut searcher = Searcher::from_config(&random_config(2)).unwrap();
        let ids = create_ids(&searcher.initial_operations().unwrap());
        for id in &ids {
            searcher.trial_created(*id).unwrap();
        }
        assert_eq!(searcher.progress(), 0.0);

        searcher.set_trial_progress(ids[0], 5.0);
        assert!((searcher.progress() - 0.25).abs() < 1e-9);

        searcher.trial_closed(ids[0]).unwrap();
        assert!((searcher.progress() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sweep_rejects_pushed_progress() {
        let mut searcher = Searcher::from_config(&random_config(1)).unwrap();
        assert!(searcher.set_custom_progress(0.5).is_err());
    }

    #[test]
    fn custom_search_never_shuts_down_on_its_own() {
        let config = ExperimentConfig::new("custom", SearcherConfig::custom());
        let mut searcher = Searcher::from_config(&config).unwrap();
        assert!(searcher.initial_operations().unwrap().is_empty());

        let id = RequestId::new();
        searcher.record(&[Operation::Create(hp_types::Create::new(id, 1, Default::default()))]);
        searcher.trial_created(id).unwrap();
        assert!(searcher.trial_closed(id).unwrap().is_empty());

        let kinds: Vec<_> = searcher
            .event_queue()
            .unwrap()
            .events()
            .iter()
            .map(|e| e.event.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                SearcherEventKind::InitialOperations {},
                SearcherEventKind::TrialCreated { request_id: id },
                SearcherEventKind::TrialClosed { request_id: id },
            ]
        );
    }

    #[test]
    fn restore_of_snapshot_is_observably_identical() {
        let config = ExperimentConfig::new("custom", SearcherConfig::custom());
        let mut searcher = Searcher::from_config(&config).unwrap();
        let id = RequestId::new();
        searcher.initial_operations().unwrap();
        searcher.trial_created(id).unwrap();
        searcher.set_trial_progress(id, 5.0);
        searcher.event_queue_mut().unwrap().remove_up_to(1).unwrap();
        searcher.set_custom_progress(0.4).unwrap();

        let snapshot = searcher.snapshot().unwrap();
        let mut restored = Searcher::from_config(&config).unwrap();
        restored.restore(snapshot.clone()).unwrap();

        assert_eq!(restored.event_queue(), searcher.event_queue());
        assert_eq!(restored.progress(), 0.4);
        assert_eq!(restored.snapshot().unwrap(), snapshot);
    }

    #[test]
    fn restored_rng_continues_the_same_sequence() {
        let mut searcher = Searcher::from_config(&random_config(4)).unwrap();
        let ids = create_ids(&searcher.initial_operations().unwrap());
        let snapshot = searcher.snapshot().unwrap();

        let mut restored = Searcher::from_config(&random_config(4)).unwrap();
        restored.restore(snapshot).unwrap();
        // Both searchers are done creating; closing a trial yields no creates
        // on either, and their snapshots stay equal.
        assert_eq!(searcher.trial_closed(ids[0]).unwrap(), restored.trial_closed(ids[0]).unwrap());
        assert_eq!(searcher.snapshot().unwrap(), restored.snapshot().unwrap());
    }

    #[test]
    fn restore_rejects_other_method() {
        let custom = Searcher::from_config(&ExperimentConfig::new("c", SearcherConfig::custom())).unwrap();
        let mut random = Searcher::from_config(&random_config(1)).unwrap();
        assert!(random.restore(custom.snapshot().unwrap()).is_err());
    }
}
