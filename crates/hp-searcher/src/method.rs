//! The search method protocol.

use hp_types::{
    Create, ExitedReason, ExperimentConfig, HParamSample, HyperparameterSpace, Operation,
    RequestId, SearchMethodConfig, SearcherError, Unit, ValidateAfter,
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::custom::CustomSearch;
use crate::queue::SearcherEventQueue;
use crate::sampling::sample_hparams;
use crate::sweep::SweepSearch;

pub type SearcherResult<T> = Result<T, SearcherError>;

/// Tag persisted with every searcher snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethodType {
    Custom,
    Random,
    Grid,
}

/// What a search method may touch while reacting to an event: the
/// searcher's seeded RNG and the experiment's hyperparameter space.
pub struct SearchContext<'a> {
    pub rng: &'a mut ChaCha8Rng,
    pub hparams: &'a HyperparameterSpace,
}

impl SearchContext<'_> {
    /// A Create for a fresh trial with the given hyperparameters. Request id
    /// and trial seed come from the searcher RNG.
    pub fn create(&mut self, hparams: HParamSample) -> Create {
        let request_id = RequestId::from_bytes(self.rng.gen());
        let trial_seed = self.rng.gen();
        Create::new(request_id, trial_seed, hparams)
    }

    /// A Create with hyperparameters sampled from the space.
    pub fn create_sampled(&mut self) -> SearcherResult<Create> {
        let hparams = sample_hparams(self.hparams, &mut *self.rng)?;
        Ok(self.create(hparams))
    }
}

/// A hyperparameter search algorithm.
///
/// Hooks return the operations the experiment should execute next. Default
/// implementations return none, so a method only overrides the events it
/// cares about.
pub trait SearchMethod: Send + Sync {
    fn method_type(&self) -> SearchMethodType;

    fn initial_operations(&mut self, ctx: &mut SearchContext<'_>) -> SearcherResult<Vec<Operation>>;

    fn trial_created(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        _request_id: RequestId,
    ) -> SearcherResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn validation_completed(
        &mut self,
        ctx: &mut SearchContext<'_>,
        request_id: RequestId,
        metric: f64,
        op: &ValidateAfter,
    ) -> SearcherResult<Vec<Operation>>;

    fn trial_exited_early(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        _request_id: RequestId,
        _reason: ExitedReason,
    ) -> SearcherResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    fn trial_closed(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        _request_id: RequestId,
    ) -> SearcherResult<Vec<Operation>> {
        Ok(Vec::new())
    }

    /// Observe a progress report. Never produces operations.
    fn trial_progress(&mut self, _request_id: RequestId, _partial_units: f64) {}

    /// Fraction of the search completed, in [0, 1].
    fn progress(
        &self,
        trial_progress: &BTreeMap<RequestId, f64>,
        trials_closed: &BTreeSet<RequestId>,
    ) -> f64;

    /// Accept a progress value pushed by an external decision-maker.
    fn set_progress(&mut self, _progress: f64) -> SearcherResult<()> {
        Err(SearcherError::MethodFailed {
            message: format!("{:?} search computes its own progress", self.method_type()),
        })
    }

    /// Whether the searcher should issue Shutdown once every requested
    /// trial has closed.
    fn shuts_down_when_drained(&self) -> bool {
        true
    }

    fn event_queue(&self) -> Option<&SearcherEventQueue> {
        None
    }

    fn event_queue_mut(&mut self) -> Option<&mut SearcherEventQueue> {
        None
    }

    fn unit(&self) -> Unit;

    fn snapshot(&self) -> SearcherResult<serde_json::Value>;

    fn restore(&mut self, state: serde_json::Value) -> SearcherResult<()>;
}

/// Build the search method an experiment config asks for.
pub fn new_search_method(config: &ExperimentConfig) -> SearcherResult<Box<dyn SearchMethod>> {
    let method: Box<dyn SearchMethod> = match &config.searcher.method {
        SearchMethodConfig::Custom { unit } => Box::new(CustomSearch::new(*unit)),
        SearchMethodConfig::Random {
            max_trials,
            max_length,
            max_concurrent_trials,
        } => Box::new(SweepSearch::random(
            *max_trials,
            *max_length,
            *max_concurrent_trials,
        )),
        SearchMethodConfig::Grid {
            max_length,
            max_concurrent_trials,
        } => Box::new(SweepSearch::grid(
            &config.hyperparameters,
            *max_length,
            *max_concurrent_trials,
        )?),
    };
    Ok(method)
}
