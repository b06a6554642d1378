//! Random and grid sweeps: every trial trains for `max_length`, validates
//! once and closes.

use hp_types::{
    ExitedReason, HParamSample, HyperparameterSpace, Length, Operation, RequestId,
    SearcherError, Unit, ValidateAfter,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::method::{SearchContext, SearchMethod, SearchMethodType, SearcherResult};
use crate::sampling::grid_points;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SweepState {
    search_method_type: SearchMethodType,
    created_trials: usize,
    pending_trials: usize,
    grid_cursor: usize,
}

/// Sweep over either random samples or the points of a grid.
#[derive(Debug, Clone)]
pub struct SweepSearch {
    max_trials: usize,
    max_length: Length,
    max_concurrent_trials: usize,
    /// Grid points; `None` for random sampling.
    grid: Option<Vec<HParamSample>>,
    state: SweepState,
}

impl SweepSearch {
    pub fn random(max_trials: usize, max_length: Length, max_concurrent_trials: usize) -> Self {
        Self::build(SearchMethodType::Random, max_trials, max_length, max_concurrent_trials, None)
    }

    pub fn grid(
        space: &HyperparameterSpace,
        max_length: Length,
        max_concurrent_trials: usize,
    ) -> SearcherResult<Self> {
        let points = grid_points(space)?;
        Ok(Self::build(
            SearchMethodType::Grid,
            points.len(),
            max_length,
            max_concurrent_trials,
            Some(points),
        ))
    }

    fn build(
        search_method_type: SearchMethodType,
        max_trials: usize,
        max_length: Length,
        max_concurrent_trials: usize,
        grid: Option<Vec<HParamSample>>,
    ) -> Self {
        Self {
            max_trials,
            max_length,
            max_concurrent_trials,
            grid,
            state: SweepState {
                search_method_type,
                created_trials: 0,
                pending_trials: 0,
                grid_cursor: 0,
            },
        }
    }

    pub fn max_trials(&self) -> usize {
        self.max_trials
    }

    fn concurrency(&self) -> usize {
        if self.max_concurrent_trials == 0 {
            self.max_trials
        } else {
            self.max_concurrent_trials.min(self.max_trials)
        }
    }

    fn can_create(&self) -> bool {
        self.state.created_trials < self.max_trials && self.state.pending_trials < self.concurrency()
    }

    fn next_create(&mut self, ctx: &mut SearchContext<'_>) -> SearcherResult<Vec<Operation>> {
        let create = match &self.grid {
            Some(points) => {
                let point = points[self.state.grid_cursor].clone();
                self.state.grid_cursor += 1;
                ctx.create(point)
            }
            None => ctx.create_sampled()?,
        };
        self.state.created_trials += 1;
        self.state.pending_trials += 1;
        let validate = ValidateAfter::new(create.request_id, self.max_length);
        Ok(vec![Operation::Create(create), Operation::ValidateAfter(validate)])
    }

    fn fill(&mut self, ctx: &mut SearchContext<'_>) -> SearcherResult<Vec<Operation>> {
        let mut ops = Vec::new();
        while self.can_create() {
            ops.extend(self.next_create(ctx)?);
        }
        Ok(ops)
    }
}

impl SearchMethod for SweepSearch {
    fn method_type(&self) -> SearchMethodType {
        self.state.search_method_type
    }

    fn initial_operations(&mut self, ctx: &mut SearchContext<'_>) -> SearcherResult<Vec<Operation>> {
        if self.max_trials == 0 {
            return Ok(vec![Operation::Shutdown { failure: false }]);
        }
        self.fill(ctx)
    }

    fn validation_completed(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        request_id: RequestId,
        _metric: f64,
        _op: &ValidateAfter,
    ) -> SearcherResult<Vec<Operation>> {
        Ok(vec![Operation::Close { request_id }])
    }

    fn trial_exited_early(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        _request_id: RequestId,
        reason: ExitedReason,
    ) -> SearcherResult<Vec<Operation>> {
        // Invalid random samples do not count against the trial budget.
        if reason == ExitedReason::InvalidHp && self.grid.is_none() {
            self.state.created_trials = self.state.created_trials.saturating_sub(1);
        }
        Ok(Vec::new())
    }

    fn trial_closed(
        &mut self,
        ctx: &mut SearchContext<'_>,
        _request_id: RequestId,
    ) -> SearcherResult<Vec<Operation>> {
        self.state.pending_trials = self.state.pending_trials.saturating_sub(1);
        self.fill(ctx)
    }

    fn progress(
        &self,
        trial_progress: &BTreeMap<RequestId, f64>,
        trials_closed: &BTreeSet<RequestId>,
    ) -> f64 {
        if self.max_trials == 0 {
            return 1.0;
        }
        let max_units = self.max_length.units.max(1) as f64;
        let sum: f64 = trial_progress
            .iter()
            .map(|(request_id, units)| {
                if trials_closed.contains(request_id) {
                    1.0
                } else {
                    (units / max_units).clamp(0.0, 1.0)
                }
            })
            .sum();
        (sum / self.max_trials as f64).clamp(0.0, 1.0)
    }

    fn unit(&self) -> Unit {
        self.max_length.unit
    }

    fn snapshot(&self) -> SearcherResult<serde_json::Value> {
        serde_json::to_value(&self.state).map_err(|e| SearcherError::Snapshot {
            message: e.to_string(),
        })
    }

    fn restore(&mut self, state: serde_json::Value) -> SearcherResult<()> {
        if state.is_null() {
            return Ok(());
        }
        let state: SweepState = serde_json::from_value(state).map_err(|e| SearcherError::Restore {
            message: e.to_string(),
        })?;
        if state.search_method_type != self.state.search_method_type {
            return Err(SearcherError::Restore {
                message: format!(
                    "expected {:?} search state, got {:?}",
                    self.state.search_method_type, state.search_method_type
                ),
            });
        }
        self.state = state;
        Ok(())
    }
}
