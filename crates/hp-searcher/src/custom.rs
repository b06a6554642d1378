//! Custom search: decisions are delegated to an external client.

use hp_types::{
    ExitedReason, Operation, RequestId, SearcherError, SearcherEventKind, Unit, ValidateAfter,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::method::{SearchContext, SearchMethod, SearchMethodType, SearcherResult};
use crate::queue::SearcherEventQueue;

/// Progress reported before the client has pushed a value of its own.
pub const CUSTOM_SEARCH_DEFAULT_PROGRESS: f64 = 0.99;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CustomSearchState {
    search_method_type: SearchMethodType,
    searcher_event_queue: SearcherEventQueue,
    progress: f64,
}

/// Records one [`SearcherEventKind`] per lifecycle hook and returns no
/// operations. The client reads the queue, decides, and submits operations
/// back through the experiment.
#[derive(Debug, Clone)]
pub struct CustomSearch {
    unit: Unit,
    state: CustomSearchState,
}

impl CustomSearch {
    pub fn new(unit: Unit) -> Self {
        Self {
            unit,
            state: CustomSearchState {
                search_method_type: SearchMethodType::Custom,
                searcher_event_queue: SearcherEventQueue::new(),
                progress: CUSTOM_SEARCH_DEFAULT_PROGRESS,
            },
        }
    }

    pub fn queue(&self) -> &SearcherEventQueue {
        &self.state.searcher_event_queue
    }

    fn record(&mut self, event: SearcherEventKind) -> SearcherResult<Vec<Operation>> {
        self.state.searcher_event_queue.enqueue(event);
        Ok(Vec::new())
    }
}

impl SearchMethod for CustomSearch {
    fn method_type(&self) -> SearchMethodType {
        SearchMethodType::Custom
    }

    fn initial_operations(&mut self, _ctx: &mut SearchContext<'_>) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherEventKind::InitialOperations {})
    }

    fn trial_created(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        request_id: RequestId,
    ) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherEventKind::TrialCreated { request_id })
    }

    fn validation_completed(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        request_id: RequestId,
        metric: f64,
        op: &ValidateAfter,
    ) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherEventKind::ValidationCompleted {
            request_id,
            validate_after_length: op.length.units,
            metric,
        })
    }

    fn trial_exited_early(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherEventKind::TrialExitedEarly {
            request_id,
            exited_reason: reason.into(),
        })
    }

    fn trial_closed(
        &mut self,
        _ctx: &mut SearchContext<'_>,
        request_id: RequestId,
    ) -> SearcherResult<Vec<Operation>> {
        self.record(SearcherEventKind::TrialClosed { request_id })
    }

    fn trial_progress(&mut self, request_id: RequestId, partial_units: f64) {
        self.state
            .searcher_event_queue
            .enqueue(SearcherEventKind::TrialProgress {
                request_id,
                partial_units,
            });
    }

    fn progress(
        &self,
        _trial_progress: &BTreeMap<RequestId, f64>,
        _trials_closed: &BTreeSet<RequestId>,
    ) -> f64 {
        self.state.progress
    }

    fn set_progress(&mut self, progress: f64) -> SearcherResult<()> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(SearcherError::MethodFailed {
                message: format!("progress must be within [0, 1], got {progress}"),
            });
        }
        self.state.progress = progress;
        Ok(())
    }

    fn shuts_down_when_drained(&self) -> bool {
        false
    }

    fn event_queue(&self) -> Option<&SearcherEventQueue> {
        Some(&self.state.searcher_event_queue)
    }

    fn event_queue_mut(&mut self) -> Option<&mut SearcherEventQueue> {
        Some(&mut self.state.searcher_event_queue)
    }

    fn unit(&self) -> Unit {
        self.unit
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
        let state: CustomSearchState =
            serde_json::from_value(state).map_err(|e| SearcherError::Restore {
                message: e.to_string(),
            })?;
        if state.search_method_type != SearchMethodType::Custom {
            return Err(SearcherError::Restore {
                message: format!("expected custom search state, got {:?}", state.search_method_type),
            });
        }
        self.state = state;
        Ok(())
    }
}
