//! Message-passing front of an experiment: the inbox protocol, the handle
//! callers clone, and the task that drives a controller.

use hp_types::{
    Experiment, ExperimentError, ExperimentId, ExitedReason, HpError, HpResult, JobId,
    JobPosition, JobSummary, Operation, RequestId, SearcherEvent, TrialSearcherState,
    ValidateAfter,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};

use crate::config::ControllerConfig;
use crate::controller::{Collaborators, ExperimentController};

pub type Reply<T> = oneshot::Sender<HpResult<T>>;

/// Everything an experiment task accepts. Handled strictly in arrival order.
#[derive(Debug)]
pub enum ExperimentMessage {
    TrialCreated {
        request_id: RequestId,
    },
    TrialCompleteOperation {
        op: ValidateAfter,
        metric: f64,
        reply: Reply<()>,
    },
    TrialReportEarlyExit {
        request_id: RequestId,
        reason: ExitedReason,
        reply: Reply<()>,
    },
    TrialReportProgress {
        request_id: RequestId,
        partial_units: f64,
    },
    TrialGetSearcherState {
        request_id: RequestId,
        reply: Reply<TrialSearcherState>,
    },
    TrialClosed {
        request_id: RequestId,
    },
    TrialFailed {
        request_id: RequestId,
        error: String,
    },

    Activate {
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    Cancel {
        reply: Reply<()>,
    },
    Kill {
        reply: Reply<()>,
    },

    SetName {
        name: String,
        reply: Reply<()>,
    },
    SetResourcePool {
        pool: String,
        reply: Reply<()>,
    },
    SetPriority {
        priority: i32,
        reply: Reply<()>,
    },
    SetWeight {
        weight: f64,
        reply: Reply<()>,
    },
    SetMaxSlots {
        max_slots: Option<usize>,
        reply: Reply<()>,
    },
    /// Priority changed on the resource manager's side.
    NotifyPriorityChange {
        priority: i32,
        reply: Reply<()>,
    },
    RegisterJobPosition {
        job_id: JobId,
        position: JobPosition,
    },
    GetJob {
        reply: Reply<JobSummary>,
    },
    Describe {
        reply: Reply<Experiment>,
    },

    GetSearcherEvents {
        reply: Reply<Vec<SearcherEvent>>,
    },
    AckSearcherEvents {
        up_to: i32,
        reply: Reply<()>,
    },
    SubmitOperations {
        operations: Vec<Operation>,
        reply: Reply<()>,
    },
    SetSearcherProgress {
        progress: f64,
        reply: Reply<()>,
    },
}

/// Cloneable address of a running experiment.
#[derive(Debug, Clone)]
pub struct ExperimentHandle {
    experiment_id: ExperimentId,
    tx: mpsc::Sender<ExperimentMessage>,
}

impl ExperimentHandle {
    /// A handle plus the inbox it feeds.
    pub fn channel(experiment_id: ExperimentId, capacity: usize) -> (Self, mpsc::Receiver<ExperimentMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { experiment_id, tx }, rx)
    }

    pub fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    fn stopped(&self) -> HpError {
        ExperimentError::Stopped {
            experiment_id: self.experiment_id,
        }
        .into()
    }

    async fn tell(&self, message: ExperimentMessage) -> HpResult<()> {
        self.tx.send(message).await.map_err(|_| self.stopped())
    }

    async fn ask<T>(&self, message: impl FnOnce(Reply<T>) -> ExperimentMessage) -> HpResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tell(message(reply)).await?;
        rx.await.map_err(|_| self.stopped())?
    }

    pub async fn trial_created(&self, request_id: RequestId) -> HpResult<()> {
        self.tell(ExperimentMessage::TrialCreated { request_id }).await
    }

    pub async fn trial_complete_operation(&self, op: ValidateAfter, metric: f64) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::TrialCompleteOperation { op, metric, reply })
            .await
    }

    pub async fn trial_report_early_exit(&self, request_id: RequestId, reason: ExitedReason) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::TrialReportEarlyExit {
            request_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn trial_report_progress(&self, request_id: RequestId, partial_units: f64) -> HpResult<()> {
        self.tell(ExperimentMessage::TrialReportProgress {
            request_id,
            partial_units,
        })
        .await
    }

    pub async fn trial_get_searcher_state(&self, request_id: RequestId) -> HpResult<TrialSearcherState> {
        self.ask(|reply| ExperimentMessage::TrialGetSearcherState { request_id, reply })
            .await
    }

    pub async fn trial_closed(&self, request_id: RequestId) -> HpResult<()> {
        self.tell(ExperimentMessage::TrialClosed { request_id }).await
    }

    pub async fn trial_failed(&self, request_id: RequestId, error: impl Into<String>) -> HpResult<()> {
        self.tell(ExperimentMessage::TrialFailed {
            request_id,
            error: error.into(),
        })
        .await
    }

    pub async fn activate(&self) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::Activate { reply }).await
    }

    pub async fn pause(&self) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::Pause { reply }).await
    }

    pub async fn cancel(&self) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::Cancel { reply }).await
    }

    pub async fn kill(&self) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::Kill { reply }).await
    }

    pub async fn set_name(&self, name: impl Into<String>) -> HpResult<()> {
        let name = name.into();
        self.ask(|reply| ExperimentMessage::SetName { name, reply }).await
    }

    pub async fn set_resource_pool(&self, pool: impl Into<String>) -> HpResult<()> {
        let pool = pool.into();
        self.ask(|reply| ExperimentMessage::SetResourcePool { pool, reply })
            .await
    }

    pub async fn set_priority(&self, priority: i32) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::SetPriority { priority, reply })
            .await
    }

    pub async fn set_weight(&self, weight: f64) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::SetWeight { weight, reply }).await
    }

    pub async fn set_max_slots(&self, max_slots: Option<usize>) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::SetMaxSlots { max_slots, reply })
            .await
    }

    pub async fn notify_priority_change(&self, priority: i32) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::NotifyPriorityChange { priority, reply })
            .await
    }

    pub async fn register_job_position(&self, job_id: JobId, position: JobPosition) -> HpResult<()> {
        self.tell(ExperimentMessage::RegisterJobPosition { job_id, position })
            .await
    }

    pub async fn get_job(&self) -> HpResult<JobSummary> {
        self.ask(|reply| ExperimentMessage::GetJob { reply }).await
    }

    pub async fn describe(&self) -> HpResult<Experiment> {
        self.ask(|reply| ExperimentMessage::Describe { reply }).await
    }

    pub async fn get_searcher_events(&self) -> HpResult<Vec<SearcherEvent>> {
        self.ask(|reply| ExperimentMessage::GetSearcherEvents { reply }).await
    }

    pub async fn ack_searcher_events(&self, up_to: i32) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::AckSearcherEvents { up_to, reply })
            .await
    }

    pub async fn submit_operations(&self, operations: Vec<Operation>) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::SubmitOperations { operations, reply })
            .await
    }

    pub async fn set_searcher_progress(&self, progress: f64) -> HpResult<()> {
        self.ask(|reply| ExperimentMessage::SetSearcherProgress { progress, reply })
            .await
    }
}

/// A spawned experiment task.
pub struct RunningExperiment {
    pub handle: ExperimentHandle,
    join: JoinHandle<Experiment>,
}

impl RunningExperiment {
    /// Wait for the experiment to reach a terminal state.
    pub async fn wait(self) -> HpResult<Experiment> {
        self.join
            .await
            .map_err(|e| HpError::Internal(format!("experiment task failed: {e}")))
    }
}

/// Build the controller for `experiment`, restore it from the store's
/// snapshot if there is one, and run it on its own task.
pub async fn spawn_experiment(
    experiment: Experiment,
    deps: Collaborators,
    settings: ControllerConfig,
) -> HpResult<RunningExperiment> {
    let span = info_span!(
        "experiment",
        experiment_id = experiment.id,
        job_id = %experiment.job_id
    );
    let (handle, inbox) = ExperimentHandle::channel(experiment.id, settings.inbox_capacity);
    let snapshot = deps.store.load_snapshot(experiment.id).await?;

    let mut controller = ExperimentController::new(experiment, deps, settings, handle.clone())
        .instrument(span.clone())
        .await?;
    if let Some(snapshot) = snapshot {
        controller.restore(snapshot)?;
    }

    let join = tokio::spawn(run(controller, inbox).instrument(span));
    Ok(RunningExperiment { handle, join })
}

async fn run(mut controller: ExperimentController, mut inbox: mpsc::Receiver<ExperimentMessage>) -> Experiment {
    controller.start().await;
    while !controller.is_terminated() {
        match inbox.recv().await {
            Some(message) => controller.handle(message).await,
            None => break,
        }
    }
    let experiment = controller.into_experiment();
    info!(state = %experiment.state, "experiment task exiting");
    experiment
}
