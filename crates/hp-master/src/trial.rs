//! Trial seam: how the controller starts child trials and talks to them.

use async_trait::async_trait;
use hp_types::{
    Checkpoint, ExperimentConfig, ExperimentId, ExperimentState, HpError, HpResult, JobId,
    RequestId, StateWithReason, TrialSearcherState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use crate::handle::ExperimentHandle;

/// Everything a trial needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSpec {
    pub experiment_id: ExperimentId,
    pub job_id: JobId,
    pub request_id: RequestId,
    pub task_id: String,
    pub experiment_state: ExperimentState,
    pub searcher_state: TrialSearcherState,
    /// Copy of the experiment config at launch time.
    pub config: ExperimentConfig,
    pub warm_start: Option<Checkpoint>,
    /// Relaunched from a snapshot rather than created by the searcher.
    pub restored: bool,
}

/// Messages pushed from the experiment to one of its trials.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialNotice {
    SearcherState(TrialSearcherState),
    ExperimentState(StateWithReason),
    ResourcePool(String),
}

/// A live child trial.
///
/// The trial reports back through the [`ExperimentHandle`] it was launched
/// with, and must eventually call `trial_closed` or `trial_failed`.
#[async_trait]
pub trait TrialHandle: Send + Sync {
    async fn notify(&self, notice: TrialNotice) -> HpResult<()>;
}

#[async_trait]
pub trait TrialLauncher: Send + Sync {
    async fn launch(&self, spec: TrialSpec, parent: ExperimentHandle) -> HpResult<Box<dyn TrialHandle>>;
}

#[derive(Debug, Default)]
struct Recorded {
    launched: Vec<TrialSpec>,
    notices: Vec<(RequestId, TrialNotice)>,
}

/// Launcher whose trials do nothing but remember what they were told.
#[derive(Debug, Clone, Default)]
pub struct RecordingLauncher {
    log: Arc<Mutex<Recorded>>,
    fail_launches: Arc<AtomicBool>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<TrialSpec> {
        self.log.lock().launched.clone()
    }

    pub fn notices_for(&self, request_id: RequestId) -> Vec<TrialNotice> {
        self.log
            .lock()
            .notices
            .iter()
            .filter(|(rid, _)| *rid == request_id)
            .map(|(_, notice)| notice.clone())
            .collect()
    }
}

#[async_trait]
impl TrialLauncher for RecordingLauncher {
    async fn launch(&self, spec: TrialSpec, _parent: ExperimentHandle) -> HpResult<Box<dyn TrialHandle>> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(HpError::Internal(format!("cannot launch trial {}", spec.task_id)));
        }
        let request_id = spec.request_id;
        self.log.lock().launched.push(spec);
        Ok(Box::new(RecordingTrial {
            request_id,
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingTrial {
    request_id: RequestId,
    log: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl TrialHandle for RecordingTrial {
    async fn notify(&self, notice: TrialNotice) -> HpResult<()> {
        self.log.lock().notices.push((self.request_id, notice));
        Ok(())
    }
}

/// Launcher whose trials "train" instantly: each outstanding ValidateAfter
/// is answered with a progress report and a made-up metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedLauncher;

#[async_trait]
impl TrialLauncher for SimulatedLauncher {
    async fn launch(&self, spec: TrialSpec, parent: ExperimentHandle) -> HpResult<Box<dyn TrialHandle>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = spec.request_id;
        let span = tracing::info_span!("trial", task_id = %spec.task_id);
        tokio::spawn(simulate(spec, parent, rx).instrument(span));
        Ok(Box::new(SimulatedTrial { request_id, tx }))
    }
}

struct SimulatedTrial {
    request_id: RequestId,
    tx: mpsc::UnboundedSender<TrialNotice>,
}

#[async_trait]
impl TrialHandle for SimulatedTrial {
    async fn notify(&self, notice: TrialNotice) -> HpResult<()> {
        self.tx
            .send(notice)
            .map_err(|_| HpError::Internal(format!("trial {} has exited", self.request_id)))
    }
}

fn simulated_metric(units: u64) -> f64 {
    1.0 / (1.0 + units as f64)
}

async fn simulate(spec: TrialSpec, parent: ExperimentHandle, mut rx: mpsc::UnboundedReceiver<TrialNotice>) {
    let request_id = spec.request_id;
    if !spec.restored {
        if let Err(err) = parent.trial_created(request_id).await {
            warn!(error = %err, "experiment gone before trial started");
            return;
        }
    }

    let mut paused = spec.experiment_state == ExperimentState::Paused;
    let mut latest = Some(spec.searcher_state);
    loop {
        if !paused {
            if let Some(state) = latest.take() {
                if state.closed {
                    break;
                }
                if let Some(op) = state.outstanding().copied() {
                    let _ = parent
                        .trial_report_progress(request_id, op.length.units as f64)
                        .await;
                    if let Err(err) = parent
                        .trial_complete_operation(op, simulated_metric(op.length.units))
                        .await
                    {
                        warn!(error = %err, %op, "operation rejected");
                    }
                }
            }
        }

        match rx.recv().await {
            Some(TrialNotice::SearcherState(state)) => latest = Some(state),
            Some(TrialNotice::ExperimentState(update)) => {
                if update.state.is_stopping() || update.state.is_terminal() {
                    break;
                }
                paused = update.state == ExperimentState::Paused;
            }
            Some(TrialNotice::ResourcePool(pool)) => debug!(%pool, "trial moved"),
            None => break,
        }
    }

    if let Err(err) = parent.trial_closed(request_id).await {
        debug!(error = %err, "experiment gone before trial closed");
    }
}
