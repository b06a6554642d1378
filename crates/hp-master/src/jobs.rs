//! Process-wide registry of running experiments, keyed by job id.

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use hp_types::{ExperimentId, ExperimentState, JobId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::handle::ExperimentHandle;

/// Lifecycle notifications for observers of the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    Registered {
        job_id: JobId,
        experiment_id: ExperimentId,
    },
    StateChanged {
        job_id: JobId,
        state: ExperimentState,
    },
    Unregistered {
        job_id: JobId,
    },
}

/// Cheap to clone; clones share one table.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<JobId, ExperimentHandle>>,
    events: Option<Sender<JobEvent>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that also publishes [`JobEvent`]s on the returned
    /// receiver.
    pub fn with_events() -> (Self, Receiver<JobEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let registry = Self {
            jobs: Arc::default(),
            events: Some(tx),
        };
        (registry, rx)
    }

    pub fn register(&self, job_id: JobId, handle: ExperimentHandle) {
        let experiment_id = handle.experiment_id();
        debug!(%job_id, experiment_id, "job registered");
        self.jobs.insert(job_id.clone(), handle);
        self.emit(JobEvent::Registered { job_id, experiment_id });
    }

    pub fn unregister(&self, job_id: &JobId) {
        if self.jobs.remove(job_id).is_some() {
            debug!(%job_id, "job unregistered");
            self.emit(JobEvent::Unregistered {
                job_id: job_id.clone(),
            });
        }
    }

    pub fn state_changed(&self, job_id: &JobId, state: ExperimentState) {
        self.emit(JobEvent::StateChanged {
            job_id: job_id.clone(),
            state,
        });
    }

    pub fn get(&self, job_id: &JobId) -> Option<ExperimentHandle> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn emit(&self, event: JobEvent) {
        if let Some(tx) = &self.events {
            // Observers are optional; a dropped receiver is fine.
            let _ = tx.try_send(event);
        }
    }
}
