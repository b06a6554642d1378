//! Experiment orchestration for hp.
//!
//! Each experiment runs as one tokio task owning an [`ExperimentController`];
//! everything else talks to it through a cloned [`ExperimentHandle`].

pub mod checkpoint_gc;
pub mod config;
pub mod controller;
pub mod handle;
pub mod jobs;
pub mod resource_manager;
pub mod store;
pub mod trial;

pub use checkpoint_gc::{select_checkpoints_to_gc, CheckpointGc, GcRequest, LoggingCheckpointGc};
pub use config::ControllerConfig;
pub use controller::{Collaborators, ExperimentController, ExperimentSnapshot};
pub use handle::{spawn_experiment, ExperimentHandle, ExperimentMessage, RunningExperiment};
pub use jobs::{JobEvent, JobRegistry};
pub use resource_manager::{MemoryResourceManager, ResourceManager, RmCall};
pub use store::{ExperimentStore, MemoryStore};
pub use trial::{
    RecordingLauncher, SimulatedLauncher, TrialHandle, TrialLauncher, TrialNotice, TrialSpec,
};
