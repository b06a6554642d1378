//! Experiment configuration.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::errors::ValidationError;
use crate::hparams::HyperparameterSpace;
use crate::ids::TrialId;
use crate::invalid_value;
use crate::operations::{Length, Unit};

/// Priority the resource manager applies when an experiment sets none.
pub const DEFAULT_SCHEDULING_PRIORITY: i32 = 42;

/// Priorities accepted by the resource manager (lower runs first).
pub const PRIORITY_RANGE: RangeInclusive<i32> = 1..=99;

/// Which search method drives the experiment, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SearchMethodConfig {
    /// Decisions are made by an external client reading searcher events.
    Custom {
        #[serde(default = "default_unit")]
        unit: Unit,
    },
    /// Independent random samples of the hyperparameter space.
    Random {
        max_trials: usize,
        max_length: Length,
        /// Zero means no limit.
        #[serde(default)]
        max_concurrent_trials: usize,
    },
    /// Every point of the hyperparameter grid.
    Grid {
        max_length: Length,
        #[serde(default)]
        max_concurrent_trials: usize,
    },
}

fn default_unit() -> Unit {
    Unit::Batches
}

/// Searcher section of the experiment config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearcherConfig {
    /// Validation metric the searcher optimizes.
    pub metric: String,
    #[serde(default = "default_true")]
    pub smaller_is_better: bool,
    /// Warm-start every trial from the latest checkpoint of this trial.
    #[serde(default)]
    pub source_trial_id: Option<TrialId>,
    /// Warm-start every trial from this checkpoint.
    #[serde(default)]
    pub source_checkpoint_uuid: Option<String>,
    #[serde(flatten)]
    pub method: SearchMethodConfig,
}

fn default_true() -> bool {
    true
}

impl SearcherConfig {
    pub fn new(method: SearchMethodConfig) -> Self {
        Self {
            metric: "validation_loss".to_string(),
            smaller_is_better: true,
            source_trial_id: None,
            source_checkpoint_uuid: None,
            method,
        }
    }

    pub fn custom() -> Self {
        Self::new(SearchMethodConfig::Custom { unit: Unit::Batches })
    }

    pub fn random(max_trials: usize, max_length: Length) -> Self {
        Self::new(SearchMethodConfig::Random {
            max_trials,
            max_length,
            max_concurrent_trials: 0,
        })
    }

    pub fn grid(max_length: Length) -> Self {
        Self::new(SearchMethodConfig::Grid {
            max_length,
            max_concurrent_trials: 0,
        })
    }

    /// Caps live trials for random and grid search. Zero means no cap.
    pub fn with_max_concurrent_trials(mut self, limit: usize) -> Self {
        match &mut self.method {
            SearchMethodConfig::Random {
                max_concurrent_trials,
                ..
            }
            | SearchMethodConfig::Grid {
                max_concurrent_trials,
                ..
            } => *max_concurrent_trials = limit,
            SearchMethodConfig::Custom { .. } => {}
        }
        self
    }

    pub fn with_metric(mut self, metric: &str, smaller_is_better: bool) -> Self {
        self.metric = metric.to_string();
        self.smaller_is_better = smaller_is_better;
        self
    }

    pub fn with_source_trial(mut self, trial_id: TrialId) -> Self {
        self.source_trial_id = Some(trial_id);
        self
    }

    pub fn with_source_checkpoint(mut self, uuid: &str) -> Self {
        self.source_checkpoint_uuid = Some(uuid.to_string());
        self
    }
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self::custom()
    }
}

/// Scheduling-related settings forwarded to the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub resource_pool: String,
    pub slots_per_trial: usize,
    /// Cap on slots used by all trials together. `None` = unlimited.
    #[serde(default)]
    pub max_slots: Option<usize>,
    pub weight: f64,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            resource_pool: "default".to_string(),
            slots_per_trial: 1,
            max_slots: None,
            weight: 1.0,
            priority: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproducibilityConfig {
    pub experiment_seed: u32,
}

impl Default for ReproducibilityConfig {
    fn default() -> Self {
        Self { experiment_seed: 0 }
    }
}

/// How many checkpoints survive garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStorageConfig {
    pub save_experiment_best: usize,
    pub save_trial_best: usize,
    pub save_trial_latest: usize,
}

impl Default for CheckpointStorageConfig {
    fn default() -> Self {
        Self {
            save_experiment_best: 0,
            save_trial_best: 1,
            save_trial_latest: 1,
        }
    }
}

/// Top-level configuration of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub searcher: SearcherConfig,
    #[serde(default)]
    pub hyperparameters: HyperparameterSpace,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub reproducibility: ReproducibilityConfig,
    #[serde(default)]
    pub checkpoint_storage: CheckpointStorageConfig,
}

impl ExperimentConfig {
    pub fn new(name: &str, searcher: SearcherConfig) -> Self {
        Self {
            name: name.to_string(),
            searcher,
            ..Default::default()
        }
    }

    pub fn with_hyperparameters(mut self, space: HyperparameterSpace) -> Self {
        self.hyperparameters = space;
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.reproducibility.experiment_seed = seed;
        self
    }

    pub fn with_resources(mut self, resources: ResourcesConfig) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_checkpoint_storage(mut self, storage: CheckpointStorageConfig) -> Self {
        self.checkpoint_storage = storage;
        self
    }

    /// Static checks run before an experiment is created.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;
        validate_weight(self.resources.weight)?;
        if let Some(priority) = self.resources.priority {
            validate_priority(priority)?;
        }
        validate_max_slots(self.resources.max_slots)?;
        self.hyperparameters.validate()?;
        match &self.searcher.method {
            SearchMethodConfig::Custom { .. } => {}
            SearchMethodConfig::Random {
                max_trials,
                max_length,
                ..
            } => {
                if *max_trials == 0 {
                    return Err(invalid_value!("searcher.max_trials", "must be at least 1"));
                }
                validate_length(max_length)?;
            }
            SearchMethodConfig::Grid { max_length, .. } => {
                validate_length(max_length)?;
                if self.hyperparameters.grid_size().is_none() {
                    return Err(invalid_value!(
                        "hyperparameters",
                        "grid search needs a count for every continuous hyperparameter"
                    ));
                }
            }
        }
        if self.searcher.source_trial_id.is_some() && self.searcher.source_checkpoint_uuid.is_some() {
            return Err(invalid_value!(
                "searcher",
                "source_trial_id and source_checkpoint_uuid are mutually exclusive"
            ));
        }
        Ok(())
    }
}

fn validate_length(length: &Length) -> Result<(), ValidationError> {
    if length.units == 0 {
        return Err(invalid_value!("searcher.max_length", "must be positive"));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(invalid_value!("name", "must not be empty"));
    }
    Ok(())
}

pub fn validate_weight(weight: f64) -> Result<(), ValidationError> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(invalid_value!("weight", "must be a positive number, got {weight}"));
    }
    Ok(())
}

pub fn validate_priority(priority: i32) -> Result<(), ValidationError> {
    if !PRIORITY_RANGE.contains(&priority) {
        return Err(invalid_value!(
            "priority",
            "must be between {} and {}, got {priority}",
            PRIORITY_RANGE.start(),
            PRIORITY_RANGE.end()
        ));
    }
    Ok(())
}

pub fn validate_max_slots(max_slots: Option<usize>) -> Result<(), ValidationError> {
    if max_slots == Some(0) {
        return Err(invalid_value!("max_slots", "must be positive when set"));
    }
    Ok(())
}
