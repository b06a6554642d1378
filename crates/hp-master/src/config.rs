//! Settings of the controller process itself, as opposed to the
//! per-experiment `ExperimentConfig`.

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use hp_types::{HpError, HpResult, DEFAULT_SCHEDULING_PRIORITY};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variables with this prefix override file settings, e.g.
/// `HPX_INBOX_CAPACITY=16`.
pub const ENV_PREFIX: &str = "HPX_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Bound of each experiment's message inbox.
    pub inbox_capacity: usize,
    /// Priority reported for experiments that never set one.
    pub default_priority: i32,
    /// Schedule checkpoint garbage collection when an experiment shuts down.
    pub checkpoint_gc: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 64,
            default_priority: DEFAULT_SCHEDULING_PRIORITY,
            checkpoint_gc: true,
        }
    }
}

impl ControllerConfig {
    /// Load the controller settings.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. The JSON file at `path`, when given
    /// 3. `HPX_*` environment variables
    pub fn load(path: Option<&Path>) -> HpResult<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(HpError::Config(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Json::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| HpError::Config(format!("failed to extract controller config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HpResult<()> {
        if self.inbox_capacity == 0 {
            return Err(HpError::Config("inbox_capacity must be positive".into()));
        }
        hp_types::validate_priority(self.default_priority)?;
        Ok(())
    }
}
