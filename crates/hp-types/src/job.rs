//! Scheduling-facing view of an experiment.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, UserId};

/// What the job queue shows for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    /// Id of the experiment behind the job, as a string.
    pub entity_id: String,
    pub submission_time: DateTime<Utc>,
    pub owner_id: UserId,
    pub username: String,
    pub progress: f64,
    pub name: String,
    pub priority: i32,
    pub weight: f64,
    pub resource_pool: String,
}

/// Position of a job in its resource pool's queue. Zero means the job has
/// never been placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct JobPosition(pub Decimal);

impl JobPosition {
    pub fn is_unset(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Decimal> for JobPosition {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
