//! Identifiers shared across the experiment, searcher and trial layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Database id of an experiment.
pub type ExperimentId = i64;

/// Database id of a trial.
pub type TrialId = i64;

/// Id of the user owning an experiment.
pub type UserId = i64;

/// Process-unique id correlating one trial attempt across operations,
/// trial searcher state and searcher events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a request id from raw bytes, used by seeded searchers so a
    /// restored searcher keeps producing the same ids.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Id of the scheduling job backing an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task id of a trial: `<experiment id>.<request id>`.
pub fn trial_task_id(experiment_id: ExperimentId, request_id: RequestId) -> String {
    format!("{experiment_id}.{request_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_parses_its_display_form() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn request_id_from_bytes_is_deterministic() {
        let a = RequestId::from_bytes([7u8; 16]);
        let b = RequestId::from_bytes([7u8; 16]);
        assert_eq!(a, b);
        assert_ne!(a, RequestId::from_bytes([8u8; 16]));
    }

    #[test]
    fn trial_task_id_format() {
        let id: RequestId = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        assert_eq!(
            trial_task_id(12, id),
            "12.67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
    }
}
