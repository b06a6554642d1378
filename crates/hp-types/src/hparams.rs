//! Hyperparameter space definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::ValidationError;
use crate::invalid_value;

/// A single hyperparameter dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterDef {
    /// Hyperparameter name as seen by the trial (e.g. "learning_rate").
    pub name: String,
    pub kind: HyperparameterKind,
}

/// Describes how a hyperparameter is sampled.
///
/// `count` is the number of grid points for the dimension; random sampling
/// ignores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HyperparameterKind {
    /// Fixed value shared by every trial.
    Const { val: serde_json::Value },
    /// Integer range [minval, maxval] inclusive.
    Int {
        minval: i64,
        maxval: i64,
        #[serde(default)]
        count: Option<usize>,
    },
    /// Continuous uniform range [minval, maxval].
    Double {
        minval: f64,
        maxval: f64,
        #[serde(default)]
        count: Option<usize>,
    },
    /// Log-uniform range: `base^x` for x uniform in [minval, maxval].
    Log {
        minval: f64,
        maxval: f64,
        base: f64,
        #[serde(default)]
        count: Option<usize>,
    },
    /// Categorical choices.
    Categorical { vals: Vec<serde_json::Value> },
}

/// A concrete hyperparameter value handed to a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HParamValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl std::fmt::Display for HParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One sampled point of a hyperparameter space.
pub type HParamSample = BTreeMap<String, HParamValue>;

/// The full hyperparameter space, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperparameterSpace {
    pub parameters: Vec<HyperparameterDef>,
}

impl HyperparameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_const(mut self, name: impl Into<String>, val: serde_json::Value) -> Self {
        self.push(name, HyperparameterKind::Const { val });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, minval: i64, maxval: i64) -> Self {
        self.push(
            name,
            HyperparameterKind::Int {
                minval,
                maxval,
                count: None,
            },
        );
        self
    }

    pub fn add_double(
        mut self,
        name: impl Into<String>,
        minval: f64,
        maxval: f64,
        count: Option<usize>,
    ) -> Self {
        self.push(
            name,
            HyperparameterKind::Double {
                minval,
                maxval,
                count,
            },
        );
        self
    }

    pub fn add_log(
        mut self,
        name: impl Into<String>,
        minval: f64,
        maxval: f64,
        base: f64,
        count: Option<usize>,
    ) -> Self {
        self.push(
            name,
            HyperparameterKind::Log {
                minval,
                maxval,
                base,
                count,
            },
        );
        self
    }

    pub fn add_categorical(mut self, name: impl Into<String>, vals: Vec<serde_json::Value>) -> Self {
        self.push(name, HyperparameterKind::Categorical { vals });
        self
    }

    fn push(&mut self, name: impl Into<String>, kind: HyperparameterKind) {
        self.parameters.push(HyperparameterDef {
            name: name.into(),
            kind,
        });
    }

    /// Rejects dimensions that nothing can be sampled from.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for param in &self.parameters {
            let field = format!("hyperparameters.{}", param.name);
            match &param.kind {
                HyperparameterKind::Const { .. } => {}
                HyperparameterKind::Int { minval, maxval, .. } => {
                    if minval > maxval {
                        return Err(invalid_value!(
                            field,
                            "minval {minval} is greater than maxval {maxval}"
                        ));
                    }
                }
                HyperparameterKind::Double { minval, maxval, .. } => {
                    validate_float_range(&field, *minval, *maxval)?;
                }
                HyperparameterKind::Log {
                    minval,
                    maxval,
                    base,
                    ..
                } => {
                    validate_float_range(&field, *minval, *maxval)?;
                    if !(base.is_finite() && *base > 0.0) {
                        return Err(invalid_value!(field, "base must be positive, got {base}"));
                    }
                }
                HyperparameterKind::Categorical { vals } => {
                    if vals.is_empty() {
                        return Err(invalid_value!(field, "vals must not be empty"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Total number of grid points, or `None` when a continuous dimension
    /// has no `count`.
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim = match &param.kind {
                HyperparameterKind::Const { .. } => 1,
                HyperparameterKind::Int {
                    minval,
                    maxval,
                    count,
                } => {
                    let span = (maxval - minval + 1).max(0) as usize;
                    count.map_or(span, |c| c.min(span))
                }
                HyperparameterKind::Double { count, .. } | HyperparameterKind::Log { count, .. } => {
                    (*count)?
                }
                HyperparameterKind::Categorical { vals } => vals.len(),
            };
            total = total.checked_mul(dim)?;
        }
        Some(total)
    }
}

fn validate_float_range(field: &str, minval: f64, maxval: f64) -> Result<(), ValidationError> {
    if !(minval.is_finite() && maxval.is_finite()) {
        return Err(invalid_value!(field, "bounds must be finite"));
    }
    if minval > maxval {
        return Err(invalid_value!(
            field,
            "minval {minval} is greater than maxval {maxval}"
        ));
    }
    Ok(())
}
