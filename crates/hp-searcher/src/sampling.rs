//! Sampling and gridding of hyperparameter spaces.

use hp_types::{HParamSample, HParamValue, HyperparameterKind, HyperparameterSpace, SearcherError};
use rand::Rng;

/// Draw one independent sample from every dimension of `space`.
///
/// Fails on a dimension with nothing to draw from: an inverted or
/// non-finite range, or an empty categorical.
pub fn sample_hparams<R: Rng + ?Sized>(
    space: &HyperparameterSpace,
    rng: &mut R,
) -> Result<HParamSample, SearcherError> {
    let mut sample = HParamSample::new();

    for param in &space.parameters {
        let empty = || SearcherError::InvalidSpace {
            message: format!("hyperparameter {} has an empty range", param.name),
        };
        let value = match &param.kind {
            HyperparameterKind::Const { val } => HParamValue::Json(val.clone()),
            HyperparameterKind::Int { minval, maxval, .. } => {
                if minval > maxval {
                    return Err(empty());
                }
                HParamValue::Int(rng.gen_range(*minval..=*maxval))
            }
            HyperparameterKind::Double { minval, maxval, .. } => {
                HParamValue::Float(uniform(rng, *minval, *maxval).ok_or_else(empty)?)
            }
            HyperparameterKind::Log {
                minval, maxval, base, ..
            } => {
                let exponent = uniform(rng, *minval, *maxval).ok_or_else(empty)?;
                HParamValue::Float(base.powf(exponent))
            }
            HyperparameterKind::Categorical { vals } => {
                if vals.is_empty() {
                    return Err(empty());
                }
                let idx = rng.gen_range(0..vals.len());
                HParamValue::Json(vals[idx].clone())
            }
        };
        sample.insert(param.name.clone(), value);
    }

    Ok(sample)
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> Option<f64> {
    (low.is_finite() && high.is_finite() && low <= high).then(|| rng.gen_range(low..=high))
}

/// Every point of the grid spanned by `space`, in declaration order of the
/// dimensions.
pub fn grid_points(space: &HyperparameterSpace) -> Result<Vec<HParamSample>, SearcherError> {
    let mut axes: Vec<(&str, Vec<HParamValue>)> = Vec::new();

    for param in &space.parameters {
        let values: Vec<HParamValue> = match &param.kind {
            HyperparameterKind::Const { val } => vec![HParamValue::Json(val.clone())],
            HyperparameterKind::Int {
                minval,
                maxval,
                count,
            } => int_axis(*minval, *maxval, *count),
            HyperparameterKind::Double {
                minval,
                maxval,
                count,
            } => {
                let steps = require_count(&param.name, *count)?;
                linspace(*minval, *maxval, steps)
                    .into_iter()
                    .map(HParamValue::Float)
                    .collect()
            }
            HyperparameterKind::Log {
                minval,
                maxval,
                base,
                count,
            } => {
                let steps = require_count(&param.name, *count)?;
                linspace(*minval, *maxval, steps)
                    .into_iter()
                    .map(|exponent| HParamValue::Float(base.powf(exponent)))
                    .collect()
            }
            HyperparameterKind::Categorical { vals } => {
                vals.iter().cloned().map(HParamValue::Json).collect()
            }
        };
        if values.is_empty() {
            return Err(SearcherError::InvalidSpace {
                message: format!("hyperparameter {} has no grid values", param.name),
            });
        }
        axes.push((param.name.as_str(), values));
    }

    // Cartesian product
    let mut result: Vec<HParamSample> = vec![HParamSample::new()];
    for (name, axis) in &axes {
        let mut next = Vec::with_capacity(result.len() * axis.len());
        for existing in &result {
            for value in axis {
                let mut point = existing.clone();
                point.insert(name.to_string(), value.clone());
                next.push(point);
            }
        }
        result = next;
    }

    Ok(result)
}

fn require_count(name: &str, count: Option<usize>) -> Result<usize, SearcherError> {
    count.filter(|c| *c > 0).ok_or_else(|| SearcherError::InvalidSpace {
        message: format!("grid search needs a positive count for {name}"),
    })
}

fn linspace(low: f64, high: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![low];
    }
    (0..steps)
        .map(|i| {
            let t = i as f64 / (steps - 1) as f64;
            low + t * (high - low)
        })
        .collect()
}

fn int_axis(low: i64, high: i64, count: Option<usize>) -> Vec<HParamValue> {
    let span = (high - low + 1).max(0) as usize;
    match count {
        Some(c) if c > 0 && c < span => {
            let mut values: Vec<i64> = linspace(low as f64, high as f64, c)
                .into_iter()
                .map(|v| v.round() as i64)
                .collect();
            values.dedup();
            values.into_iter().map(HParamValue::Int).collect()
        }
        _ => (low..=high).map(HParamValue::Int).collect(),
    }
}
