//! Metric evaluation over prediction/target matrices.
//!
//! Metrics are pure per-column functions applied feature-wise and averaged
//! over the retained columns. A column is retained when its positive-label
//! count within the evaluation sample reaches the configured threshold;
//! near-constant label columns otherwise produce unstable statistics.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RunError};
use crate::registry::MetricRegistry;
use crate::sampler::Partition;

/// A per-column metric: `(predictions, targets) -> value`.
pub type MetricFn = fn(ArrayView1<'_, f32>, ArrayView1<'_, f32>) -> f64;

/// One append-only log entry of metric values at a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricReport {
    pub step: u64,
    pub partition: Partition,
    pub values: BTreeMap<String, f64>,
}

/// Applies a fixed set of named metrics with shape validation and the
/// positive-count column filter.
pub struct MetricEvaluator {
    metrics: Vec<(String, MetricFn)>,
    min_positives: usize,
}

impl MetricEvaluator {
    /// Resolve `names` against the registry. Unknown names fail here, at
    /// construction, before any compute happens.
    pub fn from_registry(
        registry: &MetricRegistry,
        names: &[String],
        min_positives: usize,
    ) -> Result<Self> {
        let mut metrics = Vec::with_capacity(names.len());
        for name in names {
            let f = registry.resolve(name)?;
            metrics.push((name.clone(), f));
        }
        Ok(Self {
            metrics,
            min_positives,
        })
    }

    /// Evaluate every configured metric. Idempotent: identical inputs yield
    /// identical values.
    pub fn evaluate(
        &self,
        predictions: &Array2<f32>,
        targets: &Array2<f32>,
    ) -> Result<BTreeMap<String, f64>> {
        if predictions.shape() != targets.shape() {
            return Err(RunError::shape_mismatch(
                "metric evaluation",
                format!("{:?}", targets.shape()),
                format!("{:?}", predictions.shape()),
            ));
        }

        let columns = self.retained_columns(targets);
        if columns.is_empty() {
            warn!(
                threshold = self.min_positives,
                "every target column fell below the positive-count threshold"
            );
        }

        let mut values = BTreeMap::new();
        for (name, f) in &self.metrics {
            let value = if columns.is_empty() {
                f64::NAN
            } else {
                let sum: f64 = columns
                    .iter()
                    .map(|&c| {
                        f(
                            predictions.index_axis(Axis(1), c),
                            targets.index_axis(Axis(1), c),
                        )
                    })
                    .sum();
                sum / columns.len() as f64
            };
            values.insert(name.clone(), value);
        }
        Ok(values)
    }

    /// Columns with at least `min_positives` positive labels in the sample.
    /// A threshold of zero retains every column.
    fn retained_columns(&self, targets: &Array2<f32>) -> Vec<usize> {
        (0..targets.shape()[1])
            .filter(|&c| {
                if self.min_positives == 0 {
                    return true;
                }
                let positives = targets
                    .index_axis(Axis(1), c)
                    .iter()
                    .filter(|&&v| v > 0.0)
                    .count();
                positives >= self.min_positives
            })
            .collect()
    }
}

/// Mean squared error.
pub fn mse(predictions: ArrayView1<'_, f32>, targets: ArrayView1<'_, f32>) -> f64 {
    let n = predictions.len().max(1) as f64;
    predictions
        .iter()
        .zip(targets.iter())
        .map(|(&p, &t)| {
            let d = (p - t) as f64;
            d * d
        })
        .sum::<f64>()
        / n
}

/// Mean absolute error.
pub fn mae(predictions: ArrayView1<'_, f32>, targets: ArrayView1<'_, f32>) -> f64 {
    let n = predictions.len().max(1) as f64;
    predictions
        .iter()
        .zip(targets.iter())
        .map(|(&p, &t)| ((p - t) as f64).abs())
        .sum::<f64>()
        / n
}

/// Pearson correlation coefficient. NaN when either side has zero variance.
pub fn pearson_r(predictions: ArrayView1<'_, f32>, targets: ArrayView1<'_, f32>) -> f64 {
    let n = predictions.len() as f64;
    if n < 2.0 {
        return f64::NAN;
    }
    let mean_p = predictions.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_t = targets.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_p = 0.0;
    let mut var_t = 0.0;
    for (&p, &t) in predictions.iter().zip(targets.iter()) {
        let dp = p as f64 - mean_p;
        let dt = t as f64 - mean_t;
        cov += dp * dt;
        var_p += dp * dp;
        var_t += dt * dt;
    }
    let denom = (var_p * var_t).sqrt();
    if denom == 0.0 {
        return f64::NAN;
    }
    cov / denom
}
