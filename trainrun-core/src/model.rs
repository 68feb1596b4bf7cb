//! The model collaborator seam.
//!
//! The driver issues one logical call per step and waits for completion;
//! whatever parallelism a model uses internally stays behind this trait.

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunError};

/// Where the model's compute runs. Built once from the configuration and
/// handed to the model, which reports readiness or failure for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Host,
    Accelerator { data_parallel: bool },
}

impl Device {
    pub fn from_flags(use_accelerator: bool, data_parallel: bool) -> Self {
        if use_accelerator {
            Device::Accelerator { data_parallel }
        } else {
            Device::Host
        }
    }
}

/// Result of one optimization step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub loss: f64,
    pub outputs: Array2<f32>,
}

/// A trainable regression model over sequence-encoded inputs.
pub trait Model: Send {
    /// Forward pass only.
    fn predict(&self, inputs: &Array3<f32>) -> Result<Array2<f32>>;

    /// One forward/backward/update over a batch.
    fn train_step(&mut self, inputs: &Array3<f32>, targets: &Array2<f32>) -> Result<StepOutcome>;

    /// Snapshot of every trainable parameter, in a stable order.
    fn parameters(&self) -> Vec<f32>;

    /// Restore a parameter snapshot taken with [`Model::parameters`].
    fn load_parameters(&mut self, params: &[f32]) -> Result<()>;

    /// Move the model to a device, failing when the device is unavailable.
    fn place(&mut self, device: Device) -> Result<()>;
}

/// Least-squares linear regression over flattened inputs, updated with
/// plain gradient descent. The reference model for runs and tests.
pub struct LinearModel {
    weights: Array2<f32>,
    bias: Array1<f32>,
    learning_rate: f32,
    input_dim: usize,
}

impl LinearModel {
    /// `input_dim` is the flattened per-example size (sequence length times
    /// channels).
    pub fn new(input_dim: usize, n_targets: usize, learning_rate: f32) -> Self {
        Self {
            weights: Array2::zeros((input_dim, n_targets)),
            bias: Array1::zeros(n_targets),
            learning_rate,
            input_dim,
        }
    }

    fn flatten<'a>(&self, inputs: &'a Array3<f32>) -> Result<ndarray::CowArray<'a, f32, ndarray::Ix2>> {
        let n = inputs.shape()[0];
        let per_example = inputs.shape()[1] * inputs.shape()[2];
        if per_example != self.input_dim {
            return Err(RunError::shape_mismatch(
                "model input",
                format!("{} values per example", self.input_dim),
                format!("{per_example}"),
            ));
        }
        inputs.to_shape((n, self.input_dim)).map_err(|e| {
            RunError::shape_mismatch("model input", "contiguous batch", e.to_string())
        })
    }
}

impl Model for LinearModel {
    fn predict(&self, inputs: &Array3<f32>) -> Result<Array2<f32>> {
        let x = self.flatten(inputs)?;
        Ok(x.dot(&self.weights) + &self.bias)
    }

    fn train_step(&mut self, inputs: &Array3<f32>, targets: &Array2<f32>) -> Result<StepOutcome> {
        let x = self.flatten(inputs)?;
        if targets.shape() != [x.shape()[0], self.weights.shape()[1]] {
            return Err(RunError::shape_mismatch(
                "model targets",
                format!("{:?}", [x.shape()[0], self.weights.shape()[1]]),
                format!("{:?}", targets.shape()),
            ));
        }

        let outputs = x.dot(&self.weights) + &self.bias;
        let residual = &outputs - targets;
        let n = x.shape()[0] as f32;

        let loss = residual.iter().map(|&r| (r as f64).powi(2)).sum::<f64>()
            / (residual.len().max(1) as f64);

        let grad_w = x.t().dot(&residual) * (2.0 / n);
        let grad_b = residual.sum_axis(ndarray::Axis(0)) * (2.0 / n);
        self.weights = &self.weights - &(grad_w * self.learning_rate);
        self.bias = &self.bias - &(grad_b * self.learning_rate);

        Ok(StepOutcome { loss, outputs })
    }

    fn parameters(&self) -> Vec<f32> {
        let mut params: Vec<f32> = self.weights.iter().copied().collect();
        params.extend(self.bias.iter().copied());
        params
    }

    fn load_parameters(&mut self, params: &[f32]) -> Result<()> {
        let expected = self.weights.len() + self.bias.len();
        if params.len() != expected {
            return Err(RunError::corrupt_checkpoint(format!(
                "parameter blob holds {} values, model needs {expected}",
                params.len()
            )));
        }
        let (w, b) = params.split_at(self.weights.len());
        self.weights = Array2::from_shape_vec(self.weights.raw_dim(), w.to_vec())
            .map_err(|e| RunError::corrupt_checkpoint(e.to_string()))?;
        self.bias = Array1::from_vec(b.to_vec());
        Ok(())
    }

    fn place(&mut self, device: Device) -> Result<()> {
        match device {
            Device::Host => Ok(()),
            Device::Accelerator { .. } => Err(RunError::config(
                "the linear model runs on the host only",
            )),
        }
    }
}
