//! File-backed matrix access.
//!
//! Each partition lives in one safetensors file holding two named f32
//! tensors: an input array of shape `examples x sequence_length x channels`
//! and a target array of shape `examples x n_targets`. Everything above this
//! module treats the on-disk format as opaque.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{Array2, Array3};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::error::{Result, RunError};

/// Decoded contents of one partition file.
#[derive(Debug, Clone)]
pub struct MatrixFile {
    pub inputs: Array3<f32>,
    pub targets: Array2<f32>,
}

impl MatrixFile {
    /// Read and decode a partition file, validating tensor ranks and the
    /// shared leading length.
    pub fn open(path: &Path, input_key: &str, target_key: &str) -> Result<Self> {
        let buffer = std::fs::read(path).map_err(|e| {
            RunError::config(format!("cannot read dataset {}: {e}", path.display()))
        })?;
        let tensors = SafeTensors::deserialize(&buffer)?;

        let inputs = tensors.tensor(input_key).map_err(|_| {
            RunError::config(format!(
                "dataset {} has no '{input_key}' array",
                path.display()
            ))
        })?;
        let targets = tensors.tensor(target_key).map_err(|_| {
            RunError::config(format!(
                "dataset {} has no '{target_key}' array",
                path.display()
            ))
        })?;

        let inputs = decode_f32_3d(&inputs, input_key)?;
        let targets = decode_f32_2d(&targets, target_key)?;

        if inputs.shape()[0] != targets.shape()[0] {
            return Err(RunError::shape_mismatch(
                format!("dataset {}", path.display()),
                format!("{} examples in both arrays", inputs.shape()[0]),
                format!("{} targets rows", targets.shape()[0]),
            ));
        }

        Ok(Self { inputs, targets })
    }

    /// Number of examples in the file.
    pub fn len(&self) -> usize {
        self.inputs.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a partition file. Used by tooling and tests; training runs
    /// only ever read.
    pub fn write(
        path: &Path,
        inputs: &Array3<f32>,
        targets: &Array2<f32>,
        input_key: &str,
        target_key: &str,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let input_data: Vec<f32> = inputs.iter().copied().collect();
        let target_data: Vec<f32> = targets.iter().copied().collect();
        let views: HashMap<String, TensorView<'_>> = HashMap::from([
            (
                input_key.to_string(),
                TensorView::new(
                    Dtype::F32,
                    inputs.shape().to_vec(),
                    bytemuck::cast_slice(&input_data),
                )?,
            ),
            (
                target_key.to_string(),
                TensorView::new(
                    Dtype::F32,
                    targets.shape().to_vec(),
                    bytemuck::cast_slice(&target_data),
                )?,
            ),
        ]);
        safetensors::serialize_to_file(views, &None, path)?;
        Ok(())
    }
}

fn check_f32(view: &TensorView<'_>, name: &str) -> Result<()> {
    if view.dtype() != Dtype::F32 {
        return Err(RunError::shape_mismatch(
            format!("array '{name}'"),
            "f32 elements",
            format!("{:?}", view.dtype()),
        ));
    }
    Ok(())
}

fn decode_f32_3d(view: &TensorView<'_>, name: &str) -> Result<Array3<f32>> {
    check_f32(view, name)?;
    let shape = view.shape();
    if shape.len() != 3 {
        return Err(RunError::shape_mismatch(
            format!("array '{name}'"),
            "rank 3 (examples x length x channels)",
            format!("rank {}", shape.len()),
        ));
    }
    let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
    Array3::from_shape_vec((shape[0], shape[1], shape[2]), data).map_err(|e| {
        RunError::shape_mismatch(format!("array '{name}'"), "consistent extents", e.to_string())
    })
}

fn decode_f32_2d(view: &TensorView<'_>, name: &str) -> Result<Array2<f32>> {
    check_f32(view, name)?;
    let shape = view.shape();
    if shape.len() != 2 {
        return Err(RunError::shape_mismatch(
            format!("array '{name}'"),
            "rank 2 (examples x targets)",
            format!("rank {}", shape.len()),
        ));
    }
    let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
    Array2::from_shape_vec((shape[0], shape[1]), data).map_err(|e| {
        RunError::shape_mismatch(format!("array '{name}'"), "consistent extents", e.to_string())
    })
}
