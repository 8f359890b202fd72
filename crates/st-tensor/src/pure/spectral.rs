// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Spectral helpers backed by nalgebra's SVD.

use super::{PureResult, Tensor, TensorError};
use nalgebra::DMatrix;

impl Tensor {
    /// Singular values in descending order, `min(rows, cols)` of them.
    ///
    /// The decomposition runs in `f64`; non-finite inputs are rejected before
    /// reaching nalgebra and a non-finite spectrum is reported as
    /// [`TensorError::DecompositionFailed`].
    pub fn singular_values(&self) -> PureResult<Vec<f32>> {
        self.ensure_finite("svd_input")?;
        let (rows, cols) = self.shape();
        let widened: Vec<f64> = self.data().iter().map(|&value| value as f64).collect();
        let matrix = DMatrix::<f64>::from_row_slice(rows, cols, &widened);
        let mut values: Vec<f64> = matrix.singular_values().iter().copied().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(TensorError::DecompositionFailed {
                label: "singular_values",
            });
        }
        values.sort_by(|a, b| b.total_cmp(a));
        Ok(values.into_iter().map(|v| v as f32).collect())
    }
}
