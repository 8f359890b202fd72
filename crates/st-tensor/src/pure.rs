// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust dense tensors used by the adaptation stack.
//!
//! Everything is a row-major `rows x cols` matrix of `f32`. Batches are rows,
//! features or classes are columns. The operator set is intentionally small:
//! it covers what the neural modules need for forward/backward passes plus the
//! spectral helpers used by batch-level objectives.

pub mod spectral;

use core::fmt;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use spiral_config::determinism;
use std::error::Error;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and the modules built on top of them.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Learning rate must be positive for optimizers.
    NonPositiveLearningRate { rate: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// A state dict carried an entry that no parameter or buffer consumed.
    UnexpectedParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// A spectral decomposition failed to produce usable values.
    DecompositionFailed { label: &'static str },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::UnexpectedParameter { name } => {
                write!(f, "unexpected entry '{name}' while loading module state")
            }
            TensorError::IoError { message } => {
                write!(f, "i/o error while handling tensor data: {message}")
            }
            TensorError::SerializationError { message } => {
                write!(
                    f,
                    "serialization error while handling tensor data: {message}"
                )
            }
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value detected for {label}: {value}")
            }
            TensorError::DecompositionFailed { label } => {
                write!(f, "spectral decomposition failed for {label}")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
        }
    }
}

impl Error for TensorError {}

/// A dense row-major 2D tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_vec(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor where every element equals `value`.
    pub fn full(rows: usize, cols: usize, value: f32) -> PureResult<Self> {
        Self::from_vec(rows, cols, vec![value; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self { data, rows, cols })
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/normal");
        Self::random_normal_with(rows, cols, mean, std, &mut rng)
    }

    /// Normal sampling driven by a caller-owned RNG so streams can share one
    /// generator across batches.
    pub fn random_normal_with(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(rng);
                mean + std * sample as f32
            })
            .collect();
        Self::from_vec(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_vec(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Tensors can never be empty; kept for clippy's `len_without_is_empty`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Borrow a single row.
    pub fn row(&self, index: usize) -> PureResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::InvalidValue { label: "row_index" });
        }
        Ok(&self.data[index * self.cols..(index + 1) * self.cols])
    }

    /// Copies a contiguous range of rows into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.rows {
            return Err(TensorError::InvalidValue {
                label: "slice_rows_range",
            });
        }
        let data = self.data[start * self.cols..end * self.cols].to_vec();
        Tensor::from_vec(end - start, self.cols, data)
    }

    /// Matrix product `self @ other`.
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let lhs = &self.data[r * inner..(r + 1) * inner];
            let dst = &mut out[r * cols..(r + 1) * cols];
            for (k, &a) in lhs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[k * cols..(k + 1) * cols];
                for (d, &b) in dst.iter_mut().zip(rhs) {
                    *d += a * b;
                }
            }
        }
        Tensor::from_vec(rows, cols, out)
    }

    /// Element-wise product (Hadamard) between two tensors of identical shape.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    fn zip_with(&self, other: &Tensor, op: impl Fn(f32, f32) -> f32) -> PureResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| op(a, b))
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Returns a new tensor where every element is scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| a * value).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Add a scaled tensor to this tensor (`self += scale * other`).
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_mut(self.cols) {
            for (value, b) in row.iter_mut().zip(bias) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Apply the ReLU activation in-place (`self[i] = max(self[i], 0)`).
    pub fn relu_inplace(&mut self) {
        for value in self.data.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// Fills every element with zero while keeping the shape.
    pub fn fill_zero(&mut self) {
        self.data.iter_mut().for_each(|value| *value = 0.0);
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns the sum over rows for each column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum += value;
            }
        }
        sums
    }

    /// Row-wise softmax with max subtraction for stability.
    pub fn row_softmax(&self) -> PureResult<Tensor> {
        let mut out = Vec::with_capacity(self.len());
        for row in self.data.chunks(self.cols) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if !max.is_finite() {
                return Err(TensorError::NonFiniteValue {
                    label: "row_softmax_logits",
                    value: max,
                });
            }
            let start = out.len();
            let mut denom = 0.0f32;
            for &value in row {
                let e = (value - max).exp();
                denom += e;
                out.push(e);
            }
            let inv = 1.0 / denom;
            for value in &mut out[start..] {
                *value *= inv;
            }
        }
        Tensor::from_vec(self.rows, self.cols, out)
    }

    /// Row-wise log-softmax using the log-sum-exp trick.
    pub fn row_log_softmax(&self) -> PureResult<Tensor> {
        let mut out = Vec::with_capacity(self.len());
        for row in self.data.chunks(self.cols) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if !max.is_finite() {
                return Err(TensorError::NonFiniteValue {
                    label: "row_log_softmax_logits",
                    value: max,
                });
            }
            let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
            out.extend(row.iter().map(|v| (v - max) - log_sum));
        }
        Tensor::from_vec(self.rows, self.cols, out)
    }

    /// Index of the largest entry in each row; ties resolve to the first.
    pub fn argmax_rows(&self) -> Vec<usize> {
        self.data
            .chunks(self.cols)
            .map(|row| {
                let mut best = 0usize;
                for (idx, value) in row.iter().enumerate() {
                    if *value > row[best] {
                        best = idx;
                    }
                }
                best
            })
            .collect()
    }

    /// Computes the squared L2 norm of the tensor.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Fails with [`TensorError::NonFiniteValue`] on the first NaN or infinity.
    pub fn ensure_finite(&self, label: &'static str) -> PureResult<()> {
        match self.data.iter().find(|v| !v.is_finite()) {
            Some(&value) => Err(TensorError::NonFiniteValue { label, value }),
            None => Ok(()),
        }
    }

    /// Concatenates tensors row-wise.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let Some(first) = tensors.first() else {
            return Err(TensorError::EmptyInput("Tensor::cat_rows"));
        };
        let cols = first.cols;
        let mut total_rows = 0usize;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (tensor.rows, cols),
                });
            }
            total_rows += tensor.rows;
        }
        let mut data = Vec::with_capacity(total_rows * cols);
        for tensor in tensors {
            data.extend_from_slice(&tensor.data);
        }
        Tensor::from_vec(total_rows, cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_reject_degenerate_shapes() {
        assert_eq!(
            Tensor::zeros(0, 3).unwrap_err(),
            TensorError::InvalidDimensions { rows: 0, cols: 3 }
        );
        assert_eq!(
            Tensor::from_vec(2, 2, vec![1.0; 3]).unwrap_err(),
            TensorError::DataLength {
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn matmul_matches_manual_product() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
        assert!(a.matmul(&a).is_err());
    }

    #[test]
    fn transpose_swaps_axes() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = a.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn row_softmax_rows_sum_to_one() {
        let logits = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0]).unwrap();
        let probs = logits.row_softmax().unwrap();
        for row in probs.data().chunks(3) {
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
        assert!((probs.data()[3] - 1.0 / 3.0).abs() < 1e-6);

        let log_probs = logits.row_log_softmax().unwrap();
        for (p, lp) in probs.data().iter().zip(log_probs.data()) {
            assert!((p.ln() - lp).abs() < 1e-5);
        }
    }

    #[test]
    fn row_log_softmax_keeps_precision_for_large_logits() {
        let logits = Tensor::from_vec(1, 3, vec![1000.0, 1000.0, 1000.0]).unwrap();
        let log_probs = logits.row_log_softmax().unwrap();
        let expected = -(3.0f32).ln();
        for lp in log_probs.data() {
            assert!((lp - expected).abs() < 1e-6, "{lp} vs {expected}");
        }
    }

    #[test]
    fn row_softmax_rejects_nan_rows() {
        let logits = Tensor::from_vec(1, 2, vec![f32::NAN, f32::NAN]).unwrap();
        assert!(matches!(
            logits.row_softmax(),
            Err(TensorError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let a = Tensor::random_normal(3, 4, 0.0, 1.0, Some(7)).unwrap();
        let b = Tensor::random_normal(3, 4, 0.0, 1.0, Some(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn argmax_and_finite_guards() {
        let t = Tensor::from_vec(2, 3, vec![0.1, 0.7, 0.2, 0.5, 0.5, -1.0]).unwrap();
        assert_eq!(t.argmax_rows(), vec![1, 0]);
        assert!(t.ensure_finite("probe").is_ok());
        let bad = Tensor::from_vec(1, 2, vec![1.0, f32::INFINITY]).unwrap();
        assert!(bad.ensure_finite("probe").is_err());
    }

    #[test]
    fn slicing_and_concatenation_round_trip() {
        let t = Tensor::from_fn(4, 2, |r, c| (r * 2 + c) as f32).unwrap();
        let head = t.slice_rows(0, 1).unwrap();
        let tail = t.slice_rows(1, 4).unwrap();
        assert_eq!(Tensor::cat_rows(&[head, tail]).unwrap(), t);
        assert_eq!(t.row(2).unwrap(), &[4.0, 5.0]);
        assert!(t.slice_rows(3, 3).is_err());
    }
}
