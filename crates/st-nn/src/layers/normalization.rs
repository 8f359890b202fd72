// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Normalization, Parameter, RunningStats};
use crate::{PureResult, Tensor, TensorError};
use std::cell::RefCell;

/// Batch normalisation over the batch dimension.
///
/// Statistics come from the current batch in training mode, and in evaluation
/// mode as well once the running statistics have been discarded. Running
/// statistics are only updated by training-mode forwards while
/// `track_running_stats` is set.
#[derive(Debug)]
pub struct BatchNorm1d {
    name: String,
    features: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running: RefCell<Option<RunningStats>>,
    track_running_stats: bool,
    training: bool,
}

struct BatchStats {
    mean: Vec<f32>,
    inv_std: Vec<f32>,
    from_batch: bool,
}

impl BatchNorm1d {
    /// Creates a new batch normalisation layer operating over the feature axis.
    pub fn new(
        name: impl Into<String>,
        features: usize,
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: features,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::full(1, features, 1.0)?;
        let beta = Tensor::zeros(1, features)?;
        let running = RunningStats {
            mean: Tensor::zeros(1, features)?,
            var: Tensor::full(1, features, 1.0)?,
        };
        Ok(Self {
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            name,
            features,
            epsilon,
            momentum,
            running: RefCell::new(Some(running)),
            track_running_stats: true,
            training: true,
        })
    }

    /// Layer with PyTorch's defaults (`momentum = 0.1`, `epsilon = 1e-5`).
    pub fn with_defaults(name: impl Into<String>, features: usize) -> PureResult<Self> {
        Self::new(name, features, 0.1, 1e-5)
    }

    /// Returns the momentum applied to the running statistics.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Whether the next forward normalises with current-batch statistics.
    pub fn uses_batch_statistics(&self) -> bool {
        self.training || self.running.borrow().is_none()
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (rows, cols) = input.shape();
        if cols != self.features {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.features),
            });
        }
        Ok(())
    }

    fn compute_moments(&self, input: &Tensor) -> (Vec<f32>, Vec<f32>) {
        let (batch, features) = input.shape();
        let scale = 1.0 / batch as f32;
        let mut mean = input.sum_axis0();
        for value in mean.iter_mut() {
            *value *= scale;
        }
        let mut variance = vec![0.0f32; features];
        for row in input.data().chunks(features) {
            for (idx, value) in row.iter().enumerate() {
                let centered = *value - mean[idx];
                variance[idx] += centered * centered;
            }
        }
        for value in variance.iter_mut() {
            *value *= scale;
        }
        (mean, variance)
    }

    fn inv_std(&self, variance: &[f32]) -> Vec<f32> {
        variance
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect()
    }

    fn resolve_stats(&self, input: &Tensor) -> BatchStats {
        let running = self.running.borrow();
        match (self.training, running.as_ref()) {
            (false, Some(stats)) => BatchStats {
                mean: stats.mean.data().to_vec(),
                inv_std: self.inv_std(stats.var.data()),
                from_batch: false,
            },
            _ => {
                let (mean, variance) = self.compute_moments(input);
                BatchStats {
                    inv_std: self.inv_std(&variance),
                    mean,
                    from_batch: true,
                }
            }
        }
    }

    fn update_running(&self, input: &Tensor) {
        if !(self.training && self.track_running_stats) {
            return;
        }
        let mut running = self.running.borrow_mut();
        let Some(stats) = running.as_mut() else {
            return;
        };
        let (mean, variance) = self.compute_moments(input);
        for (dst, value) in stats.mean.data_mut().iter_mut().zip(&mean) {
            *dst = self.momentum * value + (1.0 - self.momentum) * *dst;
        }
        for (dst, value) in stats.var.data_mut().iter_mut().zip(&variance) {
            *dst = self.momentum * value + (1.0 - self.momentum) * *dst;
        }
    }

    fn normalise(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (batch, features) = input.shape();
        let stats = self.resolve_stats(input);

        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let mut output = Vec::with_capacity(batch * features);
        for row in input.data().chunks(features) {
            for feature in 0..features {
                let normed = (row[feature] - stats.mean[feature]) * stats.inv_std[feature];
                output.push(normed * gamma[feature] + beta[feature]);
            }
        }
        Tensor::from_vec(batch, features, output)
    }
}

impl Module for BatchNorm1d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let output = self.normalise(input)?;
        self.update_running(input);
        Ok(output)
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.normalise(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (batch, features) = input.shape();
        let stats = self.resolve_stats(input);
        let gamma = self.gamma.value().data();
        let n = batch as f32;

        let mut grad_input = vec![0.0f32; batch * features];
        let mut grad_gamma = vec![0.0f32; features];
        let mut grad_beta = vec![0.0f32; features];

        for feature in 0..features {
            let mut sum_grad = 0.0f32;
            let mut sum_grad_norm = 0.0f32;
            for row in 0..batch {
                let idx = row * features + feature;
                let normed = (input.data()[idx] - stats.mean[feature]) * stats.inv_std[feature];
                let g = grad_output.data()[idx];
                let g_gamma = g * gamma[feature];
                sum_grad += g_gamma;
                sum_grad_norm += g_gamma * normed;
                grad_gamma[feature] += g * normed;
                grad_beta[feature] += g;
            }
            for row in 0..batch {
                let idx = row * features + feature;
                let g_gamma = grad_output.data()[idx] * gamma[feature];
                grad_input[idx] = if stats.from_batch {
                    let normed =
                        (input.data()[idx] - stats.mean[feature]) * stats.inv_std[feature];
                    (n * g_gamma - sum_grad - normed * sum_grad_norm) / n * stats.inv_std[feature]
                } else {
                    g_gamma * stats.inv_std[feature]
                };
            }
        }

        let grad_gamma = Tensor::from_vec(1, features, grad_gamma)?;
        let grad_beta = Tensor::from_vec(1, features, grad_beta)?;
        self.gamma.accumulate_euclidean(&grad_gamma)?;
        self.beta.accumulate_euclidean(&grad_beta)?;
        Tensor::from_vec(batch, features, grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn visit_normalization(
        &self,
        visitor: &mut dyn FnMut(&dyn Normalization) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(self)
    }

    fn visit_normalization_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut dyn Normalization) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(self)
    }
}

impl Normalization for BatchNorm1d {
    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> usize {
        self.features
    }

    fn gamma(&self) -> &Parameter {
        &self.gamma
    }

    fn beta(&self) -> &Parameter {
        &self.beta
    }

    fn gamma_mut(&mut self) -> &mut Parameter {
        &mut self.gamma
    }

    fn beta_mut(&mut self) -> &mut Parameter {
        &mut self.beta
    }

    fn track_running_stats(&self) -> bool {
        self.track_running_stats
    }

    fn set_track_running_stats(&mut self, track: bool) {
        self.track_running_stats = track;
    }

    fn running_stats(&self) -> Option<RunningStats> {
        self.running.borrow().clone()
    }

    fn set_running_stats(&mut self, stats: Option<RunningStats>) -> PureResult<()> {
        if let Some(stats) = stats.as_ref() {
            for tensor in [&stats.mean, &stats.var] {
                if tensor.shape() != (1, self.features) {
                    return Err(TensorError::ShapeMismatch {
                        left: tensor.shape(),
                        right: (1, self.features),
                    });
                }
            }
        }
        *self.running.borrow_mut() = stats;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_input() -> Tensor {
        Tensor::from_vec(4, 2, vec![1.0, 10.0, 2.0, 12.0, 3.0, 14.0, 4.0, 16.0]).unwrap()
    }

    #[test]
    fn batch_norm_forward_normalises_features() {
        let bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        let output = bn.forward(&demo_input()).unwrap();
        for feature in 0..2 {
            let column: Vec<f32> = output.data().iter().skip(feature).step_by(2).copied().collect();
            let mean: f32 = column.iter().sum::<f32>() / 4.0;
            let var: f32 = column.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn training_forward_updates_running_stats_only_when_tracking() {
        let mut bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        bn.forward(&demo_input()).unwrap();
        let stats = bn.running_stats().unwrap();
        assert!((stats.mean.data()[0] - 0.25).abs() < 1e-6);
        assert!((stats.mean.data()[1] - 1.3).abs() < 1e-6);

        bn.set_track_running_stats(false);
        bn.forward(&demo_input()).unwrap();
        assert_eq!(bn.running_stats().unwrap(), stats);
    }

    #[test]
    fn replay_forward_leaves_running_stats_alone() {
        let bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        let before = bn.running_stats().unwrap();
        let replayed = bn.replay_forward(&demo_input()).unwrap();
        assert_eq!(bn.running_stats().unwrap(), before);
        assert_eq!(replayed, bn.forward(&demo_input()).unwrap());
        assert_ne!(bn.running_stats().unwrap(), before);
    }

    #[test]
    fn eval_mode_uses_running_stats_until_discarded() {
        let mut bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        bn.eval();
        assert!(!bn.uses_batch_statistics());
        let input = demo_input();
        let output = bn.forward(&input).unwrap();
        // Running mean 0 / var 1 leaves the input almost untouched.
        assert!((output.data()[1] - 10.0 / (1.0f32 + 1e-5).sqrt()).abs() < 1e-4);

        bn.set_running_stats(None).unwrap();
        assert!(bn.uses_batch_statistics());
        let output = bn.forward(&input).unwrap();
        assert!(output.data()[1] < 0.0);
    }

    #[test]
    fn batch_norm_backward_matches_numeric_gradients() {
        let mut bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        bn.set_track_running_stats(false);
        bn.gamma_mut()
            .load_value(&Tensor::from_vec(1, 2, vec![1.5, 0.7]).unwrap())
            .unwrap();
        let input = Tensor::from_vec(4, 2, vec![0.3, -1.0, 1.2, 0.4, -0.7, 2.0, 0.1, 0.9]).unwrap();
        let weights = Tensor::from_vec(4, 2, vec![0.2, -0.4, 0.9, 0.1, -0.3, 0.5, 0.6, -0.8])
            .unwrap();
        // Loss = sum(weights * output) so dL/doutput = weights.
        let loss = |bn: &BatchNorm1d, x: &Tensor| -> f32 {
            let out = bn.forward(x).unwrap();
            out.hadamard(&weights).unwrap().data().iter().sum()
        };
        let grad_input = bn.backward(&input, &weights).unwrap();
        let eps = 1e-3f32;
        for idx in 0..input.len() {
            let mut plus = input.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= eps;
            let numeric = (loss(&bn, &plus) - loss(&bn, &minus)) / (2.0 * eps);
            assert!(
                (numeric - grad_input.data()[idx]).abs() < 5e-3,
                "idx {idx}: numeric {numeric} vs analytic {}",
                grad_input.data()[idx]
            );
        }
        let grad_beta = bn.beta().gradient().unwrap();
        assert!((grad_beta.data()[0] - 1.4).abs() < 1e-6);
        assert!((grad_beta.data()[1] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn batch_norm_backward_respects_gamma_scaling() {
        let mut bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        let input = demo_input();
        let grad_output = Tensor::from_vec(4, 2, vec![1.0, 0.0, 0.0, 1.0, -1.0, 0.0, 0.0, -1.0])
            .unwrap();
        let base = bn.backward(&input, &grad_output).unwrap();
        bn.gamma_mut()
            .load_value(&Tensor::full(1, 2, 2.0).unwrap())
            .unwrap();
        let scaled = bn.backward(&input, &grad_output).unwrap();
        for (a, b) in base.data().iter().zip(scaled.data()) {
            assert!((2.0 * a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn running_stats_shape_is_validated() {
        let mut bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        let bad = RunningStats {
            mean: Tensor::zeros(1, 3).unwrap(),
            var: Tensor::zeros(1, 2).unwrap(),
        };
        assert!(bn.set_running_stats(Some(bad)).is_err());
        assert!(BatchNorm1d::new("bn", 0, 0.1, 1e-5).is_err());
        assert!(BatchNorm1d::new("bn", 2, 1.5, 1e-5).is_err());
    }

    #[test]
    fn state_dict_tracks_running_buffers() {
        let mut bn = BatchNorm1d::with_defaults("bn", 2).unwrap();
        let state = bn.state_dict().unwrap();
        assert_eq!(state.len(), 4);
        assert!(state.contains_key("bn::running_mean"));

        bn.set_running_stats(None).unwrap();
        let stripped = bn.state_dict().unwrap();
        assert_eq!(stripped.len(), 2);

        bn.load_state_dict(&state).unwrap();
        assert!(bn.running_stats().is_some());
        bn.load_state_dict(&stripped).unwrap();
        assert!(bn.running_stats().is_none());
    }
}
