// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable tensor with an Euclidean gradient buffer and a freeze switch.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
    requires_grad: bool,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),requires_grad={},has_grad={})",
            self.name,
            rows,
            cols,
            self.requires_grad,
            self.gradient.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new trainable parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
            requires_grad: true,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Number of scalar entries held by the parameter.
    pub fn numel(&self) -> usize {
        self.value.len()
    }

    /// Returns the accumulated gradient, if any backward pass reached it.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    /// Whether backward passes accumulate gradients into this parameter.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Freezes (`false`) or unfreezes (`true`) the parameter. Freezing drops
    /// any pending gradient.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if !requires_grad {
            self.gradient = None;
        }
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a Euclidean gradient. Frozen parameters ignore the update.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        if !self.requires_grad {
            return Ok(());
        }
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => {
                self.gradient = Some(update.clone());
            }
        }
        Ok(())
    }

    /// Clears the cached gradient in place.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            grad.fill_zero();
        }
    }

    /// Returns the squared L2 norm of the accumulated gradient.
    pub fn gradient_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| {
                grad.data()
                    .iter()
                    .map(|&value| {
                        let v = value as f64;
                        v * v
                    })
                    .sum::<f64>()
            })
            .unwrap_or(0.0)
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Running statistics tracked by a normalization layer.
#[derive(Clone, Debug, PartialEq)]
pub struct RunningStats {
    pub mean: Tensor,
    pub var: Tensor,
}

/// Capability exposed by normalization layers so callers can reach their
/// affine parameters and statistics without downcasting.
pub trait Normalization {
    /// Canonical layer name; parameter and buffer names derive from it.
    fn name(&self) -> &str;

    /// Number of normalised features.
    fn features(&self) -> usize;

    /// Scale parameter.
    fn gamma(&self) -> &Parameter;

    /// Shift parameter.
    fn beta(&self) -> &Parameter;

    fn gamma_mut(&mut self) -> &mut Parameter;

    fn beta_mut(&mut self) -> &mut Parameter;

    /// Whether training-mode forwards update the running statistics.
    fn track_running_stats(&self) -> bool;

    fn set_track_running_stats(&mut self, track: bool);

    /// Copy of the running statistics, `None` once they were discarded.
    fn running_stats(&self) -> Option<RunningStats>;

    /// Replaces (or discards with `None`) the running statistics.
    fn set_running_stats(&mut self, stats: Option<RunningStats>) -> PureResult<()>;

    /// Name under which the running mean appears in a state dict.
    fn running_mean_key(&self) -> String {
        format!("{}::running_mean", self.name())
    }

    /// Name under which the running variance appears in a state dict.
    fn running_var_key(&self) -> String {
        format!("{}::running_var", self.name())
    }

    /// Visits the scale and shift parameters.
    fn visit_affine_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(self.gamma_mut())?;
        visitor(self.beta_mut())
    }
}

/// High-level module trait inspired by PyTorch's `nn.Module` but expressed in
/// pure Rust.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Re-runs the forward computation without touching layer state such as
    /// running statistics. Containers use it to recover layer inputs during
    /// backward.
    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.forward(input)
    }

    /// Propagates a gradient backwards. Implementations populate the
    /// accumulators of trainable parameters before returning the gradient with
    /// respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Switches between training (`true`) and evaluation (`false`) behaviour.
    fn set_training(&mut self, training: bool);

    /// Reports the current mode.
    fn is_training(&self) -> bool;

    /// Visits every normalization layer. Modules without one keep the default.
    fn visit_normalization(
        &self,
        _visitor: &mut dyn FnMut(&dyn Normalization) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    /// Mutable counterpart of [`Module::visit_normalization`].
    fn visit_normalization_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut dyn Normalization) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    /// Switches the module to training mode.
    fn train(&mut self) {
        self.set_training(true);
    }

    /// Switches the module to evaluation mode.
    fn eval(&mut self) {
        self.set_training(false);
    }

    /// Freezes or unfreezes every parameter.
    fn set_requires_grad(&mut self, requires_grad: bool) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.set_requires_grad(requires_grad);
            Ok(())
        })
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Number of normalization layers reachable from this module.
    fn normalization_count(&self) -> PureResult<usize> {
        let mut count = 0usize;
        self.visit_normalization(&mut |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Captures a copy of every parameter tensor and every present running
    /// statistic, keyed by canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        self.visit_normalization(&mut |norm| {
            if let Some(stats) = norm.running_stats() {
                state.insert(norm.running_mean_key(), stats.mean);
                state.insert(norm.running_var_key(), stats.var);
            }
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores a state dictionary produced by [`Module::state_dict`].
    ///
    /// Loading is strict: every parameter must be present, and every entry must
    /// be consumed by a parameter or a running statistic. Normalization layers
    /// whose statistics are absent from `state` end up without running
    /// statistics.
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        let mut consumed = 0usize;
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            consumed += 1;
            param.load_value(value)
        })?;
        self.visit_normalization_mut(&mut |norm| {
            let mean = state.get(&norm.running_mean_key());
            let var = state.get(&norm.running_var_key());
            match (mean, var) {
                (Some(mean), Some(var)) => {
                    consumed += 2;
                    norm.set_running_stats(Some(RunningStats {
                        mean: mean.clone(),
                        var: var.clone(),
                    }))
                }
                (None, None) => norm.set_running_stats(None),
                (Some(_), None) => Err(TensorError::MissingParameter {
                    name: norm.running_var_key(),
                }),
                (None, Some(_)) => Err(TensorError::MissingParameter {
                    name: norm.running_mean_key(),
                }),
            }
        })?;
        if consumed != state.len() {
            let known = self.state_dict()?;
            let mut stray: Vec<&String> =
                state.keys().filter(|key| !known.contains_key(*key)).collect();
            stray.sort();
            return Err(TensorError::UnexpectedParameter {
                name: stray
                    .first()
                    .map(|key| key.to_string())
                    .unwrap_or_else(|| "<duplicate>".to_string()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_parameter_ignores_gradients() {
        let mut param = Parameter::new("gate", Tensor::zeros(1, 3).unwrap());
        let update = Tensor::from_vec(1, 3, vec![0.5, -0.5, 1.0]).unwrap();
        param.set_requires_grad(false);
        param.accumulate_euclidean(&update).unwrap();
        assert!(param.gradient().is_none());

        param.set_requires_grad(true);
        param.accumulate_euclidean(&update).unwrap();
        param.accumulate_euclidean(&update).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[1.0, -1.0, 2.0]);
        assert!((param.gradient_norm_sq() - 6.0).abs() < 1e-9);

        param.zero_gradient();
        assert_eq!(param.gradient().unwrap().squared_l2_norm(), 0.0);
    }

    #[test]
    fn freezing_drops_pending_gradient() {
        let mut param = Parameter::new("gate", Tensor::zeros(1, 2).unwrap());
        param
            .accumulate_euclidean(&Tensor::full(1, 2, 1.0).unwrap())
            .unwrap();
        param.set_requires_grad(false);
        assert!(param.gradient().is_none());
    }

    #[test]
    fn parameter_rejects_mismatched_shapes() {
        let mut param = Parameter::new("gate", Tensor::zeros(1, 2).unwrap());
        let wrong = Tensor::zeros(2, 2).unwrap();
        assert!(param.accumulate_euclidean(&wrong).is_err());
        assert!(param.load_value(&wrong).is_err());
        assert_eq!(param.numel(), 2);
    }
}
