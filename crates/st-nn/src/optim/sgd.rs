// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{for_each_update, validate_learning_rate, validate_slots, Optimizer};
use super::{OptimizerState, ParameterGroup};
use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use std::collections::BTreeMap;

/// Hyper-parameters for [`Sgd`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub dampening: f32,
    pub weight_decay: f32,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

impl SgdConfig {
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    fn validate(&self) -> PureResult<()> {
        validate_learning_rate(self.learning_rate)?;
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(TensorError::InvalidValue {
                label: "sgd momentum must lie in [0, 1)",
            });
        }
        if self.nesterov && (self.momentum == 0.0 || self.dampening != 0.0) {
            return Err(TensorError::InvalidValue {
                label: "nesterov requires momentum and zero dampening",
            });
        }
        if self.weight_decay < 0.0 {
            return Err(TensorError::InvalidValue {
                label: "sgd weight decay must be non-negative",
            });
        }
        Ok(())
    }
}

/// Stochastic gradient descent with optional heavy-ball or Nesterov momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    group: ParameterGroup,
    steps: u64,
    velocity: BTreeMap<String, Tensor>,
}

impl Sgd {
    pub fn new(group: ParameterGroup, config: SgdConfig) -> PureResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            group,
            steps: 0,
            velocity: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl Optimizer for Sgd {
    fn group(&self) -> &ParameterGroup {
        &self.group
    }

    fn learning_rate(&self) -> f32 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()> {
        validate_learning_rate(learning_rate)?;
        self.config.learning_rate = learning_rate;
        Ok(())
    }

    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        let SgdConfig {
            learning_rate,
            momentum,
            dampening,
            weight_decay,
            nesterov,
        } = self.config;
        let velocity = &mut self.velocity;
        for_each_update(&self.group, module, |param, grad| {
            let mut direction = grad.clone();
            if weight_decay > 0.0 {
                direction.add_scaled(param.value(), weight_decay)?;
            }
            if momentum > 0.0 {
                let buffer = match velocity.remove(param.name()) {
                    Some(mut buffer) => {
                        for (b, g) in buffer.data_mut().iter_mut().zip(direction.data()) {
                            *b = momentum * *b + (1.0 - dampening) * g;
                        }
                        buffer
                    }
                    None => direction.clone(),
                };
                if nesterov {
                    direction.add_scaled(&buffer, momentum)?;
                } else {
                    direction = buffer.clone();
                }
                velocity.insert(param.name().to_string(), buffer);
            }
            param.value_mut().add_scaled(&direction, -learning_rate)
        })?;
        self.steps += 1;
        Ok(())
    }

    fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            steps: self.steps,
            learning_rate: self.config.learning_rate,
            slots: self
                .velocity
                .iter()
                .map(|(name, buffer)| (name.clone(), vec![buffer.clone()]))
                .collect(),
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> PureResult<()> {
        validate_learning_rate(state.learning_rate)?;
        validate_slots(&self.group, &state.slots, 1)?;
        self.velocity = state
            .slots
            .iter()
            .filter_map(|(name, tensors)| tensors.first().map(|t| (name.clone(), t.clone())))
            .collect();
        self.steps = state.steps;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::optim::ParameterHandle;

    #[test]
    fn plain_sgd_applies_scaled_gradient() {
        let weight = Tensor::from_vec(1, 2, vec![0.5, -0.5]).unwrap();
        let bias = Tensor::zeros(1, 2).unwrap();
        let mut layer = Linear::from_parts("fc", weight, bias).unwrap();
        let group = ParameterGroup::new(vec![ParameterHandle::of(layer.bias())]);
        let mut sgd = Sgd::new(group, SgdConfig::with_learning_rate(0.5)).unwrap();
        let input = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let grad_out = Tensor::from_vec(1, 2, vec![1.0, -2.0]).unwrap();
        layer.backward(&input, &grad_out).unwrap();
        sgd.step(&mut layer).unwrap();
        assert_eq!(layer.bias().value().data(), &[-0.5, 1.0]);
        assert_eq!(layer.weight().value().data(), &[0.5, -0.5]);
        assert!(sgd.state_dict().slots.is_empty());
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut layer = Linear::from_parts(
            "fc",
            Tensor::zeros(1, 1).unwrap(),
            Tensor::zeros(1, 1).unwrap(),
        )
        .unwrap();
        let group = ParameterGroup::new(vec![ParameterHandle::of(layer.bias())]);
        let config = SgdConfig {
            learning_rate: 1.0,
            momentum: 0.5,
            ..SgdConfig::default()
        };
        let mut sgd = Sgd::new(group, config).unwrap();
        let input = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let grad_out = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        for _ in 0..2 {
            sgd.zero_grad(&mut layer).unwrap();
            layer.backward(&input, &grad_out).unwrap();
            sgd.step(&mut layer).unwrap();
        }
        // Velocity 1.0 then 1.5, so the bias moves by -2.5 in total.
        assert!((layer.bias().value().data()[0] + 2.5).abs() < 1e-6);
        assert_eq!(sgd.state_dict().slots["fc::bias"][0].data(), &[1.5]);
    }

    #[test]
    fn nesterov_requires_momentum() {
        let config = SgdConfig {
            nesterov: true,
            ..SgdConfig::default()
        };
        assert!(Sgd::new(ParameterGroup::default(), config).is_err());
    }
}
