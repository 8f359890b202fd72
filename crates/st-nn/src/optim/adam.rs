// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{for_each_update, validate_learning_rate, validate_slots, Optimizer};
use super::{OptimizerState, ParameterGroup};
use crate::module::Module;
use crate::{PureResult, Tensor, TensorError};
use std::collections::BTreeMap;

/// Hyper-parameters for [`Adam`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamConfig {
    pub fn with_learning_rate(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    fn validate(&self) -> PureResult<()> {
        validate_learning_rate(self.learning_rate)?;
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(TensorError::InvalidValue {
                label: "adam betas must lie in [0, 1)",
            });
        }
        if self.epsilon <= 0.0 || !self.epsilon.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "adam epsilon must be positive",
            });
        }
        if self.weight_decay < 0.0 || !self.weight_decay.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "adam weight decay must be non-negative",
            });
        }
        Ok(())
    }
}

/// Adam with bias-corrected moments and optional L2 weight decay.
///
/// Moment slots are created lazily the first time a parameter receives a
/// gradient, so parameters that never see one keep no state.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    group: ParameterGroup,
    steps: u64,
    /// `[first_moment, second_moment]` per parameter name.
    moments: BTreeMap<String, [Tensor; 2]>,
}

impl Adam {
    pub fn new(group: ParameterGroup, config: AdamConfig) -> PureResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            group,
            steps: 0,
            moments: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Number of completed steps.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Optimizer for Adam {
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
        let t = self.steps + 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(t.min(i32::MAX as u64) as i32);
        let bias2 = 1.0 - beta2.powi(t.min(i32::MAX as u64) as i32);
        let moments = &mut self.moments;
        for_each_update(&self.group, module, |param, grad| {
            let mut grad = grad.clone();
            if weight_decay > 0.0 {
                grad.add_scaled(param.value(), weight_decay)?;
            }
            let (rows, cols) = grad.shape();
            if !moments.contains_key(param.name()) {
                moments.insert(
                    param.name().to_string(),
                    [Tensor::zeros(rows, cols)?, Tensor::zeros(rows, cols)?],
                );
            }
            let Some([m, v]) = moments.get_mut(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            let value = param.value_mut();
            for (((w, g), m), v) in value
                .data_mut()
                .iter_mut()
                .zip(grad.data())
                .zip(m.data_mut().iter_mut())
                .zip(v.data_mut().iter_mut())
            {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *w -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            }
            Ok(())
        })?;
        self.steps = t;
        Ok(())
    }

    fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            steps: self.steps,
            learning_rate: self.config.learning_rate,
            slots: self
                .moments
                .iter()
                .map(|(name, [m, v])| (name.clone(), vec![m.clone(), v.clone()]))
                .collect(),
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> PureResult<()> {
        validate_learning_rate(state.learning_rate)?;
        validate_slots(&self.group, &state.slots, 2)?;
        let mut moments = BTreeMap::new();
        for (name, tensors) in &state.slots {
            if let [m, v] = tensors.as_slice() {
                moments.insert(name.clone(), [m.clone(), v.clone()]);
            }
        }
        self.moments = moments;
        self.steps = state.steps;
        self.config.learning_rate = state.learning_rate;
        Ok(())
    }
}
