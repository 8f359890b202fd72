// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Serializable adaptation settings and the one-call pipeline built from them.

use crate::adapt::{AdaptationMode, Adapter};
use crate::configure::{check_model, collect_params, configure_model, ParameterScope};
use crate::objective::Objective;
use crate::Result;
use serde::{Deserialize, Serialize};
use st_nn::{
    Adam, AdamConfig, Module, Optimizer, OptimizerState, ParameterGroup, PureResult, Sgd,
    SgdConfig,
};

/// Gradient optimiser used for adaptation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

/// Settings for [`setup_adapter`]. Missing fields take their defaults when
/// deserialised.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub steps: usize,
    pub mode: AdaptationMode,
    pub scope: ParameterScope,
    pub objective: Objective,
    pub optimizer: OptimizerKind,
    /// Continual adapters may skip the snapshot; episodic ones always keep it.
    pub retain_snapshot: bool,
}

impl Default for AdaptConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            momentum: 0.9,
            weight_decay: 0.0,
            steps: 1,
            mode: AdaptationMode::Continual,
            scope: ParameterScope::NormalizationAffine,
            objective: Objective::BatchNuclearNorm,
            optimizer: OptimizerKind::Adam,
            retain_snapshot: true,
        }
    }
}

/// Optimiser chosen at runtime through [`OptimizerKind`].
#[derive(Debug, Clone)]
pub enum AdaptOptimizer {
    Adam(Adam),
    Sgd(Sgd),
}

impl AdaptOptimizer {
    fn inner(&self) -> &dyn Optimizer {
        match self {
            AdaptOptimizer::Adam(opt) => opt,
            AdaptOptimizer::Sgd(opt) => opt,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Optimizer {
        match self {
            AdaptOptimizer::Adam(opt) => opt,
            AdaptOptimizer::Sgd(opt) => opt,
        }
    }
}

impl Optimizer for AdaptOptimizer {
    fn group(&self) -> &ParameterGroup {
        self.inner().group()
    }

    fn learning_rate(&self) -> f32 {
        self.inner().learning_rate()
    }

    fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()> {
        self.inner_mut().set_learning_rate(learning_rate)
    }

    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        self.inner_mut().step(module)
    }

    fn zero_grad(&mut self, module: &mut dyn Module) -> PureResult<()> {
        self.inner_mut().zero_grad(module)
    }

    fn state_dict(&self) -> OptimizerState {
        self.inner().state_dict()
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> PureResult<()> {
        self.inner_mut().load_state_dict(state)
    }
}

/// Builds the configured optimiser over `group`.
pub fn build_optimizer(group: ParameterGroup, config: &AdaptConfig) -> PureResult<AdaptOptimizer> {
    match config.optimizer {
        OptimizerKind::Adam => Adam::new(
            group,
            AdamConfig {
                learning_rate: config.learning_rate,
                beta1: config.beta1,
                beta2: config.beta2,
                weight_decay: config.weight_decay,
                ..AdamConfig::default()
            },
        )
        .map(AdaptOptimizer::Adam),
        OptimizerKind::Sgd => Sgd::new(
            group,
            SgdConfig {
                learning_rate: config.learning_rate,
                momentum: config.momentum,
                weight_decay: config.weight_decay,
                ..SgdConfig::default()
            },
        )
        .map(AdaptOptimizer::Sgd),
    }
}

/// Configures and checks `model`, collects its adaptable parameters, builds
/// the optimiser and wraps everything in an [`Adapter`].
pub fn setup_adapter<M: Module>(
    mut model: M,
    config: &AdaptConfig,
) -> Result<Adapter<M, AdaptOptimizer, Objective>> {
    configure_model(&mut model)?;
    check_model(&model)?;
    let group = collect_params(&model, config.scope)?;
    tracing::debug!(
        scope = ?config.scope,
        names = ?group.names(),
        "collected adaptation parameters"
    );
    let optimizer = build_optimizer(group, config)?;
    if config.mode == AdaptationMode::Continual && !config.retain_snapshot {
        Adapter::continual_without_snapshot(model, optimizer, config.objective, config.steps)
    } else {
        Adapter::new(model, optimizer, config.objective, config.steps, config.mode)
    }
}
