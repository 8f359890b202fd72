// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Test-time adaptation of normalization layers.
//!
//! A pretrained [`Module`](st_nn::Module) is configured so only the affine
//! parameters of its normalization layers are trainable and the layers
//! normalise with current-batch statistics. The [`Adapter`] then minimises an
//! unsupervised objective (batch nuclear norm maximisation by default) on every
//! incoming batch before returning predictions, optionally restoring the
//! initial state before each batch (episodic mode).

pub mod adapt;
pub mod bench;
pub mod config;
pub mod configure;
pub mod objective;
pub mod runner;
pub mod snapshot;

pub use adapt::{forward_and_adapt, forward_only, AdaptationMode, AdaptationStep, Adapter};
pub use config::{build_optimizer, setup_adapter, AdaptConfig, AdaptOptimizer, OptimizerKind};
pub use configure::{check_model, collect_params, configure_model, ParameterScope};
pub use objective::{BatchNuclearNorm, Objective, SoftmaxEntropy, UnsupervisedObjective};
pub use snapshot::AdaptationSnapshot;

use st_tensor::TensorError;
use thiserror::Error;

/// Errors surfaced while preparing or running test-time adaptation.
#[derive(Debug, Error, PartialEq)]
pub enum AdaptError {
    /// The model must be in training mode before adaptation is set up.
    #[error("adaptation needs train mode: call model.train()")]
    NotTraining,
    /// Nothing would be updated.
    #[error("adaptation needs some trainable parameters: check which require grad")]
    NoTrainableParameters,
    /// Every parameter is trainable, so the pretrained weights are not protected.
    #[error("adaptation should not update all parameters: check which require grad")]
    AllParametersTrainable,
    /// Adaptation targets normalization layers and the model has none.
    #[error("adaptation needs normalization layers for its optimization")]
    NoNormalization,
    /// A restore was requested without a stored snapshot.
    #[error("cannot reset without a saved model/optimizer state")]
    MissingSnapshot,
    /// The number of adaptation steps per batch must be positive.
    #[error("adaptation requires >= 1 step(s) to forward and update, got {0}")]
    InvalidSteps(usize),
    /// Numeric or shape failure from the tensor and module layers.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, AdaptError>;
