// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Neural module API built on top of SpiralTorch's pure tensors.
//!
//! This crate offers a lightweight `nn.Module` style surface: explicit
//! train/eval modes, freezable parameters, batch normalization with optional
//! running statistics, name-bound optimisers whose state can be exported, and
//! checkpoint persistence.

pub mod io;
pub mod layers;
pub mod module;
pub mod optim;

pub use io::{load_checkpoint, load_module, save_checkpoint, save_module, Checkpoint};
pub use layers::linear::Linear;
pub use layers::normalization::BatchNorm1d;
pub use layers::sequential::Sequential;
pub use layers::Relu;
pub use module::{Module, Normalization, Parameter, RunningStats};
pub use optim::{
    Adam, AdamConfig, Optimizer, OptimizerState, ParameterGroup, ParameterHandle, Sgd, SgdConfig,
};

pub use st_tensor::{PureResult, Tensor, TensorError};
