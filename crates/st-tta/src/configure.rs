// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Model preparation: configuration, compatibility checks and parameter
//! collection.

use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use st_nn::{Module, ParameterGroup, ParameterHandle, PureResult};

/// Which parameters [`collect_params`] hands to the optimiser.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterScope {
    /// Scale and shift of every normalization layer.
    #[default]
    NormalizationAffine,
    /// Every parameter of the model. Frozen ones are bound but never move.
    All,
}

/// Prepares a model for adaptation.
///
/// Switches to training mode, freezes every parameter, unfreezes the affine
/// parameters of each normalization layer and makes those layers normalise
/// with batch statistics by discarding their running buffers.
pub fn configure_model(model: &mut dyn Module) -> PureResult<()> {
    model.train();
    model.set_requires_grad(false)?;
    let mut layers = 0usize;
    model.visit_normalization_mut(&mut |norm| {
        norm.visit_affine_mut(&mut |param| {
            param.set_requires_grad(true);
            Ok(())
        })?;
        norm.set_track_running_stats(false);
        norm.set_running_stats(None)?;
        layers += 1;
        Ok(())
    })?;
    tracing::debug!(normalization_layers = layers, "configured model for adaptation");
    Ok(())
}

/// Verifies the preconditions adaptation relies on.
pub fn check_model(model: &dyn Module) -> Result<()> {
    if !model.is_training() {
        return Err(AdaptError::NotTraining);
    }
    let mut total = 0usize;
    let mut trainable = 0usize;
    model.visit_parameters(&mut |param| {
        total += 1;
        if param.requires_grad() {
            trainable += 1;
        }
        Ok(())
    })?;
    if trainable == 0 {
        return Err(AdaptError::NoTrainableParameters);
    }
    if trainable == total {
        return Err(AdaptError::AllParametersTrainable);
    }
    if model.normalization_count()? == 0 {
        return Err(AdaptError::NoNormalization);
    }
    Ok(())
}

/// Gathers the parameters selected by `scope`, in visit order.
pub fn collect_params(model: &dyn Module, scope: ParameterScope) -> PureResult<ParameterGroup> {
    let mut handles = Vec::new();
    match scope {
        ParameterScope::NormalizationAffine => {
            model.visit_normalization(&mut |norm| {
                handles.push(ParameterHandle::of(norm.gamma()));
                handles.push(ParameterHandle::of(norm.beta()));
                Ok(())
            })?;
        }
        ParameterScope::All => {
            model.visit_parameters(&mut |param| {
                handles.push(ParameterHandle::of(param));
                Ok(())
            })?;
        }
    }
    Ok(ParameterGroup::new(handles))
}
