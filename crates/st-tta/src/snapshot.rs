// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{AdaptError, Result};
use st_nn::{Module, Optimizer, OptimizerState, PureResult, Tensor};
use std::collections::HashMap;

/// Deep copy of a model's state dict and its optimiser state.
///
/// Never mutated after capture; restoring copies out of it.
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptationSnapshot {
    model: HashMap<String, Tensor>,
    optimizer: OptimizerState,
}

impl AdaptationSnapshot {
    pub fn model_state(&self) -> &HashMap<String, Tensor> {
        &self.model
    }

    pub fn optimizer_state(&self) -> &OptimizerState {
        &self.optimizer
    }
}

/// Copies the current model and optimiser state.
pub fn capture(model: &dyn Module, optimizer: &dyn Optimizer) -> PureResult<AdaptationSnapshot> {
    Ok(AdaptationSnapshot {
        model: model.state_dict()?,
        optimizer: optimizer.state_dict(),
    })
}

/// Overwrites the live state with `snapshot`. Loading is strict: every
/// parameter must be present and no unknown entry may remain.
pub fn restore(
    model: &mut dyn Module,
    optimizer: &mut dyn Optimizer,
    snapshot: Option<&AdaptationSnapshot>,
) -> Result<()> {
    let snapshot = snapshot.ok_or(AdaptError::MissingSnapshot)?;
    model.load_state_dict(&snapshot.model)?;
    optimizer.load_state_dict(&snapshot.optimizer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configure::{collect_params, configure_model, ParameterScope};
    use st_nn::{Adam, AdamConfig, BatchNorm1d, Linear, Sequential};

    fn setup() -> (Sequential, Adam) {
        let mut seq = Sequential::new();
        seq.push(BatchNorm1d::with_defaults("bn", 2).unwrap());
        seq.push(Linear::new("fc", 2, 3).unwrap());
        configure_model(&mut seq).unwrap();
        let group = collect_params(&seq, ParameterScope::NormalizationAffine).unwrap();
        let adam = Adam::new(group, AdamConfig::with_learning_rate(0.1)).unwrap();
        (seq, adam)
    }

    #[test]
    fn restore_undoes_updates_to_parameters_and_moments() {
        let (mut seq, mut adam) = setup();
        let snapshot = capture(&seq, &adam).unwrap();

        let input = Tensor::from_vec(3, 2, vec![1.0, 0.0, -1.0, 2.0, 0.5, 0.5]).unwrap();
        let grad = Tensor::from_vec(3, 3, vec![0.2, -0.1, 0.4, 0.3, 0.1, -0.2, -0.5, 0.6, 0.1])
            .unwrap();
        seq.backward(&input, &grad).unwrap();
        adam.step(&mut seq).unwrap();
        assert_ne!(seq.state_dict().unwrap(), *snapshot.model_state());
        assert_ne!(adam.state_dict(), *snapshot.optimizer_state());

        restore(&mut seq, &mut adam, Some(&snapshot)).unwrap();
        assert_eq!(seq.state_dict().unwrap(), *snapshot.model_state());
        assert_eq!(adam.state_dict(), *snapshot.optimizer_state());
    }

    #[test]
    fn restore_without_snapshot_fails() {
        let (mut seq, mut adam) = setup();
        assert_eq!(
            restore(&mut seq, &mut adam, None),
            Err(AdaptError::MissingSnapshot)
        );
    }

    #[test]
    fn restore_is_strict_about_model_shape() {
        let (seq, adam) = setup();
        let snapshot = capture(&seq, &adam).unwrap();
        let mut other = Sequential::new();
        other.push(BatchNorm1d::with_defaults("bn", 2).unwrap());
        configure_model(&mut other).unwrap();
        let mut other_adam = Adam::new(
            collect_params(&other, ParameterScope::NormalizationAffine).unwrap(),
            AdamConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            restore(&mut other, &mut other_adam, Some(&snapshot)),
            Err(AdaptError::Tensor(st_nn::TensorError::UnexpectedParameter { .. }))
        ));
    }
}
