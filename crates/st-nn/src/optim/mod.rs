// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Gradient optimisers bound to a named subset of a module's parameters.
//!
//! Optimisers never own parameters. They hold a [`ParameterGroup`] naming the
//! parameters they may update and visit the module on every step, so the same
//! module can be frozen, unfrozen and restored independently of the
//! optimiser. Per-parameter slots (moments, velocities) are exported through
//! [`OptimizerState`] so callers can snapshot and restore them.

mod adam;
mod sgd;

pub use adam::{Adam, AdamConfig};
pub use sgd::{Sgd, SgdConfig};

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::collections::{BTreeMap, HashSet};

/// Identifies one parameter of a module by its canonical name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterHandle {
    pub name: String,
    pub shape: (usize, usize),
}

impl ParameterHandle {
    pub fn of(param: &Parameter) -> Self {
        Self {
            name: param.name().to_string(),
            shape: param.value().shape(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.0 * self.shape.1
    }
}

/// Ordered set of parameter handles an optimiser is allowed to update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterGroup {
    handles: Vec<ParameterHandle>,
}

impl ParameterGroup {
    pub fn new(handles: Vec<ParameterHandle>) -> Self {
        Self { handles }
    }

    pub fn handles(&self) -> &[ParameterHandle] {
        &self.handles
    }

    /// Canonical names in visit order, parallel to [`ParameterGroup::handles`].
    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Total scalar count across the group.
    pub fn numel(&self) -> usize {
        self.handles.iter().map(ParameterHandle::numel).sum()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.iter().any(|h| h.name == name)
    }

    fn name_set(&self) -> HashSet<&str> {
        self.handles.iter().map(|h| h.name.as_str()).collect()
    }
}

/// Serializable optimiser state: step counter, learning rate and the
/// per-parameter slot tensors keyed by parameter name.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerState {
    pub steps: u64,
    pub learning_rate: f32,
    pub slots: BTreeMap<String, Vec<Tensor>>,
}

/// Common surface for optimisers that update a module in place.
pub trait Optimizer {
    /// Parameters this optimiser may update.
    fn group(&self) -> &ParameterGroup;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32) -> PureResult<()>;

    /// Applies one update to every bound, trainable parameter that carries a
    /// gradient. Unbound or frozen parameters are left untouched.
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()>;

    /// Clears the gradients of every bound parameter.
    fn zero_grad(&mut self, module: &mut dyn Module) -> PureResult<()> {
        let names = self.group().name_set();
        module.visit_parameters_mut(&mut |param| {
            if names.contains(param.name()) {
                param.zero_gradient();
            }
            Ok(())
        })
    }

    /// Deep copy of the optimiser state.
    fn state_dict(&self) -> OptimizerState;

    /// Restores a state produced by [`Optimizer::state_dict`].
    fn load_state_dict(&mut self, state: &OptimizerState) -> PureResult<()>;
}

pub(crate) fn validate_learning_rate(learning_rate: f32) -> PureResult<()> {
    if learning_rate <= 0.0 || !learning_rate.is_finite() {
        return Err(TensorError::NonPositiveLearningRate {
            rate: learning_rate,
        });
    }
    Ok(())
}

/// Checks that every slot entry belongs to the group and has the expected
/// arity and shapes.
pub(crate) fn validate_slots(
    group: &ParameterGroup,
    slots: &BTreeMap<String, Vec<Tensor>>,
    arity: usize,
) -> PureResult<()> {
    for (name, tensors) in slots {
        let Some(handle) = group.handles.iter().find(|h| &h.name == name) else {
            return Err(TensorError::UnexpectedParameter { name: name.clone() });
        };
        if tensors.len() != arity {
            return Err(TensorError::DataLength {
                expected: arity,
                got: tensors.len(),
            });
        }
        for tensor in tensors {
            if tensor.shape() != handle.shape {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: handle.shape,
                });
            }
        }
    }
    Ok(())
}

/// Visits the bound, trainable parameters that currently hold a gradient.
pub(crate) fn for_each_update(
    group: &ParameterGroup,
    module: &mut dyn Module,
    mut update: impl FnMut(&mut Parameter, &Tensor) -> PureResult<()>,
) -> PureResult<()> {
    let names = group.name_set();
    module.visit_parameters_mut(&mut |param| {
        if !param.requires_grad() || !names.contains(param.name()) {
            return Ok(());
        }
        let Some(grad) = param.gradient().cloned() else {
            return Ok(());
        };
        grad.ensure_finite("optimizer_gradient")?;
        update(param, &grad)?;
        param.value().ensure_finite("optimizer_update")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_reports_names_and_sizes() {
        let group = ParameterGroup::new(vec![
            ParameterHandle {
                name: "bn::gamma".into(),
                shape: (1, 4),
            },
            ParameterHandle {
                name: "bn::beta".into(),
                shape: (1, 4),
            },
        ]);
        assert_eq!(group.names(), vec!["bn::gamma", "bn::beta"]);
        assert_eq!(group.numel(), 8);
        assert!(group.contains("bn::beta"));
        assert!(!group.contains("fc::weight"));
    }

    #[test]
    fn slot_validation_rejects_foreign_entries() {
        let group = ParameterGroup::new(vec![ParameterHandle {
            name: "bn::gamma".into(),
            shape: (1, 2),
        }]);
        let mut slots = BTreeMap::new();
        slots.insert("bn::gamma".to_string(), vec![Tensor::zeros(1, 2).unwrap()]);
        assert!(validate_slots(&group, &slots, 1).is_ok());
        assert!(validate_slots(&group, &slots, 2).is_err());
        slots.insert("fc::weight".to_string(), vec![Tensor::zeros(1, 2).unwrap()]);
        assert!(validate_slots(&group, &slots, 1).is_err());
        assert!(validate_learning_rate(0.0).is_err());
        assert!(validate_learning_rate(1e-3).is_ok());
    }
}
