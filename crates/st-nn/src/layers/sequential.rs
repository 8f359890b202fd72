// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Normalization, Parameter};
use crate::{PureResult, Tensor};

/// Sequential container that mirrors `nn.Sequential`.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
    training: bool,
}

impl Default for Sequential {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Sequential(num_layers={},training={})",
            self.layers.len(),
            self.training
        )
    }
}

impl Sequential {
    /// Creates an empty container in training mode.
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            training: true,
        }
    }

    /// Appends a new layer to the sequence. The layer adopts the container's
    /// current mode.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.push_boxed(Box::new(layer));
    }

    /// Appends a pre-boxed module to the sequence.
    pub fn push_boxed(&mut self, mut layer: Box<dyn Module>) {
        layer.set_training(self.training);
        self.layers.push(layer);
    }

    /// Returns the number of layers registered in the container.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` when the container does not hold any layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = input.clone();
        for layer in &self.layers {
            activ = layer.forward(&activ)?;
        }
        Ok(activ)
    }

    fn replay_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = input.clone();
        for layer in &self.layers {
            activ = layer.replay_forward(&activ)?;
        }
        Ok(activ)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if self.layers.is_empty() {
            return Ok(grad_output.clone());
        }
        // Replay the chain to recover every layer input.
        let mut activations = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for layer in &self.layers {
            let next = layer.replay_forward(&current)?;
            activations.push(current);
            current = next;
        }
        let mut grad = grad_output.clone();
        for (layer, layer_input) in self.layers.iter_mut().zip(activations.iter()).rev() {
            grad = layer.backward(layer_input, &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn visit_normalization(
        &self,
        visitor: &mut dyn FnMut(&dyn Normalization) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_normalization(visitor)?;
        }
        Ok(())
    }

    fn visit_normalization_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut dyn Normalization) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_normalization_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::layers::normalization::BatchNorm1d;
    use crate::layers::Relu;

    fn stack() -> Sequential {
        let mut seq = Sequential::new();
        seq.push(Linear::new("l1", 2, 3).unwrap());
        seq.push(BatchNorm1d::with_defaults("bn1", 3).unwrap());
        seq.push(Relu::new());
        seq.push(Linear::new("l2", 3, 2).unwrap());
        seq
    }

    #[test]
    fn sequential_forward_and_backward() {
        let mut seq = stack();
        let input = Tensor::from_vec(2, 2, vec![0.5, -0.1, -0.3, 0.8]).unwrap();
        let output = seq.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 2));
        let grad_out = Tensor::from_vec(2, 2, vec![1.0, -1.0, 0.5, 0.2]).unwrap();
        let grad_in = seq.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in.shape(), (2, 2));
        let mut with_grad = 0;
        seq.visit_parameters(&mut |param| {
            if param.gradient().is_some() {
                with_grad += 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(with_grad, 6);
    }

    fn running_stats(seq: &Sequential) -> Vec<Option<crate::RunningStats>> {
        let mut stats = Vec::new();
        seq.visit_normalization(&mut |norm| {
            stats.push(norm.running_stats());
            Ok(())
        })
        .unwrap();
        stats
    }

    #[test]
    fn backward_does_not_advance_running_stats() {
        let mut seq = Sequential::new();
        seq.push(BatchNorm1d::with_defaults("bn", 2).unwrap());
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad_out = Tensor::from_vec(2, 2, vec![0.5, -0.5, 1.0, 0.25]).unwrap();

        let before = running_stats(&seq);
        seq.backward(&input, &grad_out).unwrap();
        assert_eq!(running_stats(&seq), before);

        seq.forward(&input).unwrap();
        assert_ne!(running_stats(&seq), before);
    }

    #[test]
    fn mode_and_normalization_visits_reach_children() {
        let mut seq = stack();
        assert_eq!(seq.normalization_count().unwrap(), 1);
        seq.eval();
        assert!(!seq.is_training());
        let mut modes = Vec::new();
        for layer in &seq.layers {
            modes.push(layer.is_training());
        }
        assert!(modes.iter().all(|training| !training));

        let mut late = Relu::new();
        late.set_training(true);
        seq.push(late);
        assert!(!seq.layers.last().unwrap().is_training());
    }

    #[test]
    fn state_dict_round_trip_restores_parameters() {
        let mut seq = stack();
        let state = seq.state_dict().unwrap();
        assert_eq!(state.len(), 8);
        seq.visit_parameters_mut(&mut |param| {
            param.value_mut().fill_zero();
            Ok(())
        })
        .unwrap();
        seq.load_state_dict(&state).unwrap();
        assert_eq!(seq.state_dict().unwrap(), state);

        let mut extra = state.clone();
        extra.insert("ghost::weight".to_string(), Tensor::zeros(1, 1).unwrap());
        assert!(matches!(
            seq.load_state_dict(&extra),
            Err(crate::TensorError::UnexpectedParameter { .. })
        ));

        let mut missing = state;
        missing.remove("l2::bias");
        assert!(matches!(
            seq.load_state_dict(&missing),
            Err(crate::TensorError::MissingParameter { .. })
        ));
    }
}
