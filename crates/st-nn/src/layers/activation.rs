// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// ReLU activation. Parameter-free; it only carries the module mode so
/// containers can report a consistent training flag.
#[derive(Debug, Clone)]
pub struct Relu {
    training: bool,
}

impl Default for Relu {
    fn default() -> Self {
        Self { training: true }
    }
}

impl Relu {
    /// Creates a new ReLU layer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut output = input.clone();
        output.relu_inplace();
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let data = input
            .data()
            .iter()
            .zip(grad_output.data())
            .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 })
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_forward_backward() {
        let mut relu = Relu::new();
        let input = Tensor::from_vec(1, 4, vec![-1.0, -0.5, 0.2, 1.5]).unwrap();
        let output = relu.forward(&input).unwrap();
        assert_eq!(output.data(), &[0.0, 0.0, 0.2, 1.5]);

        let grad_output = Tensor::from_vec(1, 4, vec![0.3, 0.4, 0.5, 0.6]).unwrap();
        let grad_input = relu.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.data(), &[0.0, 0.0, 0.5, 0.6]);
        assert_eq!(relu.normalization_count().unwrap(), 0);
    }
}
