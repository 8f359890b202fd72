// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};

/// Fully-connected layer computing `input @ weight + bias`.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
    training: bool,
}

impl Linear {
    /// Creates a new linear layer with deterministic small parameters.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let bound = 1.0 / (input_dim as f32).sqrt();
        let weight = Tensor::from_fn(input_dim, output_dim, |r, c| {
            let phase = (r * output_dim + c) as f32 * 0.618_034 + 0.5;
            phase.sin() * bound
        })?;
        let bias = Tensor::zeros(1, output_dim)?;
        Self::from_parts(name, weight, bias)
    }

    /// Builds a layer from explicit weights (`input_dim x output_dim`) and a
    /// `1 x output_dim` bias.
    pub fn from_parts(name: impl Into<String>, weight: Tensor, bias: Tensor) -> PureResult<Self> {
        let (_, output_dim) = weight.shape();
        if bias.shape() != (1, output_dim) {
            return Err(TensorError::ShapeMismatch {
                left: bias.shape(),
                right: (1, output_dim),
            });
        }
        let name = name.into();
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            training: true,
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    /// Input feature count.
    pub fn input_dim(&self) -> usize {
        self.weight.value().shape().0
    }

    /// Output feature count.
    pub fn output_dim(&self) -> usize {
        self.weight.value().shape().1
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.input_dim() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 || grad_output.shape().1 != self.output_dim()
        {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        if self.weight.requires_grad() {
            let grad_w = input.transpose().matmul(grad_output)?;
            self.weight.accumulate_euclidean(&grad_w)?;
        }
        if self.bias.requires_grad() {
            let summed = grad_output.sum_axis0();
            let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
            self.bias.accumulate_euclidean(&grad_b)?;
        }
        grad_output.matmul(&self.weight.value().transpose())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
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
    fn linear_forward_matches_manual() {
        let layer = Linear::new("fc", 3, 2).unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let mut expected = input.matmul(layer.weight.value()).unwrap();
        expected.add_row_inplace(layer.bias.value().data()).unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn linear_backward_matches_finite_differences() {
        let weight = Tensor::from_vec(2, 2, vec![0.5, -0.3, 0.2, 0.8]).unwrap();
        let bias = Tensor::from_vec(1, 2, vec![0.1, -0.1]).unwrap();
        let mut layer = Linear::from_parts("fc", weight, bias).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, -1.0, 0.5]).unwrap();
        // Loss = sum(output), so dL/doutput is all ones.
        let grad_out = Tensor::full(2, 2, 1.0).unwrap();
        let grad_in = layer.backward(&input, &grad_out).unwrap();

        let grad_w = layer.weight().gradient().unwrap().clone();
        assert_eq!(grad_w.data(), &[0.0, 0.0, 2.5, 2.5]);
        assert_eq!(layer.bias().gradient().unwrap().data(), &[2.0, 2.0]);
        assert!((grad_in.data()[0] - 0.2).abs() < 1e-6);
        assert!((grad_in.data()[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn frozen_linear_still_propagates_input_gradient() {
        let mut layer = Linear::new("fc", 3, 2).unwrap();
        layer.set_requires_grad(false).unwrap();
        let input = Tensor::from_vec(1, 3, vec![0.1, 0.2, 0.3]).unwrap();
        let grad_out = Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap();
        let grad_in = layer.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in.shape(), (1, 3));
        assert!(layer.weight().gradient().is_none());
        assert!(layer.bias().gradient().is_none());
    }

    #[test]
    fn from_parts_validates_bias_shape() {
        let weight = Tensor::zeros(3, 2).unwrap();
        let bias = Tensor::zeros(1, 3).unwrap();
        assert!(Linear::from_parts("fc", weight, bias).is_err());
    }
}
