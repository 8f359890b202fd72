// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Unsupervised objectives computed on a batch of logits.
//!
//! Each objective returns the scalar loss together with its gradient with
//! respect to the logits, ready to be fed to [`Module::backward`](st_nn::Module::backward).

use serde::{Deserialize, Serialize};
use st_nn::{PureResult, Tensor, TensorError};

/// Loss over a `batch x classes` logit matrix that needs no labels.
pub trait UnsupervisedObjective {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Scalar loss for the batch.
    fn loss(&self, logits: &Tensor) -> PureResult<f32>;

    /// Loss and its gradient with respect to `logits`.
    fn loss_and_grad(&self, logits: &Tensor) -> PureResult<(f32, Tensor)>;
}

fn guard_logits(logits: &Tensor, label: &'static str) -> PureResult<Tensor> {
    if logits.is_empty() {
        return Err(TensorError::EmptyInput(label));
    }
    logits.ensure_finite(label)?;
    logits.row_softmax()
}

/// Backpropagates `grad_probs` through a row softmax whose output is `probs`.
fn softmax_backward(probs: &Tensor, grad_probs: &Tensor) -> PureResult<Tensor> {
    let (rows, cols) = probs.shape();
    let mut out = Vec::with_capacity(rows * cols);
    for (p, g) in probs
        .data()
        .chunks(cols)
        .zip(grad_probs.data().chunks(cols))
    {
        let dot: f32 = p.iter().zip(g).map(|(p, g)| p * g).sum();
        out.extend(p.iter().zip(g).map(|(p, g)| p * (g - dot)));
    }
    Tensor::from_vec(rows, cols, out)
}

/// Batch nuclear-norm maximisation.
///
/// `loss = -sqrt(mean(σ²))` where σ are the singular values of the row softmax
/// of the logits. Minimising it pushes predictions to be both confident and
/// diverse across the batch.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BatchNuclearNorm;

impl BatchNuclearNorm {
    fn loss_from_probs(probs: &Tensor) -> PureResult<(f32, usize)> {
        let singular = probs.singular_values()?;
        if singular.is_empty() {
            return Err(TensorError::EmptyInput("batch_nuclear_norm"));
        }
        let k = singular.len();
        let mean_sq = singular
            .iter()
            .map(|s| {
                let s = *s as f64;
                s * s
            })
            .sum::<f64>()
            / k as f64;
        let loss = -(mean_sq.sqrt()) as f32;
        if !loss.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batch_nuclear_norm",
                value: loss,
            });
        }
        Ok((loss, k))
    }
}

impl UnsupervisedObjective for BatchNuclearNorm {
    fn name(&self) -> &'static str {
        "batch_nuclear_norm"
    }

    fn loss(&self, logits: &Tensor) -> PureResult<f32> {
        let probs = guard_logits(logits, "batch_nuclear_norm_logits")?;
        Ok(Self::loss_from_probs(&probs)?.0)
    }

    fn loss_and_grad(&self, logits: &Tensor) -> PureResult<(f32, Tensor)> {
        let probs = guard_logits(logits, "batch_nuclear_norm_logits")?;
        let (loss, k) = Self::loss_from_probs(&probs)?;
        // sum(σ²) equals the squared Frobenius norm, so d(-sqrt(|P|²/k))/dP
        // is -P / (k * sqrt(|P|²/k)).
        let root = (probs.squared_l2_norm() / k as f32).sqrt();
        if root <= 0.0 || !root.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batch_nuclear_norm_root",
                value: root,
            });
        }
        let grad_probs = probs.scale(-1.0 / (k as f32 * root))?;
        let grad = softmax_backward(&probs, &grad_probs)?;
        grad.ensure_finite("batch_nuclear_norm_grad")?;
        Ok((loss, grad))
    }
}

/// Mean Shannon entropy of the row softmax.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SoftmaxEntropy;

impl SoftmaxEntropy {
    fn row_entropies(logits: &Tensor) -> PureResult<(Tensor, Tensor, Vec<f32>)> {
        let probs = guard_logits(logits, "softmax_entropy_logits")?;
        let log_probs = logits.row_log_softmax()?;
        let cols = probs.shape().1;
        let entropies = probs
            .data()
            .chunks(cols)
            .zip(log_probs.data().chunks(cols))
            .map(|(p, lp)| -p.iter().zip(lp).map(|(p, lp)| p * lp).sum::<f32>())
            .collect();
        Ok((probs, log_probs, entropies))
    }
}

impl UnsupervisedObjective for SoftmaxEntropy {
    fn name(&self) -> &'static str {
        "softmax_entropy"
    }

    fn loss(&self, logits: &Tensor) -> PureResult<f32> {
        let (_, _, entropies) = Self::row_entropies(logits)?;
        Ok(entropies.iter().sum::<f32>() / entropies.len() as f32)
    }

    fn loss_and_grad(&self, logits: &Tensor) -> PureResult<(f32, Tensor)> {
        let (probs, log_probs, entropies) = Self::row_entropies(logits)?;
        let (rows, cols) = probs.shape();
        let scale = 1.0 / rows as f32;
        let mut grad = Vec::with_capacity(rows * cols);
        for ((p, lp), h) in probs
            .data()
            .chunks(cols)
            .zip(log_probs.data().chunks(cols))
            .zip(&entropies)
        {
            grad.extend(p.iter().zip(lp).map(|(p, lp)| -p * (lp + h) * scale));
        }
        let loss = entropies.iter().sum::<f32>() * scale;
        Ok((loss, Tensor::from_vec(rows, cols, grad)?))
    }
}

/// Objective selected at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    BatchNuclearNorm,
    SoftmaxEntropy,
}

impl UnsupervisedObjective for Objective {
    fn name(&self) -> &'static str {
        match self {
            Objective::BatchNuclearNorm => BatchNuclearNorm.name(),
            Objective::SoftmaxEntropy => SoftmaxEntropy.name(),
        }
    }

    fn loss(&self, logits: &Tensor) -> PureResult<f32> {
        match self {
            Objective::BatchNuclearNorm => BatchNuclearNorm.loss(logits),
            Objective::SoftmaxEntropy => SoftmaxEntropy.loss(logits),
        }
    }

    fn loss_and_grad(&self, logits: &Tensor) -> PureResult<(f32, Tensor)> {
        match self {
            Objective::BatchNuclearNorm => BatchNuclearNorm.loss_and_grad(logits),
            Objective::SoftmaxEntropy => SoftmaxEntropy.loss_and_grad(logits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_difference(objective: &dyn UnsupervisedObjective, logits: &Tensor) -> Vec<f32> {
        let eps = 1e-3f32;
        (0..logits.len())
            .map(|idx| {
                let mut plus = logits.clone();
                plus.data_mut()[idx] += eps;
                let mut minus = logits.clone();
                minus.data_mut()[idx] -= eps;
                (objective.loss(&plus).unwrap() - objective.loss(&minus).unwrap()) / (2.0 * eps)
            })
            .collect()
    }

    fn sample_logits() -> Tensor {
        Tensor::from_vec(
            4,
            3,
            vec![
                0.8, -0.2, 0.1, //
                -0.5, 1.2, 0.3, //
                0.0, 0.4, -1.1, //
                1.5, 0.2, 0.9,
            ],
        )
        .unwrap()
    }

    #[test]
    fn nuclear_norm_of_uniform_predictions() {
        let logits = Tensor::zeros(2, 2).unwrap();
        let loss = BatchNuclearNorm.loss(&logits).unwrap();
        assert!((loss + 0.5f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn nuclear_norm_of_confident_diverse_predictions_approaches_minus_one() {
        let logits = Tensor::from_vec(2, 2, vec![20.0, 0.0, 0.0, 20.0]).unwrap();
        let loss = BatchNuclearNorm.loss(&logits).unwrap();
        assert!((loss + 1.0).abs() < 1e-4);
    }

    #[test]
    fn nuclear_norm_gradient_matches_finite_differences() {
        let logits = sample_logits();
        let (loss, grad) = BatchNuclearNorm.loss_and_grad(&logits).unwrap();
        assert!((loss - BatchNuclearNorm.loss(&logits).unwrap()).abs() < 1e-6);
        let numeric = finite_difference(&BatchNuclearNorm, &logits);
        for (analytic, numeric) in grad.data().iter().zip(&numeric) {
            assert!(
                (analytic - numeric).abs() < 5e-3,
                "analytic={analytic} numeric={numeric}"
            );
        }
    }

    #[test]
    fn entropy_gradient_matches_finite_differences() {
        let logits = sample_logits();
        let (_, grad) = SoftmaxEntropy.loss_and_grad(&logits).unwrap();
        let numeric = finite_difference(&SoftmaxEntropy, &logits);
        for (analytic, numeric) in grad.data().iter().zip(&numeric) {
            assert!((analytic - numeric).abs() < 5e-3);
        }
        let uniform = SoftmaxEntropy.loss(&Tensor::zeros(3, 4).unwrap()).unwrap();
        assert!((uniform - 4.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn objectives_reject_bad_logits() {
        let bad = Tensor::from_vec(1, 2, vec![f32::NAN, 0.0]).unwrap();
        assert!(BatchNuclearNorm.loss(&bad).is_err());
        assert!(Objective::SoftmaxEntropy.loss_and_grad(&bad).is_err());
        assert_eq!(Objective::default().name(), "batch_nuclear_norm");
    }
}
