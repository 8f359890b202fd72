// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Epoch loop: stream an adaptation split through an [`Adapter`], then score
//! the shared model on the evaluation split.

use crate::adapt::{forward_only, Adapter};
use crate::bench::LabeledSet;
use crate::objective::UnsupervisedObjective;
use crate::Result;
use serde::{Deserialize, Serialize};
use st_nn::{Module, Optimizer, PureResult, Tensor, TensorError};
use std::time::{Duration, Instant};

/// Loop limits for [`run`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of adaptation epochs.
    pub epochs: usize,
    /// Early-stop window; `0` disables early termination.
    pub stop_window: usize,
    pub batch_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            epochs: 500,
            stop_window: 25,
            batch_size: 128,
        }
    }
}

/// Result of one adaptation epoch.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub error: f32,
    /// Objective value of the last adaptation step in the epoch.
    pub loss: Option<f32>,
    pub elapsed: Duration,
}

/// Early termination details.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EarlyStop {
    /// Epoch at which the loop stopped.
    pub at_epoch: usize,
    /// Epoch whose error triggered termination.
    pub best_epoch: usize,
    pub error: f32,
}

/// Full history of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    /// Error before any adaptation step.
    pub initial_error: f32,
    pub epochs: Vec<EpochReport>,
    pub early_stop: Option<EarlyStop>,
}

impl RunReport {
    /// Error of the last finished epoch, or the initial error.
    pub fn final_error(&self) -> f32 {
        self.epochs
            .last()
            .map(|report| report.error)
            .unwrap_or(self.initial_error)
    }
}

/// Fraction of rows whose arg-max differs from the label.
pub fn error_rate(logits: &Tensor, labels: &[usize]) -> PureResult<f32> {
    if logits.shape().0 != labels.len() {
        return Err(TensorError::DataLength {
            expected: logits.shape().0,
            got: labels.len(),
        });
    }
    if labels.is_empty() {
        return Err(TensorError::EmptyInput("error_rate labels"));
    }
    let wrong = logits
        .argmax_rows()
        .into_iter()
        .zip(labels)
        .filter(|(predicted, label)| predicted != *label)
        .count();
    Ok(wrong as f32 / labels.len() as f32)
}

/// Evaluation-mode error of `model` over `set`.
pub fn evaluate(model: &mut dyn Module, set: &LabeledSet, batch_size: usize) -> PureResult<f32> {
    if set.is_empty() {
        return Err(TensorError::EmptyInput("evaluate set"));
    }
    let mut wrong = 0.0f32;
    for batch in set.batches(batch_size)? {
        let (inputs, labels) = batch?;
        let logits = forward_only(&inputs, model)?;
        wrong += error_rate(&logits, labels)? * labels.len() as f32;
    }
    Ok(wrong / set.len() as f32)
}

/// Termination rule on the error history: stop once the error recorded
/// `window` epochs ago is strictly lower than every later one.
///
/// Needs more than `window + 1` entries. A window of one compares the
/// candidate with itself and therefore never fires.
pub fn should_stop(errors: &[f32], window: usize) -> bool {
    let len = errors.len();
    if window == 0 || len <= window + 1 {
        return false;
    }
    let candidate = errors[len - window];
    let tail_start = if window == 1 { 0 } else { len - window + 1 };
    let best_later = errors[tail_start..]
        .iter()
        .copied()
        .fold(f32::INFINITY, f32::min);
    candidate < best_later
}

/// Streams `adapt_set` through `adapter` once per epoch and measures the
/// shared model on `eval_set` after each pass.
pub fn run<M, O, J>(
    adapter: &mut Adapter<M, O, J>,
    adapt_set: &LabeledSet,
    eval_set: &LabeledSet,
    config: &RunnerConfig,
) -> Result<RunReport>
where
    M: Module,
    O: Optimizer,
    J: UnsupervisedObjective,
{
    let batch_size = config.batch_size.min(adapt_set.len()).max(1);
    let initial_error = evaluate(adapter.model_mut(), eval_set, config.batch_size.max(1))?;
    tracing::info!(epoch = 0, error = initial_error, "baseline evaluation");

    let mut epochs = Vec::with_capacity(config.epochs);
    let mut errors = Vec::with_capacity(config.epochs);
    let mut early_stop = None;
    for epoch in 1..=config.epochs {
        let tic = Instant::now();
        for batch in adapt_set.batches(batch_size)? {
            let (inputs, _) = batch?;
            adapter.forward(&inputs)?;
        }
        let error = evaluate(adapter.model_mut(), eval_set, config.batch_size.max(1))?;
        let elapsed = tic.elapsed();
        errors.push(error);
        let loss = adapter.last_loss();
        tracing::info!(
            epoch,
            error,
            loss,
            elapsed_ms = elapsed.as_millis() as u64,
            "adaptation epoch finished"
        );
        epochs.push(EpochReport {
            epoch,
            error,
            loss,
            elapsed,
        });
        if should_stop(&errors, config.stop_window) {
            let best_epoch = errors.len() - config.stop_window + 1;
            let stop = EarlyStop {
                at_epoch: epoch,
                best_epoch,
                error: errors[best_epoch - 1],
            };
            tracing::info!(
                at_epoch = stop.at_epoch,
                best_epoch = stop.best_epoch,
                error = stop.error,
                "early termination"
            );
            early_stop = Some(stop);
            break;
        }
    }
    Ok(RunReport {
        initial_error,
        epochs,
        early_stop,
    })
}
