// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The adaptation step and the stateful wrapper that applies it on every
//! forward call.

use crate::objective::{Objective, UnsupervisedObjective};
use crate::snapshot::{self, AdaptationSnapshot};
use crate::{AdaptError, Result};
use serde::{Deserialize, Serialize};
use st_nn::{Module, Optimizer, PureResult, Tensor};

/// Whether the wrapper restores its initial state before every batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationMode {
    /// Restore the snapshot before each batch, so batches are independent.
    Episodic,
    /// Keep accumulating updates across batches.
    #[default]
    Continual,
}

/// Outcome of one [`forward_and_adapt`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptationStep {
    /// Logits of the training-mode forward, computed before the update.
    pub logits: Tensor,
    /// Objective value for those logits.
    pub loss: f32,
}

/// Runs one training-mode forward, minimises `objective` on its logits with a
/// single optimiser step, then clears the bound gradients.
pub fn forward_and_adapt<O>(
    input: &Tensor,
    model: &mut dyn Module,
    optimizer: &mut dyn Optimizer,
    objective: &O,
) -> PureResult<AdaptationStep>
where
    O: UnsupervisedObjective + ?Sized,
{
    model.train();
    let logits = model.forward(input)?;
    logits.ensure_finite("adaptation_logits")?;
    let (loss, grad) = objective.loss_and_grad(&logits)?;
    model.backward(input, &grad)?;
    optimizer.step(model)?;
    optimizer.zero_grad(model)?;
    Ok(AdaptationStep { logits, loss })
}

/// Evaluation-mode forward without touching any gradient.
pub fn forward_only(input: &Tensor, model: &mut dyn Module) -> PureResult<Tensor> {
    model.eval();
    model.forward(input)
}

/// Wraps a configured model and its optimiser so that every forward call
/// adapts the model on the incoming batch before predicting.
pub struct Adapter<M, O, J = Objective> {
    model: M,
    optimizer: O,
    objective: J,
    steps: usize,
    mode: AdaptationMode,
    snapshot: Option<AdaptationSnapshot>,
    last_loss: Option<f32>,
    batches: u64,
}

impl<M, O, J> core::fmt::Debug for Adapter<M, O, J> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Adapter(mode={:?},steps={},batches={},snapshot={})",
            self.mode,
            self.steps,
            self.batches,
            self.snapshot.is_some()
        )
    }
}

impl<M, O, J> Adapter<M, O, J>
where
    M: Module,
    O: Optimizer,
    J: UnsupervisedObjective,
{
    /// Builds the wrapper and captures the initial model/optimiser state.
    pub fn new(
        model: M,
        optimizer: O,
        objective: J,
        steps: usize,
        mode: AdaptationMode,
    ) -> Result<Self> {
        Self::build(model, optimizer, objective, steps, mode, true)
    }

    /// Continual wrapper that keeps no snapshot. [`Adapter::reset`] fails on it.
    pub fn continual_without_snapshot(
        model: M,
        optimizer: O,
        objective: J,
        steps: usize,
    ) -> Result<Self> {
        Self::build(
            model,
            optimizer,
            objective,
            steps,
            AdaptationMode::Continual,
            false,
        )
    }

    fn build(
        model: M,
        optimizer: O,
        objective: J,
        steps: usize,
        mode: AdaptationMode,
        retain_snapshot: bool,
    ) -> Result<Self> {
        if steps == 0 {
            return Err(AdaptError::InvalidSteps(steps));
        }
        let snapshot = if retain_snapshot {
            Some(snapshot::capture(&model, &optimizer)?)
        } else {
            None
        };
        tracing::info!(
            ?mode,
            steps,
            objective = objective.name(),
            parameters = optimizer.group().len(),
            snapshot = snapshot.is_some(),
            "test-time adaptation ready"
        );
        Ok(Self {
            model,
            optimizer,
            objective,
            steps,
            mode,
            snapshot,
            last_loss: None,
            batches: 0,
        })
    }

    /// Adapts on `input` and returns the evaluation-mode prediction of the
    /// updated model.
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if self.mode == AdaptationMode::Episodic {
            self.reset()?;
        }
        for step in 0..self.steps {
            let outcome =
                forward_and_adapt(input, &mut self.model, &mut self.optimizer, &self.objective)?;
            tracing::debug!(
                batch = self.batches,
                step,
                loss = outcome.loss,
                objective = self.objective.name(),
                "adaptation step"
            );
            self.last_loss = Some(outcome.loss);
        }
        self.batches += 1;
        Ok(forward_only(input, &mut self.model)?)
    }

    /// Restores the captured model and optimiser state.
    pub fn reset(&mut self) -> Result<()> {
        snapshot::restore(
            &mut self.model,
            &mut self.optimizer,
            self.snapshot.as_ref(),
        )?;
        tracing::trace!(batch = self.batches, "restored adaptation snapshot");
        Ok(())
    }

    pub fn mode(&self) -> AdaptationMode {
        self.mode
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn objective(&self) -> &J {
        &self.objective
    }

    pub fn snapshot(&self) -> Option<&AdaptationSnapshot> {
        self.snapshot.as_ref()
    }

    /// Loss of the most recent adaptation step.
    pub fn last_loss(&self) -> Option<f32> {
        self.last_loss
    }

    /// Number of batches seen by [`Adapter::forward`].
    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    /// Releases the model and optimiser.
    pub fn into_parts(self) -> (M, O) {
        (self.model, self.optimizer)
    }
}
