// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Checkpoint persistence for module state dicts and optimiser state.
//!
//! A checkpoint always carries the module state (parameters and running
//! statistics) and optionally the optimiser state. JSON is used for paths
//! ending in `.json`, bincode for everything else.

use crate::module::Module;
use crate::optim::{Optimizer, OptimizerState};
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Encoding used on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    Json,
    Bincode,
}

impl CheckpointFormat {
    /// Picks the format from the file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => CheckpointFormat::Json,
            _ => CheckpointFormat::Bincode,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredOptimizer {
    steps: u64,
    learning_rate: f32,
    slots: BTreeMap<String, Vec<StoredTensor>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    module: BTreeMap<String, StoredTensor>,
    optimizer: Option<StoredOptimizer>,
}

/// In-memory form of a checkpoint file.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub module: HashMap<String, Tensor>,
    pub optimizer: Option<OptimizerState>,
}

impl Checkpoint {
    /// Captures a module and, optionally, its optimiser.
    pub fn capture(
        module: &dyn Module,
        optimizer: Option<&dyn Optimizer>,
    ) -> PureResult<Checkpoint> {
        Ok(Checkpoint {
            module: module.state_dict()?,
            optimizer: optimizer.map(|opt| opt.state_dict()),
        })
    }

    /// Loads the module state and, when both sides are present, the optimiser
    /// state.
    pub fn apply(
        &self,
        module: &mut dyn Module,
        optimizer: Option<&mut dyn Optimizer>,
    ) -> PureResult<()> {
        module.load_state_dict(&self.module)?;
        if let (Some(optimizer), Some(state)) = (optimizer, self.optimizer.as_ref()) {
            optimizer.load_state_dict(state)?;
        }
        Ok(())
    }

    fn to_stored(&self) -> StoredCheckpoint {
        StoredCheckpoint {
            module: self
                .module
                .iter()
                .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
                .collect(),
            optimizer: self.optimizer.as_ref().map(|state| StoredOptimizer {
                steps: state.steps,
                learning_rate: state.learning_rate,
                slots: state
                    .slots
                    .iter()
                    .map(|(name, tensors)| {
                        (
                            name.clone(),
                            tensors.iter().map(StoredTensor::from_tensor).collect(),
                        )
                    })
                    .collect(),
            }),
        }
    }

    fn from_stored(stored: StoredCheckpoint) -> PureResult<Checkpoint> {
        let mut module = HashMap::with_capacity(stored.module.len());
        for (name, tensor) in stored.module {
            module.insert(name, tensor.into_tensor()?);
        }
        let optimizer = match stored.optimizer {
            Some(state) => {
                let mut slots = BTreeMap::new();
                for (name, tensors) in state.slots {
                    let tensors = tensors
                        .into_iter()
                        .map(StoredTensor::into_tensor)
                        .collect::<PureResult<Vec<_>>>()?;
                    slots.insert(name, tensors);
                }
                Some(OptimizerState {
                    steps: state.steps,
                    learning_rate: state.learning_rate,
                    slots,
                })
            }
            None => None,
        };
        Ok(Checkpoint { module, optimizer })
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes a checkpoint, choosing the encoding from the extension.
pub fn save_checkpoint<P: AsRef<Path>>(checkpoint: &Checkpoint, path: P) -> PureResult<()> {
    let path = path.as_ref();
    let stored = checkpoint.to_stored();
    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    match CheckpointFormat::from_path(path) {
        CheckpointFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, &stored).map_err(serde_error)?
        }
        CheckpointFormat::Bincode => {
            bincode::serialize_into(&mut writer, &stored).map_err(serde_error)?
        }
    }
    writer.flush().map_err(io_error)?;
    tracing::debug!(
        path = %path.display(),
        entries = checkpoint.module.len(),
        with_optimizer = checkpoint.optimizer.is_some(),
        "saved checkpoint"
    );
    Ok(())
}

/// Reads a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> PureResult<Checkpoint> {
    let path = path.as_ref();
    let file = File::open(path).map_err(io_error)?;
    let reader = BufReader::new(file);
    let stored: StoredCheckpoint = match CheckpointFormat::from_path(path) {
        CheckpointFormat::Json => serde_json::from_reader(reader).map_err(serde_error)?,
        CheckpointFormat::Bincode => bincode::deserialize_from(reader).map_err(serde_error)?,
    };
    Checkpoint::from_stored(stored)
}

/// Saves only the module state.
pub fn save_module<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let checkpoint = Checkpoint {
        module: module.state_dict()?,
        optimizer: None,
    };
    save_checkpoint(&checkpoint, path)
}

/// Loads module state from a checkpoint, ignoring any optimiser section.
pub fn load_module<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let checkpoint = load_checkpoint(path)?;
    module.load_state_dict(&checkpoint.module)
}
