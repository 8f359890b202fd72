// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Synthetic distribution-shift benchmark.
//!
//! Classes are Gaussian clusters around random prototypes. The corrupted test
//! stream applies a feature-space corruption of a given severity (1-5) on top
//! of the clean distribution, which is exactly the kind of covariate shift
//! batch-statistic normalization can compensate for. [`PrototypeClassifier`]
//! provides a "pretrained" `BatchNorm1d -> Linear` model fitted in closed form
//! on clean samples.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use spiral_config::determinism;
use st_nn::{
    BatchNorm1d, Linear, Normalization, PureResult, RunningStats, Sequential, Tensor, TensorError,
};

/// Highest supported corruption severity.
pub const MAX_LEVEL: u8 = 5;

/// Feature-space corruption applied to the test stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    /// Clean samples.
    #[default]
    Original,
    /// Extra isotropic Gaussian noise.
    GaussianNoise,
    /// Constant offset along a fixed random direction.
    Shift,
    /// Contraction towards the clean mean followed by a small offset.
    Contrast,
}

impl CorruptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorruptionKind::Original => "original",
            CorruptionKind::GaussianNoise => "gaussian_noise",
            CorruptionKind::Shift => "shift",
            CorruptionKind::Contrast => "contrast",
        }
    }
}

impl core::str::FromStr for CorruptionKind {
    type Err = TensorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "original" => Ok(CorruptionKind::Original),
            "gaussian_noise" | "noise" => Ok(CorruptionKind::GaussianNoise),
            "shift" => Ok(CorruptionKind::Shift),
            "contrast" => Ok(CorruptionKind::Contrast),
            _ => Err(TensorError::InvalidValue {
                label: "unknown corruption kind",
            }),
        }
    }
}

/// A corruption kind together with its severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Corruption {
    pub kind: CorruptionKind,
    pub level: u8,
}

impl Corruption {
    pub fn new(kind: CorruptionKind, level: u8) -> PureResult<Self> {
        if !(1..=MAX_LEVEL).contains(&level) {
            return Err(TensorError::InvalidValue {
                label: "corruption level must lie in 1..=5",
            });
        }
        Ok(Self { kind, level })
    }

    pub fn clean() -> Self {
        Self {
            kind: CorruptionKind::Original,
            level: 1,
        }
    }
}

/// Shape and seed of the synthetic task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub classes: usize,
    pub features: usize,
    /// Standard deviation of the prototype coordinates.
    pub separation: f32,
    /// Within-class standard deviation.
    pub noise: f32,
    pub seed: Option<u64>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            classes: 10,
            features: 16,
            separation: 1.0,
            noise: 0.6,
            seed: None,
        }
    }
}

/// Inputs with their class labels, rows in a shuffled class order.
#[derive(Clone, Debug, PartialEq)]
pub struct LabeledSet {
    pub inputs: Tensor,
    pub labels: Vec<usize>,
}

impl LabeledSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// First `count` samples (all of them when `count` exceeds the length).
    pub fn subset(&self, count: usize) -> PureResult<LabeledSet> {
        let count = count.min(self.len());
        if count == 0 {
            return Err(TensorError::EmptyInput("LabeledSet::subset"));
        }
        Ok(LabeledSet {
            inputs: self.inputs.slice_rows(0, count)?,
            labels: self.labels[..count].to_vec(),
        })
    }

    /// Consecutive batches of at most `batch_size` rows.
    pub fn batches(
        &self,
        batch_size: usize,
    ) -> PureResult<impl Iterator<Item = PureResult<(Tensor, &[usize])>> + '_> {
        if batch_size == 0 {
            return Err(TensorError::InvalidValue {
                label: "batch size must be positive",
            });
        }
        let total = self.len();
        Ok((0..total).step_by(batch_size).map(move |start| {
            let end = (start + batch_size).min(total);
            Ok((self.inputs.slice_rows(start, end)?, &self.labels[start..end]))
        }))
    }
}

/// Generator for clean and corrupted samples of one synthetic task.
#[derive(Debug)]
pub struct ShiftedBenchmark {
    config: BenchmarkConfig,
    prototypes: Tensor,
    direction: Vec<f32>,
    rng: StdRng,
}

impl ShiftedBenchmark {
    pub fn new(config: BenchmarkConfig) -> PureResult<Self> {
        if config.classes < 2 {
            return Err(TensorError::InvalidValue {
                label: "benchmark needs at least two classes",
            });
        }
        if config.noise <= 0.0 || config.separation <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "benchmark noise and separation must be positive",
            });
        }
        let mut rng = determinism::rng_from_optional(config.seed, "st-tta/bench");
        let prototypes = Tensor::random_normal_with(
            config.classes,
            config.features,
            0.0,
            config.separation,
            &mut rng,
        )?;
        let raw = Tensor::random_normal_with(1, config.features, 0.0, 1.0, &mut rng)?;
        let norm = raw.squared_l2_norm().sqrt().max(f32::EPSILON);
        let direction = raw.data().iter().map(|v| v / norm).collect();
        Ok(Self {
            config,
            prototypes,
            direction,
            rng,
        })
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Class prototypes, one row per class.
    pub fn prototypes(&self) -> &Tensor {
        &self.prototypes
    }

    /// Draws `per_class` samples of every class under `corruption`.
    pub fn sample(&mut self, per_class: usize, corruption: Corruption) -> PureResult<LabeledSet> {
        if per_class == 0 {
            return Err(TensorError::EmptyInput("ShiftedBenchmark::sample"));
        }
        let classes = self.config.classes;
        let features = self.config.features;
        let mut labels: Vec<usize> = (0..classes)
            .flat_map(|class| std::iter::repeat(class).take(per_class))
            .collect();
        labels.shuffle(&mut self.rng);

        let noise = Tensor::random_normal_with(
            labels.len(),
            features,
            0.0,
            self.config.noise,
            &mut self.rng,
        )?;
        let mut data = Vec::with_capacity(labels.len() * features);
        for (row, &label) in noise.data().chunks(features).zip(&labels) {
            let prototype = self.prototypes.row(label)?;
            data.extend(prototype.iter().zip(row).map(|(p, n)| p + n));
        }
        let mut inputs = Tensor::from_vec(labels.len(), features, data)?;
        self.corrupt(&mut inputs, corruption)?;
        tracing::debug!(
            samples = labels.len(),
            corruption = corruption.kind.as_str(),
            level = corruption.level,
            "sampled benchmark split"
        );
        Ok(LabeledSet { inputs, labels })
    }

    fn corrupt(&mut self, inputs: &mut Tensor, corruption: Corruption) -> PureResult<()> {
        let level = corruption.level as f32;
        let features = self.config.features;
        match corruption.kind {
            CorruptionKind::Original => {}
            CorruptionKind::GaussianNoise => {
                let std = 0.35 * level * self.config.noise;
                let normal = Normal::new(0.0f32, std).map_err(|_| TensorError::InvalidValue {
                    label: "corruption noise",
                })?;
                for value in inputs.data_mut() {
                    *value += normal.sample(&mut self.rng);
                }
            }
            CorruptionKind::Shift => {
                let magnitude = 1.5 * level * self.config.separation;
                for row in inputs.data_mut().chunks_mut(features) {
                    for (value, d) in row.iter_mut().zip(&self.direction) {
                        *value += magnitude * d;
                    }
                }
            }
            CorruptionKind::Contrast => {
                let center = self.clean_mean();
                let factor = 1.0 / (1.0 + 0.5 * level);
                let offset = 0.25 * level * self.config.separation;
                for row in inputs.data_mut().chunks_mut(features) {
                    for ((value, c), d) in row.iter_mut().zip(&center).zip(&self.direction) {
                        *value = c + (*value - c) * factor + offset * d;
                    }
                }
            }
        }
        Ok(())
    }

    fn clean_mean(&self) -> Vec<f32> {
        let scale = 1.0 / self.config.classes as f32;
        self.prototypes
            .sum_axis0()
            .into_iter()
            .map(|v| v * scale)
            .collect()
    }
}

/// Nearest-centroid classifier expressed as `BatchNorm1d -> Linear`.
///
/// The normalization layer carries the clean feature statistics as running
/// statistics, and the head scores `x . c - |c|^2 / 2` for every normalised
/// class centroid `c`.
#[derive(Clone, Debug, PartialEq)]
pub struct PrototypeClassifier {
    mean: Vec<f32>,
    var: Vec<f32>,
    centroids: Tensor,
}

impl PrototypeClassifier {
    const EPSILON: f32 = 1e-5;

    /// Estimates feature statistics and class centroids from labelled samples.
    pub fn fit(set: &LabeledSet, classes: usize) -> PureResult<Self> {
        if set.is_empty() {
            return Err(TensorError::EmptyInput("PrototypeClassifier::fit"));
        }
        let (rows, features) = set.inputs.shape();
        let mean: Vec<f32> = set
            .inputs
            .sum_axis0()
            .into_iter()
            .map(|v| v / rows as f32)
            .collect();
        let mut var = vec![0.0f32; features];
        let mut sums = vec![0.0f32; classes * features];
        let mut counts = vec![0usize; classes];
        for (row, &label) in set.inputs.data().chunks(features).zip(&set.labels) {
            if label >= classes {
                return Err(TensorError::InvalidValue {
                    label: "label outside the class range",
                });
            }
            counts[label] += 1;
            for (idx, value) in row.iter().enumerate() {
                let centered = value - mean[idx];
                var[idx] += centered * centered;
                sums[label * features + idx] += value;
            }
        }
        var.iter_mut().for_each(|v| *v /= rows as f32);
        if counts.iter().any(|&count| count == 0) {
            return Err(TensorError::EmptyInput("PrototypeClassifier::fit class"));
        }
        let centroids = Tensor::from_fn(classes, features, |class, idx| {
            let centroid = sums[class * features + idx] / counts[class] as f32;
            (centroid - mean[idx]) / (var[idx] + Self::EPSILON).sqrt()
        })?;
        Ok(Self {
            mean,
            var,
            centroids,
        })
    }

    pub fn classes(&self) -> usize {
        self.centroids.shape().0
    }

    pub fn features(&self) -> usize {
        self.centroids.shape().1
    }

    /// Materialises the classifier as a module named `bn` + `head`.
    pub fn build(&self) -> PureResult<Sequential> {
        let features = self.features();
        let mut bn = BatchNorm1d::new("bn", features, 0.1, Self::EPSILON)?;
        bn.set_running_stats(Some(RunningStats {
            mean: Tensor::from_vec(1, features, self.mean.clone())?,
            var: Tensor::from_vec(1, features, self.var.clone())?,
        }))?;
        let weight = self.centroids.transpose();
        let bias: Vec<f32> = self
            .centroids
            .data()
            .chunks(features)
            .map(|c| -0.5 * c.iter().map(|v| v * v).sum::<f32>())
            .collect();
        let head = Linear::from_parts("head", weight, Tensor::from_vec(1, bias.len(), bias)?)?;
        let mut model = Sequential::new();
        model.push(bn);
        model.push(head);
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::evaluate;
    use st_nn::Module;

    fn bench() -> ShiftedBenchmark {
        ShiftedBenchmark::new(BenchmarkConfig {
            classes: 4,
            features: 6,
            separation: 2.0,
            noise: 0.3,
            seed: Some(7),
        })
        .unwrap()
    }

    #[test]
    fn sampling_is_balanced_and_seeded() {
        let set = bench().sample(5, Corruption::clean()).unwrap();
        assert_eq!(set.inputs.shape(), (20, 6));
        for class in 0..4 {
            assert_eq!(set.labels.iter().filter(|&&l| l == class).count(), 5);
        }
        assert_eq!(bench().sample(5, Corruption::clean()).unwrap(), set);
    }

    #[test]
    fn corruption_levels_are_validated() {
        assert!(Corruption::new(CorruptionKind::Shift, 0).is_err());
        assert!(Corruption::new(CorruptionKind::Shift, 6).is_err());
        assert!(Corruption::new(CorruptionKind::Shift, 5).is_ok());
        assert_eq!(
            "gaussian_noise".parse::<CorruptionKind>().unwrap(),
            CorruptionKind::GaussianNoise
        );
        assert!("fog".parse::<CorruptionKind>().is_err());
    }

    #[test]
    fn batches_cover_every_sample() {
        let set = bench().sample(3, Corruption::clean()).unwrap();
        let sizes: Vec<usize> = set
            .batches(5)
            .unwrap()
            .map(|batch| batch.unwrap().1.len())
            .collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert!(set.batches(0).is_err());
        assert_eq!(set.subset(4).unwrap().len(), 4);
        assert_eq!(set.subset(100).unwrap().len(), 12);
    }

    #[test]
    fn prototype_classifier_fits_clean_data_and_suffers_under_shift() {
        let mut bench = bench();
        let train = bench.sample(50, Corruption::clean()).unwrap();
        let classifier = PrototypeClassifier::fit(&train, 4).unwrap();
        let mut model = classifier.build().unwrap();
        assert_eq!(model.normalization_count().unwrap(), 1);

        let clean = bench.sample(25, Corruption::clean()).unwrap();
        let clean_error = evaluate(&mut model, &clean, 20).unwrap();
        assert!(clean_error < 0.1, "clean error {clean_error}");

        let shifted = bench
            .sample(25, Corruption::new(CorruptionKind::Shift, 5).unwrap())
            .unwrap();
        let shifted_error = evaluate(&mut model, &shifted, 20).unwrap();
        assert!(shifted_error > clean_error);

        // Batch statistics remove a constant offset.
        crate::configure::configure_model(&mut model).unwrap();
        let batch_stat_error = evaluate(&mut model, &shifted, 20).unwrap();
        assert!(batch_stat_error < 0.25, "batch-stat error {batch_stat_error}");
    }
}
