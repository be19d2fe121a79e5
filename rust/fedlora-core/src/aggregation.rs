//! Weighted aggregation of local adapters into a global adapter.
//!
//! Every tensor of the global adapter is the weight-normalized sum of the corresponding local
//! tensors:
//!
//! ```text
//! global[t] = Σᵢ (wᵢ / Σⱼ wⱼ) · localᵢ[t]
//! ```
//!
//! The tensors are accumulated independently of each other and, for each tensor, strictly in the
//! order in which the local adapters are added. Adding the same adapters in the same order
//! therefore always yields bit-identical results, regardless of how the per-tensor work is
//! scheduled across threads.
//!
//! The [`AggregationMethod`] only decides which weight an adapter contributes:
//! - [`AggregationMethod::WeightedAverage`]: the caller supplied weight, typically the number of
//!   local training samples.
//! - [`AggregationMethod::FedAvg`]: every adapter has weight `1`.
//! - [`AggregationMethod::FedProx`]: same arithmetic as the weighted average. FedProx differs only
//!   in the objective of the local training, which penalizes the drift from the previous global
//!   adapter.

use derive_more::Display;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    adapter::{Adapter, AdapterWeights, LoraConfig, TrainingMetrics},
    common::{Owner, RoundId},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The strategy used to combine local adapters.
pub enum AggregationMethod {
    #[display(fmt = "weighted_average")]
    #[serde(rename = "weighted_average")]
    WeightedAverage,
    #[display(fmt = "fedavg")]
    #[serde(rename = "fedavg")]
    FedAvg,
    #[display(fmt = "fedprox")]
    #[serde(rename = "fedprox")]
    FedProx,
}

impl Default for AggregationMethod {
    fn default() -> Self {
        AggregationMethod::WeightedAverage
    }
}

impl AggregationMethod {
    /// Gets the weight an adapter trained with the given metrics contributes to the aggregation.
    pub fn weight(&self, metrics: &TrainingMetrics) -> f64 {
        match self {
            AggregationMethod::FedAvg => 1.,
            AggregationMethod::WeightedAverage | AggregationMethod::FedProx => {
                metrics.num_samples as f64
            }
        }
    }

    /// Checks whether the local training must add the proximal term.
    pub fn is_proximal(&self) -> bool {
        matches!(self, AggregationMethod::FedProx)
    }
}

#[derive(Debug, Error, PartialEq)]
/// Errors related to the aggregation of adapters.
pub enum AggregationError {
    #[error("no adapters to aggregate")]
    NoAdapters,

    #[error("{owner}: expected base model `{expected}`, got `{actual}`")]
    BaseModelMismatch {
        owner: Owner,
        expected: String,
        actual: String,
    },

    #[error("{owner}: expected rank {expected}, got {actual}")]
    RankMismatch {
        owner: Owner,
        expected: usize,
        actual: usize,
    },

    #[error("{owner}: shape mismatch in tensor `{tensor}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        owner: Owner,
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{owner}: tensor `{tensor}` is missing")]
    MissingTensor { owner: Owner, tensor: String },

    #[error("{owner}: unexpected tensor `{tensor}`")]
    UnexpectedTensor { owner: Owner, tensor: String },

    #[error("{owner}: invalid aggregation weight {weight}")]
    InvalidWeight { owner: Owner, weight: f64 },

    #[error("the aggregation weights sum up to zero")]
    ZeroTotalWeight,
}

#[derive(Debug, Clone)]
/// An aggregator for local adapters.
pub struct Aggregation {
    method: AggregationMethod,
    config: Option<LoraConfig>,
    /// The running weighted sums of the tensors.
    sums: AdapterWeights,
    /// The running weighted sums of the metrics.
    metrics: WeightedMetrics,
    total_weight: f64,
    sources: Vec<Owner>,
}

#[allow(clippy::len_without_is_empty)]
impl Aggregation {
    /// Creates a new, empty aggregator.
    pub fn new(method: AggregationMethod) -> Self {
        Self {
            method,
            config: None,
            sums: AdapterWeights::default(),
            metrics: WeightedMetrics::default(),
            total_weight: 0.,
            sources: Vec::new(),
        }
    }

    /// Gets the aggregation method.
    pub fn method(&self) -> AggregationMethod {
        self.method
    }

    /// Gets the number of aggregated adapters.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Gets the owners of the aggregated adapters, in aggregation order.
    pub fn sources(&self) -> &[Owner] {
        &self.sources
    }

    /// Validates if the aggregation of the given adapter may be safely performed.
    ///
    /// This should be checked before calling [`aggregate()`], since aggregation may panic or
    /// produce garbage values otherwise.
    ///
    /// # Errors
    /// Fails in one of the following cases:
    /// - The weight is negative or not finite.
    /// - The base model or the rank differ from the previously aggregated adapters.
    /// - The adapter lacks a tensor, has an additional tensor or a tensor of a different shape.
    ///
    /// [`aggregate()`]: Aggregation::aggregate
    pub fn validate_aggregation(
        &self,
        adapter: &Adapter,
        weight: f64,
    ) -> Result<(), AggregationError> {
        let owner = adapter.owner;
        if !weight.is_finite() || weight < 0. {
            return Err(AggregationError::InvalidWeight { owner, weight });
        }

        let config = match &self.config {
            // the first adapter defines the expected configuration and shapes
            None => return Ok(()),
            Some(config) => config,
        };

        if config.base_model != adapter.config.base_model {
            return Err(AggregationError::BaseModelMismatch {
                owner,
                expected: config.base_model.clone(),
                actual: adapter.config.base_model.clone(),
            });
        }

        if config.rank != adapter.config.rank {
            return Err(AggregationError::RankMismatch {
                owner,
                expected: config.rank,
                actual: adapter.config.rank,
            });
        }

        for (name, expected) in self.sums.iter() {
            match adapter.weights.get(name) {
                None => {
                    return Err(AggregationError::MissingTensor {
                        owner,
                        tensor: name.clone(),
                    })
                }
                Some(actual) if actual.shape() != expected.shape() => {
                    return Err(AggregationError::ShapeMismatch {
                        owner,
                        tensor: name.clone(),
                        expected: expected.shape().to_vec(),
                        actual: actual.shape().to_vec(),
                    })
                }
                Some(_) => {}
            }
        }

        if let Some((name, _)) = adapter
            .weights
            .iter()
            .find(|(name, _)| self.sums.get(name).is_none())
        {
            return Err(AggregationError::UnexpectedTensor {
                owner,
                tensor: name.clone(),
            });
        }

        Ok(())
    }

    /// Aggregates the given adapter with the given weight.
    ///
    /// For [`AggregationMethod::FedAvg`] the weight is ignored and replaced by `1`.
    ///
    /// It should be checked that [`validate_aggregation()`] succeeds before calling this.
    ///
    /// [`validate_aggregation()`]: Aggregation::validate_aggregation
    pub fn aggregate(&mut self, adapter: &Adapter, weight: f64) {
        let weight = self.effective_weight(weight);

        if self.config.is_none() {
            self.config = Some(adapter.config.clone());
            self.sums = adapter
                .weights
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor * weight))
                .collect();
        } else {
            self.sums.par_iter_mut().for_each(|(name, sum)| {
                if let Some(tensor) = adapter.weights.get(name) {
                    sum.scaled_add(weight, tensor);
                }
            });
        }

        self.metrics.add(&adapter.metrics, weight);
        self.total_weight += weight;
        self.sources.push(adapter.owner);
    }

    /// Validates and aggregates the given adapter.
    ///
    /// # Errors
    /// Fails if the adapter cannot be aggregated, in which case the aggregator is left untouched.
    pub fn add(&mut self, adapter: &Adapter, weight: f64) -> Result<(), AggregationError> {
        self.validate_aggregation(adapter, self.effective_weight(weight))?;
        self.aggregate(adapter, weight);
        Ok(())
    }

    /// Normalizes the weighted sums into the global adapter of the given round.
    ///
    /// # Errors
    /// Fails if no adapter was aggregated or if all weights were zero.
    pub fn finish(self, round: RoundId) -> Result<Adapter, AggregationError> {
        let config = self.config.ok_or(AggregationError::NoAdapters)?;
        if self.total_weight <= 0. {
            return Err(AggregationError::ZeroTotalWeight);
        }

        let total_weight = self.total_weight;
        let mut weights = self.sums;
        weights
            .par_iter_mut()
            .for_each(|(_, sum)| sum.mapv_inplace(|w| w / total_weight));

        Ok(Adapter {
            config,
            owner: Owner::Global,
            round,
            metrics: self.metrics.finish(total_weight),
            weights,
        })
    }

    fn effective_weight(&self, weight: f64) -> f64 {
        match self.method {
            AggregationMethod::FedAvg => 1.,
            _ => weight,
        }
    }
}

/// Aggregates the given `(adapter, weight)` pairs in order into the global adapter of a round.
///
/// # Errors
/// Fails on an empty input and on the first adapter that cannot be aggregated. No partial result is
/// produced.
pub fn aggregate<'a, I>(
    method: AggregationMethod,
    round: RoundId,
    adapters: I,
) -> Result<Adapter, AggregationError>
where
    I: IntoIterator<Item = (&'a Adapter, f64)>,
{
    let mut aggregation = Aggregation::new(method);
    for (adapter, weight) in adapters {
        aggregation.add(adapter, weight)?;
    }
    aggregation.finish(round)
}

#[derive(Debug, Clone, Default)]
struct WeightedMetrics {
    training_loss: f64,
    eval_loss: f64,
    perplexity: f64,
    tokens_processed: u64,
    num_samples: u64,
}

impl WeightedMetrics {
    fn add(&mut self, metrics: &TrainingMetrics, weight: f64) {
        self.training_loss += weight * metrics.training_loss;
        self.eval_loss += weight * metrics.eval_loss;
        self.perplexity += weight * metrics.perplexity;
        self.tokens_processed += metrics.tokens_processed;
        self.num_samples += metrics.num_samples;
    }

    fn finish(self, total_weight: f64) -> TrainingMetrics {
        TrainingMetrics {
            training_loss: self.training_loss / total_weight,
            eval_loss: self.eval_loss / total_weight,
            perplexity: self.perplexity / total_weight,
            tokens_processed: self.tokens_processed,
            num_samples: self.num_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, ArrayD};

    use super::*;

    fn config() -> LoraConfig {
        LoraConfig {
            base_model: "base".into(),
            rank: 2,
            alpha: 4.,
        }
    }

    fn adapter(id: u32, samples: u64, tensors: Vec<(&str, ArrayD<f64>)>) -> Adapter {
        Adapter {
            config: config(),
            owner: Owner::Participant(id),
            round: 1,
            metrics: TrainingMetrics {
                training_loss: id as f64,
                num_samples: samples,
                ..Default::default()
            },
            weights: tensors
                .into_iter()
                .map(|(name, tensor)| (name.to_string(), tensor))
                .collect(),
        }
    }

    fn assert_close(actual: &ArrayD<f64>, expected: &ArrayD<f64>) {
        assert_eq!(actual.shape(), expected.shape());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-12, "{} != {}", a, e);
        }
    }

    #[test]
    fn test_equal_weights_average() {
        let first = adapter(1, 10, vec![("a", array![[1., 0.], [0., 1.]].into_dyn())]);
        let second = adapter(2, 10, vec![("a", array![[3., 0.], [0., 3.]].into_dyn())]);

        let global = aggregate(
            AggregationMethod::WeightedAverage,
            1,
            vec![(&first, 1.), (&second, 1.)],
        )
        .unwrap();

        assert_eq!(global.owner, Owner::Global);
        assert_eq!(global.round, 1);
        assert_eq!(global.config, config());
        assert_close(
            global.weights.get("a").unwrap(),
            &array![[2., 0.], [0., 2.]].into_dyn(),
        );
    }

    #[test]
    fn test_sample_weighted_average() {
        let first = adapter(
            1,
            10,
            vec![
                ("a", array![[4., 0.], [2., 1.]].into_dyn()),
                ("b", array![1., 1.].into_dyn()),
            ],
        );
        let second = adapter(
            2,
            30,
            vec![
                ("a", array![[8., 4.], [2., 5.]].into_dyn()),
                ("b", array![5., -3.].into_dyn()),
            ],
        );
        let method = AggregationMethod::WeightedAverage;
        let inputs = vec![
            (&first, method.weight(&first.metrics)),
            (&second, method.weight(&second.metrics)),
        ];

        let global = aggregate(method, 3, inputs).unwrap();

        // (10 * a1 + 30 * a2) / 40
        assert_close(
            global.weights.get("a").unwrap(),
            &array![[7., 3.], [2., 4.]].into_dyn(),
        );
        assert_close(global.weights.get("b").unwrap(), &array![4., -2.].into_dyn());
        assert_eq!(global.metrics.num_samples, 40);
        assert!((global.metrics.training_loss - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_fedavg_ignores_weights() {
        let first = adapter(1, 1, vec![("a", array![0., 0.].into_dyn())]);
        let second = adapter(2, 99, vec![("a", array![2., 4.].into_dyn())]);

        let global = aggregate(
            AggregationMethod::FedAvg,
            1,
            vec![(&first, 1.), (&second, 99.)],
        )
        .unwrap();

        assert_close(global.weights.get("a").unwrap(), &array![1., 2.].into_dyn());
    }

    #[test]
    fn test_fedprox_aggregates_like_weighted_average() {
        let first = adapter(1, 1, vec![("a", array![0., 3.].into_dyn())]);
        let second = adapter(2, 3, vec![("a", array![4., 7.].into_dyn())]);
        let inputs = || vec![(&first, 1.), (&second, 3.)];

        let prox = aggregate(AggregationMethod::FedProx, 1, inputs()).unwrap();
        let avg = aggregate(AggregationMethod::WeightedAverage, 1, inputs()).unwrap();

        assert_eq!(prox.weights, avg.weights);
        assert!(AggregationMethod::FedProx.is_proximal());
        assert!(!AggregationMethod::FedAvg.is_proximal());
    }

    #[test]
    fn test_aggregation_is_reproducible() {
        let adapters: Vec<Adapter> = (1..=5)
            .map(|id| {
                let x = 0.1 * id as f64;
                adapter(
                    id,
                    id as u64 * 7,
                    vec![("a", array![[x, 1. / 3.], [x * x, 1e-9]].into_dyn())],
                )
            })
            .collect();
        let run = || {
            aggregate(
                AggregationMethod::WeightedAverage,
                2,
                adapters
                    .iter()
                    .map(|a| (a, AggregationMethod::WeightedAverage.weight(&a.metrics))),
            )
            .unwrap()
        };

        let first = run().weights.get("a").unwrap().clone();
        let second = run().weights.get("a").unwrap().clone();
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_empty_input() {
        let err = aggregate(AggregationMethod::FedAvg, 1, Vec::new()).unwrap_err();
        assert_eq!(err, AggregationError::NoAdapters);
        assert_eq!(err.to_string(), "no adapters to aggregate");
    }

    #[test]
    fn test_shape_mismatch() {
        let first = adapter(1, 1, vec![("a", array![[1., 0.], [0., 1.]].into_dyn())]);
        let second = adapter(2, 1, vec![("a", array![[1., 0., 0.], [0., 1., 0.]].into_dyn())]);

        let err = aggregate(
            AggregationMethod::FedAvg,
            1,
            vec![(&first, 1.), (&second, 1.)],
        )
        .unwrap_err();

        assert_eq!(
            err,
            AggregationError::ShapeMismatch {
                owner: Owner::Participant(2),
                tensor: "a".into(),
                expected: vec![2, 2],
                actual: vec![2, 3],
            }
        );
        assert!(err.to_string().contains("participant 2"));
    }

    #[test]
    fn test_missing_and_unexpected_tensors() {
        let first = adapter(
            1,
            1,
            vec![("a", array![1.].into_dyn()), ("b", array![1.].into_dyn())],
        );
        let missing = adapter(2, 1, vec![("a", array![1.].into_dyn())]);
        let unexpected = adapter(
            3,
            1,
            vec![
                ("a", array![1.].into_dyn()),
                ("b", array![1.].into_dyn()),
                ("c", array![1.].into_dyn()),
            ],
        );

        let mut aggregation = Aggregation::new(AggregationMethod::FedAvg);
        aggregation.add(&first, 1.).unwrap();
        assert!(matches!(
            aggregation.add(&missing, 1.),
            Err(AggregationError::MissingTensor { .. })
        ));
        assert!(matches!(
            aggregation.add(&unexpected, 1.),
            Err(AggregationError::UnexpectedTensor { .. })
        ));
        assert_eq!(aggregation.len(), 1);
        assert_eq!(aggregation.sources(), &[Owner::Participant(1)]);
    }

    #[test]
    fn test_config_mismatch() {
        let first = adapter(1, 1, vec![("a", array![1.].into_dyn())]);
        let mut other_rank = adapter(2, 1, vec![("a", array![1.].into_dyn())]);
        other_rank.config.rank = 4;
        let mut other_base = adapter(3, 1, vec![("a", array![1.].into_dyn())]);
        other_base.config.base_model = "other".into();

        let mut aggregation = Aggregation::new(AggregationMethod::WeightedAverage);
        aggregation.add(&first, 1.).unwrap();
        assert!(matches!(
            aggregation.add(&other_rank, 1.),
            Err(AggregationError::RankMismatch { .. })
        ));
        assert!(matches!(
            aggregation.add(&other_base, 1.),
            Err(AggregationError::BaseModelMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_weights() {
        let first = adapter(1, 0, vec![("a", array![1.].into_dyn())]);

        let mut aggregation = Aggregation::new(AggregationMethod::WeightedAverage);
        assert!(matches!(
            aggregation.add(&first, -1.),
            Err(AggregationError::InvalidWeight { .. })
        ));
        assert!(matches!(
            aggregation.add(&first, f64::NAN),
            Err(AggregationError::InvalidWeight { .. })
        ));

        aggregation.add(&first, 0.).unwrap();
        assert_eq!(
            aggregation.finish(1).unwrap_err(),
            AggregationError::ZeroTotalWeight
        );
    }
}
