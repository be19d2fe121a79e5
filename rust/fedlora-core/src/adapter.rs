//! Low-rank adapter representation.
//!
//! An [`Adapter`] is a named set of low-rank weight deltas layered onto a fixed base model. For
//! every targeted module of every layer it holds a pair of matrices: `lora_A` of shape
//! `rank x hidden` and `lora_B` of shape `hidden x rank`. The tensors are keyed by name in a
//! sorted map, which gives every traversal over the weights a fixed order.

use std::{
    collections::{btree_map, BTreeMap},
    iter::FromIterator,
};

use derive_more::{From, Into};
use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::common::{Owner, RoundId};

/// A single weight tensor of an adapter.
pub type Tensor = ArrayD<f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The low-rank configuration shared by all adapters of a federation.
pub struct LoraConfig {
    /// The identifier of the frozen base model the adapter is layered onto.
    pub base_model: String,
    /// The rank `r` of the low-rank decomposition.
    pub rank: usize,
    /// The LoRA `alpha` hyperparameter.
    pub alpha: f64,
}

impl LoraConfig {
    /// Gets the scaling factor `alpha / r` applied to the adapter output.
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The placement of the adapter matrices inside the base model.
pub struct LoraLayout {
    /// The modules of each layer that receive a low-rank pair, e.g. `q_proj`.
    pub target_modules: Vec<String>,
    /// The number of transformer layers.
    pub num_layers: usize,
    /// The hidden size of the targeted modules.
    pub hidden_size: usize,
}

impl LoraLayout {
    /// Gets the name of the `lora_A`/`lora_B` matrix of a module in a layer.
    pub fn tensor_name(layer: usize, module: &str, matrix: &str) -> String {
        format!("layers.{}.{}.{}", layer, module, matrix)
    }

    /// Gets the names and shapes of all tensors for the given rank.
    pub fn shapes(&self, rank: usize) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::with_capacity(self.num_layers * self.target_modules.len() * 2);
        for layer in 0..self.num_layers {
            for module in &self.target_modules {
                shapes.push((
                    Self::tensor_name(layer, module, "lora_A"),
                    vec![rank, self.hidden_size],
                ));
                shapes.push((
                    Self::tensor_name(layer, module, "lora_B"),
                    vec![self.hidden_size, rank],
                ));
            }
        }
        shapes
    }

    /// Creates freshly initialized weights.
    ///
    /// `lora_A` is drawn uniformly from `[-1/sqrt(hidden), 1/sqrt(hidden)]` with a generator seeded
    /// by `seed`, `lora_B` starts at zero so that the initial adapter is a no-op on the base model.
    pub fn init(&self, rank: usize, seed: u64) -> AdapterWeights {
        let mut prng = ChaCha20Rng::seed_from_u64(seed);
        let bound = 1.0 / (self.hidden_size.max(1) as f64).sqrt();
        self.shapes(rank)
            .into_iter()
            .map(|(name, shape)| {
                let tensor = if name.ends_with("lora_A") {
                    Tensor::from_shape_simple_fn(IxDyn(&shape), || prng.gen_range(-bound..=bound))
                } else {
                    Tensor::zeros(IxDyn(&shape))
                };
                (name, tensor)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Metrics reported by a training run.
pub struct TrainingMetrics {
    pub training_loss: f64,
    pub eval_loss: f64,
    pub perplexity: f64,
    pub tokens_processed: u64,
    /// The number of local training samples. This is the weight of the adapter in a
    /// sample-weighted aggregation.
    pub num_samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, From, Into, Serialize, Deserialize)]
/// The weight tensors of an adapter, keyed by tensor name.
pub struct AdapterWeights(BTreeMap<String, Tensor>);

#[allow(clippy::len_without_is_empty)]
impl AdapterWeights {
    /// Gets the number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets the tensor with the given name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    /// Inserts a tensor, replacing any previous tensor of the same name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    /// Iterates over the tensors in name order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.0.iter()
    }

    /// Iterates mutably over the tensors in name order.
    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, String, Tensor> {
        self.0.iter_mut()
    }

    /// Iterates mutably and in parallel over the tensors.
    pub fn par_iter_mut(&mut self) -> rayon::collections::btree_map::IterMut<'_, String, Tensor> {
        self.0.par_iter_mut()
    }

    /// Gets the total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.0.values().map(|tensor| tensor.len()).sum()
    }

    /// Gets the euclidean norm over all parameters.
    pub fn l2_norm(&self) -> f64 {
        self.0
            .values()
            .flat_map(|tensor| tensor.iter())
            .map(|w| w * w)
            .sum::<f64>()
            .sqrt()
    }
}

impl FromIterator<(String, Tensor)> for AdapterWeights {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for AdapterWeights {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A versioned low-rank adapter.
///
/// Adapters are immutable once written: training produces a new adapter, it never mutates an old
/// one.
pub struct Adapter {
    pub config: LoraConfig,
    pub owner: Owner,
    pub round: RoundId,
    pub metrics: TrainingMetrics,
    pub weights: AdapterWeights,
}

impl Adapter {
    /// Gets the shape of the tensor with the given name.
    pub fn shape_of(&self, name: &str) -> Option<&[usize]> {
        self.weights.get(name).map(|tensor| tensor.shape())
    }
}
