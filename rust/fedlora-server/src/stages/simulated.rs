//! A deterministic stand-in for the external collaborators.
//!
//! The simulated stage produces the same artifacts as the real collectors and trainers, but
//! derives the data and the adapter updates from seeded generators instead of network APIs and
//! GPUs. Given the same settings it produces bit-identical adapters.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use validator::Validate;

use fedlora_core::{Adapter, Owner, ParticipantId, RoundId, Tensor, TrainingMetrics};

use crate::{
    settings::{ModelSettings, StorageSettings},
    stages::{
        CollectArgs,
        EvaluateArgs,
        PreprocessArgs,
        Stage,
        StageError,
        StageReport,
        TrainArgs,
    },
    storage::{
        fs::{read_json, write_json},
        ArtifactId,
        ArtifactStore,
        LocalMetadata,
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceCollection {
    source: String,
    posts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Collection {
    collected_at: DateTime<Utc>,
    sources: Vec<SourceCollection>,
    total_samples: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// The local data of a participant.
struct Shard {
    participant_id: ParticipantId,
    train_samples: u64,
    test_samples: u64,
}

#[derive(Debug, Clone)]
/// The simulated stage.
pub struct SimulatedStage {
    model: ModelSettings,
    seed: u64,
    data_dir: PathBuf,
    store: ArtifactStore,
}

impl SimulatedStage {
    pub fn new(
        model: ModelSettings,
        seed: u64,
        storage: &StorageSettings,
        store: ArtifactStore,
    ) -> Self {
        Self {
            model,
            seed,
            data_dir: storage.data_dir(),
            store,
        }
    }

    fn collection_path(&self) -> PathBuf {
        self.data_dir.join("collected").join("collection.json")
    }

    fn shard_path(&self, participant: ParticipantId) -> PathBuf {
        self.data_dir
            .join("preprocessed")
            .join(format!("agent_{}.json", participant))
    }

    /// Gets the seed of the local training of a participant in a round.
    fn training_seed(&self, participant: ParticipantId, round: RoundId) -> u64 {
        self.seed ^ (u64::from(participant) << 40) ^ round.wrapping_mul(0x9e37_79b9_7f4a_7c15)
    }

    async fn baseline(&self, args: &TrainArgs) -> Result<(Adapter, Option<PathBuf>), StageError> {
        match args.baseline_round {
            Some(round) => {
                let adapter = self.store.get_aggregated(round).await?;
                let path = self
                    .store
                    .layout()
                    .relative(&self.store.artifact_dir(&ArtifactId::Aggregated { round }));
                Ok((adapter, Some(path)))
            }
            None => {
                let adapter = Adapter {
                    config: self.model.lora_config(),
                    owner: Owner::Global,
                    round: 0,
                    metrics: TrainingMetrics::default(),
                    weights: self.model.layout().init(self.model.lora_r, self.seed),
                };
                Ok((adapter, None))
            }
        }
    }
}

/// Splits `total` samples into `participants` shards whose sizes differ by at most one.
fn shard_sizes(total: u64, participants: u32) -> Vec<u64> {
    let participants = u64::from(participants);
    (0..participants)
        .map(|i| total / participants + u64::from(i < total % participants))
        .collect()
}

/// Simulates the loss curve of a local training run.
fn simulated_metrics(
    prng: &mut ChaCha20Rng,
    round: RoundId,
    epochs: u32,
    train_samples: u64,
    max_seq_length: usize,
) -> TrainingMetrics {
    let progress = (round as f64 - 1.) + f64::from(epochs) / 3.;
    let training_loss = 0.15 + 1.85 / (1. + 0.5 * progress) + prng.gen_range(0.0..0.02);
    let eval_loss = training_loss * 1.1;
    TrainingMetrics {
        training_loss,
        eval_loss,
        perplexity: eval_loss.exp(),
        tokens_processed: train_samples * u64::from(epochs) * max_seq_length as u64,
        num_samples: train_samples,
    }
}

#[async_trait]
impl Stage for SimulatedStage {
    async fn collect(&self, args: CollectArgs) -> Result<StageReport, StageError> {
        args.validate()?;

        let sources: Vec<SourceCollection> = args
            .sources
            .iter()
            .map(|source| SourceCollection {
                source: source.clone(),
                posts: u64::from(args.limit),
            })
            .collect();
        let total_samples: u64 = sources.iter().map(|source| source.posts).sum();
        let collection = Collection {
            collected_at: Utc::now(),
            sources,
            total_samples,
        };

        let path = self.collection_path();
        write_json(&path, &collection).await?;
        info!(
            "collected {} samples from {} sources",
            total_samples,
            collection.sources.len()
        );

        Ok(StageReport::success(format!(
            "collected {} samples from {} sources",
            total_samples,
            collection.sources.len()
        ))
        .with("output", &path)
        .with("total_samples", total_samples)
        .with("sources", &collection.sources))
    }

    async fn preprocess(&self, args: PreprocessArgs) -> Result<StageReport, StageError> {
        args.validate()?;

        let collection: Collection = read_json(&self.collection_path()).await?;
        let mut shards = Vec::with_capacity(args.participants as usize);
        for (participant, size) in (1..=args.participants).zip(shard_sizes(
            collection.total_samples,
            args.participants,
        )) {
            let train_samples = (size as f64 * args.train_ratio).floor() as u64;
            if train_samples == 0 {
                return Err(StageError::Execution(format!(
                    "participant {} gets no training samples out of {}",
                    participant, collection.total_samples
                )));
            }
            shards.push(Shard {
                participant_id: participant,
                train_samples,
                test_samples: size - train_samples,
            });
        }

        for shard in &shards {
            write_json(&self.shard_path(shard.participant_id), shard).await?;
        }
        debug!("preprocessed {} shards", shards.len());

        Ok(StageReport::success(format!(
            "split {} samples into {} shards",
            collection.total_samples,
            shards.len()
        ))
        .with("output", self.data_dir.join("preprocessed"))
        .with("shards", &shards))
    }

    async fn train(&self, args: TrainArgs) -> Result<StageReport, StageError> {
        args.validate()?;

        let shard_path = self.shard_path(args.participant);
        let shard: Shard = read_json(&shard_path).await?;
        let (baseline, baseline_path) = self.baseline(&args).await?;

        let mut prng = ChaCha20Rng::seed_from_u64(self.training_seed(args.participant, args.round));
        let step = args.learning_rate * f64::from(args.epochs);
        let step = if args.method.is_proximal() {
            // the proximal term pulls the local solution toward the baseline
            step / (1. + args.fedprox_mu)
        } else {
            step
        };

        let weights = baseline
            .weights
            .iter()
            .map(|(name, tensor)| {
                let delta = Tensor::from_shape_simple_fn(tensor.raw_dim(), || {
                    prng.gen_range(-1.0..=1.0)
                });
                (name.clone(), tensor + &(delta * step))
            })
            .collect();
        let metrics = simulated_metrics(
            &mut prng,
            args.round,
            args.epochs,
            shard.train_samples,
            self.model.max_seq_length,
        );

        let adapter = Adapter {
            config: self.model.lora_config(),
            owner: Owner::Participant(args.participant),
            round: args.round,
            metrics: metrics.clone(),
            weights,
        };
        let metadata = LocalMetadata {
            participant_id: args.participant,
            round: args.round,
            base_model: self.model.base_model.clone(),
            training_method: "LoRA".into(),
            lora_r: self.model.lora_r,
            lora_alpha: self.model.lora_alpha,
            epochs: args.epochs,
            batch_size: args.batch_size,
            learning_rate: args.learning_rate,
            aggregation_method: args.method,
            baseline: baseline_path,
            training_data: shard_path,
            metrics: metrics.clone(),
            created_at: Utc::now(),
        };
        let path = self.store.put_local(&adapter, &metadata).await?;
        info!(
            "participant {} trained its adapter with loss {:.4}",
            args.participant, metrics.training_loss
        );

        Ok(StageReport::success(format!(
            "local adapter of participant {} trained",
            args.participant
        ))
        .with("participant_id", args.participant)
        .with("round", args.round)
        .with("model_path", self.store.layout().relative(&path))
        .with("num_samples", metrics.num_samples)
        .with("metrics", &metrics))
    }

    async fn evaluate(&self, args: EvaluateArgs) -> Result<StageReport, StageError> {
        args.validate()?;

        let adapter = self.store.get_aggregated(args.round).await?;
        let path = self
            .store
            .artifact_dir(&ArtifactId::Aggregated { round: args.round });

        Ok(StageReport::success(format!(
            "aggregated adapter of round {} evaluated",
            args.round
        ))
        .with("model_path", self.store.layout().relative(&path))
        .with("task_type", "text_generation")
        .with("eval_loss", adapter.metrics.eval_loss)
        .with("perplexity", adapter.metrics.perplexity)
        .with("num_parameters", adapter.weights.num_parameters())
        .with("adapter_norm", adapter.weights.l2_norm()))
    }
}
