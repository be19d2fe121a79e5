//! The participant stage interface.
//!
//! The orchestrator drives data collection, preprocessing, local training and evaluation through
//! the [`Stage`] trait without knowing how a stage does its work. Every operation takes a typed
//! argument bag, validates it and returns a [`StageReport`].

pub mod simulated;

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

use fedlora_core::{AggregationMethod, RoundId};

pub use self::simulated::SimulatedStage;
use crate::storage::StorageError;

#[derive(Debug, Error)]
/// Errors of a stage operation.
pub enum StageError {
    /// The argument bag was rejected.
    #[error("invalid stage arguments: {0}")]
    Validation(#[from] ValidationErrors),
    /// The external collaborator failed.
    #[error("stage execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    #[display(fmt = "success")]
    Success,
    #[display(fmt = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The structured report of a stage operation.
pub struct StageReport {
    pub status: ReportStatus,
    pub message: String,
    /// Operation specific fields.
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl StageReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Success,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Error,
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Adds an operation specific field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        // serializing plain data into a json value doesn't fail
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Validate, Serialize, Deserialize)]
/// The arguments of the data collection.
pub struct CollectArgs {
    #[validate(length(min = 1))]
    pub sources: Vec<String>,
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Validate, Serialize, Deserialize)]
#[validate(schema(function = "validate_ratio"))]
/// The arguments of the preprocessing.
pub struct PreprocessArgs {
    #[validate(range(min = 1))]
    pub participants: u32,
    pub train_ratio: f64,
}

fn validate_ratio(args: &PreprocessArgs) -> Result<(), ValidationError> {
    if 0. < args.train_ratio && args.train_ratio < 1. {
        Ok(())
    } else {
        Err(ValidationError::new("train ratio out of (0, 1)"))
    }
}

#[derive(Debug, Clone, PartialEq, Validate, Serialize, Deserialize)]
#[validate(schema(function = "validate_hyperparameters"))]
/// The arguments of the local training of one participant.
pub struct TrainArgs {
    // `range` requires the primitive types, not their aliases
    #[validate(range(min = 1))]
    pub participant: u32,
    #[validate(range(min = 1))]
    pub round: u64,
    /// The round of the aggregated adapter to start from. `None` starts from a fresh adapter.
    pub baseline_round: Option<RoundId>,
    #[validate(range(min = 1))]
    pub epochs: u32,
    #[validate(range(min = 1))]
    pub batch_size: u32,
    pub learning_rate: f64,
    pub method: AggregationMethod,
    pub fedprox_mu: f64,
}

fn validate_hyperparameters(args: &TrainArgs) -> Result<(), ValidationError> {
    if !(args.learning_rate.is_finite() && 0. < args.learning_rate) {
        return Err(ValidationError::new("learning rate must be positive"));
    }
    if !(args.fedprox_mu.is_finite() && 0. <= args.fedprox_mu) {
        return Err(ValidationError::new("proximal term must not be negative"));
    }
    match args.baseline_round {
        Some(baseline) if baseline >= args.round => {
            Err(ValidationError::new("baseline must precede the round"))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Validate, Serialize, Deserialize)]
/// The arguments of the evaluation of an aggregated adapter.
pub struct EvaluateArgs {
    #[validate(range(min = 1))]
    pub round: u64,
}

#[async_trait]
/// The operations a round is made of.
///
/// Implementations must be idempotent per identity: running an operation again for the same
/// participant and round replaces its outputs.
pub trait Stage
where
    Self: Send + Sync + 'static,
{
    /// Collects the raw data. Only executed in the first round.
    async fn collect(&self, args: CollectArgs) -> Result<StageReport, StageError>;

    /// Splits the collected data into per-participant shards. Only executed in the first round.
    async fn preprocess(&self, args: PreprocessArgs) -> Result<StageReport, StageError>;

    /// Trains the local adapter of a participant and stores it.
    async fn train(&self, args: TrainArgs) -> Result<StageReport, StageError>;

    /// Evaluates the aggregated adapter of a round.
    async fn evaluate(&self, args: EvaluateArgs) -> Result<StageReport, StageError>;
}
