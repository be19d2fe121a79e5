//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! configuration file can be found in the `configs/` directory located in the repository root.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
    Serialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use fedlora_core::{AggregationMethod, LoraConfig, LoraLayout};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub federation: FederationSettings,
    #[validate]
    pub model: ModelSettings,
    #[validate]
    pub collection: CollectionSettings,
    pub storage: StorageSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("fedlora")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Validate, Deserialize, Serialize)]
#[validate(schema(function = "validate_federation"))]
/// The federation settings.
pub struct FederationSettings {
    /// The number of participants. Participants are identified by `1..=participants`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// participants = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLORA_FEDERATION__PARTICIPANTS=3
    /// ```
    #[validate(range(min = 1))]
    pub participants: u32,

    /// The number of rounds of a run.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// rounds = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLORA_FEDERATION__ROUNDS=10
    /// ```
    #[validate(range(min = 1))]
    pub rounds: u64,

    /// The number of local epochs per round.
    #[validate(range(min = 1))]
    pub local_epochs: u32,

    /// The local batch size.
    #[validate(range(min = 1))]
    pub batch_size: u32,

    /// The local learning rate. Must be positive.
    pub learning_rate: f64,

    /// The aggregation method, one of `weighted_average`, `fedavg` or `fedprox`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// aggregation_method = "fedprox"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLORA_FEDERATION__AGGREGATION_METHOD=fedprox
    /// ```
    pub aggregation_method: AggregationMethod,

    /// The strength `mu` of the proximal term. Only used by `fedprox`.
    #[serde(default)]
    pub fedprox_mu: f64,

    /// The maximal number of participants that train at the same time.
    #[validate(range(min = 1))]
    pub max_concurrent_training: usize,

    /// The seed of the simulated local training.
    #[serde(default)]
    pub seed: u64,
}

impl FederationSettings {
    /// Checks the floating point settings.
    fn validate_federation(&self) -> Result<(), ValidationError> {
        // the validate attribute only accepts literals, therefore we check the invariants here
        if self.learning_rate.is_finite()
            && 0. < self.learning_rate
            && self.fedprox_mu.is_finite()
            && 0. <= self.fedprox_mu
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid learning rate or proximal term"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_federation(s: &FederationSettings) -> Result<(), ValidationError> {
    s.validate_federation()
}

#[derive(Debug, Clone, Validate, Deserialize, Serialize)]
#[validate(schema(function = "validate_model"))]
/// The adapter settings.
pub struct ModelSettings {
    /// The identifier of the frozen base model.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// base_model = "mistralai/Mistral-7B-v0.1"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLORA_MODEL__BASE_MODEL=mistralai/Mistral-7B-v0.1
    /// ```
    #[validate(length(min = 1))]
    pub base_model: String,
    /// The LoRA rank.
    #[validate(range(min = 1))]
    pub lora_r: usize,
    /// The LoRA alpha.
    pub lora_alpha: f64,
    /// The targeted modules of each layer.
    #[validate(length(min = 1))]
    pub target_modules: Vec<String>,
    #[validate(range(min = 1))]
    pub num_layers: usize,
    pub hidden_size: usize,
    #[validate(range(min = 1))]
    pub max_seq_length: usize,
}

impl ModelSettings {
    /// Checks that the adapter fits into the targeted modules.
    fn validate_model(&self) -> Result<(), ValidationError> {
        if self.lora_r <= self.hidden_size && self.lora_alpha.is_finite() && 1. <= self.lora_alpha {
            Ok(())
        } else {
            Err(ValidationError::new("invalid lora rank or alpha"))
        }
    }

    /// Gets the low-rank configuration of the adapters.
    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            base_model: self.base_model.clone(),
            rank: self.lora_r,
            alpha: self.lora_alpha,
        }
    }

    /// Gets the placement of the adapter matrices.
    pub fn layout(&self) -> LoraLayout {
        LoraLayout {
            target_modules: self.target_modules.clone(),
            num_layers: self.num_layers,
            hidden_size: self.hidden_size,
        }
    }
}

/// A wrapper for validate derive.
fn validate_model(s: &ModelSettings) -> Result<(), ValidationError> {
    s.validate_model()
}

#[derive(Debug, Clone, Validate, Deserialize, Serialize)]
#[validate(schema(function = "validate_collection"))]
/// The data collection settings.
pub struct CollectionSettings {
    /// The sources to collect posts from.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [collection]
    /// sources = ["python", "machinelearning"]
    /// ```
    #[validate(length(min = 1))]
    pub sources: Vec<String>,
    /// The number of posts collected per source. The upstream API serves at most `100`.
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
    /// The fraction of the samples used for training, the rest is held out for evaluation.
    pub train_ratio: f64,
}

impl CollectionSettings {
    fn validate_collection(&self) -> Result<(), ValidationError> {
        if 0. < self.train_ratio && self.train_ratio < 1. {
            Ok(())
        } else {
            Err(ValidationError::new("invalid train ratio"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_collection(s: &CollectionSettings) -> Result<(), ValidationError> {
    s.validate_collection()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// The storage settings.
pub struct StorageSettings {
    /// The root directory. It holds the `models/`, `data/` and `results/` directories.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// root = "./fedlora"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLORA_STORAGE__ROOT=/var/lib/fedlora
    /// ```
    pub root: PathBuf,
}

impl StorageSettings {
    /// Gets the directory of the adapters and the index.
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    /// Gets the directory of the collected and preprocessed data.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Gets the directory of the round results.
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLORA_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
