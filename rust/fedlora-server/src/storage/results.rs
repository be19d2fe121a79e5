//! Persistence of round results.

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fedlora_core::{AggregationMethod, RoundId};

use crate::storage::{
    fs::{read_json, write_json},
    StorageError,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The status of a round.
pub enum RoundStatus {
    #[display(fmt = "in_progress")]
    InProgress,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The audit record of a round.
pub struct RoundResult {
    pub round: RoundId,
    pub timestamp: DateTime<Utc>,
    pub status: RoundStatus,
    /// The reports of the executed phases, keyed by phase.
    pub stage_reports: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
}

impl RoundResult {
    pub fn new(round: RoundId) -> Self {
        Self {
            round,
            timestamp: Utc::now(),
            status: RoundStatus::InProgress,
            stage_reports: BTreeMap::new(),
            error: None,
            failed_phase: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RoundStatus::Completed
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The status of a run.
pub enum RunStatus {
    #[display(fmt = "in_progress")]
    InProgress,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "error")]
    Error,
    #[display(fmt = "interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The configuration a run was started with.
pub struct RunConfig {
    pub num_participants: u32,
    pub num_rounds: u64,
    pub start_round: RoundId,
    pub base_model: String,
    pub lora_r: usize,
    pub lora_alpha: f64,
    pub local_epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    pub aggregation_method: AggregationMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The cumulative record of a run.
pub struct RunSummary {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub config: RunConfig,
    pub rounds: Vec<RoundResult>,
}

impl RunSummary {
    pub fn new(config: RunConfig) -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::InProgress,
            config,
            rounds: Vec::new(),
        }
    }

    /// Gets the last round that completed.
    pub fn last_completed_round(&self) -> Option<RoundId> {
        self.rounds
            .iter()
            .filter(|result| result.is_completed())
            .map(|result| result.round)
            .max()
    }
}

#[derive(Debug, Clone)]
/// The results directory holding `fl_results_<round>.json` and `fl_results_final.json`.
pub struct ResultsLog {
    dir: PathBuf,
}

impl ResultsLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn round_path(&self, round: RoundId) -> PathBuf {
        self.dir.join(format!("fl_results_{}.json", round))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("fl_results_final.json")
    }

    /// Writes the result of a round.
    pub async fn write_round(&self, result: &RoundResult) -> Result<(), StorageError> {
        write_json(&self.round_path(result.round), result).await
    }

    /// Writes the run summary.
    pub async fn write_summary(&self, summary: &RunSummary) -> Result<(), StorageError> {
        write_json(&self.summary_path(), summary).await
    }

    pub async fn read_round(&self, round: RoundId) -> Result<RoundResult, StorageError> {
        read_json(&self.round_path(round)).await
    }

    pub async fn read_summary(&self) -> Result<RunSummary, StorageError> {
        read_json(&self.summary_path()).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn config() -> RunConfig {
        RunConfig {
            num_participants: 3,
            num_rounds: 2,
            start_round: 1,
            base_model: "base".into(),
            lora_r: 8,
            lora_alpha: 16.,
            local_epochs: 3,
            batch_size: 4,
            learning_rate: 2e-4,
            aggregation_method: AggregationMethod::FedAvg,
        }
    }

    #[tokio::test]
    async fn test_round_and_summary_files() {
        let dir = tempdir().unwrap();
        let log = ResultsLog::new(dir.path());

        let mut result = RoundResult::new(1);
        result.status = RoundStatus::Completed;
        result
            .stage_reports
            .insert("training".into(), json!([{ "status": "success" }]));
        log.write_round(&result).await.unwrap();

        let mut summary = RunSummary::new(config());
        summary.rounds.push(result.clone());
        log.write_summary(&summary).await.unwrap();

        assert!(dir.path().join("fl_results_1.json").exists());
        assert_eq!(log.read_round(1).await.unwrap(), result);
        let read = log.read_summary().await.unwrap();
        assert_eq!(read.status, RunStatus::InProgress);
        assert_eq!(read.last_completed_round(), Some(1));
        assert!(matches!(
            log.read_round(2).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_status_format() {
        let result = RoundResult::new(4);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], json!("in_progress"));
        assert!(value.get("error").is_none());
        assert_eq!(RunStatus::Interrupted.to_string(), "interrupted");
        assert_eq!(
            serde_json::to_value(config()).unwrap()["aggregation_method"],
            json!("fedavg")
        );
    }
}
