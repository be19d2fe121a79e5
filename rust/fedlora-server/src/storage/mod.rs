//! The versioned artifact store.
//!
//! Local adapters are stored per participant and round, aggregated adapters per round. Every
//! adapter directory is written atomically and only then registered in the [`Index`], so that
//! neither a directory scan nor an index lookup can observe a partially written artifact.
//!
//! The current global adapter is found by scanning the aggregated adapter directories and taking
//! the one with the highest round, see [`ArtifactStore::latest_round()`]. There is no separate
//! pointer to it.

pub mod fs;
pub mod index;
pub mod layout;
pub mod results;

use std::{io, panic, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use fedlora_core::{
    Adapter,
    AggregationMethod,
    ParticipantId,
    RoundId,
    TrainingMetrics,
    FIRST_ROUND,
};

pub use self::{
    index::{Index, IndexEntry, IndexStats},
    layout::{ArtifactId, ArtifactKind, Layout},
    results::{ResultsLog, RoundResult, RoundStatus, RunConfig, RunStatus, RunSummary},
};
use self::{
    fs::{io_error, list_dirs, read_json, swap_dir},
    layout::{
        metadata_file,
        parse_aggregated_dir,
        parse_participant_dir,
        parse_round_dir,
        ADAPTER_FILE,
    },
};
use crate::settings::StorageSettings;

/// Errors of the artifact store.
#[derive(Display, Error, Debug)]
pub enum StorageError {
    /// artifact not found: {path:?}
    NotFound { path: PathBuf },
    /// i/o error on {path:?}: {source}
    Io { path: PathBuf, source: io::Error },
    /// invalid json in {path:?}: {source}
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// invalid adapter file {path:?}: {source}
    Adapter { path: PathBuf, source: bincode::Error },
    /// {path:?} holds {found} instead of the {expected}
    Mismatch {
        path: PathBuf,
        expected: ArtifactId,
        found: String,
    },
    /// write of {path:?} was aborted
    Aborted { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The metadata of a local adapter, stored as `metadata.json` next to it.
pub struct LocalMetadata {
    pub participant_id: ParticipantId,
    pub round: RoundId,
    pub base_model: String,
    pub training_method: String,
    pub lora_r: usize,
    pub lora_alpha: f64,
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f64,
    pub aggregation_method: AggregationMethod,
    /// The aggregated adapter the local training started from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<PathBuf>,
    pub training_data: PathBuf,
    pub metrics: TrainingMetrics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The metadata of an aggregated adapter, stored as `aggregation_metadata.json` next to it.
pub struct AggregationMetadata {
    pub round: RoundId,
    pub aggregation_method: AggregationMethod,
    pub models_aggregated: usize,
    /// The directories of the aggregated local adapters, in aggregation order.
    pub model_paths: Vec<PathBuf>,
    pub weights: Vec<f64>,
    pub base_model: String,
    pub lora_r: usize,
    pub metrics: TrainingMetrics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The outcome of the latest round discovery.
pub enum Discovery {
    /// The highest round with an aggregated adapter.
    Found(RoundId),
    /// No aggregated adapter exists.
    NotFound,
}

impl Discovery {
    /// Gets the discovered round, defaulting to the first round.
    pub fn round(&self) -> RoundId {
        match self {
            Discovery::Found(round) => *round,
            Discovery::NotFound => FIRST_ROUND,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Discovery::Found(_))
    }
}

#[derive(Debug, Clone)]
/// The artifact store.
///
/// Cloning is cheap, all clones share the same index.
pub struct ArtifactStore {
    layout: Layout,
    index: Arc<Mutex<Index>>,
}

impl ArtifactStore {
    /// Opens the store below the models directory of the settings.
    ///
    /// The index is loaded if it exists, created otherwise. An unreadable index is rebuilt from
    /// the metadata files of the stored artifacts.
    pub async fn open(settings: &StorageSettings) -> Result<Self, StorageError> {
        Self::open_at(settings.models_dir()).await
    }

    /// Opens the store below the given models directory.
    pub async fn open_at(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let layout = Layout::new(root);
        let root = layout.root().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(io_error(&root))?;

        let index_path = layout.index_path();
        let index = match Index::load(&index_path).await {
            Ok(Some(index)) => index,
            Ok(None) => {
                info!("creating artifact index {:?}", index_path);
                Index::create(&index_path, Vec::new()).await?
            }
            Err(err) => {
                warn!("rebuilding unreadable artifact index: {}", err);
                let entries = scan(&layout).await?;
                Index::create(&index_path, entries).await?
            }
        };

        Ok(Self {
            layout,
            index: Arc::new(Mutex::new(index)),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Gets the directory of an artifact.
    pub fn artifact_dir(&self, id: &ArtifactId) -> PathBuf {
        self.layout.artifact_dir(id)
    }

    /// Stores a local adapter, replacing a previous adapter of the same participant and round.
    pub async fn put_local(
        &self,
        adapter: &Adapter,
        metadata: &LocalMetadata,
    ) -> Result<PathBuf, StorageError> {
        let id = ArtifactId::Local {
            participant: metadata.participant_id,
            round: metadata.round,
        };
        self.put(id, adapter, metadata).await
    }

    /// Stores the aggregated adapter of a round, replacing a previous one of the same round.
    pub async fn put_aggregated(
        &self,
        adapter: &Adapter,
        metadata: &AggregationMetadata,
    ) -> Result<PathBuf, StorageError> {
        let id = ArtifactId::Aggregated {
            round: metadata.round,
        };
        self.put(id, adapter, metadata).await
    }

    async fn put<M: Serialize>(
        &self,
        id: ArtifactId,
        adapter: &Adapter,
        metadata: &M,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.layout.artifact_dir(&id);
        let found = identity(adapter);
        if found != id {
            return Err(StorageError::Mismatch {
                path: dir,
                expected: id,
                found: found.to_string(),
            });
        }

        let adapter_bytes = bincode::serialize(adapter).map_err(|source| StorageError::Adapter {
            path: dir.join(ADAPTER_FILE),
            source,
        })?;
        let metadata = serde_json::to_value(metadata).map_err(|source| StorageError::Json {
            path: dir.join(metadata_file(id.kind())),
            source,
        })?;
        let metadata_bytes =
            serde_json::to_vec_pretty(&metadata).map_err(|source| StorageError::Json {
                path: dir.join(metadata_file(id.kind())),
                source,
            })?;
        let files = vec![
            (ADAPTER_FILE, adapter_bytes),
            (metadata_file(id.kind()), metadata_bytes),
        ];

        // the spawned write runs to completion even if the caller is dropped midway
        let store = self.clone();
        match tokio::spawn(async move { store.write(id, files, metadata).await }).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(_) => Err(StorageError::Aborted { path: dir }),
        }
    }

    /// Swaps the artifact directory into place and indexes it. The swap is rolled back if the
    /// index can't be persisted.
    async fn write(
        &self,
        id: ArtifactId,
        files: Vec<(&'static str, Vec<u8>)>,
        metadata: serde_json::Value,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.layout.artifact_dir(&id);
        // the index lock also serializes concurrent writers of the same artifact
        let mut index = self.index.lock().await;
        let swap = swap_dir(&dir, &files).await?;
        if let Err(err) = index.add(id, self.entry(&id, metadata)).await {
            if let Err(rollback) = swap.rollback().await {
                error!("failed to roll back {:?}: {}", dir, rollback);
            }
            return Err(err);
        }
        swap.commit().await;
        debug!("stored {} in {:?}", id, dir);
        Ok(dir)
    }

    fn entry(&self, id: &ArtifactId, metadata: serde_json::Value) -> IndexEntry {
        IndexEntry {
            path: self.layout.relative(&self.layout.artifact_dir(id)),
            round: id.round(),
            participant: match id {
                ArtifactId::Local { participant, .. } => Some(*participant),
                ArtifactId::Aggregated { .. } => None,
            },
            stored_at: Utc::now(),
            metadata,
        }
    }

    /// Loads the local adapter of a participant in a round.
    pub async fn get_local(
        &self,
        participant: ParticipantId,
        round: RoundId,
    ) -> Result<Adapter, StorageError> {
        self.get(ArtifactId::Local { participant, round }).await
    }

    /// Loads the aggregated adapter of a round.
    pub async fn get_aggregated(&self, round: RoundId) -> Result<Adapter, StorageError> {
        self.get(ArtifactId::Aggregated { round }).await
    }

    async fn get(&self, id: ArtifactId) -> Result<Adapter, StorageError> {
        let path = self.layout.artifact_dir(&id).join(ADAPTER_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(io_error(&path))?;
        let adapter: Adapter = bincode::deserialize(&bytes).map_err(|source| StorageError::Adapter {
            path: path.clone(),
            source,
        })?;

        let found = identity(&adapter);
        if found != id {
            return Err(StorageError::Mismatch {
                path,
                expected: id,
                found: found.to_string(),
            });
        }
        Ok(adapter)
    }

    /// Loads the metadata of an aggregated adapter.
    pub async fn aggregation_metadata(
        &self,
        round: RoundId,
    ) -> Result<AggregationMetadata, StorageError> {
        let id = ArtifactId::Aggregated { round };
        read_json(&self.layout.artifact_dir(&id).join(metadata_file(id.kind()))).await
    }

    /// Discovers the highest round with an aggregated adapter.
    ///
    /// Directory names that don't follow the aggregated adapter naming are ignored. Gaps left by
    /// failed rounds don't matter: given the rounds `1`, `2` and `4`, the result is `4`.
    pub async fn latest_round(&self) -> Result<Discovery, StorageError> {
        let latest = list_dirs(&self.layout.aggregated_root())
            .await?
            .iter()
            .filter_map(|name| parse_aggregated_dir(name))
            .max();
        Ok(latest.map_or(Discovery::NotFound, Discovery::Found))
    }

    /// Gets the index entry of an artifact.
    pub async fn lookup(&self, id: &ArtifactId) -> Option<IndexEntry> {
        self.index.lock().await.get(id).cloned()
    }

    pub async fn stats(&self) -> IndexStats {
        self.index.lock().await.stats()
    }
}

/// Gets the artifact identity an adapter belongs to.
fn identity(adapter: &Adapter) -> ArtifactId {
    match adapter.owner.participant() {
        Some(participant) => ArtifactId::Local {
            participant,
            round: adapter.round,
        },
        None => ArtifactId::Aggregated {
            round: adapter.round,
        },
    }
}

/// Collects the index entries of all stored artifacts from their metadata files.
async fn scan(layout: &Layout) -> Result<Vec<(ArtifactId, IndexEntry)>, StorageError> {
    let mut ids = Vec::new();
    for name in list_dirs(&layout.aggregated_root()).await? {
        if let Some(round) = parse_aggregated_dir(&name) {
            ids.push(ArtifactId::Aggregated { round });
        }
    }
    for name in list_dirs(&layout.local_root()).await? {
        if let Some(participant) = parse_participant_dir(&name) {
            for name in list_dirs(&layout.participant_dir(participant)).await? {
                if let Some(round) = parse_round_dir(&name) {
                    ids.push(ArtifactId::Local { participant, round });
                }
            }
        }
    }

    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        let dir = layout.artifact_dir(&id);
        match read_json::<serde_json::Value>(&dir.join(metadata_file(id.kind()))).await {
            Ok(metadata) => entries.push((
                id,
                IndexEntry {
                    path: layout.relative(&dir),
                    round: id.round(),
                    participant: match id {
                        ArtifactId::Local { participant, .. } => Some(participant),
                        ArtifactId::Aggregated { .. } => None,
                    },
                    stored_at: Utc::now(),
                    metadata,
                },
            )),
            Err(err) => warn!("skipping {} while rebuilding the index: {}", id, err),
        }
    }
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;

    use ndarray::array;
    use tempfile::tempdir;

    use fedlora_core::{LoraConfig, Owner};

    use super::*;

    pub fn adapter(owner: Owner, round: RoundId, value: f64) -> Adapter {
        Adapter {
            config: LoraConfig {
                base_model: "base".into(),
                rank: 1,
                alpha: 2.,
            },
            owner,
            round,
            metrics: TrainingMetrics {
                num_samples: 10,
                ..Default::default()
            },
            weights: vec![("a".to_string(), array![[value, 1.]].into_dyn())]
                .into_iter()
                .collect(),
        }
    }

    pub fn aggregation_metadata(round: RoundId) -> AggregationMetadata {
        AggregationMetadata {
            round,
            aggregation_method: AggregationMethod::WeightedAverage,
            models_aggregated: 1,
            model_paths: vec![PathBuf::from("local/agent_1_lora_model/round_1")],
            weights: vec![10.],
            base_model: "base".into(),
            lora_r: 1,
            metrics: TrainingMetrics::default(),
            created_at: Utc::now(),
        }
    }

    fn local_metadata(participant: ParticipantId, round: RoundId) -> LocalMetadata {
        LocalMetadata {
            participant_id: participant,
            round,
            base_model: "base".into(),
            training_method: "LoRA".into(),
            lora_r: 1,
            lora_alpha: 2.,
            epochs: 1,
            batch_size: 1,
            learning_rate: 0.1,
            aggregation_method: AggregationMethod::WeightedAverage,
            baseline: None,
            training_data: PathBuf::from("data/preprocessed/agent_1.json"),
            metrics: TrainingMetrics::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();

        let local = adapter(Owner::Participant(1), 1, 3.);
        let path = store.put_local(&local, &local_metadata(1, 1)).await.unwrap();
        assert_eq!(path, dir.path().join("local/agent_1_lora_model/round_1"));
        assert!(path.join("metadata.json").exists());
        assert_eq!(store.get_local(1, 1).await.unwrap(), local);

        let global = adapter(Owner::Global, 1, 4.);
        store
            .put_aggregated(&global, &aggregation_metadata(1))
            .await
            .unwrap();
        assert_eq!(store.get_aggregated(1).await.unwrap(), global);
        assert_eq!(store.aggregation_metadata(1).await.unwrap().weights, vec![10.]);

        let stats = store.stats().await;
        assert_eq!(stats.total_local, 1);
        assert_eq!(stats.total_aggregated, 1);
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();

        match store.get_local(2, 3).await {
            Err(StorageError::NotFound { path }) => {
                assert!(path.ends_with("local/agent_2_lora_model/round_3/adapter.bin"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(store.lookup(&ArtifactId::Aggregated { round: 1 }).await.is_none());
    }

    #[tokio::test]
    async fn test_indexed_path_exists() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();
        store
            .put_aggregated(&adapter(Owner::Global, 2, 1.), &aggregation_metadata(2))
            .await
            .unwrap();

        let entry = store
            .lookup(&ArtifactId::Aggregated { round: 2 })
            .await
            .unwrap();
        assert_eq!(entry.round, 2);
        assert!(dir.path().join(&entry.path).join("adapter.bin").exists());
        assert_eq!(entry.metadata["models_aggregated"], 1);
    }

    #[tokio::test]
    async fn test_latest_round_discovery() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();

        let discovery = store.latest_round().await.unwrap();
        assert_eq!(discovery, Discovery::NotFound);
        assert_eq!(discovery.round(), FIRST_ROUND);

        for round in [1, 2, 4] {
            store
                .put_aggregated(&adapter(Owner::Global, round, 1.), &aggregation_metadata(round))
                .await
                .unwrap();
        }
        // ignored by the scan
        tokio::fs::create_dir_all(dir.path().join("aggregated/aggregated_lora_model_round_x"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(dir.path().join("aggregated/.tmp-aggregated_lora_model_round_9"))
            .await
            .unwrap();

        assert_eq!(store.latest_round().await.unwrap(), Discovery::Found(4));
    }

    #[tokio::test]
    async fn test_rerun_overwrites() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();

        store
            .put_aggregated(&adapter(Owner::Global, 1, 1.), &aggregation_metadata(1))
            .await
            .unwrap();
        let second = adapter(Owner::Global, 1, 7.);
        store
            .put_aggregated(&second, &aggregation_metadata(1))
            .await
            .unwrap();

        assert_eq!(store.get_aggregated(1).await.unwrap(), second);
        assert_eq!(store.stats().await.total_aggregated, 1);
        assert_eq!(
            list_dirs(&dir.path().join("aggregated")).await.unwrap(),
            vec!["aggregated_lora_model_round_1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rebuild_corrupt_index() {
        let dir = tempdir().unwrap();
        {
            let store = ArtifactStore::open_at(dir.path()).await.unwrap();
            store
                .put_local(&adapter(Owner::Participant(3), 2, 1.), &local_metadata(3, 2))
                .await
                .unwrap();
            store
                .put_aggregated(&adapter(Owner::Global, 2, 1.), &aggregation_metadata(2))
                .await
                .unwrap();
        }
        tokio::fs::write(dir.path().join("index.json"), b"garbage")
            .await
            .unwrap();

        let store = ArtifactStore::open_at(dir.path()).await.unwrap();
        let stats = store.stats().await;
        assert_eq!(stats.total_local, 1);
        assert_eq!(stats.total_aggregated, 1);
        let entry = store
            .lookup(&ArtifactId::Local {
                participant: 3,
                round: 2,
            })
            .await
            .unwrap();
        assert_eq!(entry.participant, Some(3));
        assert_eq!(entry.metadata["training_method"], "LoRA");
    }

    #[tokio::test]
    async fn test_mismatching_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();

        // an adapter of round 1 can't be stored under round 2
        assert!(matches!(
            store
                .put_aggregated(&adapter(Owner::Global, 1, 1.), &aggregation_metadata(2))
                .await,
            Err(StorageError::Mismatch { .. })
        ));
        assert!(matches!(
            store
                .put_local(&adapter(Owner::Participant(2), 1, 1.), &local_metadata(1, 1))
                .await,
            Err(StorageError::Mismatch { .. })
        ));
        assert!(store.lookup(&ArtifactId::Aggregated { round: 2 }).await.is_none());
        assert!(!store.artifact_dir(&ArtifactId::Aggregated { round: 2 }).exists());
        assert!(!dir.path().join("local").exists());
        assert_eq!(store.stats().await.total_local, 0);

        // nor loaded from a directory of another round
        store
            .put_aggregated(&adapter(Owner::Global, 1, 1.), &aggregation_metadata(1))
            .await
            .unwrap();
        tokio::fs::rename(
            store.artifact_dir(&ArtifactId::Aggregated { round: 1 }),
            store.artifact_dir(&ArtifactId::Aggregated { round: 2 }),
        )
        .await
        .unwrap();
        assert!(matches!(
            store.get_aggregated(2).await,
            Err(StorageError::Mismatch { .. })
        ));
    }

    async fn block_index(dir: &Path) {
        let path = dir.join("index.json");
        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::create_dir(&path).await.unwrap();
        tokio::fs::write(path.join("blocker"), b"").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_index_write_removes_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();
        block_index(dir.path()).await;

        let err = store
            .put_aggregated(&adapter(Owner::Global, 1, 1.), &aggregation_metadata(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(!store.artifact_dir(&ArtifactId::Aggregated { round: 1 }).exists());
        assert!(store.lookup(&ArtifactId::Aggregated { round: 1 }).await.is_none());
        assert_eq!(store.latest_round().await.unwrap(), Discovery::NotFound);
        assert!(list_dirs(&dir.path().join("aggregated")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_index_write_restores_artifact() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();
        let first = adapter(Owner::Global, 1, 1.);
        store
            .put_aggregated(&first, &aggregation_metadata(1))
            .await
            .unwrap();
        let stored_at = store
            .lookup(&ArtifactId::Aggregated { round: 1 })
            .await
            .unwrap()
            .stored_at;
        block_index(dir.path()).await;

        assert!(store
            .put_aggregated(&adapter(Owner::Global, 1, 7.), &aggregation_metadata(1))
            .await
            .is_err());
        assert_eq!(store.get_aggregated(1).await.unwrap(), first);
        let entry = store
            .lookup(&ArtifactId::Aggregated { round: 1 })
            .await
            .unwrap();
        assert_eq!(entry.stored_at, stored_at);
        assert_eq!(
            list_dirs(&dir.path().join("aggregated")).await.unwrap(),
            vec!["aggregated_lora_model_round_1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_dropped_put_completes() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_at(dir.path()).await.unwrap();
        store
            .put_aggregated(&adapter(Owner::Global, 1, 1.), &aggregation_metadata(1))
            .await
            .unwrap();

        // the caller gives up on the replacement before it is written
        let second = adapter(Owner::Global, 1, 7.);
        let metadata = aggregation_metadata(1);
        let mut put = Box::pin(store.put_aggregated(&second, &metadata));
        assert!(futures::poll!(put.as_mut()).is_pending());
        drop(put);

        let mut replaced = false;
        for _ in 0..10_000 {
            tokio::task::yield_now().await;
            if let Ok(adapter) = store.get_aggregated(1).await {
                if adapter == second {
                    replaced = true;
                    break;
                }
            }
        }
        assert!(replaced);
        // the lookup waits for the index commit of the spawned write
        let entry = store
            .lookup(&ArtifactId::Aggregated { round: 1 })
            .await
            .unwrap();
        assert!(dir.path().join(&entry.path).join("adapter.bin").exists());
        assert_eq!(
            list_dirs(&dir.path().join("aggregated")).await.unwrap(),
            vec!["aggregated_lora_model_round_1".to_string()]
        );
    }
}
