//! The artifact index.
//!
//! The index maps the logical identity of an adapter to its directory and metadata. It is kept in
//! memory and written through to `index.json` as a complete snapshot on every [`Index::add()`].

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{
    fs::{read_json, write_json},
    layout::{ArtifactId, ArtifactKind},
    StorageError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// An index entry.
pub struct IndexEntry {
    /// The artifact directory, relative to the models directory.
    pub path: PathBuf,
    pub round: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<u32>,
    pub stored_at: DateTime<Utc>,
    /// The content of the artifact's metadata file.
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexData {
    local: BTreeMap<String, IndexEntry>,
    aggregated: BTreeMap<String, IndexEntry>,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl IndexData {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            local: BTreeMap::new(),
            aggregated: BTreeMap::new(),
            created_at: now,
            last_updated: now,
        }
    }

    fn section(&self, kind: ArtifactKind) -> &BTreeMap<String, IndexEntry> {
        match kind {
            ArtifactKind::Local => &self.local,
            ArtifactKind::Aggregated => &self.aggregated,
        }
    }

    fn section_mut(&mut self, kind: ArtifactKind) -> &mut BTreeMap<String, IndexEntry> {
        match kind {
            ArtifactKind::Local => &mut self.local,
            ArtifactKind::Aggregated => &mut self.aggregated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Aggregate counts of the index.
pub struct IndexStats {
    pub total_local: usize,
    pub total_aggregated: usize,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug)]
/// The write-through artifact index.
pub struct Index {
    path: PathBuf,
    data: IndexData,
}

impl Index {
    /// Loads the index at `path`.
    ///
    /// Returns `Ok(None)` if there is no index file yet.
    ///
    /// # Errors
    /// Fails if the index file can't be read or parsed.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Option<Self>, StorageError> {
        let path = path.into();
        match read_json::<IndexData>(&path).await {
            Ok(data) => Ok(Some(Self { path, data })),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Creates an index from the given entries and persists it.
    pub async fn create(
        path: impl Into<PathBuf>,
        entries: impl IntoIterator<Item = (ArtifactId, IndexEntry)>,
    ) -> Result<Self, StorageError> {
        let mut data = IndexData::new();
        for (id, entry) in entries {
            data.section_mut(id.kind()).insert(id.key(), entry);
        }
        let index = Self {
            path: path.into(),
            data,
        };
        index.persist().await?;
        Ok(index)
    }

    /// Adds or replaces the entry of an artifact and persists the index before returning.
    ///
    /// If the index can't be persisted the in-memory index is left unchanged.
    pub async fn add(&mut self, id: ArtifactId, entry: IndexEntry) -> Result<(), StorageError> {
        let last_updated = self.data.last_updated;
        let previous = self.data.section_mut(id.kind()).insert(id.key(), entry);
        self.data.last_updated = Utc::now();

        if let Err(err) = self.persist().await {
            let section = self.data.section_mut(id.kind());
            match previous {
                Some(previous) => section.insert(id.key(), previous),
                None => section.remove(&id.key()),
            };
            self.data.last_updated = last_updated;
            return Err(err);
        }
        debug!("indexed {}", id);
        Ok(())
    }

    /// Gets the entry of an artifact.
    pub fn get(&self, id: &ArtifactId) -> Option<&IndexEntry> {
        self.data.section(id.kind()).get(&id.key())
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            total_local: self.data.local.len(),
            total_aggregated: self.data.aggregated.len(),
            created_at: self.data.created_at,
            last_updated: self.data.last_updated,
        }
    }

    async fn persist(&self) -> Result<(), StorageError> {
        write_json(&self.path, &self.data).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::fs;

    use super::*;

    fn entry(round: u64) -> IndexEntry {
        IndexEntry {
            path: PathBuf::from(format!("aggregated/aggregated_lora_model_round_{}", round)),
            round,
            participant: None,
            stored_at: Utc::now(),
            metadata: json!({ "round": round }),
        }
    }

    #[tokio::test]
    async fn test_create_add_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        assert!(Index::load(&path).await.unwrap().is_none());

        let mut index = Index::create(&path, Vec::new()).await.unwrap();
        assert!(fs::metadata(&path).await.is_ok());
        let created = index.stats();
        assert_eq!(created.total_local, 0);
        assert_eq!(created.total_aggregated, 0);

        let id = ArtifactId::Aggregated { round: 1 };
        index.add(id, entry(1)).await.unwrap();
        index.add(id, entry(1)).await.unwrap();
        index
            .add(
                ArtifactId::Local {
                    participant: 2,
                    round: 1,
                },
                entry(1),
            )
            .await
            .unwrap();

        let reloaded = Index::load(&path).await.unwrap().unwrap();
        assert_eq!(reloaded.get(&id), index.get(&id));
        let stats = reloaded.stats();
        assert_eq!(stats.total_aggregated, 1);
        assert_eq!(stats.total_local, 1);
        assert_eq!(stats.created_at, created.created_at);
        assert!(stats.last_updated >= created.last_updated);
    }

    #[tokio::test]
    async fn test_load_corrupt_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        fs::write(&path, b"{ not json").await.unwrap();
        assert!(matches!(
            Index::load(&path).await,
            Err(StorageError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        let mut index = Index::create(&path, Vec::new()).await.unwrap();

        // a directory in place of the index file makes the rename fail
        fs::remove_file(&path).await.unwrap();
        fs::create_dir(&path).await.unwrap();
        fs::write(path.join("blocker"), b"").await.unwrap();

        let id = ArtifactId::Aggregated { round: 1 };
        assert!(index.add(id, entry(1)).await.is_err());
        assert!(index.get(&id).is_none());
    }
}
