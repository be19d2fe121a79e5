//! Naming of the artifact directories.
//!
//! ```text
//! models/
//! ├── index.json
//! ├── local/
//! │   └── agent_<participant>_lora_model/
//! │       └── round_<round>/
//! │           ├── adapter.bin
//! │           └── metadata.json
//! └── aggregated/
//!     └── aggregated_lora_model_round_<round>/
//!         ├── adapter.bin
//!         └── aggregation_metadata.json
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use fedlora_core::{ParticipantId, RoundId};

pub const ADAPTER_FILE: &str = "adapter.bin";
pub const LOCAL_METADATA_FILE: &str = "metadata.json";
pub const AGGREGATION_METADATA_FILE: &str = "aggregation_metadata.json";
pub const INDEX_FILE: &str = "index.json";

const LOCAL_DIR: &str = "local";
const AGGREGATED_DIR: &str = "aggregated";
const AGGREGATED_PREFIX: &str = "aggregated_lora_model_round_";
const AGENT_PREFIX: &str = "agent_";
const AGENT_SUFFIX: &str = "_lora_model";
const ROUND_PREFIX: &str = "round_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The kind of a stored artifact.
pub enum ArtifactKind {
    Local,
    Aggregated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// The logical identity of a stored adapter.
pub enum ArtifactId {
    Local {
        participant: ParticipantId,
        round: RoundId,
    },
    Aggregated {
        round: RoundId,
    },
}

impl ArtifactId {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactId::Local { .. } => ArtifactKind::Local,
            ArtifactId::Aggregated { .. } => ArtifactKind::Aggregated,
        }
    }

    pub fn round(&self) -> RoundId {
        match self {
            ArtifactId::Local { round, .. } | ArtifactId::Aggregated { round } => *round,
        }
    }

    /// Gets the key of the artifact within the index section of its kind.
    pub fn key(&self) -> String {
        match self {
            ArtifactId::Local { participant, round } => {
                format!("agent_{}_round_{}", participant, round)
            }
            ArtifactId::Aggregated { round } => format!("round_{}", round),
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactId::Local { participant, round } => {
                write!(f, "local adapter of participant {} in round {}", participant, round)
            }
            ArtifactId::Aggregated { round } => write!(f, "aggregated adapter of round {}", round),
        }
    }
}

#[derive(Debug, Clone)]
/// The directory layout below the models directory.
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn local_root(&self) -> PathBuf {
        self.root.join(LOCAL_DIR)
    }

    pub fn aggregated_root(&self) -> PathBuf {
        self.root.join(AGGREGATED_DIR)
    }

    /// Gets the directory holding all local adapters of a participant.
    pub fn participant_dir(&self, participant: ParticipantId) -> PathBuf {
        self.local_root()
            .join(format!("{}{}{}", AGENT_PREFIX, participant, AGENT_SUFFIX))
    }

    /// Gets the directory of an artifact.
    pub fn artifact_dir(&self, id: &ArtifactId) -> PathBuf {
        match id {
            ArtifactId::Local { participant, round } => self
                .participant_dir(*participant)
                .join(format!("{}{}", ROUND_PREFIX, round)),
            ArtifactId::Aggregated { round } => self
                .aggregated_root()
                .join(format!("{}{}", AGGREGATED_PREFIX, round)),
        }
    }

    /// Gets the path of an artifact relative to the models directory.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Gets the metadata file name of an artifact kind.
pub fn metadata_file(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Local => LOCAL_METADATA_FILE,
        ArtifactKind::Aggregated => AGGREGATION_METADATA_FILE,
    }
}

/// Parses the round of an aggregated adapter directory name.
///
/// Only names made of the fixed prefix followed by decimal digits match. Anything else, e.g.
/// staging directories or stray files, is ignored.
pub fn parse_aggregated_dir(name: &str) -> Option<RoundId> {
    name.strip_prefix(AGGREGATED_PREFIX).and_then(parse_number)
}

/// Parses the participant of a participant directory name.
pub fn parse_participant_dir(name: &str) -> Option<ParticipantId> {
    name.strip_prefix(AGENT_PREFIX)
        .and_then(|rest| rest.strip_suffix(AGENT_SUFFIX))
        .and_then(parse_number)
}

/// Parses the round of a local round directory name.
pub fn parse_round_dir(name: &str) -> Option<RoundId> {
    name.strip_prefix(ROUND_PREFIX).and_then(parse_number)
}

fn parse_number<N: std::str::FromStr>(digits: &str) -> Option<N> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
