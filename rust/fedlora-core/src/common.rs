//! Identifiers shared by the coordinator and the participants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The number of a federation round.
///
/// Rounds start at `1` and are strictly increasing; a round number uniquely identifies one full
/// orchestration cycle.
pub type RoundId = u64;

/// The stable identifier of a participant, in `1..=P`.
pub type ParticipantId = u32;

/// The first round of a federation.
pub const FIRST_ROUND: RoundId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The owner of an adapter.
pub enum Owner {
    /// A local adapter trained by a participant on its private data.
    Participant(ParticipantId),
    /// An aggregated adapter produced by the coordinator.
    Global,
}

impl Owner {
    /// Gets the participant id, if the adapter is a local one.
    pub fn participant(&self) -> Option<ParticipantId> {
        match self {
            Owner::Participant(id) => Some(*id),
            Owner::Global => None,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Participant(id) => write!(f, "participant {}", id),
            Owner::Global => write!(f, "global"),
        }
    }
}
