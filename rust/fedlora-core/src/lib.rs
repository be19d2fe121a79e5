#![cfg_attr(docsrs, feature(doc_cfg))]
//! `fedlora-core` provides the basic building blocks of a federated LoRA fine-tuning round:
//!
//! - [`adapter`]: the low-rank adapters exchanged between the participants and the coordinator.
//! - [`aggregation`]: the weighted combination of local adapters into a global adapter.
//! - [`common`]: round and participant identifiers.
//!
//! The crate is free of any I/O. Persistence, stage execution and round orchestration live in
//! `fedlora-server`.

pub mod adapter;
pub mod aggregation;
pub mod common;

pub use self::{
    adapter::{Adapter, AdapterWeights, LoraConfig, LoraLayout, Tensor, TrainingMetrics},
    aggregation::{aggregate, Aggregation, AggregationError, AggregationMethod},
    common::{Owner, ParticipantId, RoundId, FIRST_ROUND},
};
