#![cfg_attr(docsrs, feature(doc_cfg))]
//! # FedLoRA: federated fine-tuning of low-rank adapters
//!
//! The coordinator of a federated LoRA fine-tuning workflow. In every round several participants
//! train a low-rank adapter on their private data, the coordinator aggregates the local adapters
//! into a single global adapter and the participants continue from it in the next round.
//!
//! The crate is organized as follows:
//! - [`orchestrator`]: drives the rounds of a run and persists their results.
//! - [`state_machine`]: executes the phases of a single round.
//! - [`stages`]: the interface to the collaborators which collect data and train adapters.
//! - [`storage`]: the versioned artifact store, its index and the round results.
//! - [`settings`]: the configuration of the coordinator.
//! - [`signal`]: operator interrupts.
//!
//! The aggregation of adapters lives in the `fedlora-core` crate.

#[macro_use]
extern crate tracing;

pub mod orchestrator;
pub mod settings;
pub mod signal;
pub mod stages;
pub mod state_machine;
pub mod storage;
