//! The state machine that controls the execution of a single round.
//!
//! # Overview
//!
//! ```text
//! Pending ──► Collecting ──► Preprocessing ──► Training ──► Aggregating ──► Evaluating ──► Completed
//!    │            │               │      ▲         │             │               │
//!    │            │               │      │         │             │               │
//!    └────────────┴───────────────┴──────┼─────────┴─────────────┴───────────────┴──► Errored
//!    └───────── (round > 1) ─────────────┘
//! ```
//!
//! The [`StateMachine`] executes the phases of one round in a fixed order. Collection and
//! preprocessing only run in the first round. Any failing phase moves the round to the
//! [`Errored`] state, no further phase of the round runs and the failure is recorded in the
//! [`RoundResult`].
//!
//! # Phase states
//!
//! **Pending**
//!
//! Checks that the operator did not interrupt the run.
//!
//! **Collecting**, **Preprocessing**
//!
//! Collect the raw data and split it into the participants' shards through the [`Stage`].
//!
//! **Training**
//!
//! Trains the local adapters of all participants through the [`Stage`], concurrently up to
//! `federation.max_concurrent_training`. The interrupt is checked again before every
//! participant starts.
//!
//! **Aggregating**
//!
//! Aggregates the local adapters of the round into the aggregated adapter and stores it.
//!
//! **Evaluating**
//!
//! Evaluates the aggregated adapter through the [`Stage`].
//!
//! **Completed**, **Errored**
//!
//! Terminal states which finalize the [`RoundResult`].
//!
//! # Events
//!
//! Every phase publishes its [`PhaseName`] together with the round via the [`EventPublisher`].
//!
//! [`Errored`]: crate::state_machine::phases::Errored
//! [`Stage`]: crate::stages::Stage
//! [`PhaseName`]: crate::state_machine::phases::PhaseName
//! [`EventPublisher`]: crate::state_machine::events::EventPublisher

pub mod events;
pub mod phases;

#[cfg(test)]
pub(crate) mod tests;

use derive_more::From;

use self::phases::{
    Aggregating,
    Collecting,
    Completed,
    Errored,
    Evaluating,
    Pending,
    PhaseName,
    PhaseState,
    Preprocessing,
    Shared,
    Training,
};
use crate::{
    settings::{CollectionSettings, FederationSettings},
    stages::Stage,
    storage::RoundResult,
};

#[derive(Debug, Clone)]
/// The settings a round is executed with.
pub struct RoundSettings {
    pub federation: FederationSettings,
    pub collection: CollectionSettings,
}

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<S> {
    Pending(PhaseState<Pending, S>),
    Collecting(PhaseState<Collecting, S>),
    Preprocessing(PhaseState<Preprocessing, S>),
    Training(PhaseState<Training, S>),
    Aggregating(PhaseState<Aggregating, S>),
    Evaluating(PhaseState<Evaluating, S>),
    Completed(PhaseState<Completed, S>),
    Errored(PhaseState<Errored, S>),
}

impl<S> StateMachine<S>
where
    S: Stage,
{
    /// Creates the state machine of a round in the [`Pending`] state.
    pub fn new(shared: Shared<S>) -> Self {
        PhaseState::<Pending, _>::new(shared).into()
    }

    /// Gets the name of the current phase.
    pub fn phase(&self) -> PhaseName {
        match self {
            StateMachine::Pending(_) => PhaseName::Pending,
            StateMachine::Collecting(_) => PhaseName::Collecting,
            StateMachine::Preprocessing(_) => PhaseName::Preprocessing,
            StateMachine::Training(_) => PhaseName::Training,
            StateMachine::Aggregating(_) => PhaseName::Aggregating,
            StateMachine::Evaluating(_) => PhaseName::Evaluating,
            StateMachine::Completed(_) => PhaseName::Completed,
            StateMachine::Errored(_) => PhaseName::Errored,
        }
    }

    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    ///
    /// Returns the round result once a terminal state has been reached.
    pub async fn next(self) -> Result<Self, RoundResult> {
        match self {
            StateMachine::Pending(state) => Ok(state.run_phase().await),
            StateMachine::Collecting(state) => Ok(state.run_phase().await),
            StateMachine::Preprocessing(state) => Ok(state.run_phase().await),
            StateMachine::Training(state) => Ok(state.run_phase().await),
            StateMachine::Aggregating(state) => Ok(state.run_phase().await),
            StateMachine::Evaluating(state) => Ok(state.run_phase().await),
            StateMachine::Completed(state) => Err(state.finish()),
            StateMachine::Errored(state) => Err(state.finish()),
        }
    }

    /// Runs the state machine until the round reaches a terminal state.
    pub async fn run(mut self) -> RoundResult {
        loop {
            self = match self.next().await {
                Ok(state) => state,
                Err(result) => return result,
            };
        }
    }
}
