//! The phases of a round.
//!
//! See the [state machine documentation] for the transitions.
//!
//! [state machine documentation]: crate::state_machine

mod aggregating;
mod collecting;
mod completed;
mod errored;
mod evaluating;
mod pending;
mod preprocessing;
mod training;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use derive_more::Display;
use thiserror::Error;
use tracing_futures::Instrument;

pub use self::{
    aggregating::Aggregating,
    collecting::Collecting,
    completed::Completed,
    errored::Errored,
    evaluating::Evaluating,
    pending::Pending,
    preprocessing::Preprocessing,
    training::Training,
};
use fedlora_core::{AggregationError, RoundId};

use crate::{
    signal::Interrupt,
    stages::{Stage, StageError, StageReport},
    state_machine::{events::EventPublisher, RoundSettings, StateMachine},
    storage::{ArtifactStore, RoundResult, StorageError},
};

/// The name of a phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "collecting")]
    Collecting,
    #[display(fmt = "preprocessing")]
    Preprocessing,
    #[display(fmt = "training")]
    Training,
    #[display(fmt = "aggregating")]
    Aggregating,
    #[display(fmt = "evaluating")]
    Evaluating,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "errored")]
    Errored,
}

impl PhaseName {
    /// Gets the key under which the report of this phase is recorded in the round result.
    pub fn report_key(&self) -> Option<&'static str> {
        match self {
            PhaseName::Collecting => Some("collection"),
            PhaseName::Preprocessing => Some("preprocessing"),
            PhaseName::Training => Some("training"),
            PhaseName::Aggregating => Some("aggregation"),
            PhaseName::Evaluating => Some("evaluation"),
            PhaseName::Pending | PhaseName::Completed | PhaseName::Errored => None,
        }
    }
}

/// Errors which abort a round.
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("interrupted by the operator")]
    Interrupted,
    #[error("stage failed: {0}")]
    Stage(#[from] StageError),
    #[error("stage reported an error: {}", .0.message)]
    Report(StageReport),
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

impl PhaseError {
    /// Gets the report to record for the failed phase.
    pub fn report(&self) -> StageReport {
        match self {
            PhaseError::Report(report) => report.clone(),
            other => StageReport::error(other.to_string()),
        }
    }
}

/// Fails with [`PhaseError::Report`] if the stage reported an error.
pub(in crate::state_machine) fn ensure_success(
    report: StageReport,
) -> Result<StageReport, PhaseError> {
    if report.is_success() {
        Ok(report)
    } else {
        Err(PhaseError::Report(report))
    }
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase<S>
where
    S: Stage,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Moves from this phase to the next phase.
    fn next(self) -> StateMachine<S>;
}

/// The round state and the I/O interfaces that are shared and accessible by all `PhaseState`s.
pub struct Shared<S> {
    /// The settings of the round.
    pub(in crate::state_machine) settings: Arc<RoundSettings>,
    /// The stage that executes the phase operations.
    pub(in crate::state_machine) stage: Arc<S>,
    /// The artifact store.
    pub(in crate::state_machine) store: ArtifactStore,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    pub(in crate::state_machine) interrupt: Interrupt,
    /// The result of the round, filled in phase by phase.
    pub(in crate::state_machine) result: RoundResult,
}

impl<S> fmt::Debug for Shared<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("settings", &self.settings)
            .field("store", &self.store)
            .field("events", &self.events)
            .field("interrupt", &self.interrupt)
            .field("result", &self.result)
            .finish()
    }
}

impl<S> Shared<S> {
    /// Creates the shared state of a round.
    pub fn new(
        round: RoundId,
        settings: Arc<RoundSettings>,
        stage: Arc<S>,
        store: ArtifactStore,
        events: EventPublisher,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            settings,
            stage,
            store,
            events,
            interrupt,
            result: RoundResult::new(round),
        }
    }

    /// Returns the current round.
    pub fn round(&self) -> RoundId {
        self.result.round
    }

    /// Records the report of a phase.
    pub fn record(&mut self, phase: PhaseName, report: serde_json::Value) {
        if let Some(key) = phase.report_key() {
            self.result.stage_reports.insert(key.to_string(), report);
        }
    }

    /// Fails with [`PhaseError::Interrupted`] if the operator interrupted the run.
    pub fn check_interrupt(&self) -> Result<(), PhaseError> {
        if self.interrupt.is_triggered() {
            Err(PhaseError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// The state corresponding to a phase of a round.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<P, S> {
    /// The private state.
    pub(in crate::state_machine) private: P,
    /// The shared round state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<S>,
}

impl<P, S> PhaseState<P, S>
where
    P: Send,
    S: Stage,
    Self: Phase<S>,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Transitions to the next phase, or to the [`Errored`] phase on failure.
    pub async fn run_phase(mut self) -> StateMachine<S> {
        let phase = Self::NAME;
        let round = self.shared.round();
        let span = error_span!("run_phase", round, phase = %phase);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(round, phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks: {}", err);
                return self.into_errored_state(err);
            }
            info!("phase ran successfully");

            debug!("transitioning to the next phase");
            self.next()
        }
        .instrument(span)
        .await
    }

    fn into_errored_state(self, err: PhaseError) -> StateMachine<S> {
        PhaseState::<Errored, _>::new(self.shared, Self::NAME, err).into()
    }
}
