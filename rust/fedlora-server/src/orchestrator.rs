//! The round orchestrator.
//!
//! The [`Orchestrator`] drives the rounds of a run strictly one after another. Every round is
//! executed by its own [`StateMachine`]. The result of a round and the cumulative run summary are
//! persisted as soon as the round reached a terminal state. The first round that doesn't complete
//! stops the run.

use std::sync::Arc;

use chrono::Utc;
use tracing_futures::Instrument;

use fedlora_core::{RoundId, FIRST_ROUND};

use crate::{
    settings::ModelSettings,
    signal::Interrupt,
    stages::Stage,
    state_machine::{
        events::{EventPublisher, EventSubscriber},
        phases::{PhaseName, Shared},
        RoundSettings,
        StateMachine,
    },
    storage::{
        ArtifactStore,
        ResultsLog,
        RoundResult,
        RunConfig,
        RunStatus,
        RunSummary,
        StorageError,
    },
};

/// The orchestrator of a federated fine-tuning run.
pub struct Orchestrator<S> {
    settings: Arc<RoundSettings>,
    model: ModelSettings,
    stage: Arc<S>,
    store: ArtifactStore,
    results: ResultsLog,
    events: EventPublisher,
    interrupt: Interrupt,
}

impl<S> Orchestrator<S>
where
    S: Stage,
{
    /// Creates a new orchestrator and the subscriber for its phase events.
    pub fn new(
        settings: RoundSettings,
        model: ModelSettings,
        stage: S,
        store: ArtifactStore,
        results: ResultsLog,
        interrupt: Interrupt,
    ) -> (Self, EventSubscriber) {
        let (events, subscriber) = EventPublisher::init(FIRST_ROUND, PhaseName::Pending);
        let orchestrator = Self {
            settings: Arc::new(settings),
            model,
            stage: Arc::new(stage),
            store,
            results,
            events,
            interrupt,
        };
        (orchestrator, subscriber)
    }

    /// Runs the rounds `1..=num_rounds`.
    pub async fn run(&self, num_rounds: u64) -> Result<RunSummary, StorageError> {
        self.run_from(FIRST_ROUND, num_rounds).await
    }

    /// Runs `num_rounds` rounds starting with `start_round`.
    ///
    /// Rounds which already have artifacts are executed again and their artifacts are replaced.
    ///
    /// # Errors
    /// Fails only if a round result or the run summary can't be persisted. Failing rounds are
    /// recorded in the returned summary.
    pub async fn run_from(
        &self,
        start_round: RoundId,
        num_rounds: u64,
    ) -> Result<RunSummary, StorageError> {
        let mut summary = RunSummary::new(self.run_config(start_round, num_rounds));
        info!(
            "starting run of {} rounds from round {}",
            num_rounds, start_round
        );

        for round in start_round..start_round + num_rounds {
            let result = self.run_round(round).await;
            let completed = result.is_completed();

            self.results.write_round(&result).await?;
            summary.rounds.push(result);
            if !completed {
                summary.status = if self.interrupt.is_triggered() {
                    RunStatus::Interrupted
                } else {
                    RunStatus::Error
                };
                break;
            }
            self.results.write_summary(&summary).await?;
        }

        if summary.status == RunStatus::InProgress {
            summary.status = RunStatus::Completed;
        }
        summary.end_time = Some(Utc::now());
        self.results.write_summary(&summary).await?;

        match summary.status {
            RunStatus::Completed => info!("run completed"),
            status => warn!(
                "run stopped with status {}, last completed round {:?}",
                status,
                summary.last_completed_round(),
            ),
        }
        Ok(summary)
    }

    /// Runs a single round to completion.
    pub async fn run_round(&self, round: RoundId) -> RoundResult {
        let shared = Shared::new(
            round,
            self.settings.clone(),
            self.stage.clone(),
            self.store.clone(),
            self.events.clone(),
            self.interrupt.clone(),
        );
        StateMachine::new(shared)
            .run()
            .instrument(info_span!("round", round))
            .await
    }

    /// Gets the round which continues the lineage of aggregated adapters.
    ///
    /// This is the round after the latest aggregated adapter, or the first round if there is none.
    pub async fn resume_round(&self) -> Result<RoundId, StorageError> {
        let discovery = self.store.latest_round().await?;
        Ok(if discovery.is_found() {
            discovery.round() + 1
        } else {
            FIRST_ROUND
        })
    }

    fn run_config(&self, start_round: RoundId, num_rounds: u64) -> RunConfig {
        let federation = &self.settings.federation;
        RunConfig {
            num_participants: federation.participants,
            num_rounds,
            start_round,
            base_model: self.model.base_model.clone(),
            lora_r: self.model.lora_r,
            lora_alpha: self.model.lora_alpha,
            local_epochs: federation.local_epochs,
            batch_size: federation.batch_size,
            learning_rate: federation.learning_rate,
            aggregation_method: federation.aggregation_method,
        }
    }
}
