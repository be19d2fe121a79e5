use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::Value;

use fedlora_core::{ParticipantId, FIRST_ROUND};

use crate::{
    stages::{Stage, StageReport, TrainArgs},
    state_machine::{
        phases::{ensure_success, Aggregating, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
};

/// The local training state.
///
/// The participants train independently of each other, at most
/// `federation.max_concurrent_training` at a time. Once a participant failed no further trainings
/// are started, the ones already running finish. The reports of all finished trainings are
/// recorded and the phase fails with the error of the first failing participant.
#[derive(Debug)]
pub struct Training;

#[async_trait]
impl<S> Phase<S> for PhaseState<Training, S>
where
    S: Stage,
{
    const NAME: PhaseName = PhaseName::Training;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let federation = &self.shared.settings.federation;
        let round = self.shared.round();
        let baseline_round = if round > FIRST_ROUND {
            Some(round - 1)
        } else {
            None
        };
        let jobs: Vec<TrainArgs> = (1..=federation.participants)
            .map(|participant| TrainArgs {
                participant,
                round,
                baseline_round,
                epochs: federation.local_epochs,
                batch_size: federation.batch_size,
                learning_rate: federation.learning_rate,
                method: federation.aggregation_method,
                fedprox_mu: federation.fedprox_mu,
            })
            .collect();
        let concurrency = federation.max_concurrent_training;

        let shared = &self.shared;
        let failed = AtomicBool::new(false);
        let outcomes: Vec<Option<Result<StageReport, PhaseError>>> = stream::iter(jobs)
            .map(|args| train(shared, &failed, args))
            .buffered(concurrency)
            .collect()
            .await;

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Ok(report) => reports.push(report.to_value()),
                Err(err) => {
                    reports.push(err.report().to_value());
                    first_error.get_or_insert(err);
                }
            }
        }
        self.shared.record(Self::NAME, Value::Array(reports));
        first_error.map_or(Ok(()), Err)
    }

    fn next(self) -> StateMachine<S> {
        PhaseState::<Aggregating, _>::new(self.shared).into()
    }
}

/// Trains the local adapter of a single participant.
///
/// Returns `None` without training if another participant already failed.
async fn train<S: Stage>(
    shared: &Shared<S>,
    failed: &AtomicBool,
    args: TrainArgs,
) -> Option<Result<StageReport, PhaseError>> {
    if failed.load(Ordering::SeqCst) {
        return None;
    }
    let participant: ParticipantId = args.participant;
    let result = train_participant(shared, args).await;
    if result.is_err() {
        failed.store(true, Ordering::SeqCst);
        warn!("training of participant {} failed", participant);
    }
    Some(result)
}

async fn train_participant<S: Stage>(
    shared: &Shared<S>,
    args: TrainArgs,
) -> Result<StageReport, PhaseError> {
    shared.check_interrupt()?;

    let participant: ParticipantId = args.participant;
    debug!("training participant {}", participant);
    let report = shared.stage.train(args).await.map_err(|err| {
        PhaseError::Report(
            StageReport::error(format!("participant {}: {}", participant, err))
                .with("participant_id", participant),
        )
    })?;
    ensure_success(report.with("participant_id", participant))
}

impl<S> PhaseState<Training, S> {
    /// Creates a new local training state.
    pub fn new(shared: Shared<S>) -> Self {
        Self {
            private: Training,
            shared,
        }
    }
}
