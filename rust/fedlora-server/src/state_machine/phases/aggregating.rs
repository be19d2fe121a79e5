use async_trait::async_trait;
use chrono::Utc;

use fedlora_core::{Aggregation, Owner};

use crate::{
    stages::{Stage, StageReport},
    state_machine::{
        phases::{Evaluating, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{AggregationMetadata, ArtifactId},
};

/// The aggregation state.
///
/// Loads the local adapters of all participants of the round, aggregates them in participant order
/// and stores the aggregated adapter. Nothing is stored if any local adapter is missing or can't be
/// aggregated.
#[derive(Debug)]
pub struct Aggregating;

#[async_trait]
impl<S> Phase<S> for PhaseState<Aggregating, S>
where
    S: Stage,
{
    const NAME: PhaseName = PhaseName::Aggregating;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round();
        let method = self.shared.settings.federation.aggregation_method;
        let store = &self.shared.store;

        let mut aggregation = Aggregation::new(method);
        let mut model_paths = Vec::new();
        let mut weights = Vec::new();
        for participant in 1..=self.shared.settings.federation.participants {
            let adapter = store.get_local(participant, round).await?;
            let weight = method.weight(&adapter.metrics);
            aggregation.add(&adapter, weight)?;
            debug!("aggregated {} with weight {}", Owner::Participant(participant), weight);

            let id = ArtifactId::Local { participant, round };
            model_paths.push(store.layout().relative(&store.artifact_dir(&id)));
            weights.push(weight);
        }
        let global = aggregation.finish(round)?;

        let metadata = AggregationMetadata {
            round,
            aggregation_method: method,
            models_aggregated: model_paths.len(),
            model_paths,
            weights,
            base_model: global.config.base_model.clone(),
            lora_r: global.config.rank,
            metrics: global.metrics.clone(),
            created_at: Utc::now(),
        };
        let path = store.put_aggregated(&global, &metadata).await?;
        info!(
            "aggregated {} local adapters with {}",
            metadata.models_aggregated, method
        );

        let report = StageReport::success(format!(
            "{} local adapters aggregated with {}",
            metadata.models_aggregated, method
        ))
        .with("round", round)
        .with("aggregation_method", method)
        .with("models_aggregated", metadata.models_aggregated)
        .with("model_paths", &metadata.model_paths)
        .with("weights", &metadata.weights)
        .with("aggregated_model_path", store.layout().relative(&path))
        .with("metrics", &metadata.metrics);
        self.shared.record(Self::NAME, report.to_value());
        Ok(())
    }

    fn next(self) -> StateMachine<S> {
        PhaseState::<Evaluating, _>::new(self.shared).into()
    }
}

impl<S> PhaseState<Aggregating, S> {
    /// Creates a new aggregation state.
    pub fn new(shared: Shared<S>) -> Self {
        Self {
            private: Aggregating,
            shared,
        }
    }
}
