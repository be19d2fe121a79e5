use async_trait::async_trait;

use crate::{
    stages::{CollectArgs, Stage},
    state_machine::{
        phases::{ensure_success, Phase, PhaseError, PhaseName, PhaseState, Preprocessing, Shared},
        StateMachine,
    },
};

/// The data collection state.
#[derive(Debug)]
pub struct Collecting;

#[async_trait]
impl<S> Phase<S> for PhaseState<Collecting, S>
where
    S: Stage,
{
    const NAME: PhaseName = PhaseName::Collecting;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let collection = &self.shared.settings.collection;
        let args = CollectArgs {
            sources: collection.sources.clone(),
            limit: collection.limit,
        };
        let report = ensure_success(self.shared.stage.collect(args).await?)?;
        self.shared.record(Self::NAME, report.to_value());
        Ok(())
    }

    fn next(self) -> StateMachine<S> {
        PhaseState::<Preprocessing, _>::new(self.shared).into()
    }
}

impl<S> PhaseState<Collecting, S> {
    /// Creates a new data collection state.
    pub fn new(shared: Shared<S>) -> Self {
        Self {
            private: Collecting,
            shared,
        }
    }
}
