use async_trait::async_trait;

use crate::{
    stages::{PreprocessArgs, Stage},
    state_machine::{
        phases::{ensure_success, Phase, PhaseError, PhaseName, PhaseState, Shared, Training},
        StateMachine,
    },
};

/// The preprocessing state.
#[derive(Debug)]
pub struct Preprocessing;

#[async_trait]
impl<S> Phase<S> for PhaseState<Preprocessing, S>
where
    S: Stage,
{
    const NAME: PhaseName = PhaseName::Preprocessing;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let args = PreprocessArgs {
            participants: self.shared.settings.federation.participants,
            train_ratio: self.shared.settings.collection.train_ratio,
        };
        let report = ensure_success(self.shared.stage.preprocess(args).await?)?;
        self.shared.record(Self::NAME, report.to_value());
        Ok(())
    }

    fn next(self) -> StateMachine<S> {
        PhaseState::<Training, _>::new(self.shared).into()
    }
}

impl<S> PhaseState<Preprocessing, S> {
    /// Creates a new preprocessing state.
    pub fn new(shared: Shared<S>) -> Self {
        Self {
            private: Preprocessing,
            shared,
        }
    }
}
