use async_trait::async_trait;

use crate::{
    stages::{EvaluateArgs, Stage},
    state_machine::{
        phases::{ensure_success, Completed, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
};

/// The evaluation state.
#[derive(Debug)]
pub struct Evaluating;

#[async_trait]
impl<S> Phase<S> for PhaseState<Evaluating, S>
where
    S: Stage,
{
    const NAME: PhaseName = PhaseName::Evaluating;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let args = EvaluateArgs {
            round: self.shared.round(),
        };
        let report = ensure_success(self.shared.stage.evaluate(args).await?)?;
        self.shared.record(Self::NAME, report.to_value());
        Ok(())
    }

    fn next(self) -> StateMachine<S> {
        PhaseState::<Completed, _>::new(self.shared).into()
    }
}

impl<S> PhaseState<Evaluating, S> {
    /// Creates a new evaluation state.
    pub fn new(shared: Shared<S>) -> Self {
        Self {
            private: Evaluating,
            shared,
        }
    }
}
