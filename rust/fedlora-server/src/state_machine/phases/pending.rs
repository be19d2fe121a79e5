use async_trait::async_trait;

use fedlora_core::FIRST_ROUND;

use crate::{
    stages::Stage,
    state_machine::{
        phases::{Collecting, Phase, PhaseError, PhaseName, PhaseState, Shared, Training},
        StateMachine,
    },
};

/// The pending state.
#[derive(Debug)]
pub struct Pending;

#[async_trait]
impl<S> Phase<S> for PhaseState<Pending, S>
where
    S: Stage,
{
    const NAME: PhaseName = PhaseName::Pending;

    async fn process(&mut self) -> Result<(), PhaseError> {
        self.shared.check_interrupt()
    }

    fn next(self) -> StateMachine<S> {
        if self.shared.round() == FIRST_ROUND {
            PhaseState::<Collecting, _>::new(self.shared).into()
        } else {
            info!("skipping data collection after the first round");
            PhaseState::<Training, _>::new(self.shared).into()
        }
    }
}

impl<S> PhaseState<Pending, S> {
    /// Creates a new pending state.
    pub fn new(shared: Shared<S>) -> Self {
        Self {
            private: Pending,
            shared,
        }
    }
}
