use crate::{
    state_machine::phases::{PhaseName, PhaseState, Shared},
    storage::{RoundResult, RoundStatus},
};

/// The completed state.
///
/// A round is completed if all of its phases succeeded.
#[derive(Debug)]
pub struct Completed;

impl<S> PhaseState<Completed, S> {
    /// Creates a new completed state.
    pub fn new(shared: Shared<S>) -> Self {
        Self {
            private: Completed,
            shared,
        }
    }

    /// Finalizes the round result.
    pub fn finish(mut self) -> RoundResult {
        let round = self.shared.round();
        self.shared
            .events
            .broadcast_phase(round, PhaseName::Completed);
        self.shared.result.status = RoundStatus::Completed;
        info!("round {} completed", round);
        self.shared.result
    }
}
