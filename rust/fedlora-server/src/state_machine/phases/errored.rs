use crate::{
    state_machine::phases::{PhaseError, PhaseName, PhaseState, Shared},
    storage::{RoundResult, RoundStatus},
};

/// The errored state.
#[derive(Debug)]
pub struct Errored {
    /// The phase that failed.
    phase: PhaseName,
    error: PhaseError,
}

impl<S> PhaseState<Errored, S> {
    /// Creates a new errored state.
    pub fn new(shared: Shared<S>, phase: PhaseName, error: PhaseError) -> Self {
        Self {
            private: Errored { phase, error },
            shared,
        }
    }

    /// Finalizes the round result with the error and the report of the failed phase.
    ///
    /// If the failed phase recorded no report itself, the error is recorded as its report.
    pub fn finish(mut self) -> RoundResult {
        let round = self.shared.round();
        let Errored { phase, error } = self.private;
        self.shared.events.broadcast_phase(round, PhaseName::Errored);
        error!("round {} failed in the {} phase: {}", round, phase, error);

        // keeps a report the failed phase already recorded
        if let Some(key) = phase.report_key() {
            self.shared
                .result
                .stage_reports
                .entry(key.to_string())
                .or_insert_with(|| error.report().to_value());
        }
        self.shared.result.status = RoundStatus::Error;
        self.shared.result.error = Some(error.to_string());
        self.shared.result.failed_phase = Some(phase.to_string());
        self.shared.result
    }
}
