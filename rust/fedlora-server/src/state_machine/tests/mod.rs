//! State machine test utilities.


use async_trait::async_trait;
use ndarray::IxDyn;
use tempfile::{tempdir, TempDir};

use fedlora_core::{ParticipantId, RoundId, Tensor};

use crate::{
    orchestrator::Orchestrator,
    settings::{CollectionSettings, FederationSettings, ModelSettings, StorageSettings},
    signal::{Interrupt, InterruptTrigger},
    stages::{
        CollectArgs,
        EvaluateArgs,
        PreprocessArgs,
        SimulatedStage,
        Stage,
        StageError,
        StageReport,
        TrainArgs,
    },
    state_machine::{events::EventSubscriber, RoundSettings},
    storage::{ArtifactId, ArtifactStore, LocalMetadata, ResultsLog},
};

/// A temporary storage root with an opened artifact store.
pub struct TestEnv {
    pub dir: TempDir,
    pub storage: StorageSettings,
    pub store: ArtifactStore,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempdir().unwrap();
        let storage = StorageSettings {
            root: dir.path().to_path_buf(),
        };
        let store = ArtifactStore::open(&storage).await.unwrap();
        Self {
            dir,
            storage,
            store,
        }
    }

    pub fn simulated(&self) -> SimulatedStage {
        SimulatedStage::new(
            ModelSettings::default(),
            7,
            &self.storage,
            self.store.clone(),
        )
    }

    pub fn results(&self) -> ResultsLog {
        ResultsLog::new(self.storage.results_dir())
    }

    pub fn orchestrator<S: Stage>(
        &self,
        stage: S,
        interrupt: Interrupt,
    ) -> (Orchestrator<S>, EventSubscriber) {
        self.orchestrator_with(FederationSettings::default(), stage, interrupt)
    }

    pub fn orchestrator_with<S: Stage>(
        &self,
        federation: FederationSettings,
        stage: S,
        interrupt: Interrupt,
    ) -> (Orchestrator<S>, EventSubscriber) {
        Orchestrator::new(
            RoundSettings {
                federation,
                collection: CollectionSettings::default(),
            },
            ModelSettings::default(),
            stage,
            self.store.clone(),
            self.results(),
            interrupt,
        )
    }
}

/// A faulty local adapter.
enum LocalFault {
    /// The adapter is stored with a tensor of a different shape.
    Reshaped(ArtifactStore),
    /// The training reports success without storing the adapter.
    Missing,
}

/// A stage that wraps the simulated stage and fails on demand.
pub struct FailingStage {
    inner: SimulatedStage,
    training: Option<(ParticipantId, RoundId)>,
    local: Option<(ParticipantId, RoundId, LocalFault)>,
    evaluation: Option<RoundId>,
    interrupt: Option<(RoundId, InterruptTrigger)>,
}

impl FailingStage {
    pub fn new(inner: SimulatedStage) -> Self {
        Self {
            inner,
            training: None,
            local: None,
            evaluation: None,
            interrupt: None,
        }
    }

    /// Stores the local adapter of a participant with a tensor of the wrong shape.
    pub fn reshape_local(
        mut self,
        participant: ParticipantId,
        round: RoundId,
        store: ArtifactStore,
    ) -> Self {
        self.local = Some((participant, round, LocalFault::Reshaped(store)));
        self
    }

    /// Reports a successful training of a participant without storing its adapter.
    pub fn skip_local(mut self, participant: ParticipantId, round: RoundId) -> Self {
        self.local = Some((participant, round, LocalFault::Missing));
        self
    }

    /// Fails the training of a participant with an execution error.
    pub fn fail_training(mut self, participant: ParticipantId, round: RoundId) -> Self {
        self.training = Some((participant, round));
        self
    }

    /// Reports an error from the evaluation of a round.
    pub fn fail_evaluation(mut self, round: RoundId) -> Self {
        self.evaluation = Some(round);
        self
    }

    /// Triggers the interrupt once the evaluation of a round succeeded.
    pub fn interrupt_after(mut self, round: RoundId, trigger: InterruptTrigger) -> Self {
        self.interrupt = Some((round, trigger));
        self
    }
}

#[async_trait]
impl Stage for FailingStage {
    async fn collect(&self, args: CollectArgs) -> Result<StageReport, StageError> {
        self.inner.collect(args).await
    }

    async fn preprocess(&self, args: PreprocessArgs) -> Result<StageReport, StageError> {
        self.inner.preprocess(args).await
    }

    async fn train(&self, args: TrainArgs) -> Result<StageReport, StageError> {
        let (participant, round) = (args.participant, args.round);
        if self.training == Some((participant, round)) {
            return Err(StageError::Execution("out of GPU memory".into()));
        }
        match &self.local {
            Some((p, r, fault)) if (*p, *r) == (participant, round) => match fault {
                LocalFault::Missing => Ok(StageReport::success("training finished")),
                LocalFault::Reshaped(store) => {
                    let report = self.inner.train(args).await?;
                    let id = ArtifactId::Local { participant, round };
                    let metadata: LocalMetadata =
                        serde_json::from_value(store.lookup(&id).await.unwrap().metadata).unwrap();
                    let mut adapter = store.get_local(participant, round).await?;
                    let name = adapter.weights.iter().next().unwrap().0.clone();
                    adapter
                        .weights
                        .insert(name, Tensor::zeros(IxDyn(&[1, 1])));
                    store.put_local(&adapter, &metadata).await?;
                    Ok(report)
                }
            },
            _ => self.inner.train(args).await,
        }
    }

    async fn evaluate(&self, args: EvaluateArgs) -> Result<StageReport, StageError> {
        let round = args.round;
        if self.evaluation == Some(round) {
            return Ok(StageReport::error("evaluation dataset unavailable"));
        }
        let report = self.inner.evaluate(args).await?;
        if let Some((interrupt_round, trigger)) = &self.interrupt {
            if *interrupt_round == round {
                trigger.trigger();
            }
        }
        Ok(report)
    }
}
