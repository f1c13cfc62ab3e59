use std::sync::Arc;

use crate::flags::FlagRouter;
use crate::model::SandboxInstance;
use crate::orchestrator::SandboxOrchestrator;
use crate::runtime::ContainerRuntime;
use crate::solves::{SolveOutcome, SolveRecorder};
use crate::store::{ExerciseCatalog, LocalStore};
use crate::{Config, Result};

/// Result of a flag submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Correct { score: u32 },
    /// The flag was right but the user had already been credited.
    AlreadySolved,
    Incorrect,
}

/// The operations offered to the request layer.
pub struct SandboxService {
    orchestrator: Arc<SandboxOrchestrator>,
    router: FlagRouter,
    recorder: SolveRecorder,
}

impl SandboxService {
    pub fn new(
        orchestrator: Arc<SandboxOrchestrator>,
        router: FlagRouter,
        recorder: SolveRecorder,
    ) -> Self {
        SandboxService {
            orchestrator,
            router,
            recorder,
        }
    }

    /// Wire everything to one [`LocalStore`] and rehydrate the port
    /// allocator from it.
    pub async fn with_local_store(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<LocalStore>,
        catalog: Arc<dyn ExerciseCatalog>,
    ) -> Result<Self> {
        let orchestrator =
            SandboxOrchestrator::new(config, runtime, store.clone(), catalog.clone())
                .init()
                .await?;

        Ok(Self::new(
            Arc::new(orchestrator),
            FlagRouter::new(catalog.clone(), store.clone()),
            SolveRecorder::new(catalog, store),
        ))
    }

    pub fn orchestrator(&self) -> &Arc<SandboxOrchestrator> {
        &self.orchestrator
    }

    pub fn solves(&self) -> &SolveRecorder {
        &self.recorder
    }

    pub async fn start_environment(
        &self,
        username: &str,
        exercise_id: &str,
    ) -> Result<SandboxInstance> {
        self.orchestrator.start(username, exercise_id).await
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<SandboxInstance>> {
        self.orchestrator.get(instance_id).await
    }

    pub async fn stop_environment(&self, instance_id: &str) -> Result<bool> {
        self.orchestrator.stop(instance_id).await
    }

    pub async fn submit_flag(
        &self,
        username: &str,
        exercise_id: &str,
        submission: Option<&str>,
    ) -> Result<Submission> {
        if !self.router.validate(username, exercise_id, submission).await {
            return Ok(Submission::Incorrect);
        }

        Ok(match self.recorder.record_solve(username, exercise_id).await? {
            SolveOutcome::New { score } => Submission::Correct { score },
            SolveOutcome::AlreadySolved => Submission::AlreadySolved,
        })
    }
}
