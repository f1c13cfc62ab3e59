use std::{io, time::Duration};
use thiserror::Error;

pub mod config;
pub mod flags;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod reaper;
pub mod runtime;
pub mod secret;
pub mod service;
pub mod solves;
pub mod store;
pub mod validate;

pub use crate::config::Config;
pub use crate::flags::FlagRouter;
pub use crate::model::{
    ExerciseDescriptor, InstanceState, SandboxInstance, SandboxPorts, SolveRecord,
};
pub use crate::orchestrator::SandboxOrchestrator;
pub use crate::ports::{PortAllocator, PortProbe, TcpProbe};
pub use crate::runtime::{docker::DockerRuntime, ContainerRuntime, ContainerStatus, LaunchRequest};
pub use crate::service::{SandboxService, Submission};
pub use crate::solves::{ExerciseStats, SolveOutcome, SolveRecorder, UserStats};
pub use crate::store::{ExerciseCatalog, InstanceRepository, JsonCatalog, LocalStore, SolveRepository};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Exercise {exercise_id} was not found")]
    ExerciseNotFound { exercise_id: String },
    #[error("Instance {instance_id} was not found")]
    InstanceNotFound { instance_id: String },
    #[error("No free port in range {base}-{}", last_port(.base, .width))]
    NoPortAvailable { base: u16, width: u16 },
    #[error("Unable to allocate ports after {attempts} attempts: {source}")]
    PortAllocationFailed {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("Invalid {what}: {value:?}")]
    InvalidArgument { what: &'static str, value: String },
    #[error("Unable to start the container runtime: {source}")]
    UnableToStartRuntime { source: io::Error },
    #[error("Unable to create temporary directory: {source}")]
    UnableToCreateTempDir { source: io::Error },
    #[error("Unable to write the build recipe: {source}")]
    UnableToWriteRecipe { source: io::Error },
    #[error("Building image {tag} failed:\n{log}")]
    BuildFailed { tag: String, log: String },
    #[error("Launching container {name} failed:\n{output}")]
    LaunchFailed { name: String, output: String },
    #[error("Stopping container {name} failed:\n{output}")]
    StopFailed { name: String, output: String },
    #[error("Container runtime query failed:\n{output}")]
    RuntimeQueryFailed { output: String },
    #[error("Runtime command took longer than {} s", timeout.as_secs())]
    RuntimeTimedOut { timeout: Duration },
    #[error("Store operation failed: {message}")]
    Store { message: String },
    #[error("Unable to read state file: {source}")]
    UnableToReadState { source: io::Error },
    #[error("Unable to write state file: {source}")]
    UnableToWriteState { source: io::Error },
    #[error("Unable to lock state file: {source}")]
    UnableToLockState { source: io::Error },
    #[error("Unable to parse state file: {source}")]
    UnableToParseState { source: ::serde_json::Error },
    #[error("Unable to read exercise catalog: {source}")]
    UnableToReadCatalog { source: io::Error },
    #[error("Unable to parse exercise catalog: {source}")]
    UnableToParseCatalog { source: ::serde_json::Error },
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

/// Coarse classification of a failure, used by callers to decide whether a
/// retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The exercise does not exist; retrying will not help.
    ExerciseUnknown,
    /// The port pool is exhausted; retry later.
    ResourceExhausted,
    /// The image could not be built or the sandbox could not be launched.
    LaunchFailed,
    /// The request itself was malformed.
    InvalidRequest,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ExerciseNotFound { .. } | Error::InstanceNotFound { .. } => {
                ErrorKind::ExerciseUnknown
            }
            Error::NoPortAvailable { .. } | Error::PortAllocationFailed { .. } => {
                ErrorKind::ResourceExhausted
            }
            Error::BuildFailed { .. }
            | Error::LaunchFailed { .. }
            | Error::UnableToStartRuntime { .. }
            | Error::RuntimeTimedOut { .. } => ErrorKind::LaunchFailed,
            Error::InvalidArgument { .. } => ErrorKind::InvalidRequest,
            _ => ErrorKind::Internal,
        }
    }
}

/// Last port of an inclusive range; an empty range renders as its base.
fn last_port(base: &u16, width: &u16) -> u32 {
    (u32::from(*base) + u32::from(*width))
        .saturating_sub(1)
        .max(u32::from(*base))
}
