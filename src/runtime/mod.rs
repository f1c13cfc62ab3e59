//! The container runtime boundary.
//!
//! Everything the orchestrator needs from the runtime goes through
//! [`ContainerRuntime`], so the orchestration logic can be driven by a fake
//! in tests while production shells out to `docker`.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;

use crate::model::SandboxPorts;
use crate::secret::Secret;
use crate::Result;

pub mod docker;
pub mod recipe;

/// Service ports inside every sandbox image.
pub const CONTROL_SERVICE_PORT: u16 = 22;
pub const SECONDARY_SERVICE_PORT: u16 = 8080;
pub const TERTIARY_SERVICE_PORT: u16 = 6080;

/// Environment variable carrying the flag into the sandbox.
pub const SECRET_ENV_VAR: &str = "FLAG";

/// Everything needed to launch one sandbox.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub secret: &'a Secret,
    pub ports: SandboxPorts,
}

/// Lifecycle state reported by the runtime for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// The runtime does not know the container.
    Unknown,
    /// The runtime could not be queried.
    Error,
}

impl ContainerStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build the image for an exercise and tag it. Returns the tag.
    async fn build_image(&self, exercise_id: &str, tag: &str) -> Result<String>;

    async fn remove_image(&self, image: &str) -> Result<()>;

    async fn run_container(&self, request: &LaunchRequest<'_>) -> Result<()>;

    /// Graceful stop followed by removal.
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Unconditional forced termination and removal.
    async fn kill_container(&self, name: &str) -> Result<()>;

    /// Never fails; lookup problems map to `Unknown` or `Error`.
    async fn status(&self, name: &str) -> ContainerStatus;

    /// Host ports currently published by any container.
    async fn mapped_ports(&self) -> Result<HashSet<u16>>;

    /// Names of running containers whose name starts with `prefix`.
    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>>;
}
