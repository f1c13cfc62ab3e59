use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a sandbox instance. Only `Running` has outgoing
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Running,
    Stopped,
    Expired,
    /// The image build or launch failed after the instance was recorded.
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        *self == Self::Running && next.is_terminal()
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host ports bound to a sandbox's three services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxPorts {
    /// Remote shell.
    pub control: u16,
    /// Browser editor.
    pub secondary: u16,
    /// Remote desktop.
    pub tertiary: u16,
}

impl SandboxPorts {
    pub fn as_array(&self) -> [u16; 3] {
        [self.control, self.secondary, self.tertiary]
    }
}

/// Every sandbox container name starts with this.
pub const CONTAINER_PREFIX: &str = "ctf-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub instance_id: String,
    pub username: String,
    pub exercise_id: String,
    pub container_name: String,
    pub secret_digest: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: InstanceState,
    pub ports: SandboxPorts,
}

impl SandboxInstance {
    /// A fresh `Running` instance with a new id and container name.
    pub fn new(
        username: &str,
        exercise_id: &str,
        secret_digest: String,
        ports: SandboxPorts,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let instance_id = Uuid::new_v4().to_string();
        let container_name = format!("{}{}", CONTAINER_PREFIX, &instance_id[..8]);

        SandboxInstance {
            instance_id,
            username: username.to_string(),
            exercise_id: exercise_id.to_string(),
            container_name,
            secret_digest,
            created_at: now,
            expires_at: now + ttl,
            state: InstanceState::Running,
            ports,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_running() && self.expires_at < now
    }

    pub fn belongs_to(&self, username: &str, exercise_id: &str) -> bool {
        self.username == username && self.exercise_id == exercise_id
    }
}

/// First correct submission of a user for an exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveRecord {
    pub username: String,
    pub exercise_id: String,
    pub score: u32,
    pub solved_at: DateTime<Utc>,
}

/// Catalog entry for an exercise; read-only for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseDescriptor {
    pub exercise_id: String,
    pub image_reference: String,
    /// Dynamic exercises run a sandbox with a per-instance secret.
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub static_flag: Option<String>,
    #[serde(default)]
    pub score: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    fn ports() -> SandboxPorts {
        SandboxPorts {
            control: 30001,
            secondary: 31001,
            tertiary: 32001,
        }
    }

    #[test]
    fn new_instance_is_running_with_ttl() {
        let now = Utc::now();
        let inst = SandboxInstance::new(
            "alice",
            "rev-1",
            "ab".repeat(32),
            ports(),
            now,
            Duration::seconds(3600),
        );

        assert!(inst.is_running());
        assert_eq!(inst.expires_at - inst.created_at, Duration::seconds(3600));
        assert!(inst.container_name.starts_with("ctf-"));
        assert_eq!(inst.container_name.len(), 12);
        assert!(inst.belongs_to("alice", "rev-1"));
        assert!(!inst.belongs_to("bob", "rev-1"));
    }

    #[test]
    fn only_running_has_transitions() {
        use InstanceState::*;

        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Expired));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Running));
        for terminal in &[Stopped, Expired, Failed] {
            for next in &[Running, Stopped, Expired, Failed] {
                assert!(!terminal.can_transition_to(*next));
            }
        }
    }

    #[test]
    fn expiry_only_applies_to_running() {
        let now = Utc::now();
        let mut inst = SandboxInstance::new(
            "alice",
            "rev-1",
            String::new(),
            ports(),
            now - Duration::hours(2),
            Duration::hours(1),
        );
        assert!(inst.is_expired_at(now));

        inst.state = InstanceState::Stopped;
        assert!(!inst.is_expired_at(now));
    }

    #[test]
    fn state_serializes_upper_case() {
        let json = serde_json::to_string(&InstanceState::Expired).unwrap();
        assert_eq!(json, "\"EXPIRED\"");
    }

    #[test]
    fn descriptor_defaults_to_static() {
        let desc: ExerciseDescriptor =
            serde_json::from_str(r#"{"exercise_id":"web-1","image_reference":"ctf-web-1"}"#)
                .unwrap();
        assert!(!desc.is_dynamic);
        assert_eq!(desc.static_flag, None);
        assert_eq!(desc.score, 0);
    }
}
