#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};

use practice_sandbox::{
    runtime::{ContainerRuntime, ContainerStatus, LaunchRequest},
    store::InstanceRepository,
    Config, Error, ExerciseDescriptor, FlagRouter, InstanceState, JsonCatalog, LocalStore,
    PortAllocator, PortProbe, Result, SandboxInstance, SandboxOrchestrator, SandboxPorts,
    SandboxService, SolveRecorder,
};

pub struct AlwaysFree;

impl PortProbe for AlwaysFree {
    fn is_bindable(&self, _port: u16) -> bool {
        true
    }
}

/// Parks one launch until the test lets it continue.
pub struct LaunchGate {
    entered: Notify,
    release: Semaphore,
}

impl LaunchGate {
    /// Resolves once the held launch has reached the runtime.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

#[derive(Default)]
struct FakeState {
    gate: Option<Arc<LaunchGate>>,
    images: HashSet<String>,
    builds: Vec<String>,
    containers: HashMap<String, String>,
    stops: Vec<String>,
    kills: Vec<String>,
    mapped: HashSet<u16>,
    fail_build: bool,
    fail_launch: bool,
    fail_stop: bool,
    fail_kill: bool,
}

/// Container runtime that keeps everything in memory and remembers the
/// secret each container was started with.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn with_images(images: &[&str]) -> Self {
        let runtime = FakeRuntime::default();
        runtime
            .state()
            .images
            .extend(images.iter().map(|i| i.to_string()));
        runtime
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn secret_of(&self, container: &str) -> Option<String> {
        self.state().containers.get(container).cloned()
    }

    pub fn is_running(&self, container: &str) -> bool {
        self.state().containers.contains_key(container)
    }

    pub fn builds(&self) -> Vec<String> {
        self.state().builds.clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.state().stops.clone()
    }

    pub fn kills(&self) -> Vec<String> {
        self.state().kills.clone()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state().images.contains(image)
    }

    /// A container the runtime knows about without any instance behind it.
    pub fn adopt_container(&self, name: &str) {
        self.state()
            .containers
            .insert(name.to_string(), String::new());
    }

    /// The next `run_container` waits until the returned gate is released.
    pub fn hold_next_launch(&self) -> Arc<LaunchGate> {
        let gate = Arc::new(LaunchGate {
            entered: Notify::new(),
            release: Semaphore::new(0),
        });
        self.state().gate = Some(gate.clone());
        gate
    }

    pub fn map_port(&self, port: u16) {
        self.state().mapped.insert(port);
    }

    pub fn fail_build(&self, fail: bool) {
        self.state().fail_build = fail;
    }

    pub fn fail_launch(&self, fail: bool) {
        self.state().fail_launch = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.state().fail_stop = fail;
    }

    pub fn fail_kill(&self, fail: bool) {
        self.state().fail_kill = fail;
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state().images.contains(image))
    }

    async fn build_image(&self, exercise_id: &str, tag: &str) -> Result<String> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        state.builds.push(exercise_id.to_string());
        if state.fail_build {
            return Err(Error::BuildFailed {
                tag: tag.to_string(),
                log: "step 2/4: apk: not found".to_string(),
            });
        }
        state.images.insert(tag.to_string());
        Ok(tag.to_string())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.state().images.remove(image);
        Ok(())
    }

    async fn run_container(&self, req: &LaunchRequest<'_>) -> Result<()> {
        tokio::task::yield_now().await;
        let gate = self.state().gate.take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            let _permit = gate.release.acquire().await;
        }
        let mut state = self.state();
        if state.fail_launch {
            return Err(Error::LaunchFailed {
                name: req.name.to_string(),
                output: "port is already allocated".to_string(),
            });
        }
        state
            .containers
            .insert(req.name.to_string(), req.secret.expose().to_string());
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.stops.push(name.to_string());
        if state.fail_stop {
            return Err(Error::StopFailed {
                name: name.to_string(),
                output: "No such container".to_string(),
            });
        }
        state.containers.remove(name);
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.kills.push(name.to_string());
        if state.fail_kill {
            return Err(Error::StopFailed {
                name: name.to_string(),
                output: "No such container".to_string(),
            });
        }
        state.containers.remove(name);
        Ok(())
    }

    async fn status(&self, name: &str) -> ContainerStatus {
        if self.is_running(name) {
            ContainerStatus::Running
        } else {
            ContainerStatus::Unknown
        }
    }

    async fn mapped_ports(&self) -> Result<HashSet<u16>> {
        Ok(self.state().mapped.clone())
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state()
            .containers
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Wraps a store and refuses state transitions of one instance.
pub struct FlakyStore {
    pub inner: Arc<LocalStore>,
    pub broken_instance: Mutex<Option<String>>,
}

#[async_trait]
impl InstanceRepository for FlakyStore {
    async fn save(&self, instance: &SandboxInstance) -> Result<()> {
        self.inner.save(instance).await
    }

    async fn insert_running(&self, instance: &SandboxInstance) -> Result<Option<SandboxInstance>> {
        self.inner.insert_running(instance).await
    }

    async fn transition(
        &self,
        instance_id: &str,
        from: InstanceState,
        to: InstanceState,
    ) -> Result<bool> {
        let broken = self.broken_instance.lock().unwrap().clone();
        if broken.as_deref() == Some(instance_id) {
            return Err(Error::Store {
                message: "disk full".to_string(),
            });
        }
        self.inner.transition(instance_id, from, to).await
    }

    async fn find_by_instance_id(&self, instance_id: &str) -> Result<Option<SandboxInstance>> {
        self.inner.find_by_instance_id(instance_id).await
    }

    async fn find_all(&self) -> Result<Vec<SandboxInstance>> {
        self.inner.find_all().await
    }

    async fn find_by_username_and_exercise_and_state(
        &self,
        username: &str,
        exercise_id: &str,
        state: InstanceState,
    ) -> Result<Vec<SandboxInstance>> {
        self.inner
            .find_by_username_and_exercise_and_state(username, exercise_id, state)
            .await
    }
}

pub fn catalog() -> JsonCatalog {
    JsonCatalog::new(vec![
        ExerciseDescriptor {
            exercise_id: "rev-1".into(),
            image_reference: "ctf-rev-1".into(),
            is_dynamic: true,
            static_flag: None,
            score: 200,
        },
        ExerciseDescriptor {
            exercise_id: "pwn-3".into(),
            image_reference: "ctf-pwn-3".into(),
            is_dynamic: true,
            static_flag: None,
            score: 300,
        },
        ExerciseDescriptor {
            exercise_id: "web-2".into(),
            image_reference: "ctf-web-2".into(),
            is_dynamic: false,
            static_flag: Some("FLAG{x}".into()),
            score: 50,
        },
    ])
}

pub struct Harness {
    pub config: Config,
    pub store: Arc<LocalStore>,
    pub runtime: Arc<FakeRuntime>,
    pub service: Arc<SandboxService>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(Config::default(), Arc::new(LocalStore::new())).await
    }

    pub async fn with_port_range(width: u16) -> Self {
        let config = Config {
            port_range: width,
            ..Config::default()
        };
        Self::with_store(config, Arc::new(LocalStore::new())).await
    }

    pub async fn with_store(config: Config, store: Arc<LocalStore>) -> Self {
        let runtime = Arc::new(FakeRuntime::with_images(&["ctf-rev-1", "ctf-web-2"]));
        let catalog = Arc::new(catalog());

        let orchestrator =
            SandboxOrchestrator::new(&config, runtime.clone(), store.clone(), catalog.clone())
                .with_port_allocator(PortAllocator::with_probe(config.port_range, AlwaysFree))
                .init()
                .await
                .expect("orchestrator init failed");

        let service = SandboxService::new(
            Arc::new(orchestrator),
            FlagRouter::new(catalog.clone(), store.clone()),
            SolveRecorder::new(catalog, store.clone()),
        );

        Harness {
            config,
            store,
            runtime,
            service: Arc::new(service),
        }
    }

    pub fn orchestrator(&self) -> &SandboxOrchestrator {
        self.service.orchestrator()
    }

    pub fn ports(&self) -> &PortAllocator {
        self.orchestrator().port_allocator()
    }

    pub async fn instance(&self, instance_id: &str) -> SandboxInstance {
        self.service
            .get_instance(instance_id)
            .await
            .expect("lookup failed")
            .expect("instance missing")
    }
}

/// A running instance created `age` ago with the given TTL.
pub fn aged_instance(
    username: &str,
    exercise_id: &str,
    ports: SandboxPorts,
    age: Duration,
    ttl: Duration,
) -> SandboxInstance {
    let created: DateTime<Utc> = Utc::now() - age;
    SandboxInstance::new(username, exercise_id, "00".repeat(32), ports, created, ttl)
}
