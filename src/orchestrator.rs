//! Sandbox lifecycle: allocate ports, record the instance, launch it, and
//! tear it down again.
//!
//! An instance is `RUNNING` from the moment it is recorded until exactly one
//! of stop, expiry or a failed launch moves it to a terminal state. That move
//! is a compare-and-set in the store, so a concurrent stop and reaper sweep
//! cannot both release the same ports.

use chrono::Utc;
use std::{collections::HashSet, sync::Arc, time::Duration};

use crate::model::{
    ExerciseDescriptor, InstanceState, SandboxInstance, SandboxPorts, CONTAINER_PREFIX,
};
use crate::ports::PortAllocator;
use crate::runtime::{ContainerRuntime, ContainerStatus, LaunchRequest};
use crate::secret::{self, Secret};
use crate::store::{ExerciseCatalog, InstanceRepository};
use crate::{Config, Error, Result};

const PORT_ALLOCATION_ATTEMPTS: usize = 3;
const PORT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct SandboxOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    instances: Arc<dyn InstanceRepository>,
    catalog: Arc<dyn ExerciseCatalog>,
    ports: PortAllocator,
    port_bases: [u16; 3],
    ttl: chrono::Duration,
}

impl SandboxOrchestrator {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        instances: Arc<dyn InstanceRepository>,
        catalog: Arc<dyn ExerciseCatalog>,
    ) -> Self {
        SandboxOrchestrator {
            runtime,
            instances,
            catalog,
            ports: PortAllocator::new(config.port_range),
            port_bases: config.port_bases(),
            ttl: chrono::Duration::from_std(config.instance_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Reserve the ports of every instance the store still lists as running.
    /// Must run before the first `start`.
    pub async fn init(self) -> Result<Self> {
        let all = self.instances.find_all().await?;
        let reserved = self.ports.rehydrate(&all);
        log::info!(
            "Rehydrated {} reserved ports from {} running instances",
            reserved,
            all.iter().filter(|i| i.is_running()).count()
        );
        Ok(self)
    }

    pub fn port_allocator(&self) -> &PortAllocator {
        &self.ports
    }

    /// Start a sandbox for `username`, or return the one already running.
    pub async fn start(&self, username: &str, exercise_id: &str) -> Result<SandboxInstance> {
        if let Some(existing) = self.running_instance(username, exercise_id).await? {
            log::debug!(
                "{} already has {} running for {}",
                username,
                existing.instance_id,
                exercise_id
            );
            return Ok(existing);
        }

        let exercise = self.catalog.lookup(exercise_id).await?;
        let secret = secret::generate(exercise_id);
        let ports = self.allocate_ports().await?;

        let instance = SandboxInstance::new(
            username,
            exercise_id,
            secret.digest(),
            ports,
            Utc::now(),
            self.ttl,
        );

        match self.instances.insert_running(&instance).await {
            Ok(None) => {}
            Ok(Some(winner)) => {
                // A concurrent start for the same pair got there first.
                self.ports.release_all(&ports.as_array());
                return Ok(winner);
            }
            Err(e) => {
                self.ports.release_all(&ports.as_array());
                return Err(e);
            }
        }

        log::info!(
            "Starting {} for {} on {} (digest {}...)",
            instance.instance_id,
            username,
            exercise_id,
            secret::log_prefix(&instance.secret_digest)
        );

        if let Err(e) = self.launch(&exercise, &instance, &secret).await {
            log::warn!("Launch of {} failed: {}", instance.instance_id, e);
            self.fail(&instance).await;
            return Err(e);
        }

        self.confirm_launch(instance).await
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<SandboxInstance>> {
        self.instances.find_by_instance_id(instance_id).await
    }

    /// Stop an instance. Returns false if no such instance exists; stopping
    /// an instance that is no longer running is a no-op.
    pub async fn stop(&self, instance_id: &str) -> Result<bool> {
        let instance = match self.instances.find_by_instance_id(instance_id).await? {
            Some(instance) => instance,
            None => return Ok(false),
        };

        self.teardown(&instance, InstanceState::Stopped).await?;
        Ok(true)
    }

    /// Tear down an instance whose TTL ran out.
    pub async fn expire(&self, instance: &SandboxInstance) -> Result<bool> {
        self.teardown(instance, InstanceState::Expired).await
    }

    pub async fn running_instance(
        &self,
        username: &str,
        exercise_id: &str,
    ) -> Result<Option<SandboxInstance>> {
        Ok(self
            .instances
            .find_by_username_and_exercise_and_state(username, exercise_id, InstanceState::Running)
            .await?
            .into_iter()
            .next())
    }

    pub async fn running_instances(&self) -> Result<Vec<SandboxInstance>> {
        Ok(self
            .instances
            .find_all()
            .await?
            .into_iter()
            .filter(SandboxInstance::is_running)
            .collect())
    }

    pub async fn all_instances(&self) -> Result<Vec<SandboxInstance>> {
        self.instances.find_all().await
    }

    /// Stop every running instance of one exercise, e.g. before its image is
    /// rebuilt. Returns how many were stopped.
    pub async fn stop_all_for_exercise(&self, exercise_id: &str) -> Result<usize> {
        let mut stopped = 0;

        for instance in self.running_instances().await? {
            if instance.exercise_id != exercise_id {
                continue;
            }
            match self.teardown(&instance, InstanceState::Stopped).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Unable to stop {}: {}", instance.instance_id, e),
            }
        }

        if let Err(e) = self.remove_stray_containers().await {
            log::warn!("Unable to reconcile containers of {}: {}", exercise_id, e);
        }

        Ok(stopped)
    }

    /// Stop every running instance of an exercise and remove its image, so
    /// the next start rebuilds it. Returns how many instances were stopped.
    pub async fn remove_exercise_image(&self, exercise_id: &str) -> Result<usize> {
        let exercise = self.catalog.lookup(exercise_id).await?;
        let stopped = self.stop_all_for_exercise(exercise_id).await?;

        self.runtime.remove_image(&exercise.image_reference).await?;
        log::info!(
            "Removed image {} of {} after stopping {} instances",
            exercise.image_reference,
            exercise_id,
            stopped
        );
        Ok(stopped)
    }

    /// Remove sandbox containers that no running instance owns. Returns how
    /// many were removed.
    pub async fn remove_stray_containers(&self) -> Result<usize> {
        // Listed before reading the store: a container only exists once its
        // instance row has been written.
        let containers = self.runtime.list_containers(CONTAINER_PREFIX).await?;
        let owned: HashSet<String> = self
            .running_instances()
            .await?
            .into_iter()
            .map(|i| i.container_name)
            .collect();

        let mut removed = 0;
        for name in containers.iter().filter(|name| !owned.contains(*name)) {
            match self.runtime.kill_container(name).await {
                Ok(()) => {
                    log::info!("Removed stray container {}", name);
                    removed += 1;
                }
                Err(e) => log::warn!("Unable to remove stray container {}: {}", name, e),
            }
        }

        Ok(removed)
    }

    pub async fn container_status(&self, instance_id: &str) -> Result<ContainerStatus> {
        let instance = self
            .instances
            .find_by_instance_id(instance_id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        Ok(self.runtime.status(&instance.container_name).await)
    }

    async fn allocate_ports(&self) -> Result<SandboxPorts> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            // Queried before taking the allocator lock; it shells out.
            let mapped = self.runtime.mapped_ports().await.unwrap_or_else(|e| {
                log::warn!("Unable to list runtime port mappings: {}", e);
                HashSet::new()
            });

            match self.try_allocate_ports(&mapped) {
                Ok(ports) => return Ok(ports),
                Err(e) if attempt >= PORT_ALLOCATION_ATTEMPTS => {
                    return Err(Error::PortAllocationFailed {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => {
                    log::debug!("Port allocation attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(PORT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// All three ports or none.
    fn try_allocate_ports(&self, mapped: &HashSet<u16>) -> Result<SandboxPorts> {
        let [control_base, secondary_base, tertiary_base] = self.port_bases;

        let control = self.ports.allocate(control_base, mapped)?;
        let secondary = match self.ports.allocate(secondary_base, mapped) {
            Ok(port) => port,
            Err(e) => {
                self.ports.release(control);
                return Err(e);
            }
        };
        let tertiary = match self.ports.allocate(tertiary_base, mapped) {
            Ok(port) => port,
            Err(e) => {
                self.ports.release_all(&[control, secondary]);
                return Err(e);
            }
        };

        Ok(SandboxPorts {
            control,
            secondary,
            tertiary,
        })
    }

    async fn launch(
        &self,
        exercise: &ExerciseDescriptor,
        instance: &SandboxInstance,
        secret: &Secret,
    ) -> Result<()> {
        let image = exercise.image_reference.as_str();

        if !self.runtime.image_exists(image).await? {
            log::info!("Image {} not found, building it", image);
            self.runtime
                .build_image(&exercise.exercise_id, image)
                .await?;
        }

        self.runtime
            .run_container(&LaunchRequest {
                name: &instance.container_name,
                image,
                secret,
                ports: instance.ports,
            })
            .await
    }

    /// Undo a start whose launch failed. The row is kept as FAILED.
    async fn fail(&self, instance: &SandboxInstance) {
        // `docker run` can leave a created container behind.
        if let Err(e) = self.runtime.kill_container(&instance.container_name).await {
            log::debug!("No container to clean up for {}: {}", instance.instance_id, e);
        }

        match self
            .instances
            .transition(&instance.instance_id, InstanceState::Running, InstanceState::Failed)
            .await
        {
            Ok(true) => self.ports.release_all(&instance.ports.as_array()),
            // Stopped or expired mid-launch: that teardown already released
            // the ports, which may belong to a newer instance by now.
            Ok(false) => log::debug!("{} left RUNNING before its launch failed", instance.instance_id),
            Err(e) => log::error!("Unable to mark {} as failed: {}", instance.instance_id, e),
        }
    }

    /// A stop or expiry that lands while the container is launching tears
    /// down before the container exists. Remove the container in that case
    /// and hand back the terminal row.
    async fn confirm_launch(&self, instance: SandboxInstance) -> Result<SandboxInstance> {
        let current = match self.instances.find_by_instance_id(&instance.instance_id).await? {
            Some(current) => current,
            None => return Ok(instance),
        };
        if current.is_running() {
            return Ok(current);
        }

        log::info!(
            "{} became {} while launching, removing {}",
            current.instance_id,
            current.state,
            current.container_name
        );
        if let Err(e) = self.runtime.kill_container(&current.container_name).await {
            log::warn!("Kill of {} failed: {}", current.container_name, e);
        }
        Ok(current)
    }

    /// Move a running instance to `target`, stop its container and release
    /// its ports. Returns false if another caller already did.
    ///
    /// Runtime failures never skip the port release: a failed graceful stop
    /// falls back to a forced kill, and a failed kill is only logged.
    async fn teardown(&self, instance: &SandboxInstance, target: InstanceState) -> Result<bool> {
        let moved = self
            .instances
            .transition(&instance.instance_id, InstanceState::Running, target)
            .await?;
        if !moved {
            log::debug!("{} is no longer running", instance.instance_id);
            return Ok(false);
        }

        if let Err(e) = self.runtime.stop_container(&instance.container_name).await {
            log::warn!(
                "Graceful stop of {} failed, killing it: {}",
                instance.container_name,
                e
            );
            if let Err(e) = self.runtime.kill_container(&instance.container_name).await {
                log::warn!("Kill of {} failed: {}", instance.container_name, e);
            }
        }

        self.ports.release_all(&instance.ports.as_array());
        log::info!("{} is now {}", instance.instance_id, target);
        Ok(true)
    }
}
