//! Persistence seams and a local implementation.
//!
//! The orchestrator talks to storage only through [`InstanceRepository`],
//! [`SolveRepository`] and [`ExerciseCatalog`]. The uniqueness rules that
//! matter under concurrency (one running instance per user and exercise, one
//! solve per user and exercise) are enforced here, by atomic operations,
//! rather than by callers checking first.

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::model::{ExerciseDescriptor, InstanceState, SandboxInstance, SolveRecord};
use crate::{Error, Result};

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Insert or replace an instance by id. The secret digest of an existing
    /// instance cannot change.
    async fn save(&self, instance: &SandboxInstance) -> Result<()>;

    /// Insert `instance` unless the same user already has a running instance
    /// for the same exercise, in which case that one is returned and nothing
    /// is written.
    async fn insert_running(&self, instance: &SandboxInstance) -> Result<Option<SandboxInstance>>;

    /// Move an instance from `from` to `to`. Returns false, writing nothing,
    /// when the instance is not in `from` or the transition is not allowed.
    async fn transition(&self, instance_id: &str, from: InstanceState, to: InstanceState)
        -> Result<bool>;

    async fn find_by_instance_id(&self, instance_id: &str) -> Result<Option<SandboxInstance>>;

    async fn find_all(&self) -> Result<Vec<SandboxInstance>>;

    async fn find_by_username_and_exercise_and_state(
        &self,
        username: &str,
        exercise_id: &str,
        state: InstanceState,
    ) -> Result<Vec<SandboxInstance>>;
}

#[async_trait]
pub trait SolveRepository: Send + Sync {
    /// Returns true if the record was inserted, false if the user had already
    /// solved the exercise.
    async fn save_if_absent(&self, record: &SolveRecord) -> Result<bool>;

    async fn find_by_username_and_exercise(
        &self,
        username: &str,
        exercise_id: &str,
    ) -> Result<Option<SolveRecord>>;

    async fn count_by_exercise(&self, exercise_id: &str) -> Result<u64>;

    async fn find_by_username(&self, username: &str) -> Result<Vec<SolveRecord>>;

    /// Newest first.
    async fn find_recent(&self, limit: usize) -> Result<Vec<SolveRecord>>;

    /// Usernames with their solve counts, most solves first.
    async fn top_solvers(&self, limit: usize) -> Result<Vec<(String, u64)>>;

    /// Exercise ids with their solve counts, most solved first.
    async fn most_solved(&self, limit: usize) -> Result<Vec<(String, u64)>>;
}

#[async_trait]
pub trait ExerciseCatalog: Send + Sync {
    /// Fails with `ExerciseNotFound` for unknown ids.
    async fn lookup(&self, exercise_id: &str) -> Result<ExerciseDescriptor>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    instances: Vec<SandboxInstance>,
    solves: Vec<SolveRecord>,
}

/// In-process store, optionally mirrored to a JSON snapshot file so state
/// survives restarts.
///
/// With a snapshot file, every call re-reads the file and every write holds
/// an exclusive `flock` on `<snapshot>.lock` across read, change and write.
/// Several processes (the serving reaper and one-off CLI commands) can share
/// one file without losing each other's rows. Port reservations stay per
/// process and are rebuilt from the file on startup.
#[derive(Debug, Default)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    path: Option<PathBuf>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed store, loading the snapshot if it exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = load(&path)?;

        log::debug!(
            "Loaded {} instances and {} solves from {}",
            state.instances.len(),
            state.solves.len(),
            path.display()
        );

        Ok(LocalStore {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                path: Some(path),
            }),
        })
    }

    /// Apply `change` to the current state. It returns its result and
    /// whether anything changed.
    async fn update<R, F>(&self, change: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut State) -> Result<(R, bool)> + Send + 'static,
    {
        if self.inner.path.is_none() {
            return self.inner.update(change);
        }

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.update(change))
            .await
            .map_err(|e| Error::Store {
                message: format!("store task failed: {}", e),
            })?
    }

    async fn read<R, F>(&self, query: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&State) -> R + Send + 'static,
    {
        if self.inner.path.is_none() {
            return self.inner.read(query);
        }

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.read(query))
            .await
            .map_err(|e| Error::Store {
                message: format!("store task failed: {}", e),
            })?
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<R, F>(&self, change: F) -> Result<R>
    where
        F: FnOnce(&mut State) -> Result<(R, bool)>,
    {
        let mut state = self.state();

        let path = match &self.path {
            Some(path) => path,
            None => return change(&mut state).map(|(result, _)| result),
        };

        let _lock = SnapshotLock::acquire(path)?;
        *state = load(path)?;

        let (result, changed) = change(&mut state)?;
        if changed {
            persist(path, &state)?;
        }
        Ok(result)
    }

    fn read<R, F>(&self, query: F) -> Result<R>
    where
        F: FnOnce(&State) -> R,
    {
        let mut state = self.state();
        // Snapshots are replaced by rename, so reading needs no lock.
        if let Some(path) = &self.path {
            *state = load(path)?;
        }
        Ok(query(&state))
    }
}

fn load(path: &Path) -> Result<State> {
    if !path.exists() {
        return Ok(State::default());
    }

    let raw = fs::read(path).map_err(|e| Error::UnableToReadState { source: e })?;
    serde_json::from_slice(&raw).map_err(|e| Error::UnableToParseState { source: e })
}

/// Write the snapshot next to the target and rename it into place.
fn persist(path: &Path, state: &State) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(state).map_err(|e| Error::UnableToParseState { source: e })?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).map_err(|e| Error::UnableToWriteState { source: e })?;
    fs::rename(&tmp, path).map_err(|e| Error::UnableToWriteState { source: e })
}

/// Exclusive advisory lock on `<snapshot>.lock`, released on drop.
struct SnapshotLock {
    _file: File,
}

impl SnapshotLock {
    fn acquire(snapshot: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(snapshot.with_extension("lock"))
            .map_err(|e| Error::UnableToLockState { source: e })?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            loop {
                // SAFETY: `file` owns a valid descriptor for the whole call.
                let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
                if rc == 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(Error::UnableToLockState { source: err });
                }
            }
        }

        Ok(SnapshotLock { _file: file })
    }
}

/// Keys ordered by how often they occur, most frequent first, ties by key.
fn ranked<'a, I>(keys: I, limit: usize) -> Vec<(String, u64)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for key in keys {
        *counts.entry(key).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, u64)> = counts
        .into_iter()
        .map(|(key, count)| (key.to_string(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

#[async_trait]
impl InstanceRepository for LocalStore {
    async fn save(&self, instance: &SandboxInstance) -> Result<()> {
        let instance = instance.clone();

        self.update(move |state| {
            match state
                .instances
                .iter_mut()
                .find(|i| i.instance_id == instance.instance_id)
            {
                Some(existing) => {
                    if existing.secret_digest != instance.secret_digest {
                        return Err(Error::Store {
                            message: format!(
                                "secret digest of {} cannot change",
                                instance.instance_id
                            ),
                        });
                    }
                    *existing = instance;
                }
                None => state.instances.push(instance),
            }
            Ok(((), true))
        })
        .await
    }

    async fn insert_running(&self, instance: &SandboxInstance) -> Result<Option<SandboxInstance>> {
        let instance = instance.clone();

        self.update(move |state| {
            if let Some(existing) = state
                .instances
                .iter()
                .find(|i| i.is_running() && i.belongs_to(&instance.username, &instance.exercise_id))
            {
                return Ok((Some(existing.clone()), false));
            }

            if state
                .instances
                .iter()
                .any(|i| i.instance_id == instance.instance_id)
            {
                return Err(Error::Store {
                    message: format!("instance {} already exists", instance.instance_id),
                });
            }

            state.instances.push(instance);
            Ok((None, true))
        })
        .await
    }

    async fn transition(
        &self,
        instance_id: &str,
        from: InstanceState,
        to: InstanceState,
    ) -> Result<bool> {
        let instance_id = instance_id.to_string();

        self.update(move |state| {
            let inst = state
                .instances
                .iter_mut()
                .find(|i| i.instance_id == instance_id)
                .ok_or_else(|| Error::InstanceNotFound {
                    instance_id: instance_id.clone(),
                })?;

            if inst.state != from || !from.can_transition_to(to) {
                return Ok((false, false));
            }
            inst.state = to;
            Ok((true, true))
        })
        .await
    }

    async fn find_by_instance_id(&self, instance_id: &str) -> Result<Option<SandboxInstance>> {
        let instance_id = instance_id.to_string();

        self.read(move |state| {
            state
                .instances
                .iter()
                .find(|i| i.instance_id == instance_id)
                .cloned()
        })
        .await
    }

    async fn find_all(&self) -> Result<Vec<SandboxInstance>> {
        self.read(|state| state.instances.clone()).await
    }

    async fn find_by_username_and_exercise_and_state(
        &self,
        username: &str,
        exercise_id: &str,
        wanted: InstanceState,
    ) -> Result<Vec<SandboxInstance>> {
        let (username, exercise_id) = (username.to_string(), exercise_id.to_string());

        self.read(move |state| {
            state
                .instances
                .iter()
                .filter(|i| i.state == wanted && i.belongs_to(&username, &exercise_id))
                .cloned()
                .collect()
        })
        .await
    }
}

#[async_trait]
impl SolveRepository for LocalStore {
    async fn save_if_absent(&self, record: &SolveRecord) -> Result<bool> {
        let record = record.clone();

        self.update(move |state| {
            if state
                .solves
                .iter()
                .any(|s| s.username == record.username && s.exercise_id == record.exercise_id)
            {
                return Ok((false, false));
            }

            state.solves.push(record);
            Ok((true, true))
        })
        .await
    }

    async fn find_by_username_and_exercise(
        &self,
        username: &str,
        exercise_id: &str,
    ) -> Result<Option<SolveRecord>> {
        let (username, exercise_id) = (username.to_string(), exercise_id.to_string());

        self.read(move |state| {
            state
                .solves
                .iter()
                .find(|s| s.username == username && s.exercise_id == exercise_id)
                .cloned()
        })
        .await
    }

    async fn count_by_exercise(&self, exercise_id: &str) -> Result<u64> {
        let exercise_id = exercise_id.to_string();

        self.read(move |state| {
            state
                .solves
                .iter()
                .filter(|s| s.exercise_id == exercise_id)
                .count() as u64
        })
        .await
    }

    async fn find_by_username(&self, username: &str) -> Result<Vec<SolveRecord>> {
        let username = username.to_string();

        self.read(move |state| {
            state
                .solves
                .iter()
                .filter(|s| s.username == username)
                .cloned()
                .collect()
        })
        .await
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<SolveRecord>> {
        self.read(move |state| {
            let mut solves = state.solves.clone();
            solves.sort_by(|a, b| b.solved_at.cmp(&a.solved_at));
            solves.truncate(limit);
            solves
        })
        .await
    }

    async fn top_solvers(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        self.read(move |state| ranked(state.solves.iter().map(|s| s.username.as_str()), limit))
            .await
    }

    async fn most_solved(&self, limit: usize) -> Result<Vec<(String, u64)>> {
        self.read(move |state| {
            ranked(state.solves.iter().map(|s| s.exercise_id.as_str()), limit)
        })
        .await
    }
}

/// Catalog held in memory, usually loaded from a JSON array of descriptors.
#[derive(Debug, Default, Clone)]
pub struct JsonCatalog {
    exercises: HashMap<String, ExerciseDescriptor>,
}

impl JsonCatalog {
    pub fn new<I: IntoIterator<Item = ExerciseDescriptor>>(descriptors: I) -> Self {
        JsonCatalog {
            exercises: descriptors
                .into_iter()
                .map(|d| (d.exercise_id.clone(), d))
                .collect(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(path).map_err(|e| Error::UnableToReadCatalog { source: e })?;
        let descriptors: Vec<ExerciseDescriptor> =
            serde_json::from_slice(&raw).map_err(|e| Error::UnableToParseCatalog { source: e })?;
        Ok(Self::new(descriptors))
    }

    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }
}

#[async_trait]
impl ExerciseCatalog for JsonCatalog {
    async fn lookup(&self, exercise_id: &str) -> Result<ExerciseDescriptor> {
        self.exercises
            .get(exercise_id)
            .cloned()
            .ok_or_else(|| Error::ExerciseNotFound {
                exercise_id: exercise_id.to_string(),
            })
    }
}
