//! Asynchronous task engine.
//!
//! Converts a long computation into a poll/result HTTP protocol: a job is
//! spawned under a fresh UUID, mutates only its own progress, and is
//! observed through `handle_progress_request` / `handle_result_request`.
//! Uncaught worker failures (errors and panics) are trapped and become a
//! terminal Error state on the same id — they surface only when the client
//! polls, never as a push.
//!
//! Each controller owns its own engine instance, so task namespaces are
//! disjoint by construction. Tasks expire one hour after creation;
//! `sweep_tasks` runs ahead of every spawn and removes expired and
//! Error-state records.
//!
//! The dedup cache maps a fingerprint of the job options to a live task
//! id, bounded to 100 entries with a one-hour TTL. It never returns an id
//! the engine cannot find.

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const DEDUP_CAPACITY: usize = 100;

fn task_ttl() -> Duration {
    Duration::hours(1)
}

#[derive(Debug)]
enum TaskState {
    Running,
    Finished(serde_json::Value),
    Failed(String),
}

#[derive(Debug)]
struct TaskRecord {
    progress: f64,
    state: TaskState,
    expire_time: DateTime<Utc>,
}

type TaskMap = Arc<Mutex<HashMap<Uuid, TaskRecord>>>;

/// Progress writer handed to a worker. Progress is clamped to `[0, 1]` and
/// never decreases; the terminal transition is the engine's alone.
#[derive(Clone)]
pub struct TaskHandle {
    id: Uuid,
    tasks: TaskMap,
}

impl TaskHandle {
    pub fn set_progress(&self, value: f64) {
        let value = value.clamp(0.0, 1.0);
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(record) = tasks.get_mut(&self.id) {
            if matches!(record.state, TaskState::Running) && value > record.progress {
                record.progress = value;
            }
        }
    }
}

/// The `{id, progress, finished}` payload shared by the spawn and poll
/// responses.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressPayload {
    pub id: String,
    pub progress: f64,
    pub finished: bool,
}

struct DedupEntry {
    fingerprint: String,
    task: Uuid,
    created: DateTime<Utc>,
}

/// Registry of running and completed jobs for one controller.
pub struct TaskEngine {
    name: &'static str,
    tasks: TaskMap,
    dedup: Mutex<VecDeque<DedupEntry>>,
}

impl TaskEngine {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            dedup: Mutex::new(VecDeque::new()),
        }
    }

    /// The controller namespace this engine serves.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocates a task and spawns its worker in the background, trapping
    /// both errors and panics into a terminal Error state.
    pub fn run_task<F, Fut>(&self, worker: F) -> Uuid
    where
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.sweep_tasks();

        let id = Uuid::new_v4();
        self.tasks.lock().unwrap().insert(
            id,
            TaskRecord {
                progress: 0.0,
                state: TaskState::Running,
                expire_time: Utc::now() + task_ttl(),
            },
        );

        let handle = TaskHandle {
            id,
            tasks: Arc::clone(&self.tasks),
        };
        let future = worker(handle);
        let tasks = Arc::clone(&self.tasks);
        let namespace = self.name;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            let mut tasks = tasks.lock().unwrap();
            let Some(record) = tasks.get_mut(&id) else {
                return;
            };
            match outcome {
                Ok(Ok(value)) => {
                    record.progress = 1.0;
                    record.state = TaskState::Finished(value);
                }
                Ok(Err(err)) => {
                    tracing::error!(task = %id, namespace, error = %format!("{err:#}"), "task failed");
                    record.state = TaskState::Failed(format!("{err:#}"));
                }
                Err(panic) => {
                    let message = panic_message(panic);
                    tracing::error!(task = %id, namespace, message, "task panicked");
                    record.state = TaskState::Failed(message);
                }
            }
        });

        id
    }

    /// Spawns through the dedup cache: a warm fingerprint hit returns the
    /// existing task instead. The boolean reports whether a task was
    /// reused.
    pub fn run_task_deduped<T, F, Fut>(&self, options: &T, worker: F) -> (Uuid, bool)
    where
        T: Serialize,
        F: FnOnce(TaskHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let fingerprint = fingerprint(options);
        if let Some(existing) = self.dedup_get(&fingerprint) {
            return (existing, true);
        }
        let id = self.run_task(worker);
        self.dedup_put(fingerprint, id);
        (id, false)
    }

    /// Removes every task whose expiry has passed or which terminated in
    /// Error.
    pub fn sweep_tasks(&self) {
        let now = Utc::now();
        self.tasks
            .lock()
            .unwrap()
            .retain(|_, record| record.expire_time > now && !matches!(record.state, TaskState::Failed(_)));
    }

    /// Targeted eviction. With `checks_only` the task is removed only when
    /// expired.
    pub fn sweep_task(&self, id: Uuid, checks_only: bool) {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get(&id) {
            Some(record) if checks_only => {
                if record.expire_time <= Utc::now() {
                    tasks.remove(&id);
                }
            }
            Some(_) => {
                tasks.remove(&id);
            }
            None => {}
        }
    }

    pub fn is_task_existing(&self, id: Uuid) -> bool {
        self.tasks.lock().unwrap().contains_key(&id)
    }

    pub fn is_task_expired(&self, id: Uuid) -> bool {
        match self.tasks.lock().unwrap().get(&id) {
            Some(record) => record.expire_time <= Utc::now(),
            None => true,
        }
    }

    /// Error-state tasks report 1.0.
    pub fn get_task_progress(&self, id: Uuid) -> Option<f64> {
        self.tasks.lock().unwrap().get(&id).map(|record| {
            if matches!(record.state, TaskState::Failed(_)) {
                1.0
            } else {
                record.progress
            }
        })
    }

    pub fn get_task_finished(&self, id: Uuid) -> Option<bool> {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .map(|record| !matches!(record.state, TaskState::Running))
    }

    /// The stored result; `None` within the option for Error-state tasks.
    pub fn get_task_result(&self, id: Uuid) -> Option<Option<serde_json::Value>> {
        self.tasks
            .lock()
            .unwrap()
            .get(&id)
            .map(|record| match &record.state {
                TaskState::Finished(value) => Some(value.clone()),
                _ => None,
            })
    }

    /// Poll protocol: 404 on missing, else `{id, progress, finished}`. The
    /// boolean tells the HTTP layer to add the `Location: ..` header that
    /// guides the client to the result URL.
    pub fn handle_progress_request(
        &self,
        id: Uuid,
    ) -> Result<(ProgressPayload, bool), crate::error::ApiError> {
        self.sweep_task(id, true);
        let tasks = self.tasks.lock().unwrap();
        let record = tasks.get(&id).ok_or(crate::error::ApiError::TaskMissing)?;
        let finished = !matches!(record.state, TaskState::Running);
        let progress = if matches!(record.state, TaskState::Failed(_)) {
            1.0
        } else {
            record.progress
        };
        Ok((
            ProgressPayload {
                id: id.to_string(),
                progress,
                finished,
            },
            finished,
        ))
    }

    /// Result protocol: 404 on missing, 409 before completion, 500 with
    /// the captured message on Error, else the stored result.
    pub fn handle_result_request(
        &self,
        id: Uuid,
    ) -> Result<serde_json::Value, crate::error::ApiError> {
        self.sweep_task(id, true);
        let tasks = self.tasks.lock().unwrap();
        let record = tasks.get(&id).ok_or(crate::error::ApiError::TaskMissing)?;
        match &record.state {
            TaskState::Running => Err(crate::error::ApiError::TaskUnfinished),
            TaskState::Failed(message) => {
                Err(crate::error::ApiError::TaskUncaught(message.clone()))
            }
            TaskState::Finished(value) => Ok(value.clone()),
        }
    }

    fn dedup_get(&self, fingerprint: &str) -> Option<Uuid> {
        let now = Utc::now();
        let mut dedup = self.dedup.lock().unwrap();
        // Stale-aware: drop entries past their TTL or whose task is gone.
        dedup.retain(|entry| {
            now - entry.created < task_ttl() && self.is_task_existing(entry.task)
        });
        dedup
            .iter()
            .find(|entry| entry.fingerprint == fingerprint)
            .map(|entry| entry.task)
    }

    fn dedup_put(&self, fingerprint: String, task: Uuid) {
        let mut dedup = self.dedup.lock().unwrap();
        dedup.push_back(DedupEntry {
            fingerprint,
            task,
            created: Utc::now(),
        });
        while dedup.len() > DEDUP_CAPACITY {
            dedup.pop_front();
        }
    }

    #[cfg(test)]
    fn force_expire(&self, id: Uuid) {
        if let Some(record) = self.tasks.lock().unwrap().get_mut(&id) {
            record.expire_time = Utc::now() - Duration::seconds(1);
        }
    }
}

/// Stable fingerprint of job options: sha256 over a canonical (sorted-key)
/// JSON rendering.
pub fn fingerprint<T: Serialize>(options: &T) -> String {
    let value = serde_json::to_value(options).unwrap_or(serde_json::Value::Null);
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{digest:x}")
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
