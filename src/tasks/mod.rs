//! Asynchronous checkout dispatch and status tracking.
//!
//! Requesting an environment is non-blocking: the work is submitted to a
//! bounded worker pool and the caller gets a task id back immediately.
//! Each task moves through an explicit handle state (`Pending`, then
//! `Running`, then `Done` with its result) and pollers read that handle
//! without blocking. Reading a finished result removes it from the pool,
//! which is the completion signal for the release-on-read pattern at the
//! boundary.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::orchestrator::Environment;

/// Identifier of a submitted checkout task.
pub type TaskId = String;

/// Stable status vocabulary exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
}

/// Result payload of a checkout task.
///
/// A structurally successful task can still represent a semantic failure:
/// the `error` field carries it, and status mapping honors it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(environment: Environment) -> Self {
        Self {
            environment: Some(environment),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            environment: None,
            error: Some(error.into()),
        }
    }
}

/// Lifecycle of one submitted task.
#[derive(Debug, Clone)]
pub enum TaskState {
    Pending,
    Running,
    Done(TaskResult),
}

/// A bounded worker pool executing checkout tasks.
///
/// Submission never blocks; tasks queue on the worker semaphore. Results
/// stay in the pool until read through [`check_environment_status`] so
/// they do not accumulate without bound.
#[derive(Clone)]
pub struct TaskPool {
    workers: Arc<Semaphore>,
    tasks: Arc<Mutex<HashMap<TaskId, TaskState>>>,
}

impl TaskPool {
    /// Create a pool with the given number of workers.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(workers.max(1))),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a unit of work; returns its task id immediately.
    pub fn submit<F>(&self, work: F) -> TaskId
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.tasks
            .lock()
            .unwrap()
            .insert(id.clone(), TaskState::Pending);

        let workers = self.workers.clone();
        let tasks = self.tasks.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .expect("task pool semaphore closed");
            tasks
                .lock()
                .unwrap()
                .insert(task_id.clone(), TaskState::Running);
            debug!("Task {} started", task_id);

            let result = work.await;

            tasks
                .lock()
                .unwrap()
                .insert(task_id.clone(), TaskState::Done(result));
            debug!("Task {} finished", task_id);
        });

        id
    }

    /// Non-blocking read of a task's state.
    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.lock().unwrap().get(task_id).cloned()
    }

    /// Drop a task and its result from the pool.
    pub fn forget(&self, task_id: &str) {
        self.tasks.lock().unwrap().remove(task_id);
    }
}

/// Status and result of a checkout task, as exposed to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

/// Map a task's handle state to the caller-facing status.
///
/// A present result with a non-null `error` field forces `FAILURE` even
/// though the task itself completed. Once a result has been read it is
/// forgotten, so a later poll for the same id reports the task as unknown.
pub fn check_environment_status(pool: &TaskPool, task_id: &str) -> Option<StatusReport> {
    let state = pool.state(task_id)?;
    let report = match state {
        TaskState::Pending => StatusReport {
            status: TaskStatus::Pending,
            result: None,
        },
        TaskState::Running => StatusReport {
            status: TaskStatus::Started,
            result: None,
        },
        TaskState::Done(result) => {
            let status = if result.error.is_some() {
                TaskStatus::Failure
            } else {
                TaskStatus::Success
            };
            pool.forget(task_id);
            StatusReport {
                status,
                result: Some(result),
            }
        }
    };
    Some(report)
}
