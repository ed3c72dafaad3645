//! The engine: one named unit of work capacity.
//!
//! An engine is idle until [`Engine::run`] creates its [`TaskPool`]. Tasks
//! added while idle wait in a pending queue; tasks added while running go
//! straight into the pool. `run` only returns once every task, including
//! the heartbeat loop, has ended.
//!
//! The engine is a cheap handle. Task bodies receive a clone of it, which
//! is how they reach "their" engine without any process-global state.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::FleetError;
use crate::logbuf::LogBuffer;
use crate::pool::TaskPool;
use crate::protocol::{Completion, StatusReport};
use crate::task::{SerializedTask, TaskCall};

/// A queued task body, waiting for the engine it will run on.
pub type EngineTask = Box<dyn FnOnce(Engine) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    name: String,
    size: usize,
    state: Mutex<State>,
    outbox: Mutex<Outbox>,
    logs: LogBuffer,
}

enum State {
    Idle { pending: Vec<EngineTask> },
    Running { pool: TaskPool },
}

/// State waiting for the next heartbeat upload.
#[derive(Debug, Default)]
struct Outbox {
    /// Work this engine hands back to the controller.
    tasks: Vec<SerializedTask>,
    /// Finished dispatched tasks.
    completed: Vec<Completion>,
}

/// Where a heartbeat snapshot ended, so exactly that much can be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadMark {
    tasks: usize,
    completed: usize,
    logs: u64,
}

impl Engine {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self::with_log_buffer(name, size, LogBuffer::new())
    }

    /// Create an engine whose uploaded log lines come from `logs`.
    pub fn with_log_buffer(name: impl Into<String>, size: usize, logs: LogBuffer) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                name: name.into(),
                size: size.max(1),
                state: Mutex::new(State::Idle {
                    pending: Vec::new(),
                }),
                outbox: Mutex::new(Outbox::default()),
                logs,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Running { .. })
    }

    /// Add a task body.
    ///
    /// Idle: appended to the pending queue, unbounded and never executed
    /// until `run`. Running: spawned into the pool immediately, with no
    /// capacity check; admission is the controller's job via `free_count`.
    pub fn add_task<F, Fut>(&self, task: F)
    where
        F: FnOnce(Engine) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_boxed(Box::new(move |engine| Box::pin(task(engine))));
    }

    /// Add one task per argument group, all running the same body.
    pub fn add_tasks<F, Fut, A, I>(&self, task: F, groups: I)
    where
        F: Fn(Engine, A) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        A: Send + 'static,
        I: IntoIterator<Item = A>,
    {
        for args in groups {
            let task = task.clone();
            self.add_task(move |engine| task(engine, args));
        }
    }

    fn add_boxed(&self, task: EngineTask) {
        let pool = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Idle { pending } => {
                    pending.push(task);
                    return;
                }
                State::Running { pool } => pool.clone(),
            }
        };
        if !pool.spawn(task(self.clone())) {
            debug!(engine = %self.name(), "engine is shutting down, task dropped");
        }
    }

    /// Start the pool, drain the pending queue into it and wait for every task to end.
    ///
    /// Fails with [`FleetError::AlreadyRunning`] if the engine is running.
    /// Back to idle, with an empty pending queue, when it returns.
    pub async fn run(&self) -> Result<(), FleetError> {
        let (pool, pending) = {
            let mut state = self.inner.state.lock();
            let pending = match &mut *state {
                State::Running { .. } => {
                    return Err(FleetError::AlreadyRunning(self.inner.name.clone()))
                }
                State::Idle { pending } => std::mem::take(pending),
            };
            let pool = TaskPool::new(self.inner.size);
            *state = State::Running { pool: pool.clone() };
            (pool, pending)
        };

        info!(engine = %self.name(), size = self.size(), pending = pending.len(), "engine running");
        for task in pending {
            pool.spawn(task(self.clone()));
        }

        pool.join().await;

        *self.inner.state.lock() = State::Idle {
            pending: Vec::new(),
        };
        info!(engine = %self.name(), "engine stopped");
        Ok(())
    }

    /// Abort every task in the pool, the caller included if it is one of them.
    pub fn cancel(&self) {
        let pool = match &*self.inner.state.lock() {
            State::Running { pool } => pool.clone(),
            State::Idle { .. } => return,
        };
        info!(engine = %self.name(), tasks = pool.count(), "cancelling all tasks");
        pool.close();
    }

    /// Tasks scheduled in the pool. Always 0 while idle.
    pub fn task_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Running { pool } => pool.count(),
            State::Idle { .. } => 0,
        }
    }

    /// Tasks waiting for `run`. Always 0 while running.
    pub fn pending_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Idle { pending } => pending.len(),
            State::Running { .. } => 0,
        }
    }

    /// `size - task_count`, never negative.
    pub fn free_count(&self) -> usize {
        self.size().saturating_sub(self.task_count())
    }

    /// Queue `call` for the controller to distribute; uploaded on the next heartbeat.
    pub fn submit(&self, call: &TaskCall) -> Result<(), FleetError> {
        let encoded = call.encode()?;
        self.inner.outbox.lock().tasks.push(encoded);
        Ok(())
    }

    pub(crate) fn record_completion(&self, completion: Completion) {
        self.inner.outbox.lock().completed.push(completion);
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.inner.logs
    }

    /// Build the next heartbeat upload without clearing anything.
    pub fn snapshot(&self) -> (StatusReport, UploadMark) {
        let free_count = u32::try_from(self.free_count()).unwrap_or(u32::MAX);
        let (logs, log_mark) = self.inner.logs.snapshot();
        let outbox = self.inner.outbox.lock();
        let mark = UploadMark {
            tasks: outbox.tasks.len(),
            completed: outbox.completed.len(),
            logs: log_mark,
        };
        let report = StatusReport {
            engine: self.inner.name.clone(),
            tasks: outbox.tasks.clone(),
            free_count,
            completed_tasks: outbox.completed.clone(),
            logs,
        };
        (report, mark)
    }

    /// Drop what a confirmed upload carried. Entries added since the snapshot stay.
    pub fn acknowledge(&self, mark: UploadMark) {
        {
            let mut outbox = self.inner.outbox.lock();
            let tasks = mark.tasks.min(outbox.tasks.len());
            outbox.tasks.drain(..tasks);
            let completed = mark.completed.min(outbox.completed.len());
            outbox.completed.drain(..completed);
        }
        self.inner.logs.acknowledge(mark.logs);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name())
            .field("size", &self.size())
            .field("running", &self.is_running())
            .finish()
    }
}
