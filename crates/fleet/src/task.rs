//! Task descriptors and the registry of callable targets.
//!
//! A task never carries code across the process boundary. It names a
//! target that every engine process registers in its [`TaskRegistry`],
//! plus JSON arguments, and travels as MessagePack bytes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::Engine;
use crate::error::FleetError;

/// Opaque correlation code assigned by whichever side created the task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskCode(String);

impl TaskCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// What to run: a named target with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskCall {
    Call { target: String, args: Vec<Value> },
}

impl TaskCall {
    pub fn call(target: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            target: target.into(),
            args,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Call { target, .. } => target,
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            Self::Call { args, .. } => args,
        }
    }

    /// Encode for the wire. Field names are kept so the tag survives decoding.
    pub fn encode(&self) -> Result<SerializedTask, FleetError> {
        Ok(SerializedTask(rmp_serde::to_vec_named(self)?))
    }
}

/// MessagePack bytes of a [`TaskCall`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedTask(#[serde(with = "crate::protocol::raw_bytes")] Vec<u8>);

impl SerializedTask {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn decode(&self) -> Result<TaskCall, FleetError> {
        Ok(rmp_serde::from_slice(&self.0)?)
    }
}

impl fmt::Debug for SerializedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerializedTask({} bytes)", self.0.len())
    }
}

/// Type-erased task body. Receives the engine it runs on and the call arguments.
pub type TaskFn = Arc<dyn Fn(Engine, Vec<Value>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps target names to task bodies.
///
/// Built once per process before the engine starts and shared read-only
/// afterwards. Every process in a fleet must register the same targets.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `target`, replacing any previous entry.
    pub fn register<F, Fut>(&mut self, target: &str, handler: F) -> &mut Self
    where
        F: Fn(Engine, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: TaskFn = Arc::new(move |engine: Engine, args: Vec<Value>| {
            Box::pin(handler(engine, args)) as BoxFuture<'static, anyhow::Result<()>>
        });
        if self.handlers.insert(target.to_string(), handler).is_some() {
            tracing::debug!(task_target = target, "replaced task target");
        }
        self
    }

    pub fn contains(&self, target: &str) -> bool {
        self.handlers.contains_key(target)
    }

    pub fn targets(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Build the future for `call`. Unknown targets resolve to an error.
    pub fn invoke(&self, engine: Engine, call: TaskCall) -> BoxFuture<'static, anyhow::Result<()>> {
        let TaskCall::Call { target, args } = call;
        match self.handlers.get(&target) {
            Some(handler) => handler(engine, args),
            None => Box::pin(async move { Err(anyhow::anyhow!("unknown task target '{target}'")) }),
        }
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("targets", &self.targets())
            .finish()
    }
}
