//! Wire contract between engines and the controller.
//!
//! Every heartbeat is one [`StatusReport`] answered by one [`StatusReply`].
//! Both travel inside an [`Envelope`] whose `correlation_id` pairs the
//! reply with its request on the DEALER/ROUTER sockets.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FleetError;
use crate::task::{SerializedTask, TaskCode};

/// Topic of a heartbeat upload.
pub const STATUS: &str = "fleet.status";

/// Topic of the controller's answer.
pub const STATUS_REPLY: &str = "fleet.status.reply";

/// Engine name the manager uses for its one-shot bootstrap upload.
pub const MANAGER_ID: &str = "manager";

// ── Envelope ─────────────────────────────────────────────────────────

/// MessagePack envelope around a request or reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,

    #[serde(with = "raw_bytes")]
    pub payload: Vec<u8>,

    pub sent_at: DateTime<Utc>,

    pub correlation_id: Uuid,

    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Envelope {
    /// Wrap `payload` under a fresh correlation id.
    pub fn new<T: Serialize>(topic: &str, payload: &T) -> Result<Self, FleetError> {
        Self::with_correlation(topic, payload, Uuid::new_v4())
    }

    pub fn with_correlation<T: Serialize>(
        topic: &str,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, FleetError> {
        Ok(Self {
            topic: topic.to_string(),
            payload: rmp_serde::to_vec_named(payload)?,
            sent_at: Utc::now(),
            correlation_id,
            version: 1,
        })
    }

    /// Build the answer to this envelope, keeping its correlation id.
    pub fn reply<T: Serialize>(&self, topic: &str, payload: &T) -> Result<Self, FleetError> {
        Self::with_correlation(topic, payload, self.correlation_id)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FleetError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FleetError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FleetError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ── Requests ─────────────────────────────────────────────────────────

/// How a dispatched task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed { error: String },
}

/// A finished task, reported once on the next heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub code: TaskCode,
    pub outcome: Outcome,
}

impl Completion {
    pub fn succeeded(code: TaskCode) -> Self {
        Self {
            code,
            outcome: Outcome::Succeeded,
        }
    }

    pub fn failed(code: TaskCode, error: impl Into<String>) -> Self {
        Self {
            code,
            outcome: Outcome::Failed {
                error: error.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded)
    }
}

/// One heartbeat upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Engine name, or [`MANAGER_ID`] for the bootstrap upload.
    pub engine: String,

    /// Tasks queued locally that the controller has not acknowledged yet.
    pub tasks: Vec<SerializedTask>,

    /// Spare capacity of the engine right now.
    pub free_count: u32,

    /// Tasks finished since the last acknowledged upload.
    pub completed_tasks: Vec<Completion>,

    /// Log lines accumulated since the last acknowledged upload.
    pub logs: Vec<String>,
}

impl StatusReport {
    /// The manager's hand-off of the initial batch.
    pub fn bootstrap(tasks: Vec<SerializedTask>) -> Self {
        Self {
            engine: MANAGER_ID.to_string(),
            tasks,
            free_count: 0,
            completed_tasks: Vec::new(),
            logs: Vec::new(),
        }
    }
}

// ── Replies ──────────────────────────────────────────────────────────

/// Directive for the current heartbeat cycle.
///
/// Encoded as `"add"`, `"quit"` or `""`. Anything unrecognised decodes
/// as [`Command::None`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Add,
    Quit,
    #[default]
    None,
}

impl From<String> for Command {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "add" => Self::Add,
            "quit" => Self::Quit,
            _ => Self::None,
        }
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        match command {
            Command::Add => "add",
            Command::Quit => "quit",
            Command::None => "",
        }
        .to_string()
    }
}

/// A task the controller hands to an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub code: TaskCode,
    pub task: SerializedTask,
}

/// The controller's answer to a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub command: Command,

    /// Only meaningful when `command` is [`Command::Add`].
    #[serde(default)]
    pub tasks: Vec<AssignedTask>,
}

impl StatusReply {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn quit() -> Self {
        Self {
            command: Command::Quit,
            tasks: Vec::new(),
        }
    }

    pub fn add(tasks: Vec<AssignedTask>) -> Self {
        Self {
            command: Command::Add,
            tasks,
        }
    }
}

/// Serde helper so byte vectors use the MessagePack bin type, not an array of ints.
pub(crate) mod raw_bytes {
    use std::fmt;

    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        d.deserialize_byte_buf(BytesVisitor)
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte buffer")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskCall;

    #[test]
    fn command_wire_strings() {
        let json = serde_json::to_string(&Command::Quit).unwrap();
        assert_eq!(json, "\"quit\"");
        let none: Command = serde_json::from_str("\"\"").unwrap();
        assert_eq!(none, Command::None);
        let odd: Command = serde_json::from_str("\"reboot\"").unwrap();
        assert_eq!(odd, Command::None);
    }

    #[test]
    fn reply_keeps_correlation_id() {
        let request = Envelope::new(STATUS, &StatusReport::bootstrap(Vec::new())).unwrap();
        let reply = request.reply(STATUS_REPLY, &StatusReply::quit()).unwrap();
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.decode::<StatusReply>().unwrap().command, Command::Quit);
    }

    #[test]
    fn add_reply_through_envelope_bytes() {
        let task = TaskCall::call("sleep", vec![serde_json::json!(10)]).encode().unwrap();
        let reply = StatusReply::add(vec![AssignedTask {
            code: TaskCode::new("t-1"),
            task,
        }]);
        let env = Envelope::new(STATUS_REPLY, &reply).unwrap();
        let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        let decoded: StatusReply = back.decode().unwrap();
        assert_eq!(decoded, reply);
        assert_eq!(decoded.tasks[0].task.decode().unwrap().target(), "sleep");
    }

    #[test]
    fn failed_completion_carries_error() {
        let report = StatusReport {
            engine: "alpha".into(),
            tasks: Vec::new(),
            free_count: 3,
            completed_tasks: vec![
                Completion::succeeded("t-1".into()),
                Completion::failed("t-2".into(), "boom"),
            ],
            logs: vec!["hello".into()],
        };
        let env = Envelope::new(STATUS, &report).unwrap();
        let decoded: StatusReport = env.decode().unwrap();
        assert_eq!(decoded, report);
        assert!(!decoded.completed_tasks[1].is_success());
    }

    #[test]
    fn bootstrap_report_has_no_capacity() {
        let report = StatusReport::bootstrap(Vec::new());
        assert_eq!(report.engine, MANAGER_ID);
        assert_eq!(report.free_count, 0);
        assert!(report.completed_tasks.is_empty() && report.logs.is_empty());
    }
}
