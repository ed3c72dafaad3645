//! Controller side of the wire contract.
//!
//! [`ControllerServer`] answers heartbeats with any [`StatusHandler`].
//! [`FifoController`] is a small reference handler for development and
//! tests; production scheduling policies implement `StatusHandler`
//! themselves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::protocol::{AssignedTask, Completion, StatusReply, StatusReport, MANAGER_ID, STATUS_REPLY};
use crate::reqrep::RequestServer;
use crate::task::{SerializedTask, TaskCode};
use crate::traits::StatusHandler;
use crate::transport::Transport;

pub struct ControllerServer {
    server: RequestServer,
}

impl ControllerServer {
    pub async fn bind(transport: &Transport) -> Result<Self, FleetError> {
        Ok(Self {
            server: RequestServer::bind(transport).await?,
        })
    }

    /// Answer heartbeats until `shutdown` is notified.
    ///
    /// Malformed requests are logged and skipped; only a failed reply send
    /// ends the loop with an error.
    pub async fn serve(&self, handler: Arc<dyn StatusHandler>, shutdown: Arc<Notify>) -> Result<(), FleetError> {
        let stop = shutdown.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        loop {
            let (token, request) = tokio::select! {
                _ = &mut stop => {
                    info!("controller shutting down");
                    return Ok(());
                }
                received = self.server.recv_request() => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "bad heartbeat request");
                        continue;
                    }
                },
            };

            let report: StatusReport = match request.decode() {
                Ok(report) => report,
                Err(e) => {
                    warn!(topic = %request.topic, error = %e, "undecodable status report");
                    continue;
                }
            };
            let reply = handler.handle(report).await;
            self.server
                .send_reply(token, request.reply(STATUS_REPLY, &reply)?)
                .await?;
        }
    }
}

// ── FIFO reference controller ────────────────────────────────────────

/// Hands out tasks first-in first-out, never more than an engine's `free_count`.
///
/// Uploaded tasks (the manager's batch and anything engines submit) are
/// queued and given codes `t-<n>`. With [`FifoController::quit_when_drained`]
/// every engine is told to quit once the queue is empty and nothing is
/// outstanding.
///
/// A completion repeated by a retried heartbeat is recorded once. Uploaded
/// tasks carry no identity, so a retried upload queues its tasks again.
#[derive(Default)]
pub struct FifoController {
    state: Mutex<FifoState>,
    quit_when_drained: bool,
}

#[derive(Default)]
struct FifoState {
    queue: VecDeque<AssignedTask>,
    /// Code → engine it was handed to.
    outstanding: HashMap<TaskCode, String>,
    completed: Vec<Completion>,
    finished: HashSet<TaskCode>,
    next_code: u64,
}

impl FifoState {
    fn enqueue(&mut self, task: SerializedTask) -> TaskCode {
        self.next_code += 1;
        let code = TaskCode::new(format!("t-{}", self.next_code));
        self.queue.push_back(AssignedTask {
            code: code.clone(),
            task,
        });
        code
    }
}

impl FifoController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quit_when_drained(mut self, enabled: bool) -> Self {
        self.quit_when_drained = enabled;
        self
    }

    pub fn enqueue(&self, task: SerializedTask) -> TaskCode {
        self.state.lock().enqueue(task)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Every completion reported so far, in arrival order.
    pub fn completed(&self) -> Vec<Completion> {
        self.state.lock().completed.clone()
    }
}

#[async_trait]
impl StatusHandler for FifoController {
    async fn handle(&self, report: StatusReport) -> StatusReply {
        let engine = report.engine;
        for line in &report.logs {
            info!(target: "fleet::engine_log", engine = %engine, "{line}");
        }

        let mut state = self.state.lock();
        for task in report.tasks {
            let code = state.enqueue(task);
            debug!(engine = %engine, code = %code, "task queued");
        }
        for completion in report.completed_tasks {
            if !state.finished.insert(completion.code.clone()) {
                debug!(engine = %engine, code = %completion.code, "duplicate completion ignored");
                continue;
            }
            if state.outstanding.remove(&completion.code).is_none() {
                warn!(engine = %engine, code = %completion.code, "completion for unknown task");
            }
            state.completed.push(completion);
        }

        if engine == MANAGER_ID {
            return StatusReply::idle();
        }

        let take = (report.free_count as usize).min(state.queue.len());
        if take > 0 {
            let batch: Vec<AssignedTask> = state.queue.drain(..take).collect();
            for assigned in &batch {
                state.outstanding.insert(assigned.code.clone(), engine.clone());
            }
            debug!(engine = %engine, tasks = batch.len(), "tasks handed out");
            return StatusReply::add(batch);
        }

        if self.quit_when_drained && state.queue.is_empty() && state.outstanding.is_empty() {
            return StatusReply::quit();
        }
        StatusReply::idle()
    }
}
