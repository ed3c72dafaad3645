//! Heartbeat loop keeping one engine in step with the controller.
//!
//! The loop is itself a task in the engine's pool and occupies one slot.
//! Each cycle is strictly sequential:
//!
//! 1. snapshot the outbox (queued tasks, completions, logs)
//! 2. upload it with `free_count`
//! 3. on a reply, acknowledge exactly the snapshot, then apply the command
//! 4. sleep
//!
//! Nothing is cleared before the controller confirms, so a retried cycle
//! uploads the same content again.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::FleetError;
use crate::pool::panic_message;
use crate::protocol::{AssignedTask, Command, Completion};
use crate::task::TaskRegistry;
use crate::traits::StatusChannel;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

// ── Reconnect policy ─────────────────────────────────────────────────

/// What to do after a failed heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// Try again after the regular heartbeat interval.
    Retry,
    /// Try again after the given delay.
    RetryAfter(Duration),
    /// Give up; the loop ends and the engine keeps running unsynchronised.
    Stop,
}

/// Decides whether a failing heartbeat keeps retrying.
///
/// `failures` counts consecutive failures before this one, so the first
/// failure is reported as 0.
pub trait ReconnectPolicy: Send + Sync {
    fn on_failure(&self, engine: &Engine, failures: u32) -> Reconnect;
}

/// Plain predicates work as policies: `true` retries after the heartbeat interval.
impl<F> ReconnectPolicy for F
where
    F: Fn(&Engine, u32) -> bool + Send + Sync,
{
    fn on_failure(&self, engine: &Engine, failures: u32) -> Reconnect {
        if self(engine, failures) {
            Reconnect::Retry
        } else {
            Reconnect::Stop
        }
    }
}

/// Default policy: doubling delay with a cap.
///
/// Gives up after `max_failures` consecutive failures, but only while the
/// engine has nothing but the heartbeat loop running. Engines with work in
/// flight keep retrying at `max_delay` so completions are not lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_failures: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INTERVAL,
            max_delay: Duration::from_secs(60),
            max_failures: Some(30),
        }
    }
}

impl ExponentialBackoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max_delay)
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn on_failure(&self, engine: &Engine, failures: u32) -> Reconnect {
        let exhausted = self.max_failures.is_some_and(|max| failures.saturating_add(1) >= max);
        if exhausted && engine.task_count() <= 1 {
            return Reconnect::Stop;
        }
        Reconnect::RetryAfter(self.delay(failures))
    }
}

// ── Heartbeat loop ───────────────────────────────────────────────────

/// Result of one heartbeat cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Continue,
    Quit,
}

pub struct SyncLoop {
    channel: Arc<dyn StatusChannel>,
    registry: Arc<TaskRegistry>,
    interval: Duration,
    policy: Arc<dyn ReconnectPolicy>,
}

impl SyncLoop {
    pub fn new(channel: Arc<dyn StatusChannel>, registry: Arc<TaskRegistry>) -> Self {
        Self {
            channel,
            registry,
            interval: DEFAULT_INTERVAL,
            policy: Arc::new(ExponentialBackoff::default()),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Register the loop as a task of `engine`. Call before adding other
    /// tasks to make it the first pending task.
    pub fn install(self, engine: &Engine) {
        engine.add_task(move |engine| async move { self.run(engine).await.map_err(anyhow::Error::from) });
    }

    /// Heartbeat until the controller says quit or the policy gives up.
    pub async fn run(self, engine: Engine) -> Result<(), FleetError> {
        info!(engine = %engine.name(), interval = ?self.interval, "heartbeat loop started");
        let mut failures = 0u32;
        loop {
            let delay = match self.cycle(&engine).await {
                Ok(Cycle::Quit) => {
                    info!(engine = %engine.name(), "quit received");
                    engine.cancel();
                    return Ok(());
                }
                Ok(Cycle::Continue) => {
                    if failures > 0 {
                        info!(engine = %engine.name(), failures, "controller reachable again");
                    }
                    failures = 0;
                    self.interval
                }
                Err(e) => {
                    warn!(engine = %engine.name(), failures, error = %e, "heartbeat failed");
                    let delay = match self.policy.on_failure(&engine, failures) {
                        Reconnect::Stop => {
                            warn!(engine = %engine.name(), failures, "giving up on controller");
                            return Err(e);
                        }
                        Reconnect::Retry => self.interval,
                        Reconnect::RetryAfter(delay) => delay,
                    };
                    failures = failures.saturating_add(1);
                    delay
                }
            };
            self.pause(delay).await;
        }
    }

    /// Upload once and apply the reply.
    pub async fn cycle(&self, engine: &Engine) -> Result<Cycle, FleetError> {
        let (report, mark) = engine.snapshot();
        let reply = self.channel.send_status(&report).await?;
        engine.acknowledge(mark);

        match reply.command {
            Command::Add => {
                debug!(engine = %engine.name(), tasks = reply.tasks.len(), "tasks assigned");
                for assigned in reply.tasks {
                    self.dispatch(engine, assigned);
                }
                Ok(Cycle::Continue)
            }
            Command::Quit => Ok(Cycle::Quit),
            Command::None => Ok(Cycle::Continue),
        }
    }

    /// Hand an assigned task to the engine, wrapped so its code is reported when it ends.
    fn dispatch(&self, engine: &Engine, assigned: AssignedTask) {
        let AssignedTask { code, task } = assigned;
        let call = match task.decode() {
            Ok(call) => call,
            Err(e) => {
                warn!(engine = %engine.name(), code = %code, error = %e, "undecodable task");
                engine.record_completion(Completion::failed(code, format!("undecodable task: {e}")));
                return;
            }
        };

        let registry = Arc::clone(&self.registry);
        engine.add_task(move |engine| async move {
            let body = registry.invoke(engine.clone(), call);
            match AssertUnwindSafe(body).catch_unwind().await {
                Ok(Ok(())) => {
                    engine.record_completion(Completion::succeeded(code));
                    Ok(())
                }
                Ok(Err(e)) => {
                    engine.record_completion(Completion::failed(code, format!("{e:#}")));
                    Err(e)
                }
                Err(panic) => {
                    engine.record_completion(Completion::failed(code, panic_message(panic.as_ref())));
                    std::panic::resume_unwind(panic)
                }
            }
        });
    }

    /// The timer sleep is a suspension point, so sibling tasks run during
    /// it whether or not the loop is alone in the pool.
    async fn pause(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}
