//! Heartbeat loop behaviour against a scripted in-process controller.
//!
//! Tests cover quit handling, dispatch and completion reporting, failure
//! containment, cancellation on quit, retransmission after failed uploads
//! and reconnect policies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use stupid_fleet::{
    AssignedTask, Engine, FleetError, Outcome, StatusChannel, StatusReply, StatusReport, SyncLoop,
    TaskCall, TaskCode, TaskRegistry,
};

const INTERVAL: Duration = Duration::from_millis(10);
const DEADLINE: Duration = Duration::from_secs(5);

/// Replays `script`; once it is exhausted answers "quit" as soon as
/// `quit_after` completions have been seen, idle before that.
struct ScriptedChannel {
    script: Mutex<VecDeque<Result<StatusReply, FleetError>>>,
    reports: Mutex<Vec<StatusReport>>,
    quit_after: usize,
}

impl ScriptedChannel {
    fn new(script: Vec<Result<StatusReply, FleetError>>, quit_after: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            reports: Mutex::new(Vec::new()),
            quit_after,
        })
    }

    fn reports(&self) -> Vec<StatusReport> {
        self.reports.lock().clone()
    }

    fn completions(&self) -> Vec<stupid_fleet::Completion> {
        self.reports
            .lock()
            .iter()
            .flat_map(|r| r.completed_tasks.clone())
            .collect()
    }
}

#[async_trait]
impl StatusChannel for ScriptedChannel {
    async fn send_status(&self, report: &StatusReport) -> Result<StatusReply, FleetError> {
        let mut reports = self.reports.lock();
        reports.push(report.clone());
        if let Some(next) = self.script.lock().pop_front() {
            return next;
        }
        let seen: usize = reports.iter().map(|r| r.completed_tasks.len()).sum();
        if seen >= self.quit_after {
            Ok(StatusReply::quit())
        } else {
            Ok(StatusReply::idle())
        }
    }
}

fn assigned(code: &str, target: &str, args: Vec<Value>) -> AssignedTask {
    AssignedTask {
        code: TaskCode::new(code),
        task: TaskCall::call(target, args).encode().unwrap(),
    }
}

fn registry(seen: Arc<Mutex<Vec<Value>>>) -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry
        .register("record", move |_engine: Engine, args: Vec<Value>| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().extend(args);
                Ok(())
            }
        })
        .register("nap", |_engine: Engine, args: Vec<Value>| async move {
            let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        })
        .register("boom", |_engine: Engine, _args: Vec<Value>| async move {
            anyhow::bail!("boom went the task")
        })
        .register("panic", |_engine: Engine, _args: Vec<Value>| async move {
            if true {
                panic!("task panicked");
            }
            Ok(())
        });
    Arc::new(registry)
}

async fn run_to_end(engine: &Engine) {
    tokio::time::timeout(DEADLINE, engine.run())
        .await
        .expect("engine did not stop")
        .unwrap();
}

#[tokio::test]
async fn quit_stops_the_engine() {
    let channel = ScriptedChannel::new(vec![], 0);
    let engine = Engine::new("alpha", 4);
    SyncLoop::new(channel.clone(), registry(Default::default()))
        .interval(INTERVAL)
        .install(&engine);

    run_to_end(&engine).await;

    let reports = channel.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].engine, "alpha");
    assert_eq!(reports[0].free_count, 3, "the loop itself holds one slot");
    assert!(!engine.is_running());
    assert_eq!(engine.task_count(), 0);
}

#[tokio::test]
async fn assigned_tasks_run_and_are_reported_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let channel = ScriptedChannel::new(
        vec![Ok(StatusReply::add(vec![
            assigned("t-1", "record", vec![json!("a")]),
            assigned("t-2", "record", vec![json!("b")]),
        ]))],
        2,
    );
    let engine = Engine::new("alpha", 4);
    SyncLoop::new(channel.clone(), registry(Arc::clone(&seen)))
        .interval(INTERVAL)
        .install(&engine);

    run_to_end(&engine).await;

    let mut values = seen.lock().clone();
    values.sort_by_key(|v| v.to_string());
    assert_eq!(values, vec![json!("a"), json!("b")]);

    let mut codes: Vec<_> = channel.completions().into_iter().map(|c| c.code).collect();
    codes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(codes, vec![TaskCode::new("t-1"), TaskCode::new("t-2")]);
    assert!(channel.completions().iter().all(|c| c.is_success()));
}

#[tokio::test]
async fn failures_are_reported_and_the_loop_continues() {
    let channel = ScriptedChannel::new(
        vec![Ok(StatusReply::add(vec![
            assigned("t-1", "boom", vec![]),
            assigned("t-2", "panic", vec![]),
            assigned("t-3", "no_such_target", vec![]),
        ]))],
        3,
    );
    let engine = Engine::new("alpha", 8);
    SyncLoop::new(channel.clone(), registry(Default::default()))
        .interval(INTERVAL)
        .install(&engine);

    run_to_end(&engine).await;

    let completions = channel.completions();
    assert_eq!(completions.len(), 3);
    let error_of = |code: &str| {
        completions
            .iter()
            .find(|c| c.code.as_str() == code)
            .map(|c| match &c.outcome {
                Outcome::Failed { error } => error.clone(),
                Outcome::Succeeded => panic!("{code} should have failed"),
            })
            .unwrap()
    };
    assert!(error_of("t-1").contains("boom went the task"));
    assert!(error_of("t-2").contains("task panicked"));
    assert!(error_of("t-3").contains("unknown task target"));
    assert!(channel.reports().len() >= 2, "loop survived the failures");
}

#[tokio::test]
async fn over_admitted_tasks_all_complete() {
    let tasks = (1..=5)
        .map(|i| assigned(&format!("t-{i}"), "nap", vec![json!(20)]))
        .collect();
    let channel = ScriptedChannel::new(vec![Ok(StatusReply::add(tasks))], 5);
    let engine = Engine::new("alpha", 3);
    SyncLoop::new(channel.clone(), registry(Default::default()))
        .interval(INTERVAL)
        .install(&engine);

    run_to_end(&engine).await;

    assert_eq!(channel.completions().len(), 5);
    assert!(
        channel.reports().iter().any(|r| r.free_count == 0),
        "free_count clamps at zero while over capacity"
    );
}

#[tokio::test]
async fn failed_upload_is_resent_unchanged() {
    let channel = ScriptedChannel::new(
        vec![
            Err(FleetError::Transport("controller gone".into())),
            Ok(StatusReply::idle()),
        ],
        0,
    );
    let engine = Engine::new("alpha", 4);
    engine
        .submit(&TaskCall::call("record", vec![json!(1)]))
        .unwrap();
    SyncLoop::new(channel.clone(), registry(Default::default()))
        .interval(INTERVAL)
        .policy(|_: &Engine, _failures: u32| true)
        .install(&engine);

    run_to_end(&engine).await;

    let reports = channel.reports();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[0].tasks.len(), 1);
    assert_eq!(reports[0].tasks, reports[1].tasks, "nothing cleared after a failure");
    assert!(reports[2].tasks.is_empty(), "cleared after confirmation");
}

#[tokio::test]
async fn policy_stop_ends_the_loop() {
    let failures = (0..10)
        .map(|_| Err(FleetError::Transport("down".into())))
        .collect();
    let channel = ScriptedChannel::new(failures, 0);
    let engine = Engine::new("alpha", 4);
    SyncLoop::new(channel.clone(), registry(Default::default()))
        .interval(INTERVAL)
        .policy(|_: &Engine, failures: u32| failures < 2)
        .install(&engine);

    run_to_end(&engine).await;

    assert_eq!(channel.reports().len(), 3);
}

#[tokio::test]
async fn submitted_work_and_logs_are_uploaded() {
    let channel = ScriptedChannel::new(vec![Ok(StatusReply::idle())], 0);
    let engine = Engine::new("alpha", 4);
    engine.log_buffer().push("engine warming up");
    SyncLoop::new(channel.clone(), registry(Default::default()))
        .interval(INTERVAL)
        .install(&engine);
    engine
        .submit(&TaskCall::call("record", vec![json!("later")]))
        .unwrap();

    run_to_end(&engine).await;

    let reports = channel.reports();
    assert_eq!(reports[0].logs, vec!["engine warming up".to_string()]);
    assert_eq!(reports[0].tasks[0].decode().unwrap().target(), "record");
    assert!(reports[1].logs.is_empty());
    assert!(reports[1].tasks.is_empty());
}

#[tokio::test]
async fn quit_cancels_running_tasks() {
    let naps = vec![
        assigned("t-1", "nap", vec![json!(3_600_000)]),
        assigned("t-2", "nap", vec![json!(3_600_000)]),
    ];
    let channel = ScriptedChannel::new(
        vec![Ok(StatusReply::add(naps)), Ok(StatusReply::quit())],
        0,
    );
    let engine = Engine::new("alpha", 2);
    SyncLoop::new(channel.clone(), registry(Default::default()))
        .interval(INTERVAL)
        .install(&engine);

    let started = std::time::Instant::now();
    run_to_end(&engine).await;
    assert!(started.elapsed() < Duration::from_secs(2), "long naps were not waited for");

    let free: Vec<u32> = channel.reports().iter().map(|r| r.free_count).collect();
    assert_eq!(free, vec![1, 0], "two naps over-admit a size-2 engine");
    assert!(channel.completions().is_empty(), "cancelled tasks are not reported");
    assert_eq!(engine.task_count(), 0);
    assert!(!engine.is_running());
}
