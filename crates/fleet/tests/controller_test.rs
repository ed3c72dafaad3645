//! ZeroMQ round trips between engines, the manager and a controller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;

use stupid_fleet::{
    Command, ControllerClient, ControllerServer, Engine, EngineLaunch, FifoController, FleetError,
    LogBuffer, Manager, StatusChannel, StatusReport, TaskCall, TaskRegistry, Transport,
};

const SETTLE: Duration = Duration::from_millis(200);
const TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    controller: Arc<FifoController>,
    shutdown: Arc<Notify>,
    handle: tokio::task::JoinHandle<Result<(), FleetError>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.notify_waiters();
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("controller did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn start_controller(transport: &Transport, controller: FifoController) -> Running {
    let server = ControllerServer::bind(transport).await.unwrap();
    let controller = Arc::new(controller);
    let shutdown = Arc::new(Notify::new());
    let handler = Arc::clone(&controller);
    let stop = Arc::clone(&shutdown);
    let handle = tokio::spawn(async move { server.serve(handler, stop).await });
    tokio::time::sleep(SETTLE).await;
    Running {
        controller,
        shutdown,
        handle,
    }
}

fn task(target: &str, args: Vec<Value>) -> stupid_fleet::SerializedTask {
    TaskCall::call(target, args).encode().unwrap()
}

#[tokio::test]
async fn heartbeat_round_trip() {
    let transport = Transport::tcp("127.0.0.1", 17500);
    let fifo = FifoController::new();
    fifo.enqueue(task("sleep", vec![json!(1)]));
    fifo.enqueue(task("sleep", vec![json!(2)]));
    fifo.enqueue(task("sleep", vec![json!(3)]));
    let running = start_controller(&transport, fifo).await;

    let client = ControllerClient::connect(transport.clone(), TIMEOUT).await.unwrap();
    let report = StatusReport {
        engine: "alpha".into(),
        tasks: vec![],
        free_count: 2,
        completed_tasks: vec![],
        logs: vec!["hello from alpha".into()],
    };
    let reply = client.send_status(&report).await.unwrap();
    assert_eq!(reply.command, Command::Add);
    assert_eq!(reply.tasks.len(), 2);
    assert_eq!(reply.tasks[0].task.decode().unwrap().args(), &[json!(1)]);

    let reply = client
        .send_status(&StatusReport {
            free_count: 0,
            ..report
        })
        .await
        .unwrap();
    assert_eq!(reply.command, Command::None);
    assert_eq!(running.controller.outstanding(), 2);
    assert_eq!(running.controller.queued(), 1);

    running.stop().await;
}

#[tokio::test]
async fn reply_timeout_drops_the_connection() {
    let transport = Transport::tcp("127.0.0.1", 17510);
    // Bound but never answering.
    let _server = stupid_fleet::reqrep::RequestServer::bind(&transport).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let short = Duration::from_millis(300);
    let client = ControllerClient::new(transport, short);
    let err = client
        .send_status(&StatusReport::bootstrap(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Timeout(d) if d == short), "got: {err}");
}

#[tokio::test]
async fn manager_hands_off_batch_once() {
    let transport = Transport::tcp("127.0.0.1", 17520);
    let running = start_controller(&transport, FifoController::new()).await;

    let mut manager = Manager::new(transport).timeout(TIMEOUT);
    manager.create_engines(&["alpha"], 4).unwrap();
    manager
        .add_tasks("sleep", (1..=3).map(|ms| vec![json!(ms)]))
        .unwrap();

    // The engine binary does not exist, so spawning fails after the upload.
    let mut manager = manager.engine_program("/nonexistent/fleet-engine");
    let err = manager.run().await.unwrap_err();
    assert!(matches!(err, FleetError::SpawnEngine { ref name, .. } if name == "alpha"), "got: {err}");

    assert_eq!(running.controller.queued(), 3);
    assert!(manager.pending_tasks().is_empty(), "batch cleared after hand-off");
    assert!(manager.is_started());
    assert!(matches!(
        manager.add_task(TaskCall::call("sleep", vec![])),
        Err(FleetError::AlreadyStarted)
    ));
    assert!(matches!(
        manager.create_engines(&["beta"], 4),
        Err(FleetError::AlreadyStarted)
    ));

    running.stop().await;
}

#[tokio::test]
async fn manager_without_engines_fails() {
    let mut manager = Manager::new(Transport::tcp("127.0.0.1", 17530));
    manager.add_task(TaskCall::call("sleep", vec![])).unwrap();
    assert!(matches!(manager.run().await, Err(FleetError::NoEngines)));
}

#[tokio::test]
async fn manager_reports_unreachable_controller() {
    let mut manager =
        Manager::new(Transport::tcp("127.0.0.1", 17540)).timeout(Duration::from_millis(300));
    manager.create_engines(&["alpha"], 4).unwrap();
    manager.add_task(TaskCall::call("sleep", vec![])).unwrap();

    let err = manager.run().await.unwrap_err();
    assert!(matches!(err, FleetError::ControllerUnreachable { .. }), "got: {err}");
    assert_eq!(manager.pending_tasks().len(), 1, "batch kept for a retry");
    assert!(!manager.is_started());
}

#[tokio::test]
async fn engine_drains_queue_and_quits() {
    let transport = Transport::tcp("127.0.0.1", 17550);
    let fifo = FifoController::new().quit_when_drained(true);
    fifo.enqueue(task("count", vec![json!(1)]));
    fifo.enqueue(task("count", vec![json!(2)]));
    fifo.enqueue(task("fan_out", vec![json!(3)]));
    fifo.enqueue(task("fail", vec![]));
    let running = start_controller(&transport, fifo).await;

    let total = Arc::new(parking_lot::Mutex::new(0u64));
    let mut registry = TaskRegistry::new();
    let sum = Arc::clone(&total);
    registry
        .register("count", move |_engine: Engine, args: Vec<Value>| {
            let sum = Arc::clone(&sum);
            async move {
                *sum.lock() += args.first().and_then(Value::as_u64).unwrap_or(0);
                Ok(())
            }
        })
        .register("fan_out", |engine: Engine, args: Vec<Value>| async move {
            let n = args.first().and_then(Value::as_u64).unwrap_or(0);
            for i in 0..n {
                engine.submit(&TaskCall::call("count", vec![json!(10 + i)]))?;
            }
            Ok(())
        })
        .register("fail", |_engine: Engine, _args: Vec<Value>| async move {
            anyhow::bail!("expected failure")
        });

    let launch = EngineLaunch {
        name: "alpha".into(),
        size: 3,
        controller: transport.endpoint(),
        heartbeat_ms: 20,
        timeout_ms: 5_000,
        max_delay_ms: 200,
        max_failures: 5,
    };
    let engine = launch
        .build_engine(Arc::new(registry), LogBuffer::new())
        .unwrap();
    tokio::time::timeout(Duration::from_secs(15), engine.run())
        .await
        .expect("engine did not quit")
        .unwrap();

    let completed = running.controller.completed();
    assert_eq!(completed.len(), 7, "4 queued tasks plus 3 fanned out");
    assert_eq!(completed.iter().filter(|c| !c.is_success()).count(), 1);
    assert_eq!(*total.lock(), 1 + 2 + 10 + 11 + 12);

    running.stop().await;
}
