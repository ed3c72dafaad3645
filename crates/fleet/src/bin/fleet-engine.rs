//! fleet-engine: One engine process.
//!
//! Normally started by `fleet-manager`, one process per configured engine
//! name. Registers the demo task targets below and heartbeats the
//! controller until told to quit.
//!
//! | target    | args                     | effect                                  |
//! |-----------|--------------------------|-----------------------------------------|
//! | `sleep`   | `[millis]`               | sleeps                                  |
//! | `echo`    | anything                 | logs the arguments                      |
//! | `fail`    | `[message]`              | fails with `message`                    |
//! | `fan_out` | `[target, n, args...]`   | hands `n` calls of `target` back to the controller |

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;

use stupid_fleet::{run_engine_process, Engine, EngineLaunch, TaskCall, TaskRegistry};

#[derive(Parser, Debug)]
#[command(name = "fleet-engine", version, about)]
struct Cli {
    #[command(flatten)]
    launch: EngineLaunch,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_engine_process(cli.launch, registry())
}

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register("sleep", |_engine: Engine, args: Vec<Value>| async move {
            let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(())
        })
        .register("echo", |engine: Engine, args: Vec<Value>| async move {
            let args = Value::Array(args);
            tracing::info!(engine = %engine.name(), args = %args, "echo");
            Ok(())
        })
        .register("fail", |_engine: Engine, args: Vec<Value>| async move {
            let message = args.first().and_then(Value::as_str).unwrap_or("task failed");
            anyhow::bail!("{message}")
        })
        .register("fan_out", |engine: Engine, args: Vec<Value>| async move {
            let mut args = args.into_iter();
            let target = args
                .next()
                .and_then(|v| v.as_str().map(str::to_owned))
                .context("fan_out needs a target name")?;
            let count = args
                .next()
                .and_then(|v| v.as_u64())
                .context("fan_out needs a count")?;
            let rest: Vec<Value> = args.collect();
            for _ in 0..count {
                engine.submit(&TaskCall::call(target.clone(), rest.clone()))?;
            }
            tracing::info!(engine = %engine.name(), target = %target, count, "fanned out");
            Ok(())
        });
    registry
}
