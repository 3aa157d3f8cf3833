//! Demo workload: a Main supervisor, a simulated motor and a polling
//! scheduler.
//!
//! The supervisor starts the other two from its own thread. The poller
//! reads the motor through queries, publishes the position as a variable
//! and a signal, and runs a scan batch that steps the motor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info};

use threadctl_config::{Config, DemoConfig};
use threadctl_core::{
    BatchStep, ControlResult, Controller, ControllerContext, ControllerError, ControllerHandler,
    ControllerKind, RuntimeConfig, Scheduler, SchedulerHandle, Signal, SubscribeOptions,
};

pub(crate) const MAIN: &str = "main";
const MOTOR: &str = "motor";
const POLLER: &str = "poller";

const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the demo on the calling thread until the Main controller stops.
pub(crate) fn run(config: &Config) -> anyhow::Result<()> {
    let readings = Arc::new(AtomicU64::new(0));
    let supervisor = Supervisor {
        demo: config.demo.clone(),
        runtime: config.runtime.clone(),
        readings: readings.clone(),
        poller: None,
    };
    let main = Controller::builder(MAIN)
        .kind(ControllerKind::Main)
        .runtime(config.runtime.clone())
        .build(supervisor)?;
    main.exec()?;

    info!(readings = readings.load(Ordering::Relaxed), "Demo finished");
    Ok(())
}

struct Supervisor {
    demo: DemoConfig,
    runtime: RuntimeConfig,
    readings: Arc<AtomicU64>,
    poller: Option<SchedulerHandle>,
}

impl ControllerHandler for Supervisor {
    fn on_start(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        let motor = Controller::builder(MOTOR)
            .runtime(self.runtime.clone())
            .build(Motor::default())?;
        motor.start()?;
        motor.sync_exec_point("run", Some(QUERY_TIMEOUT))?;

        let poller = Scheduler::new()
            .on_setup(|ctx| {
                info!(controller = %ctx.id(), "Poller ready");
                Ok(())
            })
            .build(Controller::builder(POLLER).runtime(self.runtime.clone()))?;
        install_jobs(&poller, &motor, &self.demo)?;
        poller.start()?;

        let readings = self.readings.clone();
        ctx.controller().subscribe(
            move |signal: &Signal| {
                readings.fetch_add(1, Ordering::Relaxed);
                debug!(position = %signal.value, "Reading received");
            },
            SubscribeOptions::new().src(POLLER).tags(["reading"]),
        )?;

        poller.start_batch_job(
            "scan",
            self.demo.poll_period(),
            json!({ "steps": self.demo.scan_steps }),
        )?;
        self.poller = Some(poller);
        Ok(())
    }

    fn on_finish(&mut self, ctx: &ControllerContext) {
        if let Some(poller) = self.poller.take() {
            info!(
                controller = %ctx.id(),
                variables = ?poller.variables().snapshot(),
                "Final poller state"
            );
        }
    }
}

fn install_jobs(poller: &SchedulerHandle, motor: &Controller, demo: &DemoConfig) -> ControlResult<()> {
    let (target, vars, sender) = (motor.clone(), poller.variables().clone(), poller.controller().clone());
    poller.add_job(
        "poll",
        demo.poll_period(),
        move |_: &ControllerContext| {
            let position = match target.query("read", Value::Null, Some(QUERY_TIMEOUT)) {
                Ok(position) => position,
                // The motor stops before us during shutdown.
                Err(ControllerError::NoController(_)) => return Ok(()),
                Err(err) => return Err(err),
            };
            vars.set_variable("position", position.clone());
            sender.send_signal(MAIN, "reading", position);
            Ok(())
        },
        true,
    )?;

    let vars = poller.variables().clone();
    poller.add_job(
        "report",
        demo.report_period(),
        move |ctx: &ControllerContext| {
            info!(
                controller = %ctx.id(),
                position = ?vars.get_variable("position"),
                scanned = ?vars.get_variable("scanned"),
                "Status"
            );
            Ok(())
        },
        false,
    )?;

    let (target, vars) = (motor.clone(), poller.variables().clone());
    let home = motor.clone();
    poller.add_batch_job(
        "scan",
        move |args: &Value| {
            let total = args["steps"].as_u64().unwrap_or(0);
            let (target, vars) = (target.clone(), vars.clone());
            let mut done = 0;
            move |_: &ControllerContext| -> ControlResult<BatchStep> {
                target.command("move", json!(1))?;
                done += 1;
                vars.set_variable("scanned", json!(done));
                Ok(if done >= total {
                    BatchStep::Finished
                } else {
                    BatchStep::Continue
                })
            }
        },
        Some(Box::new(move |ctx: &ControllerContext, args: &Value| {
            info!(controller = %ctx.id(), ?args, "Scan complete, homing motor");
            // Gone already when the scan is cut short by shutdown.
            let _ = home.command("home", Value::Null);
        })),
    )
}

/// Simulated motor exposing `move`, `home` and `read` commands.
#[derive(Default)]
struct Motor {
    position: Arc<Mutex<i64>>,
}

impl ControllerHandler for Motor {
    fn on_start(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        let controller = ctx.controller();

        let position = self.position.clone();
        controller.add_command("move", move |args: Value| -> anyhow::Result<Value> {
            let delta = args
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("move expects an integer, got {args}"))?;
            let mut position = position.lock();
            *position += delta;
            Ok(json!(*position))
        });

        let position = self.position.clone();
        controller.add_command("home", move |_: Value| -> anyhow::Result<Value> {
            *position.lock() = 0;
            Ok(json!(0))
        });

        let position = self.position.clone();
        controller.add_command("read", move |_: Value| -> anyhow::Result<Value> {
            Ok(json!(*position.lock()))
        });
        Ok(())
    }

    fn on_finish(&mut self, ctx: &ControllerContext) {
        info!(controller = %ctx.id(), position = *self.position.lock(), "Motor parked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_commands() {
        let registry = Arc::new(threadctl_core::Registry::new());
        let motor = Controller::builder("test-motor")
            .registry(registry)
            .build(Motor::default())
            .unwrap();
        motor.start().unwrap();
        motor.sync_exec_point("run", Some(Duration::from_secs(5))).unwrap();

        assert_eq!(motor.query("move", json!(3), None).unwrap(), json!(3));
        assert_eq!(motor.query("move", json!(-1), None).unwrap(), json!(2));
        assert!(motor.query("move", json!("far"), None).is_err());
        assert_eq!(motor.query("home", Value::Null, None).unwrap(), json!(0));
        assert_eq!(motor.query("read", Value::Null, None).unwrap(), json!(0));

        motor.stop_and_wait(true, Some(Duration::from_secs(5))).unwrap();
    }
}
