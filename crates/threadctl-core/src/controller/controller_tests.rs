//! Tests for controllers.

use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

use serde_json::json;

use super::*;
use crate::bus::{Signal, SubscribeOptions};
use crate::error::ControllerError;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

struct Scope {
    registry: Arc<Registry>,
    bus: Arc<SignalBus>,
}

impl Scope {
    fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            bus: Arc::new(SignalBus::new()),
        }
    }

    fn builder(&self, id: &str) -> ControllerBuilder {
        Controller::builder(id)
            .registry(self.registry.clone())
            .bus(self.bus.clone())
    }

    fn start(&self, id: &str, handler: impl ControllerHandler) -> Controller {
        let ctl = self.builder(id).build(handler).unwrap();
        ctl.start().unwrap();
        ctl
    }
}

/// Collects messages under one tag and counts hook calls.
#[derive(Default, Clone)]
struct Recorder {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl ControllerHandler for Recorder {
    fn on_start(&mut self, _ctx: &ControllerContext) -> ControlResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn run(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        loop {
            let message = ctx.wait_for_message("data", None)?;
            if let Some(value) = message.into_value() {
                self.received.lock().push(value);
            }
        }
    }

    fn on_finish(&mut self, _ctx: &ControllerContext) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_start_fires_start_and_run_points() {
    let scope = Scope::new();
    let recorder = Recorder::default();
    let ctl = scope.start("recorder", recorder.clone());

    assert!(ctl.is_running());
    ctl.sync_exec_point("run", WAIT).unwrap();
    assert!(ctl.exec_point_reached("start"));
    assert_eq!(recorder.started.load(Ordering::SeqCst), 1);

    ctl.stop_and_wait(true, WAIT).unwrap();
    assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_start_twice_is_invalid() {
    let scope = Scope::new();
    let ctl = scope.start("once", ());
    let err = ctl.start().unwrap_err();
    assert!(matches!(err, ControllerError::InvalidState { .. }));
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_main_cannot_be_spawned() {
    let scope = Scope::new();
    let main = scope.builder("main").kind(ControllerKind::Main).build(()).unwrap();
    assert!(matches!(
        main.start().unwrap_err(),
        ControllerError::InvalidState { .. }
    ));
}

#[test]
fn test_messages_delivered_by_priority() {
    let scope = Scope::new();
    let ctl = scope.builder("sorted").kind(ControllerKind::Run).build(run_fn(|ctx| {
        ctx.wait_for_sync("go", 1, None)?;
        let mut seen = Vec::new();
        while let Ok(message) = ctx.pop_message("data") {
            seen.extend(message.into_value());
        }
        ctx.controller().send_signal("any", "result", Value::Array(seen));
        ctx.notify_exec_point("drained")?;
        ctx.run_until_stopped()
    }))
    .unwrap();

    let result = Arc::new(Mutex::new(None));
    let sink = result.clone();
    scope
        .bus
        .subscribe(
            move |s: &Signal| *sink.lock() = Some(s.value.clone()),
            SubscribeOptions::new().tags(["result"]),
        )
        .unwrap();

    ctl.start().unwrap();
    ctl.send_message("data", json!("c"), 2);
    ctl.send_message("data", json!("a"), 0);
    ctl.send_message("data", json!("b"), 1);
    ctl.send_message("data", json!("a2"), 0);
    ctl.send_sync("go", 1);

    ctl.sync_exec_point("drained", WAIT).unwrap();
    assert_eq!(*result.lock(), Some(json!(["a", "a2", "b", "c"])));
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_wait_for_message_receives_in_order() {
    let scope = Scope::new();
    let recorder = Recorder::default();
    let ctl = scope.builder("recv").kind(ControllerKind::Run).build(recorder.clone()).unwrap();
    ctl.start().unwrap();

    for i in 0..10 {
        ctl.send_message("data", json!(i), 0);
    }
    let start = Instant::now();
    while recorder.received.lock().len() < 10 && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*recorder.received.lock(), (0..10).map(|i| json!(i)).collect::<Vec<_>>());

    ctl.stop_and_wait(true, WAIT).unwrap();
    assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pop_message_empty() {
    let scope = Scope::new();
    let ctl = scope.builder("empty").kind(ControllerKind::Run).build(run_fn(|ctx| {
        match ctx.pop_message("nothing") {
            Err(ControllerError::NoMessage(tag)) if tag == "nothing" => {
                ctx.notify_exec_point("checked")?
            }
            _ => {}
        }
        Ok(())
    }))
    .unwrap();
    ctl.start().unwrap();
    ctl.sync_exec_point("checked", WAIT).unwrap();
    ctl.wait_stopped(WAIT).unwrap();
}

#[test]
fn test_call_sync_returns_value_from_target_thread() {
    let scope = Scope::new();
    let ctl = scope.start("worker", ());

    let name = ctl
        .call_in_thread_sync(
            || Ok(std::thread::current().name().map(str::to_string)),
            CallOptions::default().with_timeout(Duration::from_secs(5)),
        )
        .unwrap();
    assert_eq!(name.as_deref(), Some("worker"));
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("sensor offline: {0}")]
struct SensorError(u32);

#[test]
fn test_call_passes_error_through() {
    let scope = Scope::new();
    let ctl = scope.start("faulty", ());

    let err = ctl
        .call_in_thread_sync(|| -> anyhow::Result<u32> { Err(SensorError(7).into()) }, CallOptions::default())
        .unwrap_err();
    assert_eq!(err.remote_as::<SensorError>(), Some(&SensorError(7)));
    assert_eq!(err.to_string(), "sensor offline: 7");

    let value = ctl
        .call_in_thread_sync_or(|| -> anyhow::Result<u32> { Err(SensorError(7).into()) }, 99, CallOptions::default())
        .unwrap();
    assert_eq!(value, 99);

    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_call_panic_becomes_remote_error() {
    let scope = Scope::new();
    let ctl = scope.start("panicky", ());

    let err = ctl
        .call_in_thread_sync(|| -> anyhow::Result<()> { panic!("boom") }, CallOptions::default())
        .unwrap_err();
    assert!(matches!(err, ControllerError::Remote(_)));
    assert!(err.to_string().contains("boom"));
    assert!(ctl.is_running());

    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_same_thread_shortcut_does_not_deadlock() {
    let scope = Scope::new();
    let ctl = scope
        .builder("self-caller")
        .kind(ControllerKind::Run)
        .build(run_fn(|ctx| {
            let me = ctx.controller().clone();
            let inner = me.clone();
            let value = me.call_in_thread_sync(
                move || inner.call_in_thread_sync(|| Ok(21 * 2), CallOptions::default()).map_err(Into::into),
                CallOptions::default(),
            )?;
            if value == 42 {
                ctx.notify_exec_point("called")?;
            }
            ctx.run_until_stopped()
        }))
        .unwrap();

    ctl.start().unwrap();
    ctl.sync_exec_point("called", WAIT).unwrap();
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_call_without_shortcut_on_own_thread_is_served_while_waiting() {
    let scope = Scope::new();
    let ctl = scope
        .builder("nested")
        .kind(ControllerKind::Run)
        .build(run_fn(|ctx| {
            let value = ctx.controller().call_in_thread_sync(
                || Ok("served"),
                CallOptions::default()
                    .without_shortcut()
                    .with_timeout(Duration::from_secs(5)),
            )?;
            if value == "served" {
                ctx.notify_exec_point("called")?;
            }
            ctx.run_until_stopped()
        }))
        .unwrap();

    ctl.start().unwrap();
    ctl.sync_exec_point("called", WAIT).unwrap();
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_tagged_call_waits_for_drain() {
    let scope = Scope::new();
    let ctl = scope
        .builder("queued")
        .kind(ControllerKind::Run)
        .build(run_fn(|ctx| loop {
            ctx.wait_for_sync("drain", 1, None)?;
            ctx.check_commands("calls")?;
        }))
        .unwrap();
    ctl.start().unwrap();

    let pending = ctl.call_in_thread_async(|| Ok(5), Some("calls"), 0);
    assert_eq!(ctl.pending_messages("calls"), 1);
    assert!(!pending.is_done());

    ctl.send_sync("drain", 1);
    assert_eq!(pending.wait(WAIT).unwrap(), 5);
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_call_timeout_leaves_call_running() {
    let scope = Scope::new();
    let ctl = scope.start("slow", ());
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();

    let err = ctl
        .call_in_thread_sync(
            move || {
                std::thread::sleep(Duration::from_millis(100));
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            CallOptions::default().with_timeout(Duration::from_millis(10)),
        )
        .unwrap_err();
    assert!(matches!(err, ControllerError::TimedOut));

    ctl.call_in_thread_sync(|| Ok(()), CallOptions::default()).unwrap();
    assert!(done.load(Ordering::SeqCst));
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_tagged_call_to_loop_controller_needs_timeout() {
    let scope = Scope::new();
    let ctl = scope
        .builder("undrained")
        .kind(ControllerKind::Loop)
        .build(())
        .unwrap();
    ctl.start().unwrap();

    let err = ctl
        .call_in_thread_sync(
            || Ok(1),
            CallOptions::default()
                .with_tag("calls")
                .with_timeout(Duration::from_millis(30)),
        )
        .unwrap_err();
    assert!(matches!(err, ControllerError::TimedOut));
    assert_eq!(ctl.pending_messages("calls"), 1);
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_pending_call_resolves_when_target_stops() {
    let scope = Scope::new();
    let ctl = scope
        .builder("stopper")
        .kind(ControllerKind::Run)
        .build(run_fn(|ctx| ctx.wait_for_sync("never", 1, None)))
        .unwrap();
    ctl.start().unwrap();

    let pending = ctl.call_in_thread_async(|| Ok(1), Some("ignored"), 0);
    ctl.stop_and_wait(true, WAIT).unwrap();

    let err = pending.wait(WAIT).unwrap_err();
    assert!(matches!(err, ControllerError::NoController(name) if name == "stopper"));
}

#[test]
fn test_call_on_stopped_controller_fails_fast() {
    let scope = Scope::new();
    let ctl = scope.start("gone", ());
    ctl.stop_and_wait(true, WAIT).unwrap();

    let err = ctl
        .call_in_thread_sync(|| Ok(()), CallOptions::default())
        .unwrap_err();
    assert!(matches!(err, ControllerError::NoController(_)));
}

#[test]
fn test_callback_runs_on_target_thread() {
    let scope = Scope::new();
    let ctl = scope.start("cb", ());
    let (tx, rx) = std::sync::mpsc::channel();

    ctl.call_in_thread_callback::<i32, _>(
        || 6 * 7,
        Some(Box::new(move |v: i32| {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send((v, name));
        })),
        None,
        0,
    );

    let (value, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(value, 42);
    assert_eq!(thread.as_deref(), Some("cb"));
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_stop_from_own_thread_unwinds() {
    let scope = Scope::new();
    let reached = Arc::new(AtomicBool::new(false));
    let after = reached.clone();
    let recorder = Recorder::default();
    let finished = recorder.finished.clone();

    struct SelfStop(Arc<AtomicBool>, Recorder);
    impl ControllerHandler for SelfStop {
        fn run(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
            ctx.stop()?;
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn on_finish(&mut self, ctx: &ControllerContext) {
            self.1.on_finish(ctx);
        }
    }

    let ctl = scope
        .builder("self-stop")
        .kind(ControllerKind::Run)
        .build(SelfStop(after, recorder))
        .unwrap();
    ctl.start().unwrap();
    ctl.wait_stopped(WAIT).unwrap();

    assert!(!reached.load(Ordering::SeqCst));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_exec_point_twice_fails() {
    let scope = Scope::new();
    let ctl = scope
        .builder("points")
        .kind(ControllerKind::Run)
        .build(run_fn(|ctx| {
            ctx.notify_exec_point("ready")?;
            match ctx.notify_exec_point("ready") {
                Err(ControllerError::ExecPointNotified { point, .. }) if point == "ready" => {
                    ctx.notify_exec_point("checked")
                }
                _ => Ok(()),
            }
        }))
        .unwrap();
    ctl.start().unwrap();
    ctl.sync_exec_point("checked", WAIT).unwrap();
    ctl.wait_stopped(WAIT).unwrap();

    // Reached before the stop: still satisfied afterwards.
    ctl.sync_exec_point("ready", Some(Duration::ZERO)).unwrap();
    // Never reached: fails instead of waiting.
    let err = ctl.sync_exec_point("missing", WAIT).unwrap_err();
    assert!(matches!(err, ControllerError::NoController(_)));
}

#[test]
fn test_wait_stopped_before_and_after_stop() {
    let scope = Scope::new();
    let ctl = scope.start("waited", ());

    let waiter = {
        let ctl = ctl.clone();
        std::thread::spawn(move || ctl.wait_stopped(WAIT))
    };
    std::thread::sleep(Duration::from_millis(20));
    ctl.stop().unwrap();

    waiter.join().unwrap().unwrap();
    ctl.wait_stopped(Some(Duration::ZERO)).unwrap();
    ctl.join().unwrap();
}

#[test]
fn test_wait_stopped_never_fails_during_teardown() {
    let scope = Scope::new();
    for cycle in 0..100 {
        let ctl = scope.start(&format!("racing-{cycle}"), ());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let ctl = ctl.clone();
                std::thread::spawn(move || loop {
                    match ctl.wait_stopped(Some(Duration::ZERO)) {
                        Ok(()) => return Ok(()),
                        Err(ControllerError::TimedOut) => std::thread::yield_now(),
                        Err(err) => return Err(err),
                    }
                })
            })
            .collect();

        ctl.stop().unwrap();
        ctl.join().unwrap();
        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }
    }
}

#[test]
fn test_run_error_escalates_to_stop_all() {
    let scope = Scope::new();
    let bystander = scope.start("bystander", ());
    let failing = scope
        .builder("failing")
        .kind(ControllerKind::Run)
        .build(run_fn(|_ctx| Err(ControllerError::NoJob("missing".into()))))
        .unwrap();
    failing.start().unwrap();

    failing.wait_stopped(WAIT).unwrap();
    bystander.wait_stopped(WAIT).unwrap();
    assert!(scope.registry.controllers().is_empty());
}

#[test]
fn test_commands_and_queries() {
    let scope = Scope::new();
    let ctl = scope.start("device", ());
    let counter = Arc::new(AtomicUsize::new(0));
    let c = counter.clone();
    ctl.add_command("bump", move |args: Value| -> anyhow::Result<Value> {
        let by = args.as_u64().unwrap_or(1) as usize;
        Ok(json!(c.fetch_add(by, Ordering::SeqCst) + by))
    });

    ctl.command("bump", json!(2)).unwrap();
    let total = ctl.query("bump", json!(3), WAIT).unwrap();
    assert_eq!(total, json!(5));

    let err = ctl.query("missing", json!(null), WAIT).unwrap_err();
    assert!(matches!(err, ControllerError::UnknownCommand { command, .. } if command == "missing"));

    ctl.add_command("fail", |_args: Value| -> anyhow::Result<Value> { anyhow::bail!("refused") });
    let err = ctl.query("fail", json!(null), WAIT).unwrap_err();
    assert_eq!(err.to_string(), "refused");
    // Fire-and-forget failures are only logged.
    ctl.command("fail", json!(null)).unwrap();

    assert!(ctl.remove_command("fail"));
    assert!(!ctl.has_command("fail"));
    ctl.stop_and_wait(true, WAIT).unwrap();
}

#[test]
fn test_sync_subscription_runs_on_destination_thread() {
    let scope = Scope::new();
    let ctl = scope.start("listener", ());
    let (tx, rx) = std::sync::mpsc::channel();
    let tx = Mutex::new(tx);

    ctl.subscribe(
        move |s: &Signal| {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.lock().send((s.value.clone(), name));
        },
        SubscribeOptions::new().src("sensor").tags(["reading"]),
    )
    .unwrap();

    let sent = scope
        .bus
        .signal(Signal::new("sensor", "any", "reading", json!(1.5)));
    assert_eq!(sent, 1);
    let (value, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(value, json!(1.5));
    assert_eq!(thread.as_deref(), Some("listener"));

    ctl.stop_and_wait(true, WAIT).unwrap();
    assert!(scope.bus.is_empty());
}

#[test]
fn test_limit_queue_drops_excess() {
    let scope = Scope::new();
    let ctl = scope
        .builder("slow-listener")
        .kind(ControllerKind::Run)
        .build(run_fn(|ctx| {
            ctx.wait_for_sync("go", 1, None)?;
            ctx.run_until_stopped()
        }))
        .unwrap();
    ctl.start().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();

    ctl.subscribe(
        move |_: &Signal| {
            c.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::new().limit_queue(2),
    )
    .unwrap();

    // The listener is parked in wait_for_sync, which still serves
    // interrupts, so block it from draining with a slow call first.
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock();
    let blocker = gate.clone();
    ctl.call_in_thread_callback(move || drop(blocker.lock()), None, None, 0);

    let accepted: usize = (0..5)
        .map(|i| ctl.bus().signal(Signal::new("x", "y", "t", json!(i))))
        .sum();
    assert_eq!(accepted, 2);
    drop(held);

    ctl.call_in_thread_sync(|| Ok(()), CallOptions::default()).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    ctl.send_sync("go", 1);
    ctl.stop_and_wait(true, WAIT).unwrap();
}
