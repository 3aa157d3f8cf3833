//! Tests for the controller registry.

use std::thread;

use super::*;
use crate::bus::SignalBus;
use crate::controller::ControllerState;

fn scoped() -> (Arc<Registry>, Arc<SignalBus>) {
    (Arc::new(Registry::new()), Arc::new(SignalBus::new()))
}

fn build(registry: &Arc<Registry>, bus: &Arc<SignalBus>, id: &str) -> Controller {
    Controller::builder(id)
        .registry(registry.clone())
        .bus(bus.clone())
        .build(())
        .unwrap()
}

#[test]
fn test_registry_default_is_empty() {
    let registry = Registry::default();
    assert!(registry.controllers().is_empty());
    assert!(registry.main().is_none());
}

#[test]
fn test_created_is_not_visible_to_lookup() {
    let (registry, bus) = scoped();
    let _ctl = build(&registry, &bus, "dev");

    assert_eq!(registry.controllers().len(), 1);
    let err = registry.lookup("dev", false, None).unwrap_err();
    assert!(matches!(err, ControllerError::NoController(name) if name == "dev"));
}

#[test]
fn test_duplicate_name_rejected() {
    let (registry, bus) = scoped();
    let _first = build(&registry, &bus, "dev");

    let err = Controller::builder("dev")
        .registry(registry.clone())
        .bus(bus.clone())
        .build(())
        .unwrap_err();
    assert!(matches!(err, ControllerError::DuplicateController(name) if name == "dev"));
}

#[test]
fn test_promote_unknown_controller() {
    let (registry, bus) = scoped();
    let ctl = build(&registry, &bus, "dev");
    let other = Registry::new();

    let err = other.promote_to_running(&ctl).unwrap_err();
    assert!(matches!(err, ControllerError::NoController(_)));
}

#[test]
fn test_lifecycle_moves_between_sets() {
    let (registry, bus) = scoped();
    let ctl = build(&registry, &bus, "dev");
    ctl.start().unwrap();

    let found = registry.lookup("dev", false, None).unwrap();
    assert!(found.same(&ctl));
    assert_eq!(registry.running_ids(), vec!["dev".to_string()]);

    ctl.stop_and_wait(true, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(ctl.state(), ControllerState::Stopped);
    assert!(registry.is_stopped("dev"));

    // Stopped names fail immediately, even when waiting.
    let start = Instant::now();
    let err = registry
        .lookup("dev", true, Some(Duration::from_secs(5)))
        .unwrap_err();
    assert!(matches!(err, ControllerError::NoController(_)));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_name_reusable_after_stop() {
    let (registry, bus) = scoped();
    let first = build(&registry, &bus, "dev");
    first.start().unwrap();
    first.stop_and_wait(true, Some(Duration::from_secs(5))).unwrap();

    let second = build(&registry, &bus, "dev");
    assert!(!registry.is_stopped("dev"));
    second.start().unwrap();
    assert!(registry.lookup("dev", false, None).unwrap().same(&second));
    second.stop_and_wait(true, Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn test_lookup_waits_for_start() {
    let (registry, bus) = scoped();
    let ctl = build(&registry, &bus, "late");

    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || registry.lookup("late", true, Some(Duration::from_secs(5))))
    };
    thread::sleep(Duration::from_millis(30));
    ctl.start().unwrap();

    let found = waiter.join().unwrap().unwrap();
    assert!(found.same(&ctl));
    ctl.stop_and_wait(true, Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn test_lookup_times_out() {
    let (registry, _bus) = scoped();
    let err = registry
        .lookup("ghost", true, Some(Duration::from_millis(30)))
        .unwrap_err();
    assert!(matches!(err, ControllerError::TimedOut));
}

#[test]
fn test_stop_all_discards_created_and_stops_running() {
    let (registry, bus) = scoped();
    let idle = build(&registry, &bus, "idle");
    let busy = build(&registry, &bus, "busy");
    busy.start().unwrap();

    registry.stop_all(true, Some(Duration::from_secs(5)));

    assert_eq!(idle.state(), ControllerState::Stopped);
    assert_eq!(busy.state(), ControllerState::Stopped);
    assert!(registry.controllers().is_empty());
    assert!(idle.start().is_err());
}

#[test]
fn test_second_main_rejected() {
    let (registry, bus) = scoped();
    let main = Controller::builder("main")
        .kind(ControllerKind::Main)
        .registry(registry.clone())
        .bus(bus.clone())
        .build(())
        .unwrap();
    assert!(registry.main().unwrap().same(&main));

    let err = Controller::builder("main2")
        .kind(ControllerKind::Main)
        .registry(registry.clone())
        .bus(bus.clone())
        .build(())
        .unwrap_err();
    assert!(matches!(err, ControllerError::DuplicateController(name) if name == "main"));
}

/// Main controller that lingers in `on_finish`.
struct SlowFinish;

impl crate::controller::ControllerHandler for SlowFinish {
    fn on_finish(&mut self, _ctx: &crate::controller::ControllerContext) {
        thread::sleep(Duration::from_millis(300));
    }
}

#[test]
fn test_stop_all_returns_when_main_outlasts_timeout() {
    let (registry, bus) = scoped();
    let main = Controller::builder("main")
        .kind(ControllerKind::Main)
        .registry(registry.clone())
        .bus(bus.clone())
        .build(SlowFinish)
        .unwrap();
    let runner = {
        let main = main.clone();
        thread::spawn(move || main.exec())
    };
    registry
        .lookup("main", true, Some(Duration::from_secs(5)))
        .unwrap();

    let started = Instant::now();
    registry.stop_all(true, Some(Duration::from_millis(20)));
    assert!(started.elapsed() < Duration::from_millis(250));
    assert_ne!(main.state(), ControllerState::Stopped);

    runner.join().unwrap().unwrap();
    assert_eq!(main.state(), ControllerState::Stopped);
}
