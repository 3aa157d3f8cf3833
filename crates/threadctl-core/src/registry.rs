//! Controller registry.
//!
//! Tracks controllers by name in three sets: *created*, *running* and
//! *stopped*. A registry-wide [`MultiNotifier`] is bumped on every change so
//! lookups can wait for a controller to appear.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::controller::{Controller, ControllerKind};
use crate::error::{ControlResult, ControllerError};
use crate::notifier::MultiNotifier;
use crate::thread_context::is_current;

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

#[derive(Default)]
struct Tables {
    created: HashMap<String, Controller>,
    running: HashMap<String, Controller>,
    stopped: HashSet<String>,
    main: Option<String>,
}

/// Table of controllers known to one process (or one test scope).
pub struct Registry {
    tables: Mutex<Tables>,
    changed: MultiNotifier,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            changed: MultiNotifier::new(),
        }
    }

    /// Process-wide registry used by default.
    pub fn global() -> Arc<Registry> {
        GLOBAL.clone()
    }

    /// Register a freshly created controller.
    ///
    /// Fails with `DuplicateController` if the name is created or running,
    /// or if a second Main controller is registered.
    pub fn store_created(&self, controller: &Controller) -> ControlResult<()> {
        let id = controller.id().to_string();
        {
            let mut tables = self.tables.lock();
            if tables.created.contains_key(&id) || tables.running.contains_key(&id) {
                return Err(ControllerError::DuplicateController(id));
            }
            if controller.kind() == ControllerKind::Main {
                if let Some(main) = &tables.main {
                    return Err(ControllerError::DuplicateController(main.clone()));
                }
                tables.main = Some(id.clone());
            }
            tables.stopped.remove(&id);
            tables.created.insert(id.clone(), controller.clone());
        }
        debug!(controller = %id, "Registry: created");
        self.changed.notify();
        Ok(())
    }

    /// Move a created controller to the running set.
    pub fn promote_to_running(&self, controller: &Controller) -> ControlResult<()> {
        let id = controller.id().to_string();
        {
            let mut tables = self.tables.lock();
            if tables.running.contains_key(&id) {
                return Err(ControllerError::DuplicateController(id));
            }
            let Some(created) = tables.created.remove(&id) else {
                return Err(ControllerError::NoController(id));
            };
            tables.running.insert(id.clone(), created);
        }
        info!(controller = %id, "Registry: running");
        self.changed.notify();
        Ok(())
    }

    /// Move a controller to the terminal stopped set.
    pub fn unregister(&self, controller: &Controller) {
        let id = controller.id().to_string();
        {
            let mut tables = self.tables.lock();
            let known =
                tables.running.remove(&id).is_some() || tables.created.remove(&id).is_some();
            if !known {
                warn!(controller = %id, "Registry: unregistering unknown controller");
            }
            if tables.main.as_deref() == Some(id.as_str()) {
                tables.main = None;
            }
            tables.stopped.insert(id.clone());
        }
        info!(controller = %id, "Registry: stopped");
        self.changed.notify();
    }

    /// Find a running controller by name.
    ///
    /// With `wait` set, blocks until a controller with this name is running
    /// or `timeout` elapses. A name in the stopped set fails immediately.
    pub fn lookup(
        &self,
        name: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> ControlResult<Controller> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Read the count first: a change after this point bumps it and
            // releases the wait below.
            let seen = self.changed.count();
            {
                let tables = self.tables.lock();
                if let Some(controller) = tables.running.get(name) {
                    return Ok(controller.clone());
                }
                let finished =
                    tables.stopped.contains(name) && !tables.created.contains_key(name);
                if finished || !wait {
                    return Err(ControllerError::NoController(name.to_string()));
                }
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.changed.wait(seen + 1, remaining)?;
        }
    }

    /// The Main controller, if one is registered.
    pub fn main(&self) -> Option<Controller> {
        let tables = self.tables.lock();
        let name = tables.main.as_ref()?;
        tables
            .running
            .get(name)
            .or_else(|| tables.created.get(name))
            .cloned()
    }

    /// All created or running controllers.
    pub fn controllers(&self) -> Vec<Controller> {
        let tables = self.tables.lock();
        tables
            .running
            .values()
            .chain(tables.created.values())
            .cloned()
            .collect()
    }

    /// Names of running controllers.
    pub fn running_ids(&self) -> Vec<String> {
        self.tables.lock().running.keys().cloned().collect()
    }

    /// Check whether the name is in the stopped set.
    pub fn is_stopped(&self, name: &str) -> bool {
        let tables = self.tables.lock();
        tables.stopped.contains(name)
            && !tables.running.contains_key(name)
            && !tables.created.contains_key(name)
    }

    /// Stop every controller except `keep`, then wait for them if `sync`.
    ///
    /// Created-but-never-started controllers are discarded.
    pub fn stop_all_except(&self, keep: Option<&str>, sync: bool, timeout: Option<Duration>) {
        let targets: Vec<Controller> = self
            .controllers()
            .into_iter()
            .filter(|c| Some(c.id()) != keep)
            .collect();
        info!(count = targets.len(), "Registry: stopping controllers");

        for controller in &targets {
            if let Err(err) = controller.request_stop() {
                warn!(controller = %controller.id(), error = %err, "Registry: stop request failed");
            }
        }
        if !sync {
            return;
        }
        for controller in targets.iter().filter(|c| !is_current(c.id())) {
            if let Err(err) = controller.wait_stopped(timeout) {
                warn!(controller = %controller.id(), error = %err, "Registry: controller did not stop in time");
            }
        }
    }

    /// Stop every controller, with the Main controller last.
    pub fn stop_all(&self, sync: bool, timeout: Option<Duration>) {
        let main = self.main();
        let main_id = main.as_ref().map(|m| m.id().to_string());
        self.stop_all_except(main_id.as_deref(), sync, timeout);
        if let Some(main) = main {
            if let Err(err) = main.request_stop() {
                warn!(error = %err, "Registry: stopping main controller failed");
            } else if sync {
                if let Err(err) = main.wait_stopped(timeout) {
                    warn!(controller = %main.id(), error = %err, "Registry: main controller did not stop in time");
                }
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Find a running controller in the process-wide registry.
pub fn get_controller(
    name: &str,
    wait: bool,
    timeout: Option<Duration>,
) -> ControlResult<Controller> {
    Registry::global().lookup(name, wait, timeout)
}

/// Stop a controller from the process-wide registry.
pub fn stop_controller(name: &str, sync: bool, timeout: Option<Duration>) -> ControlResult<()> {
    let controller = Registry::global().lookup(name, false, None)?;
    controller.stop_and_wait(sync, timeout)
}

/// Stop every controller in the process-wide registry.
pub fn stop_all_controllers(sync: bool, timeout: Option<Duration>) {
    Registry::global().stop_all(sync, timeout);
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
