//! Controllers: named actors each bound to exactly one thread.
//!
//! A [`Controller`] is a cheap, cloneable handle usable from any thread. The
//! code that runs *on* the controller's thread implements
//! [`ControllerHandler`] and receives a [`ControllerContext`], which exposes
//! the owner-only operations (popping messages, sleeping, checkpoints).

mod call;
mod command;
mod context;
mod lifecycle;
mod signals;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::bus::{SignalBus, SubscriptionId};
use crate::config::RuntimeConfig;
use crate::error::ControlResult;
use crate::host::{HostLoop, ThreadLoop};
use crate::message::{MessageQueue, Payload};
use crate::notifier::MultiNotifier;
use crate::registry::Registry;

pub use call::{CallOptions, CallResult};
pub use command::CommandHandler;
pub use context::{ControllerContext, LoopStatus};
pub use lifecycle::{POINT_RUN, POINT_START, POINT_STOP};

/// Controller kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    /// Processes its event loop until stopped.
    Loop,
    /// Runs the handler's `run` body; stops when it returns.
    Run,
    /// Event loop on the calling (main) thread; at most one per registry.
    /// Stopping it stops every other controller first.
    Main,
}

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    /// Registered, thread not started.
    Created = 0,
    /// Thread spawned, not yet live.
    Starting = 1,
    /// Running its loop or `run` body.
    Running = 2,
    /// Running cleanup after a stop.
    Finishing = 3,
    /// Terminal.
    Stopped = 4,
}

impl From<u8> for ControllerState {
    fn from(v: u8) -> Self {
        match v {
            0 => ControllerState::Created,
            1 => ControllerState::Starting,
            2 => ControllerState::Running,
            3 => ControllerState::Finishing,
            _ => ControllerState::Stopped,
        }
    }
}

/// Code executed on a controller's own thread.
///
/// `on_finish` runs exactly once, whether the controller stopped on
/// request, returned from `run`, or failed.
pub trait ControllerHandler: Send + 'static {
    /// Setup hook; the `"run"` exec point fires after it returns.
    fn on_start(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Body of a [`ControllerKind::Run`] controller.
    fn run(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        ctx.run_until_stopped()
    }

    /// Cleanup hook.
    fn on_finish(&mut self, ctx: &ControllerContext) {
        let _ = ctx;
    }
}

/// Handler with no hooks: a plain event loop.
impl ControllerHandler for () {}

/// Handler whose `run` body is a closure.
pub struct RunFn<F>(F);

/// Wrap a closure as a [`ControllerHandler::run`] body.
pub fn run_fn<F>(f: F) -> RunFn<F>
where
    F: FnMut(&ControllerContext) -> ControlResult<()> + Send + 'static,
{
    RunFn(f)
}

impl<F> ControllerHandler for RunFn<F>
where
    F: FnMut(&ControllerContext) -> ControlResult<()> + Send + 'static,
{
    fn run(&mut self, ctx: &ControllerContext) -> ControlResult<()> {
        (self.0)(ctx)
    }
}

#[derive(Default)]
struct ExecNote {
    notifier: Arc<MultiNotifier>,
    notified: bool,
    aborted: bool,
}

/// Exec points of one controller. `finalized` is set once teardown has
/// resolved every point; until then waiters park even if the state already
/// reads `Stopped`.
#[derive(Default)]
struct ExecNotes {
    points: HashMap<String, ExecNote>,
    finalized: bool,
}

pub(crate) struct ControllerInner {
    id: String,
    kind: ControllerKind,
    host: Arc<dyn HostLoop>,
    registry: Arc<Registry>,
    bus: Arc<SignalBus>,
    runtime: RuntimeConfig,
    command_tag: Option<String>,
    state: AtomicU8,
    stop_requested: AtomicBool,
    messages: Mutex<MessageQueue>,
    exec_notes: Mutex<ExecNotes>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    commands: DashMap<String, Arc<dyn CommandHandler>>,
    handler: Mutex<Option<Box<dyn ControllerHandler>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Handle to a controller.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

/// Non-owning controller handle.
#[derive(Clone)]
pub struct WeakController {
    inner: Weak<ControllerInner>,
}

impl WeakController {
    /// Get a strong handle if the controller is still alive.
    pub fn upgrade(&self) -> Option<Controller> {
        self.inner.upgrade().map(|inner| Controller { inner })
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Controller`].
pub struct ControllerBuilder {
    id: String,
    kind: ControllerKind,
    registry: Option<Arc<Registry>>,
    bus: Option<Arc<SignalBus>>,
    runtime: RuntimeConfig,
    host: Option<Arc<dyn HostLoop>>,
    command_tag: Option<String>,
}

impl ControllerBuilder {
    /// Start building a controller with the given unique name.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ControllerKind::Loop,
            registry: None,
            bus: None,
            runtime: RuntimeConfig::default(),
            host: None,
            command_tag: None,
        }
    }

    /// Set the controller kind.
    pub fn kind(mut self, kind: ControllerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Register in this registry instead of the process-wide one.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this signal bus instead of the process-wide one.
    pub fn bus(mut self, bus: Arc<SignalBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the runtime configuration.
    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Run on a custom hosting loop.
    pub fn host_loop(mut self, host: Arc<dyn HostLoop>) -> Self {
        self.host = Some(host);
        self
    }

    /// Queue named commands under this tag instead of the interrupt channel.
    pub fn command_tag(mut self, tag: impl Into<String>) -> Self {
        self.command_tag = Some(tag.into());
        self
    }

    /// Create the controller and register it as *created*.
    pub fn build(self, handler: impl ControllerHandler) -> ControlResult<Controller> {
        let host = self
            .host
            .unwrap_or_else(|| Arc::new(ThreadLoop::new(self.runtime.max_batch)) as Arc<dyn HostLoop>);
        let controller = Controller {
            inner: Arc::new(ControllerInner {
                id: self.id,
                kind: self.kind,
                host,
                registry: self.registry.unwrap_or_else(Registry::global),
                bus: self.bus.unwrap_or_else(SignalBus::global),
                runtime: self.runtime,
                command_tag: self.command_tag,
                state: AtomicU8::new(ControllerState::Created as u8),
                stop_requested: AtomicBool::new(false),
                messages: Mutex::new(MessageQueue::new()),
                exec_notes: Mutex::new(ExecNotes::default()),
                subscriptions: Mutex::new(Vec::new()),
                commands: DashMap::new(),
                handler: Mutex::new(Some(Box::new(handler) as Box<dyn ControllerHandler>)),
                thread: Mutex::new(None),
            }),
        };
        controller.inner.registry.store_created(&controller)?;
        debug!(controller = %controller.id(), kind = ?controller.kind(), "Controller created");
        Ok(controller)
    }
}

impl Controller {
    /// Start building a controller.
    pub fn builder(id: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder::new(id)
    }

    /// Controller name.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Controller kind.
    pub fn kind(&self) -> ControllerKind {
        self.inner.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        ControllerState::from(self.inner.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ControllerState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    /// Check if the controller is running.
    pub fn is_running(&self) -> bool {
        self.state() == ControllerState::Running
    }

    /// Check if a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Whether the owning thread must unwind at its next checkpoint.
    pub(crate) fn should_unwind(&self) -> bool {
        self.is_stop_requested() && self.state() == ControllerState::Running
    }

    /// Hosting loop of this controller's thread.
    pub fn host(&self) -> Arc<dyn HostLoop> {
        self.inner.host.clone()
    }

    /// Runtime configuration.
    pub fn runtime(&self) -> &RuntimeConfig {
        &self.inner.runtime
    }

    /// Registry this controller lives in.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Signal bus this controller publishes to.
    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.inner.bus
    }

    /// Get a non-owning handle.
    pub fn downgrade(&self) -> WeakController {
        WeakController {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check whether two handles refer to the same controller.
    pub fn same(&self, other: &Controller) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Check whether the calling thread is this controller's thread.
    pub fn is_current_thread(&self) -> bool {
        crate::thread_context::current_controller().is_some_and(|c| c.same(self))
    }

    /// Enqueue a message; callable from any thread, never blocks.
    pub fn send_message(&self, tag: &str, value: Value, priority: i32) {
        self.push_payload(tag, Payload::Value(value), priority);
    }

    pub(crate) fn push_payload(&self, tag: &str, payload: Payload, priority: i32) {
        let mut messages = self.inner.messages.lock();
        // Checked under the queue lock: teardown marks the state before
        // draining, so nothing can slip in after the drain.
        if self.state() == ControllerState::Stopped {
            drop(messages);
            trace!(controller = %self.id(), tag, "Dropping message for stopped controller");
            drop(payload);
            return;
        }
        messages.push(tag, payload, priority);
        drop(messages);
        self.inner.host.wake();
    }

    /// Send a synchronization token waited on with
    /// [`ControllerContext::wait_for_sync`].
    pub fn send_sync(&self, tag: &str, uid: u64) {
        let mut messages = self.inner.messages.lock();
        if self.state() == ControllerState::Stopped {
            return;
        }
        messages.push_sync(tag, uid);
        drop(messages);
        self.inner.host.wake();
    }

    /// Number of queued messages under a tag.
    pub fn pending_messages(&self, tag: &str) -> usize {
        self.inner.messages.lock().len_of(tag)
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
