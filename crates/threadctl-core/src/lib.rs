//! # threadctl Core
//!
//! Cooperative multi-threaded controller framework.
//!
//! ## Components
//!
//! - [`Controller`] - Named actor owning one thread, a priority message
//!   queue, an interrupt channel and lifecycle exec points
//! - [`Registry`] - Process-wide (or scoped) table of controllers
//! - [`SignalBus`] - Publish/subscribe routing of [`Signal`]s
//! - [`Notifier`] / [`MultiNotifier`] - Cross-thread wait/notify
//! - [`Scheduler`] - Controller running periodic and batch jobs
//! - [`HostLoop`] - Event loop hosting a controller's thread
//!
//! ## Threading
//!
//! Code registered with a controller runs only on that controller's thread.
//! Other threads reach it through messages, signals and cross-thread calls.
//! Every blocking wait keeps running the waiting thread's own loop, so
//! controllers stay responsive to interrupts and stop requests.

pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod message;
pub mod notifier;
pub mod registry;
pub mod scheduler;
pub mod thread_context;

pub use bus::{Filter, Signal, SignalBus, SubscribeOptions, SubscriptionId, ALL, ANY};
pub use config::RuntimeConfig;
pub use controller::{
    run_fn, CallOptions, CallResult, CommandHandler, Controller, ControllerBuilder,
    ControllerContext, ControllerHandler, ControllerKind, ControllerState, LoopStatus,
    WeakController,
};
pub use error::{ControlResult, ControllerError};
pub use host::{HostLoop, ThreadLoop, TimerHandle};
pub use message::{Message, Payload, EXECUTE_TAG};
pub use notifier::{MultiNotifier, Notifier};
pub use registry::{get_controller, stop_all_controllers, stop_controller, Registry};
pub use scheduler::{BatchJob, BatchStep, Scheduler, SchedulerHandle, VariableStore};
pub use thread_context::{current_controller, current_loop};
