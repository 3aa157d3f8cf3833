//! Publish/subscribe signal bus.
//!
//! Signals are matched by `(source, destination, tag)` against every
//! subscription. Matching subscriptions run in descending priority order,
//! equal priorities in registration order. Non-sync subscriptions run in the
//! sender's thread; sync subscriptions are marshalled into their destination
//! controller's thread through the interrupt channel, subject to queue and
//! rate admission limits. Signals over a limit are dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::controller::{Controller, WeakController};
use crate::error::{ControlResult, ControllerError};

/// Wildcard matching every controller id.
pub const ANY: &str = "any";
/// Broadcast address: matches every concrete subscription filter.
pub const ALL: &str = "all";

static GLOBAL: Lazy<Arc<SignalBus>> = Lazy::new(|| Arc::new(SignalBus::new()));

/// Unique subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Source or destination filter of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Matches every id, including the `any` and `all` wildcards.
    Any,
    /// Matches the listed ids and the `all` broadcast address.
    Only(Vec<String>),
}

impl Filter {
    /// Filter for the given ids.
    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::Only(ids.into_iter().map(Into::into).collect())
    }

    /// Check whether a signal address passes this filter.
    pub fn matches(&self, address: &str) -> bool {
        match self {
            Filter::Any => true,
            Filter::Only(ids) => address == ALL || ids.iter().any(|id| id == address),
        }
    }
}

impl From<&str> for Filter {
    fn from(id: &str) -> Self {
        if id == ANY {
            Filter::Any
        } else {
            Filter::Only(vec![id.to_string()])
        }
    }
}

/// A published signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    /// Sending controller id, or `any`/`all`.
    pub src: String,

    /// Destination controller id, or `any`/`all`.
    pub dst: String,

    /// Signal tag.
    pub tag: String,

    /// Payload.
    pub value: Value,
}

impl Signal {
    pub fn new(
        src: impl Into<String>,
        dst: impl Into<String>,
        tag: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            tag: tag.into(),
            value,
        }
    }
}

type Callback = Arc<dyn Fn(&Signal) + Send + Sync>;
type Predicate = Arc<dyn Fn(&Signal) -> bool + Send + Sync>;

/// Options for [`SignalBus::subscribe`].
#[derive(Clone)]
pub struct SubscribeOptions {
    src: Filter,
    dst: Filter,
    tags: Option<Vec<String>>,
    filter: Option<Predicate>,
    priority: i32,
    dest: Option<Controller>,
    limit_queue: Option<usize>,
    limit_period: Option<Duration>,
    id: Option<SubscriptionId>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            src: Filter::Any,
            dst: Filter::Any,
            tags: None,
            filter: None,
            priority: 0,
            dest: None,
            limit_queue: None,
            limit_period: None,
            id: None,
        }
    }
}

impl SubscribeOptions {
    /// Match every signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only signals from these sources.
    pub fn src(mut self, src: impl Into<Filter>) -> Self {
        self.src = src.into();
        self
    }

    /// Only signals addressed to these destinations.
    pub fn dst(mut self, dst: impl Into<Filter>) -> Self {
        self.dst = dst.into();
        self
    }

    /// Only signals with one of these tags.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Extra predicate on the whole signal.
    pub fn filter(mut self, filter: impl Fn(&Signal) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Higher priorities are served first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Deliver in this controller's thread instead of the sender's.
    pub fn sync_to(mut self, dest: &Controller) -> Self {
        self.dest = Some(dest.clone());
        self
    }

    /// Cap on deliveries not yet completed in the destination thread.
    pub fn limit_queue(mut self, limit: usize) -> Self {
        self.limit_queue = Some(limit);
        self
    }

    /// Minimum spacing between accepted deliveries.
    pub fn limit_period(mut self, period: Duration) -> Self {
        self.limit_period = Some(period);
        self
    }

    /// Use a caller-chosen id.
    pub fn id(mut self, id: SubscriptionId) -> Self {
        self.id = Some(id);
        self
    }

    fn matches(&self, signal: &Signal) -> bool {
        self.src.matches(&signal.src)
            && self.dst.matches(&signal.dst)
            && self
                .tags
                .as_ref()
                .is_none_or(|tags| tags.iter().any(|t| *t == signal.tag))
            && self.filter.as_ref().is_none_or(|f| f(signal))
    }
}

enum Delivery {
    Direct,
    Queued(WeakController),
}

struct Subscription {
    id: SubscriptionId,
    order: u64,
    options: SubscribeOptions,
    callback: Callback,
    delivery: Delivery,
    in_flight: AtomicUsize,
    last_accepted: Mutex<Option<Instant>>,
}

/// Releases one in-flight slot when the delivery completes or is dropped.
struct InFlight(Arc<Subscription>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Subscription {
    fn admit(self: &Arc<Self>) -> Option<InFlight> {
        let limit = self.options.limit_queue;
        let reserved = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                limit.is_none_or(|l| n < l).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            warn!(subscription = %self.id, "Signal dropped: delivery queue full");
            return None;
        }
        let guard = InFlight(self.clone());

        if let Some(period) = self.options.limit_period {
            let now = Instant::now();
            let mut last = self.last_accepted.lock();
            if last.is_some_and(|t| now.duration_since(t) < period) {
                trace!(subscription = %self.id, "Signal dropped: rate limited");
                return None;
            }
            *last = Some(now);
        }
        Some(guard)
    }

    fn deliver(self: &Arc<Self>, signal: &Signal) -> bool {
        let Some(guard) = self.admit() else {
            return false;
        };
        match &self.delivery {
            Delivery::Direct => {
                (self.callback)(signal);
                drop(guard);
                true
            }
            Delivery::Queued(dest) => {
                let Some(dest) = dest.upgrade() else {
                    return false;
                };
                let callback = self.callback.clone();
                let signal = signal.clone();
                dest.call_in_thread_callback(
                    move || {
                        let _guard = guard;
                        callback(&signal);
                    },
                    None,
                    None,
                    0,
                );
                true
            }
        }
    }
}

/// Signal router shared by a set of controllers.
pub struct SignalBus {
    subs: RwLock<Vec<Arc<Subscription>>>,
    order: AtomicU64,
}

impl SignalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(Vec::new()),
            order: AtomicU64::new(0),
        }
    }

    /// Process-wide bus used by default.
    pub fn global() -> Arc<SignalBus> {
        GLOBAL.clone()
    }

    /// Register a subscription.
    ///
    /// With a destination controller (see [`SubscribeOptions::sync_to`]) the
    /// callback runs in that controller's thread; otherwise in the
    /// sender's.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Signal) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> ControlResult<SubscriptionId> {
        let id = options.id.unwrap_or_default();
        let delivery = match &options.dest {
            Some(dest) => Delivery::Queued(dest.downgrade()),
            None => Delivery::Direct,
        };
        let subscription = Arc::new(Subscription {
            id,
            order: self.order.fetch_add(1, Ordering::SeqCst),
            options: SubscribeOptions {
                dest: None,
                ..options
            },
            callback: Arc::new(callback),
            delivery,
            in_flight: AtomicUsize::new(0),
            last_accepted: Mutex::new(None),
        });

        let mut subs = self.subs.write();
        if subs.iter().any(|s| s.id == id) {
            return Err(ControllerError::InvalidSubscription(format!(
                "subscription {id} already exists"
            )));
        }
        subs.push(subscription);
        debug!(subscription = %id, total = subs.len(), "Signal subscription added");
        Ok(id)
    }

    /// Remove a subscription; returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subs.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if removed {
            debug!(subscription = %id, "Signal subscription removed");
        }
        removed
    }

    /// Publish a signal; returns the number of accepted deliveries.
    ///
    /// Callbacks run outside the bus lock, so they may subscribe, unsubscribe
    /// or publish themselves.
    pub fn signal(&self, signal: Signal) -> usize {
        let mut matching: Vec<Arc<Subscription>> = self
            .subs
            .read()
            .iter()
            .filter(|s| s.options.matches(&signal))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.options
                .priority
                .cmp(&a.options.priority)
                .then(a.order.cmp(&b.order))
        });

        trace!(src = %signal.src, dst = %signal.dst, tag = %signal.tag, matched = matching.len(), "Signal published");
        matching.iter().filter(|s| s.deliver(&signal)).count()
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    /// Check if the bus has no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
