//! Signal bus wrappers bound to a controller's id.

use serde_json::Value;

use super::Controller;
use crate::bus::{Signal, SubscribeOptions, SubscriptionId};
use crate::error::ControlResult;

impl Controller {
    /// Subscribe with delivery into this controller's thread.
    ///
    /// The subscription is removed automatically when the controller stops.
    pub fn subscribe(
        &self,
        callback: impl Fn(&Signal) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> ControlResult<SubscriptionId> {
        self.track(callback, options.sync_to(self))
    }

    /// Subscribe with delivery in the sender's thread.
    ///
    /// The callback must be safe to run concurrently with this controller.
    pub fn subscribe_nonsync(
        &self,
        callback: impl Fn(&Signal) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> ControlResult<SubscriptionId> {
        self.track(callback, options)
    }

    fn track(
        &self,
        callback: impl Fn(&Signal) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> ControlResult<SubscriptionId> {
        // Held across the bus call so teardown cannot miss the new id.
        let mut ids = self.inner.subscriptions.lock();
        if self.state() == super::ControllerState::Stopped {
            return Err(self.invalid_state("cannot subscribe after stop"));
        }
        let id = self.inner.bus.subscribe(callback, options)?;
        ids.push(id);
        Ok(id)
    }

    /// Remove one of this controller's subscriptions.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.lock().retain(|s| *s != id);
        self.inner.bus.unsubscribe(id)
    }

    /// Publish a signal with this controller as source.
    pub fn send_signal(&self, dst: &str, tag: &str, value: Value) -> usize {
        self.inner.bus.signal(Signal::new(self.id(), dst, tag, value))
    }
}
