use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, error, warn};

/// Event topic names, shared with the UI layer that renders them.
pub mod event_names {
    pub const HEALTH_STATUS_CHANGE: &str = "health:status-change";
    pub const ALERT_CREATED: &str = "alert:created";
    pub const STREAM_STATE: &str = "stream:state";
    pub const STREAM_PAYLOAD: &str = "stream:payload";
    pub const BREAKER_STATE: &str = "breaker:state";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// Synchronous publish/subscribe fan-out for one topic.
///
/// Subscribers run on the publishing thread in subscription order. A
/// subscriber that returns `Err` or panics is logged and skipped; the
/// remaining subscribers still receive the event.
pub struct EventBus<T> {
    topic: &'static str,
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_id: AtomicU64,
}

impl<T> EventBus<T> {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.push((id, Arc::new(subscriber)));
        debug!(topic = self.topic, id = id.0, "Subscriber registered");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        subs.len() != before
    }

    /// Deliver `event` to every subscriber. Returns how many accepted it.
    pub fn publish(&self, event: &T) -> usize {
        // Snapshot so subscribers may (un)subscribe without deadlocking.
        let subs: Vec<(SubscriptionId, Subscriber<T>)> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = 0;
        for (id, subscriber) in subs {
            match catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(topic = self.topic, id = id.0, error = %e, "Subscriber failed");
                }
                Err(_) => {
                    error!(topic = self.topic, id = id.0, "Subscriber panicked");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::event_names::*;
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn event_names_match_ui_contract() {
        assert_eq!(HEALTH_STATUS_CHANGE, "health:status-change");
        assert_eq!(ALERT_CREATED, "alert:created");
        assert_eq!(STREAM_STATE, "stream:state");
        assert_eq!(STREAM_PAYLOAD, "stream:payload");
        assert_eq!(BREAKER_STATE, "breaker:state");
    }

    #[test]
    fn publish_reaches_subscribers_in_order() {
        let bus: EventBus<u32> = EventBus::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |v: &u32| {
                seen.lock().unwrap().push(format!("{tag}{v}"));
                Ok(())
            });
        }
        assert_eq!(bus.publish(&7), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7"]);
    }

    #[test]
    fn failing_subscriber_does_not_block_others() {
        let bus: EventBus<&str> = EventBus::new("test");
        let hits = Arc::new(Mutex::new(0));
        bus.subscribe(|_| Err("observer exploded".to_string()));
        bus.subscribe(|_| panic!("observer panicked"));
        let counter = Arc::clone(&hits);
        bus.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        assert_eq!(bus.publish(&"event"), 1);
        assert_eq!(*hits.lock().unwrap(), 1);
        // Bus stays usable after a panic.
        assert_eq!(bus.publish(&"again"), 1);
        assert_eq!(*hits.lock().unwrap(), 2);
    }

    #[test]
    fn unsubscribe_removes_subscriber() {
        let bus: EventBus<()> = EventBus::new("test");
        let id = bus.subscribe(|_| Ok(()));
        assert_eq!(bus.len(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(bus.is_empty());
        assert_eq!(bus.publish(&()), 0);
    }
}
