//! Typed in-process pub/sub.
//!
//! Dispatch is synchronous on the publishing thread: within one topic,
//! publish order is delivery order to every subscriber. Handlers may publish
//! recursively; the nested dispatch completes before control returns. A
//! failing handler is surfaced on [`Topic::BusError`] and never aborts
//! iteration over the remaining subscribers.
//!
//! Production wiring keeps all publication on a single dispatcher task fed by
//! a bounded channel, so subscriber state needs no locking of its own beyond
//! interior mutability.

use crate::{
    error::DataError,
    event::{BusErrorEvent, BusEvent, BusPayload, Topic},
};
use fnv::FnvHashMap;
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Subscriber callback. Returning `Err` reports the failure on
/// [`Topic::BusError`]; it does not stop dispatch.
pub type Handler = Arc<dyn Fn(&BusEvent) -> Result<(), DataError> + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: SmolStr,
    handler: Handler,
}

/// Synchronous topic-keyed event bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<FnvHashMap<Topic, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `(topic, handler_id)`. Idempotent: a second
    /// subscribe with the same identity replaces the handler in place,
    /// preserving its registration order.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler_id: impl Into<SmolStr>,
        handler: impl Fn(&BusEvent) -> Result<(), DataError> + Send + Sync + 'static,
    ) {
        let id = handler_id.into();
        let subscription = Subscription {
            id: id.clone(),
            handler: Arc::new(handler),
        };

        let mut subscribers = self.subscribers.write();
        let entries = subscribers.entry(topic).or_default();
        match entries.iter_mut().find(|entry| entry.id == id) {
            Some(existing) => *existing = subscription,
            None => entries.push(subscription),
        }
    }

    /// Remove the handler registered under `(topic, handler_id)`. Idempotent.
    pub fn unsubscribe(&self, topic: Topic, handler_id: &str) {
        let mut subscribers = self.subscribers.write();
        if let Some(entries) = subscribers.get_mut(&topic) {
            entries.retain(|entry| entry.id != handler_id);
        }
    }

    /// Publish to every subscriber of `event.topic` in registration order,
    /// on the calling thread.
    pub fn publish(&self, event: BusEvent) {
        // Snapshot under the lock, dispatch outside it: handlers may publish
        // recursively or (un)subscribe.
        let snapshot: Vec<Subscription> = {
            let subscribers = self.subscribers.read();
            match subscribers.get(&event.topic) {
                Some(entries) => entries.clone(),
                None => return,
            }
        };

        for subscription in snapshot {
            if let Err(err) = (subscription.handler)(&event) {
                self.report_handler_error(event.topic, &subscription.id, err);
            }
        }
    }

    /// Convenience for `publish(BusEvent::new(topic, payload))`.
    pub fn publish_to(&self, topic: Topic, payload: BusPayload) {
        self.publish(BusEvent::new(topic, payload));
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .get(&topic)
            .map_or(0, |entries| entries.len())
    }

    fn report_handler_error(&self, topic: Topic, handler_id: &SmolStr, err: DataError) {
        if topic == Topic::BusError {
            // An error-topic handler failing must not recurse.
            error!(handler = %handler_id, %err, "bus error handler failed");
            return;
        }
        warn!(topic = %topic, handler = %handler_id, %err, "bus handler failed");
        self.publish(BusEvent::new(
            Topic::BusError,
            BusPayload::Error(BusErrorEvent {
                topic,
                handler_id: handler_id.clone(),
                detail: err.to_string(),
            }),
        ));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.read();
        let total: usize = subscribers.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("topics", &subscribers.len())
            .field("subscribers", &total)
            .finish()
    }
}

/// Spawn the single dispatcher task draining venue-client channels onto the
/// bus. Producers block (bounded channel) when the dispatcher lags, which is
/// the only backpressure mechanism by design of the pipeline.
pub fn spawn_dispatcher(
    bus: Arc<EventBus>,
    mut events: mpsc::Receiver<BusEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            bus.publish(event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Disconnected, StreamId};
    use parking_lot::Mutex;

    fn disconnected(ts: i64) -> BusEvent {
        BusEvent::new(
            Topic::MarketDisconnected,
            BusPayload::Disconnected(Disconnected {
                stream_id: StreamId::from("binance.futures.usd"),
                close_code: None,
                ts,
            }),
        )
    }

    #[test]
    fn test_delivery_in_registration_and_publish_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b"] {
            let log = Arc::clone(&log);
            bus.subscribe(Topic::MarketDisconnected, name, move |event| {
                if let BusPayload::Disconnected(payload) = &event.payload {
                    log.lock().push((name, payload.ts));
                }
                Ok(())
            });
        }

        bus.publish(disconnected(1));
        bus.publish(disconnected(2));

        assert_eq!(
            log.lock().clone(),
            vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]
        );
    }

    #[test]
    fn test_subscribe_idempotent_by_identity() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0u32));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.subscribe(Topic::MarketDisconnected, "same", move |_| {
                *hits.lock() += 1;
                Ok(())
            });
        }
        assert_eq!(bus.subscriber_count(Topic::MarketDisconnected), 1);

        bus.publish(disconnected(1));
        assert_eq!(*hits.lock(), 1);

        bus.unsubscribe(Topic::MarketDisconnected, "same");
        bus.unsubscribe(Topic::MarketDisconnected, "same");
        assert_eq!(bus.subscriber_count(Topic::MarketDisconnected), 0);
    }

    #[test]
    fn test_failing_handler_does_not_abort_iteration() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        {
            let hits = Arc::clone(&hits);
            bus.subscribe(Topic::MarketDisconnected, "bad", move |_| {
                hits.lock().push("bad");
                Err(DataError::Protocol("boom".to_string()))
            });
        }
        {
            let hits = Arc::clone(&hits);
            bus.subscribe(Topic::MarketDisconnected, "good", move |_| {
                hits.lock().push("good");
                Ok(())
            });
        }

        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            bus.subscribe(Topic::BusError, "collector", move |event| {
                if let BusPayload::Error(payload) = &event.payload {
                    errors.lock().push(payload.handler_id.clone());
                }
                Ok(())
            });
        }

        bus.publish(disconnected(1));

        assert_eq!(hits.lock().clone(), vec!["bad", "good"]);
        assert_eq!(errors.lock().clone(), vec![SmolStr::from("bad")]);
    }

    #[test]
    fn test_dispatcher_drains_channel_in_order() {
        tokio_test::block_on(async {
            let bus = Arc::new(EventBus::new());
            let log = Arc::new(Mutex::new(Vec::new()));
            {
                let log = Arc::clone(&log);
                bus.subscribe(Topic::MarketDisconnected, "observer", move |event| {
                    if let BusPayload::Disconnected(payload) = &event.payload {
                        log.lock().push(payload.ts);
                    }
                    Ok(())
                });
            }

            let (tx, rx) = mpsc::channel(16);
            let dispatcher = spawn_dispatcher(Arc::clone(&bus), rx);
            for ts in [1, 2, 3] {
                tx.send(disconnected(ts)).await.unwrap();
            }
            drop(tx);
            dispatcher.await.unwrap();

            assert_eq!(log.lock().clone(), vec![1, 2, 3]);
        });
    }

    #[test]
    fn test_recursive_publish_completes_before_return() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let bus_outer = Arc::clone(&bus);
            let log = Arc::clone(&log);
            bus.subscribe(Topic::MarketDisconnected, "republisher", move |event| {
                if let BusPayload::Disconnected(payload) = &event.payload {
                    log.lock().push(("outer", payload.ts));
                    if payload.ts == 1 {
                        bus_outer.publish(disconnected(99));
                    }
                }
                Ok(())
            });
        }
        {
            let log = Arc::clone(&log);
            bus.subscribe(Topic::MarketDisconnected, "observer", move |event| {
                if let BusPayload::Disconnected(payload) = &event.payload {
                    log.lock().push(("observer", payload.ts));
                }
                Ok(())
            });
        }

        bus.publish(disconnected(1));

        // Nested publish (ts=99) fully dispatches inside the outer handler,
        // before the outer event reaches the second subscriber.
        assert_eq!(
            log.lock().clone(),
            vec![
                ("outer", 1),
                ("outer", 99),
                ("observer", 99),
                ("observer", 1)
            ]
        );
    }
}
