//! Publish/subscribe dispatch of domain events.
//!
//! Subscribers register per event kind. `publish` calls them one after the
//! other in registration order and only returns once every handler has
//! completed, including awaiting async handlers. A handler that returns an
//! error or panics is logged and skipped; the remaining handlers and the
//! publisher never see the failure. Handlers that want fire-and-forget work
//! spawn their own task.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error};
use shared::{DomainEvent, EventKind};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

type HandlerFn = dyn Fn(DomainEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

/// Adapts a closure returning a boxed future into a [`Subscriber`]
pub struct FnSubscriber {
    name: String,
    handler: Box<HandlerFn>,
}

impl FnSubscriber {
    pub fn new<F>(name: &str, handler: F) -> Self
    where
        F: Fn(DomainEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Subscriber for FnSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        (self.handler)(event.clone()).await
    }
}

/// Outcome of one publish call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: usize,
    pub failed: usize,
}

/// Per-instance subscriber registry. Never shared between instances.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Arc<dyn Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, subscriber: Arc<dyn Subscriber>) {
        let mut subscribers = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!("{} subscribed to {}", subscriber.name(), kind);
        subscribers.entry(kind).or_default().push(subscriber);
    }

    pub fn subscribe_fn<F>(&self, kind: EventKind, name: &str, handler: F)
    where
        F: Fn(DomainEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(FnSubscriber::new(name, handler)));
    }

    #[cfg(test)]
    fn subscriber_count(&self, kind: EventKind) -> usize {
        match self.subscribers.read() {
            Ok(guard) => guard.get(&kind).map_or(0, Vec::len),
            Err(poisoned) => poisoned.into_inner().get(&kind).map_or(0, Vec::len),
        }
    }

    pub async fn publish(&self, event: DomainEvent) -> Dispatch {
        // Snapshot so handlers may subscribe without deadlocking
        let handlers: Vec<Arc<dyn Subscriber>> = {
            let subscribers = match self.subscribers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.get(&event.kind).cloned().unwrap_or_default()
        };

        let mut dispatch = Dispatch::default();

        for handler in handlers {
            let result = AssertUnwindSafe(handler.on_event(&event))
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(())) => dispatch.delivered += 1,
                Ok(Err(e)) => {
                    error!("Subscriber {} failed on {}: {}", handler.name(), event.kind, e);
                    dispatch.failed += 1;
                }
                Err(panic) => {
                    let reason = if let Some(msg) = panic.downcast_ref::<&'static str>() {
                        (*msg).to_string()
                    } else if let Some(msg) = panic.downcast_ref::<String>() {
                        msg.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    error!("Subscriber {} panicked on {}: {}", handler.name(), event.kind, reason);
                    dispatch.failed += 1;
                }
            }
        }

        dispatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn Subscriber> {
        Arc::new(FnSubscriber::new(tag, move |event: DomainEvent| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("{}:{}", tag, event.field("message")));
                Ok(())
            }
            .boxed()
        }))
    }

    fn chat(message: &str) -> DomainEvent {
        DomainEvent::new(EventKind::Chat).with("message", message)
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventKind::Chat, recorder(Arc::clone(&log), "a"));
        bus.subscribe(EventKind::Chat, recorder(Arc::clone(&log), "b"));
        bus.subscribe(EventKind::Kill, recorder(Arc::clone(&log), "kill"));

        let dispatch = bus.publish(chat("hi")).await;

        assert_eq!(dispatch, Dispatch { delivered: 2, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["a:hi", "b:hi"]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let dispatch = bus.publish(DomainEvent::new(EventKind::RoundEnd)).await;
        assert_eq!(dispatch, Dispatch::default());
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_fn(EventKind::Chat, "broken", |_event| {
            async { Err::<(), HandlerError>("boom".into()) }.boxed()
        });
        bus.subscribe(EventKind::Chat, recorder(Arc::clone(&log), "after"));

        let dispatch = bus.publish(chat("x")).await;

        assert_eq!(dispatch.failed, 1);
        assert_eq!(dispatch.delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["after:x"]);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventKind::Chat, recorder(Arc::clone(&log), "before"));
        bus.subscribe_fn(EventKind::Chat, "panics", |_event| {
            async {
                let broken = true;
                if broken {
                    panic!("handler exploded");
                }
                Ok(())
            }
            .boxed()
        });
        bus.subscribe(EventKind::Chat, recorder(Arc::clone(&log), "after"));

        let dispatch = bus.publish(chat("y")).await;

        assert_eq!(dispatch, Dispatch { delivered: 2, failed: 1 });
        assert_eq!(*log.lock().unwrap(), vec!["before:y", "after:y"]);
    }

    #[tokio::test]
    async fn test_publish_awaits_slow_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = Arc::clone(&log);
        bus.subscribe_fn(EventKind::Chat, "slow", move |_event| {
            let log = Arc::clone(&slow_log);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("slow".to_string());
                Ok(())
            }
            .boxed()
        });
        bus.subscribe(EventKind::Chat, recorder(Arc::clone(&log), "fast"));

        bus.publish(chat("z")).await;

        assert_eq!(*log.lock().unwrap(), vec!["slow", "fast:z"]);
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::Disconnect, recorder(log, "d"));

        assert_eq!(bus.subscriber_count(EventKind::Disconnect), 1);
        assert_eq!(bus.subscriber_count(EventKind::Chat), 0);
    }
}
