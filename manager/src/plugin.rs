//! Extension contract.
//!
//! Plugins are handed to the instance as a list at construction time. On
//! start each one registers its subscribers on the instance's bus; on stop
//! it gets a chance to cancel background work.

use crate::bus::EventBus;
use crate::console::GameConsole;
use crate::store::EventStore;
use async_trait::async_trait;
use std::sync::Arc;

/// What a plugin may use from its instance
#[derive(Clone)]
pub struct PluginContext {
    pub instance: String,
    pub bus: Arc<EventBus>,
    pub console: Arc<dyn GameConsole>,
    pub store: Arc<dyn EventStore>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn register(self: Arc<Self>, ctx: &PluginContext);

    async fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HandlerError, Subscriber};
    use crate::console::testing::MockConsole;
    use crate::store::MemoryStore;
    use shared::{DomainEvent, EventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Greets every player that finishes connecting
    struct Greeter {
        console: std::sync::Mutex<Option<Arc<dyn GameConsole>>>,
        greeted: AtomicUsize,
    }

    #[async_trait]
    impl Subscriber for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        async fn on_event(&self, event: &DomainEvent) -> Result<(), HandlerError> {
            let console = self.console.lock().unwrap().clone().ok_or("not registered")?;
            console.tell(event.field("player_id"), "Welcome!").await;
            self.greeted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Plugin for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        fn register(self: Arc<Self>, ctx: &PluginContext) {
            *self.console.lock().unwrap() = Some(Arc::clone(&ctx.console));
            ctx.bus.subscribe(EventKind::Begin, self);
        }
    }

    #[tokio::test]
    async fn test_registered_plugin_receives_events() {
        let console = Arc::new(MockConsole::default());
        let ctx = PluginContext {
            instance: "main".to_string(),
            bus: Arc::new(EventBus::new()),
            console: console.clone(),
            store: Arc::new(MemoryStore::new()),
        };

        let greeter = Arc::new(Greeter {
            console: std::sync::Mutex::new(None),
            greeted: AtomicUsize::new(0),
        });
        let plugin: Arc<dyn Plugin> = greeter.clone();
        plugin.clone().register(&ctx);
        plugin.stop().await;

        ctx.bus
            .publish(DomainEvent::new(EventKind::Begin).with("player_id", "2"))
            .await;

        assert_eq!(greeter.greeted.load(Ordering::SeqCst), 1);
        assert_eq!(console.told_to("2"), vec!["Welcome!"]);
    }
}
