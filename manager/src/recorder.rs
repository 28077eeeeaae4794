//! Built-in plugin that writes player activity to the history store.

use crate::bus::{HandlerError, Subscriber};
use crate::plugin::{Plugin, PluginContext};
use crate::store::{ChatKind, ConnectionKind, EventStore, Record};
use async_trait::async_trait;
use shared::{DomainEvent, EventKind};
use std::sync::Arc;

const RECORDED: [EventKind; 6] = [
    EventKind::Chat,
    EventKind::TeamChat,
    EventKind::Kill,
    EventKind::Connect,
    EventKind::Disconnect,
    EventKind::UserinfoChanged,
];

pub struct StoreRecorder {
    instance: String,
    store: Arc<dyn EventStore>,
}

impl StoreRecorder {
    pub fn new(instance: &str, store: Arc<dyn EventStore>) -> Self {
        Self {
            instance: instance.to_string(),
            store,
        }
    }

    fn to_record(event: &DomainEvent) -> Option<Record> {
        let text = |key: &str| event.field(key).to_string();

        let record = match event.kind {
            EventKind::Chat | EventKind::TeamChat => Record::Chat {
                player: text("name"),
                kind: if event.kind == EventKind::Chat {
                    ChatKind::Public
                } else {
                    ChatKind::Team
                },
                message: text("message"),
            },
            EventKind::Kill => Record::Frag {
                fragger: text("fragger"),
                fragged: text("fragged"),
                weapon: text("weapon"),
            },
            EventKind::Connect | EventKind::Disconnect => Record::Connection {
                player: text("name"),
                player_id: text("player_id"),
                ip: text("ip"),
                kind: if event.kind == EventKind::Connect {
                    ConnectionKind::Connect
                } else {
                    ConnectionKind::Disconnect
                },
            },
            EventKind::UserinfoChanged => Record::PlayerInfo {
                player: text("name"),
                player_id: text("player_id"),
                class_id: event.field("class_id").parse().unwrap_or(0),
                class_name: text("class_name"),
                model: text("model"),
            },
            _ => return None,
        };

        Some(record)
    }
}

#[async_trait]
impl Subscriber for StoreRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        if let Some(record) = Self::to_record(event) {
            self.store.record(&self.instance, record);
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for StoreRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn register(self: Arc<Self>, ctx: &PluginContext) {
        for kind in RECORDED {
            ctx.bus.subscribe(kind, self.clone());
        }
    }
}
