//! Game-facing operations used by event subscribers.
//!
//! [`GameConsole`] is the narrow view of the running server that plugins and
//! services get: chat output, player counts and the current map/mode.
//! [`RemoteConsole`] implements it over the remote-administration client and
//! adds the raw administrative commands the instance exposes.

use crate::store::{ChatKind, EventStore, Record};
use async_trait::async_trait;
use log::{info, warn};
use rcon::RconClient;
use shared::{mode_id, mode_name, Player};
use std::sync::Arc;

pub const SERVER_SPEAKER: &str = "Server";

#[async_trait]
pub trait GameConsole: Send + Sync {
    async fn say(&self, message: &str);

    async fn tell(&self, player_id: &str, message: &str);

    async fn players(&self) -> Vec<Player>;

    async fn player_count(&self) -> usize {
        self.players().await.len()
    }

    async fn current_map(&self) -> Option<String>;

    /// Current mode name, `None` when the server does not answer
    async fn current_mode(&self) -> Option<String>;

    async fn change_map(&self, map: &str);

    /// Switches mode by name. Unknown names are ignored with a warning.
    async fn change_mode(&self, mode: &str);
}

pub struct RemoteConsole {
    instance: String,
    client: RconClient,
    store: Arc<dyn EventStore>,
}

impl RemoteConsole {
    pub fn new(instance: &str, client: RconClient, store: Arc<dyn EventStore>) -> Self {
        Self {
            instance: instance.to_string(),
            client,
            store,
        }
    }

    pub fn client(&self) -> &RconClient {
        &self.client
    }

    pub async fn rcon(&self, command: &str) -> String {
        self.client.rcon(command).await
    }

    pub async fn cvar(&self, key: &str) -> Option<String> {
        self.client.get_cvar(key).await
    }

    pub async fn set_cvar(&self, key: &str, value: &str) -> String {
        self.client.set_cvar(key, value).await
    }

    pub async fn kick(&self, player_id: &str) -> String {
        info!("Kicking client {}", player_id);
        self.client.rcon(&format!("kick {}", player_id)).await
    }

    pub async fn ban(&self, ip: &str) -> String {
        info!("Banning {}", ip);
        self.client.rcon(&format!("addip {}", ip)).await
    }

    pub async fn unban(&self, ip: &str) -> String {
        info!("Unbanning {}", ip);
        self.client.rcon(&format!("removeip {}", ip)).await
    }

    fn record_server_chat(&self, kind: ChatKind, message: &str) {
        self.store.record(
            &self.instance,
            Record::Chat {
                player: SERVER_SPEAKER.to_string(),
                kind,
                message: message.to_string(),
            },
        );
    }
}

#[async_trait]
impl GameConsole for RemoteConsole {
    async fn say(&self, message: &str) {
        self.client.say(message).await;
        self.record_server_chat(ChatKind::Public, message);
    }

    async fn tell(&self, player_id: &str, message: &str) {
        self.client.tell(player_id, message).await;
        self.record_server_chat(ChatKind::Tell, message);
    }

    async fn players(&self) -> Vec<Player> {
        self.client.players().await
    }

    async fn current_map(&self) -> Option<String> {
        self.client.get_cvar("mapname").await
    }

    async fn current_mode(&self) -> Option<String> {
        let id = self.client.get_cvar("g_authenticity").await?;
        mode_name(&id).map(str::to_string)
    }

    async fn change_map(&self, map: &str) {
        info!("Changing map to {}", map);
        self.client.rcon(&format!("map {}", map)).await;
    }

    async fn change_mode(&self, mode: &str) {
        let Some(id) = mode_id(mode) else {
            warn!("Unknown mode {}, not changing", mode);
            return;
        };

        info!("Changing mode to {} ({})", mode, id);
        self.client.set_cvar("mbmode", &id.to_string()).await;
        self.client.rcon(&format!("mbmode {}", id)).await;
    }
}
