//! One managed game server.
//!
//! A [`ServerInstance`] owns everything that belongs to a single dedicated
//! server: its remote console, its event bus, its services and its plugins.
//! Nothing is shared between instances, so several can live in one process.
//!
//! ## Services
//!
//! Registered at construction, launched in this order:
//! 1. `engine` - the dedicated server process
//! 2. `tailer` - follows the engine log and feeds the bus
//! 3. `restarter` - scheduled restarts, only when configured
//!
//! Services never restart the instance themselves. They send a
//! [`ControlMessage`] that [`ServerInstance::serve`] acts on.

use crate::bus::EventBus;
use crate::config::Settings;
use crate::console::{GameConsole, RemoteConsole};
use crate::error::ManagerError;
use crate::plugin::{Plugin, PluginContext};
use crate::recorder::StoreRecorder;
use crate::restarter::ScheduledRestarter;
use crate::store::EventStore;
use crate::supervisor::{ProcessSpec, RestartPolicy, ServiceRegistry, ServiceStatus, Startable};
use crate::tailer::LogTailer;
use crate::utils::format_uptime;
use crate::vote::{VoteController, VoteKind, VoteSnapshot};
use futures::FutureExt;
use log::{debug, error, info, warn};
use rcon::RconClient;
use serde::Serialize;
use shared::{mode_name, Player};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub const ENGINE_SERVICE: &str = "engine";
pub const TAILER_SERVICE: &str = "tailer";
pub const RESTARTER_SERVICE: &str = "restarter";

/// Requests services send to the instance's control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Restart,
    Shutdown,
}

/// Who asked for a stop.
///
/// Interactive callers are asked to confirm when too many players are
/// connected. Programmatic callers cannot answer and are treated as forced.
pub enum StopCaller {
    Interactive(Box<dyn FnOnce(usize) -> bool + Send>),
    Programmatic,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub server_running: bool,
    pub map: Option<String>,
    pub mode: Option<String>,
    pub uptime: Option<String>,
    pub players: Vec<Player>,
    pub player_count: usize,
    pub services: Vec<ServiceStatus>,
    pub plugins: Vec<String>,
    pub votes: Vec<VoteSnapshot>,
}

pub struct ServerInstance {
    settings: Settings,
    console: Arc<RemoteConsole>,
    bus: Arc<EventBus>,
    store: Arc<dyn EventStore>,
    services: ServiceRegistry,
    votes: Arc<VoteController>,
    plugins: Vec<Arc<dyn Plugin>>,
    plugins_registered: AtomicBool,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
}

impl ServerInstance {
    /// Builds an instance with the built-in plugins followed by `extra_plugins`.
    pub fn new(settings: Settings, store: Arc<dyn EventStore>, extra_plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let name = settings.server.name.clone();
        let client = RconClient::new(
            &settings.server.host,
            settings.server.port,
            &settings.security.rcon_password,
        );
        let console = Arc::new(RemoteConsole::new(&name, client, Arc::clone(&store)));
        let game_console: Arc<dyn GameConsole> = console.clone();
        let votes = Arc::new(VoteController::new(&settings.votes, Arc::clone(&game_console)));

        let recorder: Arc<dyn Plugin> = Arc::new(StoreRecorder::new(&name, Arc::clone(&store)));
        let vote_plugin: Arc<dyn Plugin> = votes.clone();
        let mut plugins = vec![recorder, vote_plugin];
        plugins.extend(extra_plugins);

        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let instance = Self {
            settings,
            console,
            bus: Arc::new(EventBus::new()),
            store,
            services: ServiceRegistry::new(),
            votes,
            plugins,
            plugins_registered: AtomicBool::new(false),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        };
        instance.register_services(game_console);
        instance
    }

    fn register_services(&self, console: Arc<dyn GameConsole>) {
        let server = &self.settings.server;

        let mut engine = ProcessSpec::new(server.engine_path(), server.launch_args());
        engine.working_dir = Some(server.engine_dir.clone());
        let engine_policy = if server.auto_restart {
            RestartPolicy::OnFailure {
                delay: server.restart_settle(),
            }
        } else {
            RestartPolicy::Never
        };
        self.services
            .register_service(ENGINE_SERVICE, Startable::Process(engine), engine_policy);

        let instance = server.name.clone();
        let log_path = server.log_path.clone();
        let tailer_settings = self.settings.tailer.clone();
        let bus = Arc::clone(&self.bus);
        let store = Arc::clone(&self.store);
        self.services.register_service(
            TAILER_SERVICE,
            Startable::task(move || {
                let tailer = LogTailer::new(
                    &instance,
                    &log_path,
                    tailer_settings.clone(),
                    Arc::clone(&bus),
                    Arc::clone(&store),
                );
                async move { tailer.run().await }.boxed()
            }),
            RestartPolicy::Never,
        );

        let restarter = ScheduledRestarter::new(
            server.restart_every_hours,
            Duration::from_secs(server.restart_postpone_secs),
            console,
            self.control_tx.clone(),
        );
        if let Some(restarter) = restarter.map(Arc::new) {
            self.services.register_service(
                RESTARTER_SERVICE,
                Startable::task(move || {
                    let restarter = Arc::clone(&restarter);
                    async move { restarter.run().await }.boxed()
                }),
                RestartPolicy::Never,
            );
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.server.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn console(&self) -> &Arc<RemoteConsole> {
        &self.console
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn votes(&self) -> &Arc<VoteController> {
        &self.votes
    }

    /// Sender for requests to the control loop
    pub fn control(&self) -> mpsc::UnboundedSender<ControlMessage> {
        self.control_tx.clone()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|plugin| plugin.name().to_string()).collect()
    }

    /// Checks the launch preconditions and launches every service
    pub async fn start(&self) -> Result<(), ManagerError> {
        let server = &self.settings.server;

        let config = server.server_config_path();
        if !is_file(&config).await {
            return Err(ManagerError::ServerConfigMissing(config));
        }

        let engine = server.engine_path();
        if !is_file(&engine).await {
            return Err(ManagerError::EngineMissing(engine));
        }
        make_executable(&engine)?;
        self.link_locations()?;

        self.register_plugins();
        self.services.launch_all()?;

        info!("Instance {} started on port {}", server.name, server.port);
        Ok(())
    }

    fn register_plugins(&self) {
        if self.plugins_registered.swap(true, Ordering::SeqCst) {
            return;
        }

        let ctx = PluginContext {
            instance: self.name().to_string(),
            bus: Arc::clone(&self.bus),
            console: self.console.clone(),
            store: Arc::clone(&self.store),
        };
        for plugin in &self.plugins {
            plugin.clone().register(&ctx);
            info!("Registered plugin {}", plugin.name());
        }
    }

    /// Points every configured symlink at the shared game directory
    fn link_locations(&self) -> Result<(), ManagerError> {
        let locations = &self.settings.locations;
        if locations.symlinks.is_empty() {
            return Ok(());
        }

        let Some(target) = &locations.game_path else {
            return Err(ManagerError::Config(
                "locations.symlinks requires locations.game_path".to_string(),
            ));
        };

        for link in &locations.symlinks {
            ensure_symlink(target, link)?;
        }
        Ok(())
    }

    /// Stops plugins and services, then removes the engine log.
    pub async fn stop(&self, force: bool, caller: StopCaller) -> Result<(), ManagerError> {
        let threshold = self.settings.server.stop_confirm_threshold;

        if !force && self.services.is_running(ENGINE_SERVICE) {
            let players = self.console.player_count().await;
            if players > threshold {
                match caller {
                    StopCaller::Programmatic => {
                        info!("Stopping {} with {} players connected", self.name(), players)
                    }
                    StopCaller::Interactive(confirm) => {
                        if !confirm(players) {
                            return Err(ManagerError::StopDeclined(players));
                        }
                    }
                }
            }
        }

        for plugin in self.plugins.iter().rev() {
            plugin.stop().await;
        }
        self.services.stop_all().await;

        let log_path = &self.settings.server.log_path;
        match tokio::fs::remove_file(log_path).await {
            Ok(()) => debug!("Removed {}", log_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", log_path.display(), e),
        }

        info!("Instance {} stopped", self.name());
        Ok(())
    }

    pub async fn restart(&self) -> Result<(), ManagerError> {
        info!("Restarting instance {}", self.name());
        self.stop(false, StopCaller::Programmatic).await?;
        sleep(self.settings.server.restart_settle()).await;
        self.start().await
    }

    /// Runs control requests until a shutdown arrives
    pub async fn serve(&self) -> Result<(), ManagerError> {
        let receiver = match self.control_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let mut control = receiver.ok_or_else(|| ManagerError::ServiceFailed {
            name: "control".to_string(),
            reason: "control loop already running".to_string(),
        })?;

        while let Some(message) = control.recv().await {
            match message {
                ControlMessage::Restart => {
                    if let Err(e) = self.restart().await {
                        error!("Restart of {} failed: {}", self.name(), e);
                    }
                }
                ControlMessage::Shutdown => {
                    self.stop(true, StopCaller::Programmatic).await?;
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn status(&self) -> InstanceStatus {
        let server_running = self.services.is_running(ENGINE_SERVICE);

        let (map, mode, players) = if server_running {
            (
                self.console.current_map().await,
                self.console.current_mode().await,
                self.console.players().await,
            )
        } else {
            (None, None, Vec::new())
        };

        let uptime = self
            .services
            .started_at(ENGINE_SERVICE)
            .map(|started| format_uptime(started.elapsed()));

        InstanceStatus {
            name: self.name().to_string(),
            server_running,
            map,
            mode,
            uptime,
            player_count: players.len(),
            players,
            services: self.services.status(),
            plugins: self.plugin_names(),
            votes: vec![
                self.votes.snapshot(VoteKind::Map),
                self.votes.snapshot(VoteKind::Mode),
            ],
        }
    }

    pub async fn players(&self) -> Vec<Player> {
        self.console.players().await
    }

    /// Changes the map when given one, otherwise reads the current map
    pub async fn map(&self, name: Option<&str>) -> Option<String> {
        match name {
            Some(name) => {
                self.console.change_map(name).await;
                Some(name.to_string())
            }
            None => self.console.current_map().await,
        }
    }

    /// Changes the mode when given an id, otherwise reads the current mode name
    pub async fn mode(&self, id: Option<usize>) -> Option<String> {
        match id {
            Some(id) => {
                let Some(name) = mode_name(&id.to_string()) else {
                    warn!("Unknown mode id {}", id);
                    return None;
                };
                self.console.change_mode(name).await;
                Some(name.to_string())
            }
            None => self.console.current_mode().await,
        }
    }

    /// Sets the cvar when given a value, otherwise reads it
    pub async fn cvar(&self, key: &str, value: Option<&str>) -> Option<String> {
        match value {
            Some(value) => {
                self.console.set_cvar(key, value).await;
                Some(value.to_string())
            }
            None => self.console.cvar(key).await,
        }
    }

    pub async fn rcon(&self, command: &str) -> String {
        self.console.rcon(command).await
    }

    pub async fn say(&self, message: &str) {
        self.console.say(message).await
    }

    pub async fn tell(&self, player_id: &str, message: &str) {
        self.console.tell(player_id, message).await
    }

    pub async fn kick(&self, player_id: &str) -> String {
        self.console.kick(player_id).await
    }

    pub async fn ban(&self, ip: &str) -> String {
        self.console.ban(ip).await
    }

    pub async fn unban(&self, ip: &str) -> String {
        self.console.unban(ip).await
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ManagerError> {
    use std::os::unix::fs::PermissionsExt;

    let fs_error = |source| ManagerError::Filesystem {
        path: path.to_path_buf(),
        source,
    };

    let mut permissions = std::fs::metadata(path).map_err(fs_error)?.permissions();
    let mode = permissions.mode();
    if mode & 0o111 != 0o111 {
        permissions.set_mode(mode | 0o111);
        std::fs::set_permissions(path, permissions).map_err(fs_error)?;
        debug!("Marked {} executable", path.display());
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ManagerError> {
    Ok(())
}

/// Makes `link` a symlink to `target`, replacing whatever is there
#[cfg(unix)]
fn ensure_symlink(target: &Path, link: &Path) -> Result<(), ManagerError> {
    let fs_error = |source| ManagerError::Filesystem {
        path: link.to_path_buf(),
        source,
    };

    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if std::fs::read_link(link).map_err(fs_error)? == target {
                return Ok(());
            }
            std::fs::remove_file(link).map_err(fs_error)?;
        }
        Ok(meta) if meta.is_dir() => {
            warn!("Replacing directory {} with a link to {}", link.display(), target.display());
            std::fs::remove_dir_all(link).map_err(fs_error)?;
        }
        Ok(_) => std::fs::remove_file(link).map_err(fs_error)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(fs_error(e)),
    }

    std::os::unix::fs::symlink(target, link).map_err(fs_error)?;
    info!("Linked {} -> {}", link.display(), target.display());
    Ok(())
}

#[cfg(not(unix))]
fn ensure_symlink(_target: &Path, link: &Path) -> Result<(), ManagerError> {
    warn!("Symlinks unsupported on this platform, skipping {}", link.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationSettings;
    use crate::store::MemoryStore;
    use std::net::UdpSocket;
    use std::path::PathBuf;
    use std::thread;
    use tempfile::TempDir;

    const STATUS: &str = "print\n\
cl score ping name            address                                 rate\n\
-- ----- ---- --------------- --------------------------------------- -----\n\
 0    12   48 ^1Dark ^3Lord^7   203.0.113.7:29071                       25000\n\
 1     4   60 Rey^7   203.0.113.8:29071                       25000\n\
 3    -2  120 Padawan^7 203.0.113.9:29070 30000\n";

    struct Layout {
        dir: TempDir,
    }

    impl Layout {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("bin")).unwrap();
            std::fs::create_dir_all(dir.path().join("MBII")).unwrap();
            std::fs::create_dir_all(dir.path().join("shared")).unwrap();
            Self { dir }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.dir.path().join(rel)
        }

        fn write_engine(&self) {
            std::fs::write(self.path("bin/mbiided"), "#!/bin/sh\nsleep 30\n").unwrap();
        }

        fn write_server_config(&self) {
            std::fs::write(self.path("MBII/server.cfg"), "set g_gametype 7\n").unwrap();
        }

        fn settings(&self, port: u16, extra: &str) -> Settings {
            let text = format!(
                r#"
[server]
name = "test"
engine = "mbiided"
engine_dir = "{bin}"
port = {port}
home_path = "{home}"
server_config_dir = "{config}"
log_path = "{log}"
{extra}

[security]
rcon_password = "pw"

[tailer]
wait_secs = 1
wait_step_ms = 50
poll_ms = 20
"#,
                bin = self.path("bin").display(),
                home = self.dir.path().display(),
                config = self.path("MBII").display(),
                log = self.path("MBII/test-games.log").display(),
            );
            Settings::from_toml_str(&text).unwrap()
        }
    }

    fn instance(settings: Settings) -> ServerInstance {
        ServerInstance::new(settings, Arc::new(MemoryStore::new()), Vec::new())
    }

    /// Port nobody answers on
    fn silent_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    /// Answers every datagram with a status table until idle for two seconds
    fn status_server() -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        thread::spawn(move || {
            let mut buf = [0u8; 2048];
            socket.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
            while let Ok((_, from)) = socket.recv_from(&mut buf) {
                let mut reply = vec![0xFF, 0xFF, 0xFF, 0xFF];
                reply.extend_from_slice(STATUS.as_bytes());
                let _ = socket.send_to(&reply, from);
            }
        });
        port
    }

    #[tokio::test]
    async fn test_start_requires_server_config() {
        let layout = Layout::new();
        layout.write_engine();
        let instance = instance(layout.settings(silent_port(), ""));

        match instance.start().await {
            Err(ManagerError::ServerConfigMissing(path)) => {
                assert_eq!(path, layout.path("MBII/server.cfg"))
            }
            other => panic!("expected missing config, got {:?}", other),
        }
        assert!(!instance.services().is_running(ENGINE_SERVICE));
    }

    #[tokio::test]
    async fn test_start_requires_engine() {
        let layout = Layout::new();
        layout.write_server_config();
        let instance = instance(layout.settings(silent_port(), ""));

        let err = instance.start().await.unwrap_err();
        assert!(matches!(err, ManagerError::EngineMissing(_)));
        assert!(err.to_string().starts_with("failed to start: no engine found at"));
    }

    #[tokio::test]
    async fn test_services_registered_in_order() {
        let layout = Layout::new();
        let plain = instance(layout.settings(silent_port(), ""));
        assert_eq!(plain.services().names(), vec![ENGINE_SERVICE, TAILER_SERVICE]);
        assert_eq!(plain.plugin_names(), vec!["recorder", "votes"]);

        let scheduled = instance(layout.settings(silent_port(), "restart_every_hours = 6.0"));
        assert_eq!(
            scheduled.services().names(),
            vec![ENGINE_SERVICE, TAILER_SERVICE, RESTARTER_SERVICE]
        );
    }

    #[tokio::test]
    async fn test_status_of_stopped_instance() {
        let layout = Layout::new();
        let instance = instance(layout.settings(silent_port(), ""));

        let status = instance.status().await;
        assert!(!status.server_running);
        assert_eq!(status.map, None);
        assert_eq!(status.uptime, None);
        assert_eq!(status.player_count, 0);
        assert_eq!(status.services.len(), 2);
        assert_eq!(status.votes.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_mode_id_sends_nothing() {
        let layout = Layout::new();
        let instance = instance(layout.settings(silent_port(), ""));

        assert_eq!(instance.mode(Some(9)).await, None);
    }

    #[tokio::test]
    async fn test_shutdown_message_ends_control_loop() {
        let layout = Layout::new();
        let instance = instance(layout.settings(silent_port(), ""));
        std::fs::write(layout.path("MBII/test-games.log"), "old\n").unwrap();

        instance.control().send(ControlMessage::Shutdown).unwrap();
        instance.serve().await.unwrap();

        assert!(!layout.path("MBII/test-games.log").exists());
        assert!(matches!(
            instance.serve().await,
            Err(ManagerError::ServiceFailed { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_prepares_engine_and_links() {
        use std::os::unix::fs::PermissionsExt;

        let layout = Layout::new();
        layout.write_engine();
        layout.write_server_config();
        std::fs::create_dir_all(layout.path("home-data")).unwrap();
        std::fs::write(layout.path("MBII/test-games.log"), "").unwrap();

        let mut settings = layout.settings(silent_port(), "");
        settings.locations = LocationSettings {
            game_path: Some(layout.path("shared")),
            symlinks: vec![layout.path("home-data")],
        };
        let instance = instance(settings);

        instance.start().await.unwrap();

        let mode = std::fs::metadata(layout.path("bin/mbiided")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(
            std::fs::read_link(layout.path("home-data")).unwrap(),
            layout.path("shared")
        );
        assert!(instance.services().is_running(ENGINE_SERVICE));
        assert!(instance.services().is_running(TAILER_SERVICE));
        assert!(instance.status().await.uptime.is_some());

        instance.stop(true, StopCaller::Programmatic).await.unwrap();

        assert!(!instance.services().is_running(ENGINE_SERVICE));
        assert!(!layout.path("MBII/test-games.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_log_file_stops_tailer_for_good() {
        let layout = Layout::new();
        layout.write_engine();
        layout.write_server_config();
        let instance = instance(layout.settings(silent_port(), ""));
        instance.start().await.unwrap();
        assert!(instance.services().is_running(TAILER_SERVICE));

        // One second wait budget, then past the one second retry delay
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!instance.services().is_running(TAILER_SERVICE));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!instance.services().is_running(TAILER_SERVICE));
        assert!(instance.services().is_running(ENGINE_SERVICE));

        instance.stop(true, StopCaller::Programmatic).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interactive_stop_asks_above_threshold() {
        let layout = Layout::new();
        layout.write_engine();
        layout.write_server_config();
        let instance = instance(layout.settings(status_server(), ""));
        instance.start().await.unwrap();

        let declined = instance
            .stop(
                false,
                StopCaller::Interactive(Box::new(|players| {
                    assert_eq!(players, 3);
                    false
                })),
            )
            .await;
        assert!(matches!(declined, Err(ManagerError::StopDeclined(3))));
        assert!(instance.services().is_running(ENGINE_SERVICE));

        instance.stop(false, StopCaller::Programmatic).await.unwrap();
        assert!(!instance.services().is_running(ENGINE_SERVICE));
    }
}
