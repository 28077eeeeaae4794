//! Instance settings.
//!
//! The core receives a ready-made [`Settings`]. Loading from TOML is only a
//! convenience for the binary; every optional field has a default.

use crate::error::ManagerError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub security: SecuritySettings,
    #[serde(default)]
    pub locations: LocationSettings,
    #[serde(default)]
    pub tailer: TailerSettings,
    #[serde(default)]
    pub votes: VoteSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub name: String,
    /// Engine binary name, resolved inside `engine_dir`
    pub engine: String,
    #[serde(default = "default_engine_dir")]
    pub engine_dir: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_game")]
    pub game: String,
    pub home_path: PathBuf,
    #[serde(default = "default_server_config_file")]
    pub server_config_file: String,
    /// Directory that must contain `server_config_file`
    pub server_config_dir: PathBuf,
    pub log_path: PathBuf,
    /// Hours between scheduled restarts. Zero or negative disables them.
    #[serde(default)]
    pub restart_every_hours: f64,
    /// Interval between "is the server empty yet" checks once a scheduled restart is due
    #[serde(default = "default_restart_postpone_secs")]
    pub restart_postpone_secs: u64,
    /// Stopping with more players than this requires confirmation
    #[serde(default = "default_stop_confirm_threshold")]
    pub stop_confirm_threshold: usize,
    #[serde(default = "default_restart_settle_secs")]
    pub restart_settle_secs: u64,
    /// Relaunch the engine process when it exits unexpectedly
    #[serde(default)]
    pub auto_restart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySettings {
    pub rcon_password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationSettings {
    /// Shared game data directory the engine home links must point to
    pub game_path: Option<PathBuf>,
    #[serde(default)]
    pub symlinks: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailerSettings {
    pub wait_secs: u64,
    pub wait_step_ms: u64,
    pub poll_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for TailerSettings {
    fn default() -> Self {
        Self {
            wait_secs: 10,
            wait_step_ms: 500,
            poll_ms: 250,
            retry_delay_ms: 1000,
        }
    }
}

impl TailerSettings {
    pub fn wait_budget(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn wait_step(&self) -> Duration {
        Duration::from_millis(self.wait_step_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Timing and threshold knobs for one vote kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoteRules {
    pub enabled: bool,
    /// Percentage of current players needed to open a vote
    pub trigger_percent: u32,
    /// Percentage of current players the winning option needs
    pub win_percent: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
    /// Seconds-remaining marks at which a countdown reminder is broadcast
    pub reminder_offsets: Vec<u64>,
    /// Interval of the periodic option reminder, 0 disables it
    pub prompt_secs: u64,
    /// Minimum seconds between two trigger commands of the same participant
    pub flood_secs: u64,
}

impl Default for VoteRules {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_percent: 50,
            win_percent: 50,
            window_secs: 30,
            cooldown_secs: 5,
            reminder_offsets: vec![20, 10, 5],
            prompt_secs: 15,
            flood_secs: 5,
        }
    }
}

impl VoteRules {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn flood_interval(&self) -> Duration {
        Duration::from_secs(self.flood_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VoteSettings {
    pub map: VoteRules,
    pub mode: VoteRules,
    pub primary_maps: Vec<String>,
    pub secondary_maps: Vec<String>,
    pub modes: Vec<String>,
}

fn default_engine_dir() -> PathBuf {
    PathBuf::from("/usr/bin")
}

fn default_port() -> u16 {
    29070
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_game() -> String {
    "MBII".to_string()
}

fn default_server_config_file() -> String {
    "server.cfg".to_string()
}

fn default_restart_postpone_secs() -> u64 {
    600
}

fn default_stop_confirm_threshold() -> usize {
    2
}

fn default_restart_settle_secs() -> u64 {
    2
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self, ManagerError> {
        toml::from_str(text).map_err(|e| ManagerError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ManagerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ManagerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

impl ServerSettings {
    pub fn engine_path(&self) -> PathBuf {
        self.engine_dir.join(&self.engine)
    }

    pub fn server_config_path(&self) -> PathBuf {
        self.server_config_dir.join(&self.server_config_file)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_secs(self.restart_settle_secs)
    }

    /// Command line of the dedicated server process
    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "--quiet".to_string(),
            "+set".to_string(),
            "dedicated".to_string(),
            "2".to_string(),
            "+set".to_string(),
            "net_port".to_string(),
            self.port.to_string(),
            "+set".to_string(),
            "fs_game".to_string(),
            self.game.clone(),
            "+set".to_string(),
            "fs_homepath".to_string(),
            self.home_path.display().to_string(),
            "+exec".to_string(),
            self.server_config_file.clone(),
        ]
    }
}
