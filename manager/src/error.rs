//! Error types for the instance manager.
//!
//! Only launch, configuration and lifecycle failures are errors. Transport
//! and parse failures degrade to empty values and are logged instead.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("failed to start: no engine found at {}", .0.display())]
    EngineMissing(PathBuf),

    #[error("unable to load a server config at {}", .0.display())]
    ServerConfigMissing(PathBuf),

    #[error("dedicated server did not create {} within {:?}", .path.display(), .waited)]
    LogFileTimeout { path: PathBuf, waited: Duration },

    #[error("failed to launch service {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem precondition failed for {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("stop declined with {0} players connected")]
    StopDeclined(usize),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("service {name} failed: {reason}")]
    ServiceFailed { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
