//! Follows the engine log and feeds classified lines to the event bus.
//!
//! The tailer waits for the log file to appear, seeks to its end and then
//! reads only appended lines. Every complete line is archived first and
//! classified second. A read failure or a file that shrinks below the read
//! position (the engine restarted and recreated it) ends the current follow
//! cycle; the tailer then waits for the file again and starts a new cycle.
//! Only a file that never shows up within the wait budget is fatal.

use crate::bus::EventBus;
use crate::config::TailerSettings;
use crate::error::ManagerError;
use crate::extractor::EventExtractor;
use crate::store::EventStore;
use log::{debug, error, info, warn};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::{sleep, Instant};

#[derive(Debug)]
enum CycleEnd {
    Truncated,
    Failed(std::io::Error),
}

pub struct LogTailer {
    instance: String,
    path: PathBuf,
    settings: TailerSettings,
    bus: Arc<EventBus>,
    store: Arc<dyn EventStore>,
}

impl LogTailer {
    pub fn new(
        instance: &str,
        path: &Path,
        settings: TailerSettings,
        bus: Arc<EventBus>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            instance: instance.to_string(),
            path: path.to_path_buf(),
            settings,
            bus,
            store,
        }
    }

    /// Polls for the log file in fixed steps until the wait budget runs out
    pub async fn wait_for_file(&self) -> Result<(), ManagerError> {
        let started = Instant::now();

        loop {
            if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
                return Ok(());
            }

            if started.elapsed() >= self.settings.wait_budget() {
                return Err(ManagerError::LogFileTimeout {
                    path: self.path.clone(),
                    waited: self.settings.wait_budget(),
                });
            }

            sleep(self.settings.wait_step()).await;
        }
    }

    /// Runs follow cycles until the log file fails to appear
    pub async fn run(&self) -> Result<(), ManagerError> {
        let mut extractor = EventExtractor::new();
        let mut from_start = false;

        loop {
            self.wait_for_file().await?;
            info!("Watching {}", self.path.display());

            match self.follow(&mut extractor, from_start).await {
                CycleEnd::Truncated => {
                    warn!("{} was truncated, restarting from the beginning", self.path.display());
                    from_start = true;
                }
                CycleEnd::Failed(e) => {
                    error!("Reading {} failed: {}, restarting", self.path.display(), e);
                    from_start = false;
                    sleep(self.settings.retry_delay()).await;
                }
            }
        }
    }

    async fn follow(&self, extractor: &mut EventExtractor, from_start: bool) -> CycleEnd {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) => return CycleEnd::Failed(e),
        };

        let mut position = if from_start {
            0
        } else {
            match file.seek(SeekFrom::End(0)).await {
                Ok(position) => position,
                Err(e) => return CycleEnd::Failed(e),
            }
        };

        let mut reader = BufReader::new(file);
        let mut pending: Vec<u8> = Vec::new();

        loop {
            match reader.read_until(b'\n', &mut pending).await {
                Ok(0) => {
                    match tokio::fs::metadata(&self.path).await {
                        Ok(meta) if meta.len() < position => return CycleEnd::Truncated,
                        Ok(_) => {}
                        Err(e) => return CycleEnd::Failed(e),
                    }
                    sleep(self.settings.poll_interval()).await;
                }
                Ok(n) => {
                    position += n as u64;

                    // Partial line, wait for the rest
                    if pending.last() != Some(&b'\n') {
                        continue;
                    }

                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    self.process_line(extractor, &line).await;
                }
                Err(e) => return CycleEnd::Failed(e),
            }
        }
    }

    async fn process_line(&self, extractor: &mut EventExtractor, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return;
        }

        debug!("[{}] {}", self.instance, line);
        self.store.archive_line(&self.instance, line);

        if let Some(event) = extractor.classify(line) {
            self.bus.publish(event).await;
        }
    }
}
