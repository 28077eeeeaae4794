//! Periodic restart of the instance while nobody is playing.

use crate::console::GameConsole;
use crate::error::ManagerError;
use crate::instance::ControlMessage;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub struct ScheduledRestarter {
    every: Duration,
    postpone: Duration,
    console: Arc<dyn GameConsole>,
    control: mpsc::UnboundedSender<ControlMessage>,
}

impl ScheduledRestarter {
    /// Returns `None` when the interval is zero, negative or not a number.
    pub fn new(
        every_hours: f64,
        postpone: Duration,
        console: Arc<dyn GameConsole>,
        control: mpsc::UnboundedSender<ControlMessage>,
    ) -> Option<Self> {
        if !every_hours.is_finite() || every_hours <= 0.0 {
            info!("Scheduled restarter disabled (interval {} hours)", every_hours);
            return None;
        }

        Some(Self {
            every: Duration::from_secs_f64(every_hours * 3600.0),
            postpone,
            console,
            control,
        })
    }

    pub fn interval(&self) -> Duration {
        self.every
    }

    /// Waits one interval, then until the server is empty, then asks the
    /// instance to restart. The restart relaunches this service.
    pub async fn run(&self) -> Result<(), ManagerError> {
        info!("Next scheduled restart in {:?}", self.every);
        sleep(self.every).await;

        loop {
            let players = self.console.player_count().await;
            if players == 0 {
                break;
            }
            info!(
                "Server not empty ({} players), restart postponed for {:?}",
                players, self.postpone
            );
            sleep(self.postpone).await;
        }

        info!("Server is empty, requesting scheduled restart");
        self.control.send(ControlMessage::Restart).map_err(|_| {
            warn!("Instance control loop is gone, restart request dropped");
            ManagerError::ServiceFailed {
                name: "restarter".to_string(),
                reason: "control loop closed".to_string(),
            }
        })
    }
}
