//! Registry of long-running services owned by one server instance.
//!
//! A service is either an external process (the dedicated server) or an
//! async task (log tailer, scheduled restarter). Services launch strictly in
//! registration order and stop in reverse order. Each launched service gets
//! a monitor task that owns it, watches for its exit and applies the
//! service's restart policy.

use crate::error::ManagerError;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, info, warn};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// How long a monitor gets to wind its service down before it is aborted
const STOP_GRACE: Duration = Duration::from_secs(5);

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ManagerError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            working_dir: None,
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command.spawn()
    }
}

#[derive(Clone)]
pub enum Startable {
    Process(ProcessSpec),
    Task(TaskFn),
}

impl Startable {
    pub fn task<F>(task: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), ManagerError>> + Send + Sync + 'static,
    {
        Startable::Task(Arc::new(task))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    /// Relaunch after `delay` when the service fails or exits unexpectedly
    OnFailure { delay: Duration },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub restarts: u32,
}

#[derive(Debug, Default)]
struct ServiceState {
    running: bool,
    pid: Option<u32>,
    restarts: u32,
    started_at: Option<Instant>,
}

type SharedState = Arc<Mutex<ServiceState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, ServiceState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn mark_started(state: &SharedState, pid: Option<u32>, relaunch: bool) {
    let mut state = lock_state(state);
    state.running = true;
    state.pid = pid;
    state.started_at = Some(Instant::now());
    if relaunch {
        state.restarts += 1;
    }
}

fn mark_stopped(state: &SharedState) {
    let mut state = lock_state(state);
    state.running = false;
    state.pid = None;
}

struct Slot {
    name: String,
    startable: Startable,
    policy: RestartPolicy,
    state: SharedState,
    stop_tx: Option<watch::Sender<bool>>,
    monitor: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Adds a service. Re-registering a name replaces its definition in place.
    pub fn register_service(&self, name: &str, startable: Startable, policy: RestartPolicy) {
        let mut slots = self.slots();

        if let Some(slot) = slots.iter_mut().find(|slot| slot.name == name) {
            warn!("Service {} registered twice, replacing definition", name);
            slot.startable = startable;
            slot.policy = policy;
            return;
        }

        slots.push(Slot {
            name: name.to_string(),
            startable,
            policy,
            state: Arc::new(Mutex::new(ServiceState::default())),
            stop_tx: None,
            monitor: None,
        });
    }

    /// Launches every service that is not running, in registration order.
    /// The first launch failure aborts the remaining launches.
    pub fn launch_all(&self) -> Result<(), ManagerError> {
        let mut slots = self.slots();

        for slot in slots.iter_mut() {
            if lock_state(&slot.state).running {
                continue;
            }
            Self::launch(slot)?;
        }

        Ok(())
    }

    fn launch(slot: &mut Slot) -> Result<(), ManagerError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = slot.name.clone();
        let state = Arc::clone(&slot.state);
        let policy = slot.policy;

        let monitor = match &slot.startable {
            Startable::Process(spec) => {
                let child = spec.spawn().map_err(|source| ManagerError::Launch {
                    name: name.clone(),
                    source,
                })?;
                info!("Launched {} (pid {:?})", name, child.id());
                mark_started(&state, child.id(), false);
                tokio::spawn(monitor_process(name, spec.clone(), child, policy, state, stop_rx))
            }
            Startable::Task(task) => {
                info!("Launched {}", name);
                mark_started(&state, None, false);
                tokio::spawn(monitor_task(name, Arc::clone(task), policy, state, stop_rx))
            }
        };

        slot.stop_tx = Some(stop_tx);
        slot.monitor = Some(monitor);
        Ok(())
    }

    /// Stops every service in reverse registration order
    pub async fn stop_all(&self) {
        let stopping: Vec<(String, Option<watch::Sender<bool>>, Option<JoinHandle<()>>)> = {
            let mut slots = self.slots();
            slots
                .iter_mut()
                .rev()
                .map(|slot| (slot.name.clone(), slot.stop_tx.take(), slot.monitor.take()))
                .collect()
        };

        for (name, stop_tx, monitor) in stopping {
            Self::shutdown(&name, stop_tx, monitor).await;
        }
    }

    pub async fn stop_service(&self, name: &str) -> Result<(), ManagerError> {
        let (stop_tx, monitor) = {
            let mut slots = self.slots();
            let slot = slots
                .iter_mut()
                .find(|slot| slot.name == name)
                .ok_or_else(|| ManagerError::UnknownService(name.to_string()))?;
            (slot.stop_tx.take(), slot.monitor.take())
        };

        Self::shutdown(name, stop_tx, monitor).await;
        Ok(())
    }

    async fn shutdown(name: &str, stop_tx: Option<watch::Sender<bool>>, monitor: Option<JoinHandle<()>>) {
        let Some(mut monitor) = monitor else {
            return;
        };

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }

        match timeout(STOP_GRACE, &mut monitor).await {
            Ok(_) => info!("Stopped {}", name),
            Err(_) => {
                warn!("{} did not stop within {:?}, aborting", name, STOP_GRACE);
                monitor.abort();
            }
        }
    }

    pub fn status(&self) -> Vec<ServiceStatus> {
        self.slots()
            .iter()
            .map(|slot| {
                let state = lock_state(&slot.state);
                ServiceStatus {
                    name: slot.name.clone(),
                    running: state.running,
                    pid: state.pid,
                    restarts: state.restarts,
                }
            })
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.slots()
            .iter()
            .find(|slot| slot.name == name)
            .is_some_and(|slot| lock_state(&slot.state).running)
    }

    /// Time of the latest launch of a running service
    pub fn started_at(&self, name: &str) -> Option<Instant> {
        self.slots()
            .iter()
            .find(|slot| slot.name == name)
            .and_then(|slot| {
                let state = lock_state(&slot.state);
                if state.running {
                    state.started_at
                } else {
                    None
                }
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.slots().iter().map(|slot| slot.name.clone()).collect()
    }
}

/// Waits out a restart delay. Returns false when a stop arrived first.
async fn restart_delay(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        _ = stop_rx.changed() => false,
    }
}

async fn monitor_process(
    name: String,
    spec: ProcessSpec,
    mut child: Child,
    policy: RestartPolicy,
    state: SharedState,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            exit = child.wait() => {
                mark_stopped(&state);

                let failed = match &exit {
                    Ok(status) if status.success() => {
                        info!("{} exited", name);
                        false
                    }
                    Ok(status) => {
                        error!("{} exited unexpectedly: {}", name, status);
                        true
                    }
                    Err(e) => {
                        error!("Lost track of {}: {}", name, e);
                        true
                    }
                };

                let RestartPolicy::OnFailure { delay } = policy else {
                    return;
                };
                if !failed || !restart_delay(delay, &mut stop_rx).await {
                    return;
                }

                match spec.spawn() {
                    Ok(relaunched) => {
                        info!("Relaunched {} (pid {:?})", name, relaunched.id());
                        mark_started(&state, relaunched.id(), true);
                        child = relaunched;
                    }
                    Err(e) => {
                        error!("Failed to relaunch {}: {}", name, e);
                        return;
                    }
                }
            }
            _ = stop_rx.changed() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", name, e);
                }
                mark_stopped(&state);
                return;
            }
        }
    }
}

async fn monitor_task(
    name: String,
    task: TaskFn,
    policy: RestartPolicy,
    state: SharedState,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut relaunch = false;

    loop {
        if relaunch {
            info!("Relaunched {}", name);
            mark_started(&state, None, true);
        }

        let outcome = tokio::select! {
            outcome = AssertUnwindSafe(task()).catch_unwind() => outcome,
            _ = stop_rx.changed() => {
                mark_stopped(&state);
                return;
            }
        };
        mark_stopped(&state);

        match outcome {
            Ok(Ok(())) => {
                info!("{} finished", name);
                return;
            }
            Ok(Err(e)) => error!("{} failed: {}", name, e),
            Err(_) => error!("{} panicked", name),
        }

        let RestartPolicy::OnFailure { delay } = policy else {
            return;
        };
        if !restart_delay(delay, &mut stop_rx).await {
            return;
        }
        relaunch = true;
    }
}
