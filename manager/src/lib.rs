//! # Game Server Manager Library
//!
//! This library supervises a dedicated game server process, talks to it over
//! the remote-administration protocol and turns its log into typed events
//! that independent subscribers react to.
//!
//! ## Core Responsibilities
//!
//! ### Supervision
//! The dedicated server, the log tailer and the scheduled restarter run as
//! named services. They launch in registration order, stop in reverse order
//! and are relaunched according to their restart policy.
//!
//! ### Event Pipeline
//! New log lines are archived, classified against an ordered list of line
//! shapes and published on the instance's event bus. A line that matches no
//! shape is only archived.
//!
//! ### Voting
//! Map and mode votes are the largest subscriber: quorum-triggered,
//! timer-bounded ballots whose results are applied at the next round end.
//!
//! ## Architecture Design
//!
//! ### Per-Instance State
//! Every piece of mutable state (bus subscriptions, roster, vote sessions,
//! services) belongs to one [`instance::ServerInstance`]. Several instances
//! can share a process without seeing each other.
//!
//! ### Synchronous Dispatch
//! Publishing awaits every handler in registration order. A failing or
//! panicking handler is logged and skipped; the publisher never sees it.
//! Handlers that want concurrency spawn their own tasks.
//!
//! ### Bounded Round Trips
//! The only network call is the per-call UDP client, bounded by its idle
//! timeout. An unresponsive server yields empty values instead of errors.
//!
//! ## Module Organization
//!
//! ### Supervisor Module (`supervisor`)
//! Service registry with process and task services and restart policies.
//!
//! ### Tailer and Extractor Modules (`tailer`, `extractor`)
//! Follows the log file from its end, survives truncation, and classifies
//! lines into [`shared::DomainEvent`]s.
//!
//! ### Bus Module (`bus`)
//! Kind-keyed subscriber registry with ordered, failure-isolated dispatch.
//!
//! ### Vote Module (`vote`)
//! The vote session state machine and the controller that binds it to chat
//! commands, timers and the console.
//!
//! ### Instance Module (`instance`)
//! Wires everything together and exposes the operations front ends call:
//! start, stop, restart, status, players, map, mode, cvar, rcon, say, tell,
//! kick, ban and unban.

pub mod bus;
pub mod config;
pub mod console;
pub mod error;
pub mod extractor;
pub mod instance;
pub mod plugin;
pub mod recorder;
pub mod restarter;
pub mod store;
pub mod supervisor;
pub mod tailer;
pub mod utils;
pub mod vote;

pub use config::Settings;
pub use error::ManagerError;
pub use instance::{ControlMessage, InstanceStatus, ServerInstance, StopCaller};
