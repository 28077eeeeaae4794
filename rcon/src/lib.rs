//! # Remote Administration Client
//!
//! Client side of the engine's out-of-band UDP administration protocol.
//!
//! ## Wire Format
//!
//! Every request is a single datagram: the four byte marker `FF FF FF FF`
//! followed by either `rcon <password> <command>` (authenticated) or the bare
//! command (console mode). The engine answers with one or more datagrams that
//! arrive back to back; the client reads until no datagram arrives within a one
//! second idle window, decodes each chunk as UTF-8 with invalid bytes replaced
//! and concatenates them in arrival order.
//!
//! ## Failure Model
//!
//! There is no retry and no error surface. A server that does not answer
//! simply produces an empty string, which the parsers turn into empty player
//! lists or unknown cvars. Callers are never blocked for longer than the idle
//! window per read attempt.
//!
//! ## Connection Model
//!
//! The client holds no socket. Each call binds a fresh ephemeral UDP socket,
//! so it can be cloned freely and used from event handlers, timers and
//! front ends at the same time without sharing state.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use rcon::RconClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = RconClient::new("127.0.0.1", 29070, "secret");
//!
//!     client.say("Server restarting in 5 minutes").await;
//!
//!     for player in client.players().await {
//!         println!("{} {} {}ms", player.id, player.name, player.ping);
//!     }
//!
//!     let map = client.get_cvar("mapname").await;
//!     println!("{:?}", map);
//! }
//! ```

pub mod network;

pub use network::{RconClient, DEFAULT_IDLE_TIMEOUT};
