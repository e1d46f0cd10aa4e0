//! # Authoritative Tick Server
//!
//! Runs a physics simulation at a fixed tick rate and serves remote clients
//! over a dual-channel (reliable + unreliable) transport. Clients only ever
//! send discrete control actions for the objects they own; the server applies
//! them, steps the world and replicates the result back.
//!
//! ## Per-tick pipeline
//!
//! ```text
//! transport events -> sessions / ownership -> drain actions -> step
//!     -> hooks -> replicate -> flush -> paced sleep
//! ```
//!
//! Everything above runs on a single task. The transport's socket tasks only
//! move datagrams; all session, ownership and queue state is mutated by the
//! tick and needs no locks.
//!
//! ## Modules
//!
//! - [`accumulator`]: per-object action queues with last-write-wins merging
//! - [`session`]: session lifecycle, ownership exclusivity, playout delay
//! - [`replication`]: interest management, outbound messages, inbound
//!   validation
//! - [`scheduler`]: the tick loop and the [`scheduler::TickHook`] extension point
//! - [`pacing`]: the PI controller that holds the tick rate
//! - [`transport`]: the transport boundary plus in-memory and UDP transports
//! - [`simulation`] / [`world`]: the physics boundary and a kinematic
//!   reference world
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::scheduler::{SchedulerConfig, TickScheduler};
//! use server::spawner::VehicleSpawner;
//! use server::transport::UdpTransport;
//! use server::world::SimpleWorld;
//! use std::time::Duration;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = UdpTransport::bind("127.0.0.1:8080", Duration::from_secs(5)).await?;
//!     let mut scheduler =
//!         TickScheduler::new(transport, SimpleWorld::new(), SchedulerConfig::default())
//!             .with_hook(VehicleSpawner::default());
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     scheduler.run(shutdown_rx).await;
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod config;
pub mod error;
pub mod pacing;
pub mod replication;
pub mod scheduler;
pub mod session;
pub mod simulation;
pub mod spawner;
pub mod transport;
pub mod world;

pub use error::ServerError;
