//! # Tick Server Client Library
//!
//! Client side of the action-replication protocol. A client never simulates
//! anything itself: it sends discrete control actions for the objects the
//! server says it owns and mirrors whatever the server replicates back.
//!
//! ## Modules
//!
//! ### Replica (`replica`)
//! The client's copy of the replicated world. Construction, teardown and
//! ownership changes apply immediately; snapshots sit in a playout buffer
//! sized by the server's `SetPlayoutDelay` before they are applied.
//!
//! ### Latency (`latency`)
//! A FIFO that holds each message until a release time, used to emulate a
//! slow link in both directions.
//!
//! ### Network (`network`)
//! A headless UDP client speaking the server's framing, with an optional
//! fake ping routed through the latency queues.
//!
//! ### Harness (`harness`)
//! Runs a server scheduler and any number of replicas in one process over
//! the in-memory transport, on a caller-supplied clock.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client =
//!         Client::connect("127.0.0.1:8080", Duration::from_millis(100), Duration::from_secs(3))
//!             .await?;
//!     client.run(Duration::from_secs(10), 30).await?;
//!     client.disconnect();
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod harness;
pub mod latency;
pub mod network;
pub mod replica;

pub use error::ClientError;
