//! Stratum v1 mining protocol client.
//!
//! The protocol uses JSON-RPC over TCP with newline-delimited messages.
//!
//! # Protocol Overview
//!
//! Stratum v1 is a bidirectional, event-driven protocol:
//!
//! - **Client requests**: subscribe (id 1), authorize (id 2), submit and
//!   ping (ids from 100 upward, never reused)
//! - **Server notifications**: mining.notify (new work),
//!   mining.set_difficulty, mining.set_extranonce, client.reconnect
//! - **Server responses**: Results for client requests (boolean or error array)
//!
//! # Architecture
//!
//! The client is an active async task that owns the TCP connection,
//! reconnects with backoff, and pushes [`ClientEvent`]s to a consumer via a
//! channel. Shares come back in as [`ClientCommand`]s.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stratum_v1::{ClientEvent, ConnectionConfig, PoolConfig, StratumV1Client};
//!
//! let (event_tx, mut event_rx) = mpsc::channel(100);
//! let (command_tx, command_rx) = mpsc::channel(100);
//! let pool = PoolConfig {
//!     url: "stratum+tcp://pool.example.com:3333".to_string(),
//!     username: "alice.rig1".to_string(),
//!     ..Default::default()
//! };
//!
//! let client = StratumV1Client::new(
//!     pool,
//!     ConnectionConfig::default(),
//!     event_tx,
//!     command_rx,
//!     shutdown_token,
//! );
//! tokio::spawn(client.run());
//!
//! while let Some(event) = event_rx.recv().await {
//!     match event {
//!         ClientEvent::NewJob { session_id, job } => { /* handle new work */ }
//!         ClientEvent::DifficultyChanged(diff) => { /* update difficulty */ }
//!         // ...
//!     }
//! }
//! ```

mod backoff;
mod client;
mod connection;
mod error;
mod messages;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{PoolConfig, SessionInfo, SessionState, StratumV1Client};
pub use connection::{
    Connection, ConnectionConfig, Connector, TcpConnector, Transport, parse_pool_url,
};
#[cfg(test)]
pub(crate) use connection::{MockConnector, MockTransport, MockTransportHandle};
pub use error::{StratumError, StratumResult};
pub use messages::{
    ClientCommand, ClientEvent, JobNotification, JsonRpcMessage, PendingShare, RejectReason,
    ShareStats, ShareStatus, ShareSubmission, SubmitParams, SubscribeResult,
};
