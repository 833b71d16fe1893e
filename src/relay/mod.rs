//! Session relay: many interactive sessions multiplexed over one control connection.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and retry classification
//! - `types`: Serializable control-connection frames and log records
//! - `message`: Human-readable result messages
//! - `ssh`: Remote shell connections, channels and port forwards (russh)
//! - `terminal`: Local PTY sessions backed by an optional persistent multiplexer
//! - `tail`: Incremental structured log tailing
//! - `router`: Frame dispatch between a control connection and the pools
//! - `server`: WebSocket endpoint carrying control connections

pub mod config;
pub mod error;
pub(crate) mod message;
pub mod router;
pub mod server;
pub mod ssh;
pub mod tail;
pub mod terminal;
pub mod types;

pub use error::{RelayError, Result};
pub use router::{Registry, SessionRouter};
