//! Remote shell connections over SSH.
//!
//! - `handler`: russh client handler
//! - `auth`: authentication strategies and the chain built from a [`Credential`]
//! - `client`: client configuration and connect-with-retry
//! - `transport`: the `Connector`/`Transport` seam and its russh implementation
//! - `shell`: one interactive shell channel with ordered input and output
//! - `forward`: local port forwards over `direct-tcpip` (feature-gated)
//! - `connection`: one transport multiplexing shells and forwards
//! - `pool`: control-connection identity to connection mapping
//!
//! [`Credential`]: crate::relay::types::Credential

pub mod auth;
pub(crate) mod client;
pub mod connection;
#[cfg(feature = "port_forward")]
pub mod forward;
pub mod handler;
pub mod pool;
pub mod shell;
pub mod transport;

pub use client::SshConnector;
pub use connection::RemoteShellConnection;
pub use pool::{ConnectOutcome, RemoteShellPool};
pub use shell::ShellChannel;
pub use transport::{Connected, Connector, OpenedShell, ShellIo, Transport};
