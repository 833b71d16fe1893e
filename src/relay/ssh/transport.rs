//! The seam between the shell pool and the SSH protocol.
//!
//! [`Connector`] establishes an authenticated [`Transport`]; a transport opens
//! interactive shells and `direct-tcpip` tunnels multiplexed over one
//! connection. The russh-backed implementations live here as well, so the
//! pool and connection logic never touch russh types directly.

#[cfg(feature = "port_forward")]
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{ChannelMsg, ChannelWriteHalf, Disconnect, client};
use tokio::sync::mpsc;
use tracing::debug;

use crate::relay::error::{RelayError, Result};
use crate::relay::types::ConnectParams;

use super::handler::SshClientHandler;

/// Terminal type requested for interactive shells
pub(crate) const TERM: &str = "xterm-256color";

/// Input side of an opened shell.
#[async_trait]
pub trait ShellIo: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<()>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A freshly opened interactive shell.
///
/// `output` yields remote output chunks in order and ends when the remote
/// side closes the channel.
pub struct OpenedShell {
    pub io: Box<dyn ShellIo>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Byte stream spliced by a port forward.
#[cfg(feature = "port_forward")]
pub trait TunnelStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

#[cfg(feature = "port_forward")]
impl<T> TunnelStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

/// An authenticated connection able to multiplex channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_shell(&self, cols: u16, rows: u16) -> Result<OpenedShell>;

    /// Open a stream to `host:port` as seen from the remote side.
    #[cfg(feature = "port_forward")]
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn TunnelStream>>;

    fn is_closed(&self) -> bool;

    async fn disconnect(&self);
}

/// Result of a successful connect.
pub struct Connected {
    pub transport: Arc<dyn Transport>,
    /// Retries needed before the handshake succeeded
    pub retry_attempts: u32,
}

/// Establishes transports. The relay uses [`super::SshConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected>;
}

/// [`Transport`] over an authenticated russh session.
pub struct SshTransport {
    handle: client::Handle<SshClientHandler>,
}

impl SshTransport {
    pub(crate) fn new(handle: client::Handle<SshClientHandler>) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_shell(&self, cols: u16, rows: u16) -> Result<OpenedShell> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| RelayError::Channel(format!("Failed to open channel: {}", e)))?;

        channel
            .request_pty(false, TERM, cols as u32, rows as u32, 0, 0, &[])
            .await
            .map_err(|e| RelayError::Channel(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| RelayError::Channel(format!("Failed to start shell: {}", e)))?;

        let (mut read_half, write_half) = channel.split();
        let (tx, output) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match read_half.wait().await {
                    // PTY output is a single stream; stderr is forwarded alongside stdout
                    Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if tx.send(data.to_vec()).is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("Remote shell exited with status {}", exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        });

        Ok(OpenedShell {
            io: Box::new(RusshShellIo { write_half }),
            output,
        })
    }

    #[cfg(feature = "port_forward")]
    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Box<dyn TunnelStream>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                port as u32,
                originator.ip().to_string(),
                originator.port() as u32,
            )
            .await
            .map_err(|e| {
                RelayError::Channel(format!("Failed to open direct-tcpip channel: {}", e))
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}

/// Write half of a russh shell channel.
struct RusshShellIo {
    write_half: ChannelWriteHalf<client::Msg>,
}

#[async_trait]
impl ShellIo for RusshShellIo {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_half
            .data(data)
            .await
            .map_err(|e| RelayError::Channel(format!("Failed to write to shell: {}", e)))
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.write_half
            .window_change(cols as u32, rows as u32, 0, 0)
            .await
            .map_err(|e| RelayError::Channel(format!("Failed to resize shell: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.write_half
            .close()
            .await
            .map_err(|e| RelayError::Channel(format!("Failed to close shell channel: {}", e)))
    }
}
