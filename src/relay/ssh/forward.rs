//! Local port forwarding over `direct-tcpip` channels (RFC 4254).
//!
//! A [`PortForward`] binds `127.0.0.1:<localPort>` and, for every accepted
//! local connection, opens a new tunnel through the transport and splices
//! bytes in both directions until either side closes. A tunnel that fails to
//! open only drops that one local connection; the listener keeps accepting.
//!
//! Stopping (or dropping) the forward cancels its token, which closes the
//! listener and every spliced connection it started.
//!
//! This module is only compiled when the `port_forward` feature is enabled.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::relay::error::{RelayError, Result};
use crate::relay::types::{ForwardInfo, ForwardSpec};

use super::transport::Transport;

/// An active local listener forwarding to a remote destination.
pub struct PortForward {
    info: ForwardInfo,
    cancel_token: CancellationToken,
}

impl PortForward {
    /// Bind the local port and start accepting connections.
    ///
    /// A `local_port` of 0 binds an ephemeral port; the bound port is
    /// reported in [`PortForward::info`].
    pub(crate) async fn start(transport: Arc<dyn Transport>, spec: &ForwardSpec) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", spec.local_port))
            .await
            .map_err(|e| {
                RelayError::Network(format!(
                    "Failed to bind to local port {}: {}",
                    spec.local_port, e
                ))
            })?;

        let local_addr = listener.local_addr()?;
        let cancel_token = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            transport,
            spec.remote_host.clone(),
            spec.remote_port,
            cancel_token.clone(),
        ));

        info!(
            "Port forward {} -> {}:{} active",
            local_addr, spec.remote_host, spec.remote_port
        );

        Ok(Self {
            info: ForwardInfo {
                local_port: local_addr.port(),
                local_address: local_addr.to_string(),
                remote_host: spec.remote_host.clone(),
                remote_port: spec.remote_port,
            },
            cancel_token,
        })
    }

    pub fn info(&self) -> &ForwardInfo {
        &self.info
    }

    pub fn local_port(&self) -> u16 {
        self.info.local_port
    }

    /// Close the listener and all connections spliced through it.
    pub fn stop(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!("Stopping port forward on {}", self.info.local_address);
            self.cancel_token.cancel();
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    remote_host: String,
    remote_port: u16,
    cancel_token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,

            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((local_stream, client_addr)) => {
                debug!("New connection from {} to forwarded port", client_addr);

                let transport = transport.clone();
                let remote_host = remote_host.clone();
                let connection_token = cancel_token.child_token();

                tokio::spawn(async move {
                    if let Err(e) = splice_connection(
                        transport,
                        local_stream,
                        client_addr,
                        &remote_host,
                        remote_port,
                        connection_token,
                    )
                    .await
                    {
                        debug!("Port forwarding connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting forwarded connection: {}", e);
                break;
            }
        }
    }

    debug!("Port forward listener closed");
}

/// Splice one accepted local connection through a fresh tunnel.
async fn splice_connection(
    transport: Arc<dyn Transport>,
    local_stream: TcpStream,
    client_addr: SocketAddr,
    remote_host: &str,
    remote_port: u16,
    cancel_token: CancellationToken,
) -> Result<()> {
    let tunnel = transport
        .open_direct_tcpip(remote_host, remote_port, client_addr)
        .await?;

    let (mut local_read, mut local_write) = tokio::io::split(local_stream);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);

    let local_to_remote = tokio::io::copy(&mut local_read, &mut tunnel_write);
    let remote_to_local = tokio::io::copy(&mut tunnel_read, &mut local_write);

    tokio::select! {
        _ = cancel_token.cancelled() => {
            debug!("Forwarded connection from {} cancelled", client_addr);
        }
        result = local_to_remote => {
            if let Err(e) = result {
                debug!("Local to remote copy ended: {}", e);
            }
        }
        result = remote_to_local => {
            if let Err(e) = result {
                debug!("Remote to local copy ended: {}", e);
            }
        }
    }

    debug!("Forwarded connection from {} closed", client_addr);
    Ok(())
}
