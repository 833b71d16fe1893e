//! One authenticated transport multiplexing shells and port forwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::relay::error::{RelayError, Result};
use crate::relay::types::{CloseCallback, ConnectParams, DataCallback, ShellInfo};
#[cfg(feature = "port_forward")]
use crate::relay::types::{ForwardInfo, ForwardSpec};

#[cfg(feature = "port_forward")]
use super::forward::PortForward;
use super::shell::ShellChannel;
use super::transport::Transport;

/// A remote shell connection: one transport, many shells and forwards.
///
/// Shell entries remove themselves when their channel ends. Each entry carries
/// a generation number so a late close of an old channel never evicts a newer
/// channel started under the same session id.
pub struct RemoteShellConnection {
    target: String,
    transport: Arc<dyn Transport>,
    shells: Arc<DashMap<String, ShellChannel>>,
    #[cfg(feature = "port_forward")]
    forwards: DashMap<u16, PortForward>,
    next_generation: AtomicU64,
    connected: AtomicBool,
}

impl RemoteShellConnection {
    pub fn new(params: &ConnectParams, transport: Arc<dyn Transport>) -> Self {
        Self {
            target: format!("{}@{}:{}", params.username, params.host, params.port),
            transport,
            shells: Arc::new(DashMap::new()),
            #[cfg(feature = "port_forward")]
            forwards: DashMap::new(),
            next_generation: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.transport.is_closed()
    }

    /// Open a shell channel bound to `session_id`.
    ///
    /// Remote output goes to `on_data` until the channel ends, then
    /// `on_close` fires exactly once.
    pub async fn start_shell(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
        on_data: DataCallback,
        on_close: CloseCallback,
    ) -> Result<ShellInfo> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        if self.shells.contains_key(session_id) {
            return Err(RelayError::DuplicateSession(session_id.to_string()));
        }

        let opened = self.transport.open_shell(cols, rows).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let shells = self.shells.clone();
        let owned_id = session_id.to_string();
        let on_close: CloseCallback = Box::new(move || {
            shells.remove_if(&owned_id, |_, shell| shell.generation() == generation);
            on_close();
        });

        match self.shells.entry(session_id.to_string()) {
            // Lost a race with a concurrent start for the same id
            Entry::Occupied(_) => {
                drop(opened);
                Err(RelayError::DuplicateSession(session_id.to_string()))
            }
            Entry::Vacant(vacant) => {
                let shell = ShellChannel::spawn(
                    session_id.to_string(),
                    generation,
                    cols,
                    rows,
                    opened,
                    on_data,
                    on_close,
                );
                let info = shell.info();
                vacant.insert(shell);
                info!("Shell {} started on {}", session_id, self.target);
                Ok(info)
            }
        }
    }

    /// Queue input for a shell. Returns `false` if the session is unknown.
    pub fn write(&self, session_id: &str, data: Vec<u8>) -> bool {
        match self.shells.get(session_id) {
            Some(shell) => {
                shell.write(data);
                true
            }
            None => false,
        }
    }

    /// Resize a shell. Returns `false` if the session is unknown.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        match self.shells.get(session_id) {
            Some(shell) => {
                shell.resize(cols, rows);
                true
            }
            None => false,
        }
    }

    pub fn close_shell(&self, session_id: &str) -> bool {
        match self.shells.remove(session_id) {
            Some((_, shell)) => {
                shell.close();
                true
            }
            None => false,
        }
    }

    pub fn list_shells(&self) -> Vec<ShellInfo> {
        self.shells.iter().map(|entry| entry.value().info()).collect()
    }

    /// Start forwarding a local port through this connection.
    ///
    /// `PortInUse` only covers ports this connection already forwards. Another
    /// connection holding the same port is not tracked here: the listener bind
    /// fails and the error comes back as `Network`. Port 0 binds an ephemeral
    /// port.
    #[cfg(feature = "port_forward")]
    pub async fn setup_port_forward(&self, spec: &ForwardSpec) -> Result<ForwardInfo> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        if spec.local_port != 0 && self.forwards.contains_key(&spec.local_port) {
            return Err(RelayError::PortInUse(spec.local_port));
        }

        let forward = PortForward::start(self.transport.clone(), spec).await?;
        let info = forward.info().clone();

        match self.forwards.entry(forward.local_port()) {
            Entry::Occupied(_) => {
                forward.stop();
                Err(RelayError::PortInUse(info.local_port))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(forward);
                Ok(info)
            }
        }
    }

    #[cfg(feature = "port_forward")]
    pub fn stop_port_forward(&self, local_port: u16) -> bool {
        match self.forwards.remove(&local_port) {
            Some((_, forward)) => {
                forward.stop();
                true
            }
            None => false,
        }
    }

    #[cfg(feature = "port_forward")]
    pub fn list_forwards(&self) -> Vec<ForwardInfo> {
        self.forwards
            .iter()
            .map(|entry| entry.value().info().clone())
            .collect()
    }

    /// Close every shell and forward, then the transport.
    ///
    /// Each resource is closed independently. Safe to call more than once.
    pub async fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        let session_ids: Vec<String> = self.shells.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            self.close_shell(&session_id);
        }

        #[cfg(feature = "port_forward")]
        {
            let ports: Vec<u16> = self.forwards.iter().map(|e| *e.key()).collect();
            for port in ports {
                self.stop_port_forward(port);
            }
        }

        if was_connected {
            self.transport.disconnect().await;
            info!("Disconnected from {}", self.target);
        } else {
            debug!("Connection to {} already closed", self.target);
        }
    }
}
