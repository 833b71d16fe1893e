//! Remote shell pool: at most one connection per control-connection identity.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::relay::error::{RelayError, Result};
use crate::relay::types::{CloseCallback, ConnectParams, DataCallback, ShellInfo};
#[cfg(feature = "port_forward")]
use crate::relay::types::{ForwardInfo, ForwardSpec};

use super::connection::RemoteShellConnection;
use super::transport::Connector;

/// Outcome of a successful [`RemoteShellPool::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub retry_attempts: u32,
    /// An earlier connection for the identity was closed
    pub replaced: bool,
}

/// Maps control-connection identities to their remote shell connection.
pub struct RemoteShellPool {
    connector: Arc<dyn Connector>,
    connections: DashMap<String, Arc<RemoteShellConnection>>,
}

impl RemoteShellPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: DashMap::new(),
        }
    }

    /// Establish the connection for `identity`, replacing any previous one.
    ///
    /// On failure the identity is left disconnected.
    pub async fn connect(&self, identity: &str, params: &ConnectParams) -> Result<ConnectOutcome> {
        let replaced = match self.connections.remove(identity) {
            Some((_, previous)) => {
                info!("Replacing connection {} for {}", previous.target(), identity);
                previous.close().await;
                true
            }
            None => false,
        };

        let connected = self.connector.connect(params).await?;
        let connection = Arc::new(RemoteShellConnection::new(params, connected.transport));

        // A concurrent connect for the same identity may have finished first
        if let Some(previous) = self.connections.insert(identity.to_string(), connection) {
            previous.close().await;
        }

        info!(
            "Identity {} connected to {}@{}:{}",
            identity, params.username, params.host, params.port
        );

        Ok(ConnectOutcome {
            retry_attempts: connected.retry_attempts,
            replaced,
        })
    }

    fn connection(&self, identity: &str) -> Option<Arc<RemoteShellConnection>> {
        self.connections
            .get(identity)
            .map(|entry| entry.value().clone())
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.connection(identity)
            .is_some_and(|connection| connection.is_connected())
    }

    pub async fn start_shell(
        &self,
        identity: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
        on_data: DataCallback,
        on_close: CloseCallback,
    ) -> Result<ShellInfo> {
        let connection = self.connection(identity).ok_or(RelayError::NotConnected)?;
        connection
            .start_shell(session_id, cols, rows, on_data, on_close)
            .await
    }

    /// Queue input; a no-op returning `false` for unknown identities or sessions.
    pub fn write(&self, identity: &str, session_id: &str, data: Vec<u8>) -> bool {
        self.connection(identity)
            .is_some_and(|connection| connection.write(session_id, data))
    }

    /// Best-effort resize; a no-op returning `false` when unknown.
    pub fn resize(&self, identity: &str, session_id: &str, cols: u16, rows: u16) -> bool {
        self.connection(identity)
            .is_some_and(|connection| connection.resize(session_id, cols, rows))
    }

    pub fn close_shell(&self, identity: &str, session_id: &str) -> bool {
        self.connection(identity)
            .is_some_and(|connection| connection.close_shell(session_id))
    }

    pub fn list_shells(&self, identity: &str) -> Vec<ShellInfo> {
        self.connection(identity)
            .map(|connection| connection.list_shells())
            .unwrap_or_default()
    }

    #[cfg(feature = "port_forward")]
    pub async fn setup_port_forward(&self, identity: &str, spec: &ForwardSpec) -> Result<ForwardInfo> {
        let connection = self.connection(identity).ok_or(RelayError::NotConnected)?;
        connection.setup_port_forward(spec).await
    }

    #[cfg(not(feature = "port_forward"))]
    pub async fn setup_port_forward(
        &self,
        _identity: &str,
        _spec: &crate::relay::types::ForwardSpec,
    ) -> Result<crate::relay::types::ForwardInfo> {
        Err(RelayError::FeatureDisabled("Port forwarding"))
    }

    #[cfg(feature = "port_forward")]
    pub fn stop_port_forward(&self, identity: &str, local_port: u16) -> bool {
        self.connection(identity)
            .is_some_and(|connection| connection.stop_port_forward(local_port))
    }

    #[cfg(not(feature = "port_forward"))]
    pub fn stop_port_forward(&self, _identity: &str, _local_port: u16) -> bool {
        false
    }

    #[cfg(feature = "port_forward")]
    pub fn list_forwards(&self, identity: &str) -> Vec<ForwardInfo> {
        self.connection(identity)
            .map(|connection| connection.list_forwards())
            .unwrap_or_default()
    }

    #[cfg(not(feature = "port_forward"))]
    pub fn list_forwards(&self, _identity: &str) -> Vec<crate::relay::types::ForwardInfo> {
        Vec::new()
    }

    /// Close all shells, forwards and the transport for `identity`.
    ///
    /// Returns `false` when there was nothing to disconnect.
    pub async fn disconnect(&self, identity: &str) -> bool {
        match self.connections.remove(identity) {
            Some((_, connection)) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Control-connection teardown.
    pub async fn remove_all(&self, identity: &str) {
        if self.disconnect(identity).await {
            info!("Remote shell resources released for {}", identity);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::relay::ssh::shell::tests::echo_shell;
    use crate::relay::ssh::transport::{Connected, OpenedShell, Transport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-process transport: echo shells and echo tunnels.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open_shell(&self, _cols: u16, _rows: u16) -> Result<OpenedShell> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RelayError::Channel("transport closed".into()));
            }
            Ok(echo_shell().0)
        }

        #[cfg(feature = "port_forward")]
        async fn open_direct_tcpip(
            &self,
            host: &str,
            _port: u16,
            _originator: std::net::SocketAddr,
        ) -> Result<Box<dyn crate::relay::ssh::transport::TunnelStream>> {
            if host == "unreachable" {
                return Err(RelayError::Channel("administratively prohibited".into()));
            }
            let (near, far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
            Ok(Box::new(near))
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn disconnect(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Connector handing out fake transports; hosts named `badauth` or
    /// `down` fail like a real server would.
    #[derive(Default)]
    pub(crate) struct FakeConnector;

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, params: &ConnectParams) -> Result<Connected> {
            match params.host.as_str() {
                "badauth" => Err(RelayError::Authentication(
                    "password authentication failed: credentials rejected".into(),
                )),
                "down" => Err(RelayError::Network("Failed to connect: Connection refused".into())),
                _ => Ok(Connected {
                    transport: Arc::new(FakeTransport::default()),
                    retry_attempts: 0,
                }),
            }
        }
    }

    pub(crate) fn params(host: &str) -> ConnectParams {
        ConnectParams {
            host: host.to_string(),
            port: 22,
            username: "dev".to_string(),
            credential: None,
        }
    }

    fn pool() -> RemoteShellPool {
        RemoteShellPool::new(Arc::new(FakeConnector))
    }

    fn callbacks() -> (
        DataCallback,
        mpsc::UnboundedReceiver<Vec<u8>>,
        CloseCallback,
        Arc<AtomicUsize>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        (
            Arc::new(move |bytes| {
                let _ = tx.send(bytes);
            }),
            rx,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            closes,
        )
    }

    mod connect {
        use super::*;

        #[tokio::test]
        async fn test_failed_connect_leaves_identity_disconnected() {
            let pool = pool();
            let err = pool.connect("A", &params("badauth")).await.unwrap_err();
            assert!(matches!(err, RelayError::Authentication(_)));
            assert!(!pool.is_connected("A"));

            let err = pool.connect("A", &params("down")).await.unwrap_err();
            assert!(matches!(err, RelayError::Network(_)));
            assert_eq!(pool.connection_count(), 0);
        }

        #[tokio::test]
        async fn test_reconnect_replaces_previous_connection() {
            let pool = pool();
            let first = pool.connect("A", &params("h")).await.unwrap();
            assert!(!first.replaced);

            let (on_data, _rx, on_close, closes) = callbacks();
            pool.start_shell("A", "s1", 80, 24, on_data, on_close).await.unwrap();

            let second = pool.connect("A", &params("h")).await.unwrap();
            assert!(second.replaced);
            assert!(pool.list_shells("A").is_empty());

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }
    }

    mod shells {
        use super::*;

        #[tokio::test]
        async fn test_start_shell_requires_connection() {
            let pool = pool();
            let (on_data, _rx, on_close, _) = callbacks();
            let err = pool
                .start_shell("A", "s1", 80, 24, on_data, on_close)
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::NotConnected));
        }

        #[tokio::test]
        async fn test_duplicate_session_rejected_without_affecting_existing() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();

            let (on_data, mut rx, on_close, closes) = callbacks();
            pool.start_shell("A", "s1", 80, 24, on_data, on_close).await.unwrap();

            let (on_data2, _rx2, on_close2, closes2) = callbacks();
            let err = pool
                .start_shell("A", "s1", 80, 24, on_data2, on_close2)
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::DuplicateSession(ref id) if id == "s1"));

            assert!(pool.write("A", "s1", b"still here".to_vec()));
            let chunk = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chunk, b"still here".to_vec());
            assert_eq!(closes.load(Ordering::SeqCst), 0);
            assert_eq!(closes2.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_write_and_resize_unknown_session_are_noops() {
            let pool = pool();
            assert!(!pool.write("A", "ghost", b"x".to_vec()));
            assert!(!pool.resize("A", "ghost", 100, 30));

            pool.connect("A", &params("h")).await.unwrap();
            assert!(!pool.write("A", "ghost", b"x".to_vec()));
            assert!(!pool.resize("A", "ghost", 100, 30));
            assert!(!pool.close_shell("A", "ghost"));
        }

        #[tokio::test]
        async fn test_session_id_reusable_after_close() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();

            let (on_data, _rx, on_close, _) = callbacks();
            pool.start_shell("A", "s1", 80, 24, on_data, on_close).await.unwrap();
            assert!(pool.close_shell("A", "s1"));

            let (on_data, _rx, on_close, _) = callbacks();
            pool.start_shell("A", "s1", 80, 24, on_data, on_close).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;

            // The first channel's late close must not evict the second
            assert_eq!(pool.list_shells("A").len(), 1);
        }

        #[tokio::test]
        async fn test_end_to_end_scenario() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();

            let (on_data, mut rx, on_close, closes) = callbacks();
            let info = pool.start_shell("A", "s1", 80, 24, on_data, on_close).await.unwrap();
            assert_eq!((info.cols, info.rows), (80, 24));

            assert!(pool.write("A", "s1", b"ls\n".to_vec()));
            let chunk = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chunk, b"ls\n".to_vec());

            assert!(pool.close_shell("A", "s1"));
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(closes.load(Ordering::SeqCst), 1);

            assert!(pool.disconnect("A").await);
            assert!(pool.list_shells("A").is_empty());
            assert!(pool.list_forwards("A").is_empty());
            assert!(!pool.is_connected("A"));
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_disconnect_when_not_connected_is_safe() {
            let pool = pool();
            assert!(!pool.disconnect("A").await);
            pool.remove_all("A").await;
        }
    }

    #[cfg(feature = "port_forward")]
    mod forwards {
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        fn spec(local_port: u16, remote_host: &str) -> ForwardSpec {
            ForwardSpec {
                local_port,
                remote_host: remote_host.to_string(),
                remote_port: 5432,
            }
        }

        #[tokio::test]
        async fn test_forward_splices_bytes() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();
            let info = pool.setup_port_forward("A", &spec(0, "db")).await.unwrap();

            let mut client = tokio::net::TcpStream::connect(("127.0.0.1", info.local_port))
                .await
                .unwrap();
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            tokio::time::timeout(Duration::from_secs(1), client.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf, b"ping");
        }

        #[tokio::test]
        async fn test_same_port_twice_is_port_in_use() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();
            let info = pool.setup_port_forward("A", &spec(0, "db")).await.unwrap();

            let err = pool
                .setup_port_forward("A", &spec(info.local_port, "db"))
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::PortInUse(port) if port == info.local_port));
            assert_eq!(pool.list_forwards("A").len(), 1);
        }

        #[tokio::test]
        async fn test_other_identity_has_independent_bookkeeping() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();
            pool.connect("B", &params("h")).await.unwrap();
            let info = pool.setup_port_forward("A", &spec(0, "db")).await.unwrap();

            // B is not blocked by A's bookkeeping; only the OS bind can refuse it
            let err = pool
                .setup_port_forward("B", &spec(info.local_port, "db"))
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::Network(_)), "got {:?}", err);

            assert!(pool.stop_port_forward("A", info.local_port));
            tokio::time::sleep(Duration::from_millis(50)).await;
            let b_info = pool
                .setup_port_forward("B", &spec(info.local_port, "db"))
                .await
                .unwrap();
            assert_eq!(b_info.local_port, info.local_port);
        }

        #[tokio::test]
        async fn test_failed_tunnel_keeps_listener() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();
            let info = pool
                .setup_port_forward("A", &spec(0, "unreachable"))
                .await
                .unwrap();

            let mut client = tokio::net::TcpStream::connect(("127.0.0.1", info.local_port))
                .await
                .unwrap();
            let mut buf = [0u8; 1];
            let read = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
                .await
                .unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));

            // Listener still accepts
            assert!(tokio::net::TcpStream::connect(("127.0.0.1", info.local_port))
                .await
                .is_ok());
            assert_eq!(pool.list_forwards("A").len(), 1);
        }

        #[tokio::test]
        async fn test_disconnect_releases_forwards() {
            let pool = pool();
            pool.connect("A", &params("h")).await.unwrap();
            let info = pool.setup_port_forward("A", &spec(0, "db")).await.unwrap();

            pool.disconnect("A").await;
            assert!(pool.list_forwards("A").is_empty());

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(tokio::net::TcpListener::bind(("127.0.0.1", info.local_port))
                .await
                .is_ok());
        }
    }
}
