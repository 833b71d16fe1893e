//! Session router: one per control connection.
//!
//! The router parses inbound frames, resolves them to the remote shell pool,
//! the local terminal pool or the log tailer under its connection identity,
//! and turns results and session output into outbound frames.
//!
//! Remote shell and local terminal requests are queued on one ordered lane
//! per family: the frame loop never waits on them, and each family's requests
//! run strictly in arrival order, so a detach followed by a re-attach of the
//! same id cannot be reordered. Log requests are handled inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::RelayConfig;
use super::message::{ConnectMessageBuilder, ForwardMessageBuilder, TerminalStartMessageBuilder};
use super::ssh::{RemoteShellPool, SshConnector};
use super::tail::{LogTailer, UpdateCallback};
use super::terminal::LocalTerminalPool;
use super::types::{
    CloseCallback, DataCallback, InboundFrame, LogEvent, LogRequest, OutboundFrame, SshRequest,
    TerminalRequest,
};

/// Process-wide pools shared by every control connection.
pub struct Registry {
    pub ssh: RemoteShellPool,
    pub terminals: LocalTerminalPool,
    pub tailer: LogTailer,
}

impl Registry {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            ssh: RemoteShellPool::new(Arc::new(SshConnector::new(config.ssh.clone()))),
            terminals: LocalTerminalPool::new(config.terminal.clone()),
            tailer: LogTailer::new(config.tail_debounce),
        }
    }

    pub fn from_parts(ssh: RemoteShellPool, terminals: LocalTerminalPool, tailer: LogTailer) -> Self {
        Self {
            ssh,
            terminals,
            tailer,
        }
    }
}

/// Incremental UTF-8 decoding of an output stream.
///
/// An incomplete multi-byte sequence at the end of a chunk is held back until
/// the next chunk; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[invalid..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

type Job = BoxFuture<'static, ()>;

/// Queue whose jobs run one at a time, in the order they were queued.
///
/// The draining task ends once every sender is dropped.
fn ordered_lane(family: &'static str, identity: &str) -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let identity = identity.to_string();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            job.await;
        }
        debug!("{} lane of {} drained", family, identity);
    });
    tx
}

pub struct SessionRouter {
    identity: String,
    registry: Arc<Registry>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    ssh_lane: mpsc::UnboundedSender<Job>,
    terminal_lane: mpsc::UnboundedSender<Job>,
    torn_down: AtomicBool,
}

impl SessionRouter {
    /// Router for a new control connection with a fresh identity.
    pub fn new(registry: Arc<Registry>, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Arc<Self> {
        Self::with_identity(uuid::Uuid::new_v4().to_string(), registry, outbound)
    }

    /// Must be called inside a tokio runtime.
    pub fn with_identity(
        identity: impl Into<String>,
        registry: Arc<Registry>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Arc<Self> {
        let identity = identity.into();
        Arc::new(Self {
            ssh_lane: ordered_lane("ssh", &identity),
            terminal_lane: ordered_lane("terminal", &identity),
            identity,
            registry,
            outbound,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn send(&self, frame: OutboundFrame) {
        if self.outbound.send(frame).is_err() {
            debug!("Control connection {} gone, frame dropped", self.identity);
        }
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Handle one text frame. Frames that cannot be parsed get an `error` frame.
    pub fn handle_text(self: &Arc<Self>, text: &str) {
        match InboundFrame::parse(text) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => {
                debug!("Rejected frame from {}: {}", self.identity, e);
                self.send(OutboundFrame::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Queue `frame` on its family's lane. Never waits for the operation.
    pub fn dispatch(self: &Arc<Self>, frame: InboundFrame) {
        if self.is_torn_down() {
            debug!("Ignoring frame for torn down router {}", self.identity);
            return;
        }
        let router = self.clone();
        let (lane, job): (_, Job) = match frame {
            InboundFrame::Ssh(request) => (&self.ssh_lane, router.run_ssh(request).boxed()),
            InboundFrame::Terminal(request) => {
                (&self.terminal_lane, router.run_terminal(request).boxed())
            }
            InboundFrame::Log(request) => {
                self.dispatch_log(request);
                return;
            }
        };
        if lane.send(job).is_err() {
            warn!("Request lane of {} is closed", self.identity);
        }
    }

    /// Output callback that frames decoded chunks with `frame`.
    fn output_sink(
        &self,
        session_id: &str,
        frame: fn(String, String) -> OutboundFrame,
    ) -> DataCallback {
        let outbound = self.outbound.clone();
        let session_id = session_id.to_string();
        let decoder = StdMutex::new(Utf8Decoder::default());
        Arc::new(move |bytes: Vec<u8>| {
            let Ok(mut decoder) = decoder.lock() else {
                return;
            };
            let text = decoder.decode(&bytes);
            if !text.is_empty() {
                let _ = outbound.send(frame(session_id.clone(), text));
            }
        })
    }

    fn close_notifier(&self, frame: OutboundFrame) -> CloseCallback {
        let outbound = self.outbound.clone();
        Box::new(move || {
            let _ = outbound.send(frame);
        })
    }

    async fn run_ssh(self: Arc<Self>, request: SshRequest) {
        if self.is_torn_down() {
            return;
        }
        let pool = &self.registry.ssh;
        match request {
            SshRequest::Connect(params) => {
                let frame = match pool.connect(&self.identity, &params).await {
                    Ok(outcome) => {
                        if self.is_torn_down() {
                            pool.remove_all(&self.identity).await;
                            return;
                        }
                        OutboundFrame::ConnectResult {
                            success: true,
                            message: Some(
                                ConnectMessageBuilder::new(&params.username, &params.host, params.port)
                                    .with_retry_attempts(outcome.retry_attempts)
                                    .replaced(outcome.replaced)
                                    .build(),
                            ),
                        }
                    }
                    Err(e) => {
                        warn!("Connect to {} failed for {}: {}", params.host, self.identity, e);
                        OutboundFrame::ConnectResult {
                            success: false,
                            message: Some(e.to_string()),
                        }
                    }
                };
                self.send(frame);
            }
            SshRequest::StartShell {
                session_id,
                cols,
                rows,
            } => {
                let on_data = self.output_sink(&session_id, |session_id, data| {
                    OutboundFrame::ShellOutput { session_id, data }
                });
                let on_close = self.close_notifier(OutboundFrame::ShellClosed {
                    session_id: session_id.clone(),
                });
                let result = pool
                    .start_shell(&self.identity, &session_id, cols, rows, on_data, on_close)
                    .await;
                let frame = match result {
                    Ok(_) => OutboundFrame::ShellStarted {
                        session_id,
                        success: true,
                        message: None,
                    },
                    Err(e) => OutboundFrame::ShellStarted {
                        session_id,
                        success: false,
                        message: Some(e.to_string()),
                    },
                };
                self.send(frame);
            }
            SshRequest::Input { session_id, data } => {
                if !pool.write(&self.identity, &session_id, data.into_bytes()) {
                    debug!("Input for unknown shell {}", session_id);
                }
            }
            SshRequest::Resize {
                session_id,
                cols,
                rows,
            } => {
                pool.resize(&self.identity, &session_id, cols, rows);
            }
            SshRequest::CloseShell { session_id } => {
                // A closed shell reports itself through its close callback
                if !pool.close_shell(&self.identity, &session_id) {
                    self.send(OutboundFrame::ShellClosed { session_id });
                }
            }
            SshRequest::ListShells => {
                self.send(OutboundFrame::ShellList {
                    shells: pool.list_shells(&self.identity),
                });
            }
            SshRequest::Disconnect => {
                pool.disconnect(&self.identity).await;
                self.send(OutboundFrame::Disconnected);
            }
            SshRequest::PortForward(spec) => {
                let frame = match pool.setup_port_forward(&self.identity, &spec).await {
                    Ok(info) => OutboundFrame::PortForwardResult {
                        success: true,
                        local_port: info.local_port,
                        message: Some(
                            ForwardMessageBuilder::new(
                                &info.local_address,
                                &info.remote_host,
                                info.remote_port,
                            )
                            .build(),
                        ),
                    },
                    Err(e) => OutboundFrame::PortForwardResult {
                        success: false,
                        local_port: spec.local_port,
                        message: Some(e.to_string()),
                    },
                };
                self.send(frame);
            }
            SshRequest::StopPortForward { local_port } => {
                let success = pool.stop_port_forward(&self.identity, local_port);
                self.send(OutboundFrame::PortForwardStopped {
                    local_port,
                    success,
                });
            }
            SshRequest::ListPortForwards => {
                self.send(OutboundFrame::PortForwardList {
                    forwards: pool.list_forwards(&self.identity),
                });
            }
        }
    }

    async fn run_terminal(self: Arc<Self>, request: TerminalRequest) {
        if self.is_torn_down() {
            return;
        }
        let pool = &self.registry.terminals;
        match request {
            TerminalRequest::Start(params) => {
                let on_data = self.output_sink(&params.session_id, |session_id, data| {
                    OutboundFrame::TerminalOutput { session_id, data }
                });
                let on_close = self.close_notifier(OutboundFrame::TerminalClosed {
                    session_id: params.session_id.clone(),
                });

                let result = pool
                    .start_terminal(&self.identity, &params, on_data, on_close)
                    .await;
                let frame = match result {
                    Ok(started) => {
                        if self.is_torn_down() {
                            pool.close_terminal(&self.identity, &params.session_id, false)
                                .await;
                            return;
                        }
                        OutboundFrame::TerminalStartResult {
                            success: true,
                            session_id: params.session_id.clone(),
                            kind: params.kind,
                            message: Some(
                                TerminalStartMessageBuilder::new(&params.session_id, params.kind)
                                    .with_backend(pool.backend_name(), started.backend_name)
                                    .reattached(started.reattached)
                                    .build(),
                            ),
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Terminal {} failed to start for {}: {}",
                            params.session_id, self.identity, e
                        );
                        OutboundFrame::TerminalStartResult {
                            success: false,
                            session_id: params.session_id.clone(),
                            kind: params.kind,
                            message: Some(e.to_string()),
                        }
                    }
                };
                self.send(frame);
            }
            TerminalRequest::Input { session_id, data } => {
                if !pool.write(&self.identity, &session_id, data.into_bytes()) {
                    debug!("Input for detached terminal {}", session_id);
                }
            }
            TerminalRequest::Resize {
                session_id,
                cols,
                rows,
            } => {
                pool.resize(&self.identity, &session_id, cols, rows);
            }
            TerminalRequest::Close { session_id, kill } => {
                pool.close_terminal(&self.identity, &session_id, kill).await;
                self.send(OutboundFrame::TerminalClosed { session_id });
            }
            TerminalRequest::List => {
                self.send(OutboundFrame::TerminalList {
                    terminals: pool.list(&self.identity),
                });
            }
            TerminalRequest::ListManaged => {
                let frame = match pool.list_managed().await {
                    Ok(terminals) => OutboundFrame::ManagedTerminalList { terminals },
                    Err(e) => OutboundFrame::Error {
                        message: format!("Failed to list managed terminals: {}", e),
                    },
                };
                self.send(frame);
            }
            TerminalRequest::KillManaged { session_id, kind } => {
                let success = match pool.kill_managed(&session_id, kind).await {
                    Ok(killed) => killed,
                    Err(e) => {
                        warn!("Failed to kill managed terminal {}: {}", session_id, e);
                        false
                    }
                };
                self.send(OutboundFrame::KillManagedResult {
                    session_id,
                    success,
                });
            }
        }
    }

    fn dispatch_log(self: &Arc<Self>, request: LogRequest) {
        match request {
            LogRequest::Watch { path } => {
                let outbound = self.outbound.clone();
                let event_path = path.clone();
                let on_update: UpdateCallback = Arc::new(move |events: Vec<LogEvent>| {
                    let _ = outbound.send(OutboundFrame::LogEvents {
                        path: event_path.clone(),
                        events,
                    });
                });
                let frame = match self.registry.tailer.watch(&self.identity, &path, on_update) {
                    Ok(()) => OutboundFrame::LogWatchResult {
                        success: true,
                        path,
                        message: None,
                    },
                    Err(e) => OutboundFrame::LogWatchResult {
                        success: false,
                        message: Some(e.to_string()),
                        path,
                    },
                };
                self.send(frame);
            }
            LogRequest::Unwatch => {
                self.registry.tailer.unwatch(&self.identity);
            }
        }
    }

    /// Release everything this connection owns. Runs at most once.
    ///
    /// Remote shells and forwards are closed, local terminals are detached
    /// (their backend sessions survive) and the log watch is stopped.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.ssh.remove_all(&self.identity).await;
        self.registry
            .terminals
            .remove_all(&self.identity, false)
            .await;
        self.registry.tailer.unwatch(&self.identity);
        info!("Control connection {} torn down", self.identity);
    }
}
