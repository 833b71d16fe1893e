//! Interactive shell channels.
//!
//! A [`ShellChannel`] owns two tasks:
//!
//! - a **writer** draining an unbounded input queue into the channel, so
//!   `write` and `resize` never suspend and are applied in submission order;
//! - a **reader** delivering remote output to the data callback in the order
//!   it was produced, then invoking the close callback exactly once when the
//!   output ends (remote exit, transport loss) or the channel is closed.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::relay::types::{CloseCallback, DataCallback, ShellInfo};

use super::transport::OpenedShell;

enum ShellInput {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

fn pack_size(cols: u16, rows: u16) -> u32 {
    ((cols as u32) << 16) | rows as u32
}

fn unpack_size(packed: u32) -> (u16, u16) {
    ((packed >> 16) as u16, (packed & 0xffff) as u16)
}

/// One interactive shell bound to a session id.
pub struct ShellChannel {
    session_id: String,
    generation: u64,
    created_at: String,
    size: AtomicU32,
    input_tx: mpsc::UnboundedSender<ShellInput>,
    cancel_token: CancellationToken,
}

impl ShellChannel {
    /// Start the reader and writer tasks for an opened shell.
    pub(crate) fn spawn(
        session_id: String,
        generation: u64,
        cols: u16,
        rows: u16,
        opened: OpenedShell,
        on_data: DataCallback,
        on_close: CloseCallback,
    ) -> Self {
        let OpenedShell { io, mut output } = opened;
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<ShellInput>();
        let cancel_token = CancellationToken::new();

        let writer_id = session_id.clone();
        tokio::spawn(async move {
            while let Some(input) = input_rx.recv().await {
                let result = match input {
                    ShellInput::Data(bytes) => io.write(&bytes).await,
                    ShellInput::Resize { cols, rows } => io.resize(cols, rows).await,
                    ShellInput::Close => {
                        if let Err(e) = io.close().await {
                            debug!("Shell {} close: {}", writer_id, e);
                        }
                        break;
                    }
                };
                if let Err(e) = result {
                    debug!("Shell {} input dropped: {}", writer_id, e);
                }
            }
        });

        let reader_id = session_id.clone();
        let reader_token = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = reader_token.cancelled() => break,

                    chunk = output.recv() => match chunk {
                        Some(bytes) => on_data(bytes),
                        None => break,
                    },
                }
            }
            info!("Shell {} closed", reader_id);
            on_close();
        });

        Self {
            session_id,
            generation,
            created_at: chrono::Utc::now().to_rfc3339(),
            size: AtomicU32::new(pack_size(cols, rows)),
            input_tx,
            cancel_token,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue input for the shell.
    pub fn write(&self, data: Vec<u8>) {
        let _ = self.input_tx.send(ShellInput::Data(data));
    }

    /// Queue a window size change.
    pub fn resize(&self, cols: u16, rows: u16) {
        self.size.store(pack_size(cols, rows), Ordering::Relaxed);
        let _ = self.input_tx.send(ShellInput::Resize { cols, rows });
    }

    /// Close the channel. Queued input is flushed first; the close callback
    /// fires from the reader task.
    pub fn close(&self) {
        let _ = self.input_tx.send(ShellInput::Close);
        self.cancel_token.cancel();
    }

    pub fn info(&self) -> ShellInfo {
        let (cols, rows) = unpack_size(self.size.load(Ordering::Relaxed));
        ShellInfo {
            session_id: self.session_id.clone(),
            cols,
            rows,
            created_at: self.created_at.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::relay::error::Result;
    use crate::relay::ssh::transport::ShellIo;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Shell that echoes its input back as output and records resizes.
    pub(crate) struct EchoShellIo {
        output: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
        pub(crate) resizes: Arc<StdMutex<Vec<(u16, u16)>>>,
    }

    #[async_trait]
    impl ShellIo for EchoShellIo {
        async fn write(&self, data: &[u8]) -> Result<()> {
            if let Some(tx) = self.output.lock().unwrap().as_ref() {
                let _ = tx.send(data.to_vec());
            }
            Ok(())
        }

        async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
            self.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.output.lock().unwrap().take();
            Ok(())
        }
    }

    /// Echo shell and the log of resizes it received.
    pub(crate) fn echo_shell() -> (OpenedShell, Arc<StdMutex<Vec<(u16, u16)>>>) {
        let (tx, output) = mpsc::unbounded_channel();
        let resizes = Arc::new(StdMutex::new(Vec::new()));
        let io = EchoShellIo {
            output: StdMutex::new(Some(tx)),
            resizes: resizes.clone(),
        };
        (
            OpenedShell {
                io: Box::new(io),
                output,
            },
            resizes,
        )
    }

    fn collecting() -> (DataCallback, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_data: DataCallback = Arc::new(move |bytes| {
            let _ = tx.send(bytes);
        });
        (on_data, rx)
    }

    fn counting_close() -> (CloseCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        (
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    mod size_packing {
        use super::*;

        #[test]
        fn test_pack_unpack() {
            assert_eq!(unpack_size(pack_size(80, 24)), (80, 24));
            assert_eq!(unpack_size(pack_size(u16::MAX, 1)), (u16::MAX, 1));
        }
    }

    mod channel {
        use super::*;

        #[tokio::test]
        async fn test_output_delivered_in_order() {
            let (opened, _) = echo_shell();
            let (on_data, mut rx) = collecting();
            let (on_close, _) = counting_close();
            let shell = ShellChannel::spawn("s1".into(), 1, 80, 24, opened, on_data, on_close);

            for i in 0..20 {
                shell.write(format!("line {}\n", i).into_bytes());
            }

            for i in 0..20 {
                let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(chunk, format!("line {}\n", i).into_bytes());
            }
        }

        #[tokio::test]
        async fn test_close_fires_callback_once() {
            let (opened, _) = echo_shell();
            let (on_data, _rx) = collecting();
            let (on_close, count) = counting_close();
            let shell = ShellChannel::spawn("s1".into(), 1, 80, 24, opened, on_data, on_close);

            shell.close();
            shell.close();
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_remote_exit_fires_callback() {
            let (tx, output) = mpsc::unbounded_channel::<Vec<u8>>();
            let opened = OpenedShell {
                io: Box::new(EchoShellIo {
                    output: StdMutex::new(None),
                    resizes: Arc::new(StdMutex::new(Vec::new())),
                }),
                output,
            };
            let (on_data, _rx) = collecting();
            let (on_close, count) = counting_close();
            let _shell = ShellChannel::spawn("s1".into(), 1, 80, 24, opened, on_data, on_close);

            drop(tx);
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_resize_updates_info() {
            let (opened, resizes) = echo_shell();
            let (on_data, _rx) = collecting();
            let (on_close, _) = counting_close();
            let shell = ShellChannel::spawn("s1".into(), 1, 80, 24, opened, on_data, on_close);

            shell.resize(120, 40);
            tokio::time::sleep(Duration::from_millis(50)).await;

            let info = shell.info();
            assert_eq!((info.cols, info.rows), (120, 40));
            assert_eq!(*resizes.lock().unwrap(), vec![(120, 40)]);
        }
    }
}
