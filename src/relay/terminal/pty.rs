//! PTY-wrapped child processes.
//!
//! portable-pty exposes blocking readers and writers, so each process gets
//! two OS threads: a reader delivering output chunks to the data callback in
//! the order they were produced, and a writer draining an unbounded input
//! queue. Once the reader sees end of output it reaps the child and invokes
//! the exit callback exactly once.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, mpsc};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, warn};

use crate::relay::error::{RelayError, Result};
use crate::relay::types::DataCallback;

/// Invoked once with the exit code (if it could be collected).
pub type ExitCallback = Box<dyn FnOnce(Option<u32>) + Send>;

const READ_BUFFER_SIZE: usize = 8192;

/// A running process attached to a pseudo-terminal.
pub struct PtyProcess {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl PtyProcess {
    pub fn spawn(
        command: CommandBuilder,
        cols: u16,
        rows: u16,
        on_data: DataCallback,
        on_exit: ExitCallback,
    ) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RelayError::Spawn(format!("Failed to open PTY: {}", e)))?;

        let program = command
            .get_argv()
            .first()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| RelayError::Spawn(format!("Failed to spawn {}: {}", program, e)))?;
        // The child holds the only slave handle now, so the reader sees EOF when it exits
        drop(pair.slave);

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (mut reader, mut writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(RelayError::Spawn(format!("Failed to open PTY streams: {}", e)));
            }
        };

        let pid = child.process_id();
        let killer = child.clone_killer();
        let running = Arc::new(AtomicBool::new(true));

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>();
        std::thread::spawn(move || {
            for chunk in input_rx {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    debug!("PTY write failed: {}", e);
                    break;
                }
            }
        });

        let reader_running = running.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => on_data(buf[..n].to_vec()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    // Linux reports EIO once the slave side is gone
                    Err(e) => {
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }

            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    warn!("Failed to reap {}: {}", program, e);
                    None
                }
            };
            reader_running.store(false, Ordering::SeqCst);
            on_exit(code);
        });

        Ok(Self {
            master: StdMutex::new(pair.master),
            killer: StdMutex::new(killer),
            input_tx,
            running,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue input. Returns `false` once the process has exited.
    pub fn write(&self, data: Vec<u8>) -> bool {
        self.is_running() && self.input_tx.send(data).is_ok()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        let Ok(master) = self.master.lock() else {
            return false;
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .is_ok()
    }

    /// Kill the child. The exit callback still fires from the reader thread.
    pub fn kill(&self) {
        if !self.is_running() {
            return;
        }
        if let Ok(mut killer) = self.killer.lock()
            && let Err(e) = killer.kill()
        {
            debug!("Failed to kill PTY child {:?}: {}", self.pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{mpsc as tokio_mpsc, oneshot};

    fn collecting() -> (DataCallback, tokio_mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let on_data: DataCallback = Arc::new(move |bytes| {
            let _ = tx.send(bytes);
        });
        (on_data, rx)
    }

    fn exit_signal() -> (ExitCallback, oneshot::Receiver<Option<u32>>) {
        let (tx, rx) = oneshot::channel();
        (
            Box::new(move |code| {
                let _ = tx.send(code);
            }),
            rx,
        )
    }

    async fn read_until(rx: &mut tokio_mpsc::UnboundedReceiver<Vec<u8>>, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for output")
                .expect("output ended early");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
        seen
    }

    mod process {
        use super::*;

        #[tokio::test]
        async fn test_output_then_exit_code() {
            let mut cmd = CommandBuilder::new("sh");
            cmd.args(["-c", "echo relay-ready; exit 3"]);
            let (on_data, mut rx) = collecting();
            let (on_exit, exited) = exit_signal();

            let process = PtyProcess::spawn(cmd, 80, 24, on_data, on_exit).unwrap();
            assert!(process.pid().is_some());

            read_until(&mut rx, "relay-ready").await;
            let code = tokio::time::timeout(Duration::from_secs(5), exited)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(code, Some(3));
            assert!(!process.is_running());
            assert!(!process.write(b"late".to_vec()));
        }

        #[tokio::test]
        async fn test_input_is_echoed() {
            let (on_data, mut rx) = collecting();
            let (on_exit, _exited) = exit_signal();
            let process = PtyProcess::spawn(CommandBuilder::new("cat"), 80, 24, on_data, on_exit).unwrap();

            assert!(process.write(b"ping\n".to_vec()));
            read_until(&mut rx, "ping").await;
            assert!(process.resize(100, 30));

            process.kill();
        }

        #[tokio::test]
        async fn test_kill_fires_exit_once() {
            let mut cmd = CommandBuilder::new("sleep");
            cmd.arg("30");
            let (on_data, _rx) = collecting();
            let (on_exit, exited) = exit_signal();
            let process = PtyProcess::spawn(cmd, 80, 24, on_data, on_exit).unwrap();

            process.kill();
            process.kill();

            tokio::time::timeout(Duration::from_secs(5), exited)
                .await
                .unwrap()
                .unwrap();
            assert!(!process.is_running());
        }

        #[test]
        fn test_missing_program_is_spawn_error() {
            let (on_data, _rx) = collecting();
            let (on_exit, _exited) = exit_signal();
            let result = PtyProcess::spawn(
                CommandBuilder::new("/nonexistent/relay-binary"),
                80,
                24,
                on_data,
                on_exit,
            );
            assert!(matches!(result, Err(RelayError::Spawn(_))));
        }
    }
}
