//! Byte cursor over an append-only log.
//!
//! Each [`TailCursor::poll`] reads from the last consumed offset to the
//! current end of the file and consumes only complete, newline-terminated
//! lines. A trailing partial line stays unconsumed until its newline arrives.
//!
//! A file shorter than the cursor has been truncated or replaced: the cursor
//! resets to 0 and the same pass re-reads whatever the file now holds.

use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

use crate::relay::error::Result;
use crate::relay::types::LogEvent;

use super::parser::parse_lines;

/// Lines parsed between yields to the scheduler.
const PARSE_CHUNK_LINES: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailCursor {
    offset: u64,
}

impl TailCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor that skips the first `offset` bytes.
    pub fn at(offset: u64) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Consume every complete line appended since the last poll.
    ///
    /// A missing file yields no events and leaves the cursor untouched.
    pub async fn poll(&mut self, path: &Path) -> Result<Vec<LogEvent>> {
        let len = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if len < self.offset {
            info!(
                "{} truncated ({} < {}), re-reading from start",
                path.display(),
                len,
                self.offset
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            debug!("{}: partial line pending", path.display());
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;

        let text = String::from_utf8_lossy(complete);
        let lines: Vec<&str> = text.lines().collect();

        let mut events = Vec::with_capacity(lines.len());
        for (index, chunk) in lines.chunks(PARSE_CHUNK_LINES).enumerate() {
            if index > 0 {
                tokio::task::yield_now().await;
            }
            events.extend(parse_lines(chunk.iter().copied()));
        }
        Ok(events)
    }
}
