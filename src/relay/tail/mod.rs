//! Incremental tailing of append-only JSON-lines logs.
//!
//! - `parser`: one line to one [`LogEvent`](crate::relay::types::LogEvent)
//! - `cursor`: byte cursor that reads only complete new lines, with truncation detection
//! - `tailer`: per-identity file watches with debounced passes

pub mod cursor;
pub mod parser;
pub mod tailer;

pub use cursor::TailCursor;
pub use tailer::{LogTailer, UpdateCallback};
