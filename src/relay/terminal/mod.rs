//! Local terminal sessions.
//!
//! - `backend`: the [`SessionBackend`] capability trait, backend naming and selection
//! - `zellij` / `tmux`: persistent multiplexer backends
//! - `direct`: non-persistent backend spawning the target process itself
//! - `pty`: a PTY-wrapped child process with ordered output delivery
//! - `assistant`: assistant CLI resolution and invocation line
//! - `session`: one local terminal session entry
//! - `manager`: per-identity session state machine
//! - `pool`: identity to manager mapping plus system-wide managed listing

pub mod assistant;
pub mod backend;
pub mod direct;
pub mod manager;
pub mod pool;
pub mod pty;
pub mod session;
pub mod tmux;
pub mod zellij;

use std::fmt;
use std::str::FromStr;

pub use backend::{AttachRequest, SessionBackend, backend_session_name, parse_backend_name, select_backend};
pub use manager::LocalTerminalManager;
pub use pool::LocalTerminalPool;
pub use pty::PtyProcess;

/// Which backend keeps local terminals alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// zellij, then tmux, then direct
    #[default]
    Auto,
    Zellij,
    Tmux,
    Direct,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "zellij" => Ok(BackendPreference::Zellij),
            "tmux" => Ok(BackendPreference::Tmux),
            "direct" | "none" => Ok(BackendPreference::Direct),
            other => Err(format!("Unknown terminal backend: {}", other)),
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPreference::Auto => write!(f, "auto"),
            BackendPreference::Zellij => write!(f, "zellij"),
            BackendPreference::Tmux => write!(f, "tmux"),
            BackendPreference::Direct => write!(f, "direct"),
        }
    }
}
