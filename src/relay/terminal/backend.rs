//! Terminal backends and their session naming convention.
//!
//! A persistent backend (zellij, tmux) keeps the shell alive in an external
//! multiplexer session; the relay only ever holds a PTY running that
//! multiplexer's attach client. The backend session name is the sole link
//! between a detached terminal and its process, so it is derived
//! deterministically from the terminal kind and session id:
//!
//! ```text
//! relay-<kind>-<sanitized session id>
//! ```
//!
//! where every character outside `[A-Za-z0-9]` is replaced with `-`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use tracing::{info, warn};

use crate::relay::error::{RelayError, Result};
use crate::relay::types::TerminalKind;

use super::BackendPreference;
use super::direct::DirectBackend;
use super::tmux::TmuxBackend;
use super::zellij::ZellijBackend;

/// Fixed prefix of every backend session the relay creates.
pub const BACKEND_PREFIX: &str = "relay";

/// Terminal type advertised to processes spawned in a PTY.
pub(crate) const TERM: &str = "xterm-256color";

pub fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Deterministic backend session name for a terminal.
pub fn backend_session_name(kind: TerminalKind, session_id: &str) -> String {
    format!(
        "{}-{}-{}",
        BACKEND_PREFIX,
        kind.backend_token(),
        sanitize_session_id(session_id)
    )
}

/// Split a backend session name into its kind and (sanitized) session id.
///
/// Returns `None` for sessions the relay did not create.
pub fn parse_backend_name(name: &str) -> Option<(TerminalKind, String)> {
    let rest = name.strip_prefix(BACKEND_PREFIX)?.strip_prefix('-')?;
    let (token, session_id) = rest.split_once('-')?;
    if session_id.is_empty() {
        return None;
    }
    let kind = TerminalKind::from_backend_token(token)?;
    Some((kind, session_id.to_string()))
}

/// What to run when a backend creates a new session.
#[derive(Debug, Clone, Default)]
pub struct AttachRequest {
    pub cwd: Option<PathBuf>,
    pub program: String,
    pub args: Vec<String>,
}

/// A place local terminals run in.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether sessions outlive the PTY attached to them.
    fn is_persistent(&self) -> bool;

    /// Command that attaches to `name`, creating the session if absent.
    fn attach_command(&self, name: &str, request: &AttachRequest) -> CommandBuilder;

    async fn exists(&self, name: &str) -> bool;

    /// Every live session name known to the backend, relay-created or not.
    async fn list(&self) -> Result<Vec<String>>;

    /// Terminate a backend session. Returns `false` if it did not exist.
    async fn kill(&self, name: &str) -> Result<bool>;
}

/// Output of a backend control command.
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
}

/// Run a non-interactive backend control command to completion.
pub(crate) async fn run_backend_command(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| RelayError::Backend(format!("Failed to run {}: {}", program, e)))?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    })
}

fn is_installed(binary: &str) -> bool {
    which::which(binary).is_ok()
}

/// Pick the backend for a preference.
///
/// `Auto` probes zellij, then tmux, then falls back to direct spawning. An
/// explicit multiplexer that is not installed also falls back to direct.
pub fn select_backend(preference: BackendPreference) -> Arc<dyn SessionBackend> {
    let backend: Arc<dyn SessionBackend> = match preference {
        BackendPreference::Auto => {
            if is_installed(ZellijBackend::BINARY) {
                Arc::new(ZellijBackend)
            } else if is_installed(TmuxBackend::BINARY) {
                Arc::new(TmuxBackend)
            } else {
                Arc::new(DirectBackend)
            }
        }
        BackendPreference::Zellij if is_installed(ZellijBackend::BINARY) => Arc::new(ZellijBackend),
        BackendPreference::Tmux if is_installed(TmuxBackend::BINARY) => Arc::new(TmuxBackend),
        BackendPreference::Direct => Arc::new(DirectBackend),
        missing => {
            warn!(
                "Terminal backend {} is not installed, terminals will not persist",
                missing
            );
            Arc::new(DirectBackend)
        }
    };

    info!("Using {} terminal backend", backend.name());
    backend
}
