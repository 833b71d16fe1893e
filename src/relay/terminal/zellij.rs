//! zellij backend.

use async_trait::async_trait;
use portable_pty::CommandBuilder;
use tracing::debug;

use crate::relay::error::Result;

use super::backend::{AttachRequest, SessionBackend, TERM, run_backend_command};

pub struct ZellijBackend;

impl ZellijBackend {
    pub const BINARY: &'static str = "zellij";
}

/// Session names from `zellij list-sessions --short --no-formatting`.
fn parse_session_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.split_whitespace().next().unwrap_or(line).to_string())
        .collect()
}

#[async_trait]
impl SessionBackend for ZellijBackend {
    fn name(&self) -> &'static str {
        "zellij"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn attach_command(&self, name: &str, request: &AttachRequest) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(Self::BINARY);
        cmd.args(["attach", "--create", name]);
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        }
        // Allow attaching from inside another zellij session
        cmd.env_remove("ZELLIJ");
        cmd.env_remove("ZELLIJ_SESSION_NAME");
        cmd.env("TERM", TERM);
        cmd
    }

    async fn exists(&self, name: &str) -> bool {
        match self.list().await {
            Ok(sessions) => sessions.iter().any(|session| session == name),
            Err(e) => {
                debug!("zellij list failed: {}", e);
                false
            }
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let output =
            run_backend_command(Self::BINARY, &["list-sessions", "--short", "--no-formatting"])
                .await?;
        // Exits non-zero when there are no sessions
        if !output.success {
            return Ok(Vec::new());
        }
        Ok(parse_session_list(&output.stdout))
    }

    async fn kill(&self, name: &str) -> Result<bool> {
        let killed = run_backend_command(Self::BINARY, &["kill-session", name]).await?;
        // Exited sessions linger as resurrectable until deleted
        let deleted = run_backend_command(Self::BINARY, &["delete-session", "--force", name]).await?;
        Ok(killed.success || deleted.success)
    }
}
