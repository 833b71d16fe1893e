//! tmux backend.

use async_trait::async_trait;
use portable_pty::CommandBuilder;

use crate::relay::error::Result;

use super::backend::{AttachRequest, SessionBackend, TERM, run_backend_command};

pub struct TmuxBackend;

impl TmuxBackend {
    pub const BINARY: &'static str = "tmux";
}

/// Exact-match target, so `relay-shell-a` never matches `relay-shell-ab`.
fn exact_target(name: &str) -> String {
    format!("={}", name)
}

#[async_trait]
impl SessionBackend for TmuxBackend {
    fn name(&self) -> &'static str {
        "tmux"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn attach_command(&self, name: &str, request: &AttachRequest) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(Self::BINARY);
        cmd.args(["new-session", "-A", "-s", name]);
        if let Some(cwd) = &request.cwd {
            cmd.arg("-c");
            cmd.arg(cwd);
            cmd.cwd(cwd);
        }
        cmd.env_remove("TMUX");
        cmd.env("TERM", TERM);
        cmd
    }

    async fn exists(&self, name: &str) -> bool {
        run_backend_command(Self::BINARY, &["has-session", "-t", &exact_target(name)])
            .await
            .is_ok_and(|output| output.success)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let output =
            run_backend_command(Self::BINARY, &["list-sessions", "-F", "#{session_name}"]).await?;
        // No server running means no sessions
        if !output.success {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn kill(&self, name: &str) -> Result<bool> {
        let output =
            run_backend_command(Self::BINARY, &["kill-session", "-t", &exact_target(name)]).await?;
        Ok(output.success)
    }
}
