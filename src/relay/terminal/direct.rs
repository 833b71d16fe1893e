//! Direct backend: the target process is the PTY child itself.
//!
//! Nothing persists. When the process exits the terminal is gone.

use async_trait::async_trait;
use portable_pty::CommandBuilder;

use crate::relay::error::Result;

use super::backend::{AttachRequest, SessionBackend, TERM};

pub struct DirectBackend;

#[async_trait]
impl SessionBackend for DirectBackend {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn attach_command(&self, _name: &str, request: &AttachRequest) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", TERM);
        cmd
    }

    async fn exists(&self, _name: &str) -> bool {
        false
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn kill(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }
}
