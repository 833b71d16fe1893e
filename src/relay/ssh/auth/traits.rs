use async_trait::async_trait;
use russh::client;

use crate::relay::error::Result;
use crate::relay::ssh::handler::SshClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Credentials rejected by the server
    /// * `Err(_)` - The attempt could not be made (unreadable key, no agent, ...)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool>;

    /// Strategy name used in logs and failure messages.
    fn name(&self) -> &'static str;
}
