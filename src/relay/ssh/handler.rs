//! russh client handler.
//!
//! The relay accepts every host key (similar to `StrictHostKeyChecking=no`).
//! Host key pinning against a known_hosts file is not implemented.

use russh::{client, keys};
use tracing::debug;

/// Client handler for russh connections opened by the relay.
pub struct SshClientHandler {
    host: String,
}

impl SshClientHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting {} host key for {}",
            server_public_key.algorithm(),
            self.host
        );
        Ok(true)
    }
}
