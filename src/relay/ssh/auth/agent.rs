//! Authentication through a running SSH agent (`SSH_AUTH_SOCK`).

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, info};

use crate::relay::error::{RelayError, Result};
use crate::relay::ssh::handler::SshClientHandler;

use super::traits::AuthStrategy;

fn agent_failure(stage: &str, detail: impl std::fmt::Display) -> RelayError {
    RelayError::Authentication(format!("SSH agent {}: {}", stage, detail))
}

/// Offers each agent identity in turn until the server accepts one.
#[derive(Default)]
pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| agent_failure("unreachable", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| agent_failure("identity listing failed", e))?;
        if identities.is_empty() {
            return Err(agent_failure("has no identities", "nothing to offer"));
        }

        // RSA keys need the server's preferred signature hash
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let offered = identities.len();
        for (index, identity) in identities.into_iter().enumerate() {
            let outcome = handle
                .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
                .await;
            match outcome {
                Ok(auth) if auth.success() => {
                    info!("{} accepted agent identity {}/{}", username, index + 1, offered);
                    return Ok(true);
                }
                Ok(_) => debug!("Agent identity {}/{} rejected", index + 1, offered),
                Err(e) => debug!("Agent identity {}/{} errored: {}", index + 1, offered, e),
            }
        }

        debug!("None of {} agent identities accepted for {}", offered, username);
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
