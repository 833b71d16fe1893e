//! Public key SSH authentication, from a key file or from inline key material.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::relay::error::{RelayError, Result};
use crate::relay::ssh::handler::SshClientHandler;

use super::traits::AuthStrategy;

/// Private key file authentication strategy.
pub struct KeyAuth {
    key_path: PathBuf,
    passphrase: Option<String>,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let key_pair = keys::load_secret_key(&self.key_path, self.passphrase.as_deref())
            .map_err(|e| {
                RelayError::Authentication(format!(
                    "Key authentication failed: cannot load {:?}: {}",
                    self.key_path, e
                ))
            })?;

        authenticate_with_key(handle, username, key_pair).await
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// Authentication with private key material supplied by the client.
///
/// Accepts OpenSSH and PEM encodings.
pub struct InlineKeyAuth {
    key: String,
    passphrase: Option<String>,
}

impl InlineKeyAuth {
    pub fn new(key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self {
            key: key.into(),
            passphrase,
        }
    }
}

#[async_trait]
impl AuthStrategy for InlineKeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool> {
        let key_pair = keys::decode_secret_key(&self.key, self.passphrase.as_deref()).map_err(
            |e| RelayError::Authentication(format!("Key authentication failed: {}", e)),
        )?;

        authenticate_with_key(handle, username, key_pair).await
    }

    fn name(&self) -> &'static str {
        "inline-key"
    }
}

async fn authenticate_with_key(
    handle: &mut client::Handle<SshClientHandler>,
    username: &str,
    key_pair: keys::PrivateKey,
) -> Result<bool> {
    // For RSA keys, use the best supported hash algorithm
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

    let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

    let result = handle
        .authenticate_publickey(username, key_with_hash)
        .await
        .map_err(|e| RelayError::Authentication(format!("Key authentication failed: {}", e)))?;

    Ok(result.success())
}
