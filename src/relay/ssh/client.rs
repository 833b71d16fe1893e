//! SSH connection establishment.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keepalive and compression preferences. Shell
//!    connections are long-lived and idle between keystrokes, so there is no
//!    inactivity timeout; keepalives detect dead peers instead.
//! 2. **Handshake**: TCP connect and key exchange, bounded by the connect
//!    timeout together with authentication.
//! 3. **Authentication**: an [`AuthChain`] built from the request's credential.
//!
//! ## Retry Strategy
//!
//! Attempts use exponential backoff with jitter via `backon`, starting at the
//! configured retry delay and capped at [`MAX_RETRY_DELAY`]. Only errors for
//! which [`RelayError::is_retryable`] holds are retried; authentication
//! failures never are, to avoid account lockouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::client;
use tracing::{error, info, warn};

use crate::relay::config::{MAX_RETRY_DELAY, SshSettings};
use crate::relay::error::{RelayError, Result};
use crate::relay::types::ConnectParams;

use super::auth::{AuthChain, AuthStrategy};
use super::handler::SshClientHandler;
use super::transport::{Connected, Connector, SshTransport};

/// Keepalive interval for shell connections
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered keepalives before the connection is considered dead
const KEEPALIVE_MAX: usize = 3;

/// Build the russh client configuration.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        preferred,
        ..Default::default()
    })
}

/// Connect with exponential backoff, returning the handle and the retry count.
pub(crate) async fn connect_with_retry(
    params: &ConnectParams,
    settings: &SshSettings,
) -> Result<(client::Handle<SshClientHandler>, u32)> {
    let attempt_counter = AtomicU32::new(0);
    let target = format!("{}@{}:{}", params.username, params.host, params.port);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(settings.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(settings.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if current_attempt > 0 {
            warn!("SSH connection retry attempt {} to {}", current_attempt, target);
        }

        connect_once(params, settings).await
    })
    .retry(backoff)
    .when(|e: &RelayError| {
        let retryable = e.is_retryable();
        if !retryable {
            warn!(
                "SSH connection to {} failed with non-retryable error: {}",
                target, e
            );
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(handle) => {
            if retry_count > 0 {
                info!(
                    "SSH connection to {} succeeded after {} retry attempt(s)",
                    target, retry_count
                );
            }
            Ok((handle, retry_count))
        }
        Err(e) => {
            error!(
                "SSH connection to {} failed after {} attempt(s). Last error: {}",
                target, total_attempts, e
            );
            Err(e)
        }
    }
}

/// One handshake and authentication attempt, bounded by the connect timeout.
async fn connect_once(
    params: &ConnectParams,
    settings: &SshSettings,
) -> Result<client::Handle<SshClientHandler>> {
    let attempt = async {
        let config = build_client_config(settings.compress);
        let handler = SshClientHandler::new(params.host.clone());

        let mut handle = client::connect(config, (params.host.as_str(), params.port), handler)
            .await
            .map_err(|e| RelayError::from_connect_failure(format!("Failed to connect: {}", e)))?;

        let auth_chain = AuthChain::from_credential(params.credential.as_ref());
        if !auth_chain.authenticate(&mut handle, &params.username).await? {
            return Err(RelayError::Authentication(
                "no authentication methods succeeded".to_string(),
            ));
        }

        Ok(handle)
    };

    tokio::time::timeout(settings.connect_timeout, attempt)
        .await
        .map_err(|_| RelayError::Timeout(settings.connect_timeout))?
}

/// [`Connector`] that opens russh connections.
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Connected> {
        let (handle, retry_attempts) = connect_with_retry(params, &self.settings).await?;
        Ok(Connected {
            transport: Arc::new(SshTransport::new(handle)),
            retry_attempts,
        })
    }
}
