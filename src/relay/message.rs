//! Builders for the human-readable `message` field of result frames.
//!
//! These follow the fluent builder style: required fields in `new`, optional
//! details via `with_*`, then `build()`.

use super::types::TerminalKind;

/// Builder for `ssh.connectResult` success messages.
///
/// # Example
///
/// ```ignore
/// let message = ConnectMessageBuilder::new("deploy", "build-01", 22)
///     .with_retry_attempts(2)
///     .replaced(true)
///     .build();
/// ```
pub struct ConnectMessageBuilder {
    username: String,
    host: String,
    port: u16,
    retry_attempts: u32,
    replaced: bool,
}

impl ConnectMessageBuilder {
    pub fn new(username: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            username: username.into(),
            host: host.into(),
            port,
            retry_attempts: 0,
            replaced: false,
        }
    }

    /// Set the number of retry attempts needed to connect.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Mark that an earlier connection for the same client was replaced.
    pub fn replaced(mut self, replaced: bool) -> Self {
        self.replaced = replaced;
        self
    }

    pub fn build(&self) -> String {
        let mut message = format!("Connected to {}@{}:{}", self.username, self.host, self.port);
        if self.retry_attempts > 0 {
            message.push_str(&format!(" after {} retry attempt(s)", self.retry_attempts));
        }
        if self.replaced {
            message.push_str(" (previous connection closed)");
        }
        message
    }
}

/// Builder for `ssh.portForwardResult` success messages.
pub struct ForwardMessageBuilder {
    local_address: String,
    remote_host: String,
    remote_port: u16,
}

impl ForwardMessageBuilder {
    pub fn new(
        local_address: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn build(&self) -> String {
        format!(
            "Forwarding {} -> {}:{}",
            self.local_address, self.remote_host, self.remote_port
        )
    }
}

/// Builder for `terminal.startResult` messages.
///
/// # Example
///
/// ```ignore
/// let message = TerminalStartMessageBuilder::new("t1", TerminalKind::PlainShell)
///     .with_backend("zellij", Some("relay-shell-t1"))
///     .reattached(true)
///     .build();
/// ```
pub struct TerminalStartMessageBuilder {
    session_id: String,
    kind: TerminalKind,
    backend: Option<String>,
    backend_name: Option<String>,
    reattached: bool,
}

impl TerminalStartMessageBuilder {
    pub fn new(session_id: impl Into<String>, kind: TerminalKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            backend: None,
            backend_name: None,
            reattached: false,
        }
    }

    /// Set the backend that hosts the session, and its persistent name if any.
    pub fn with_backend(
        mut self,
        backend: impl Into<String>,
        backend_name: Option<impl Into<String>>,
    ) -> Self {
        self.backend = Some(backend.into());
        self.backend_name = backend_name.map(Into::into);
        self
    }

    /// Whether an existing backend session was re-attached.
    pub fn reattached(mut self, reattached: bool) -> Self {
        self.reattached = reattached;
        self
    }

    pub fn build(&self) -> String {
        let verb = if self.reattached {
            "Re-attached"
        } else {
            "Started"
        };
        let mut message = format!("{} {} '{}'", verb, self.kind, self.session_id);

        match (&self.backend, &self.backend_name) {
            (Some(backend), Some(name)) => {
                message.push_str(&format!(" ({} session '{}')", backend, name));
            }
            (Some(backend), None) => {
                message.push_str(&format!(" ({}, not persistent)", backend));
            }
            _ => {}
        }

        message
    }
}
