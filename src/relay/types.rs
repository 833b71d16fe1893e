//! Serializable frame types for the control connection.
//!
//! Every frame is a JSON object whose `type` field has the form
//! `<family>.<operation>`. The family prefix (`ssh`, `terminal`, `log`)
//! selects which pool handles the frame; the operation selects the variant.
//! Field names are camelCase on the wire.
//!
//! Inbound frames deserialize into [`SshRequest`], [`TerminalRequest`] or
//! [`LogRequest`] (wrapped in [`InboundFrame`]). Everything the relay sends
//! back is an [`OutboundFrame`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{RelayError, Result};

fn default_ssh_port() -> u16 {
    22
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Credential used to authenticate a remote shell connection.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Credential {
    Password {
        password: String,
    },
    /// Private key file on the relay host
    KeyFile {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// Private key material sent by the client (OpenSSH or PEM encoding)
    PrivateKey {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// Identities offered by the relay host's ssh-agent
    Agent,
}

// Secrets never reach the logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password { .. } => f.write_str("Password(***)"),
            Credential::KeyFile { path, .. } => write!(f, "KeyFile({})", path),
            Credential::PrivateKey { .. } => f.write_str("PrivateKey(***)"),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

/// Target and credentials of a remote shell connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    /// Falls back to ssh-agent when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

/// A local listening port forwarded to a host reachable from the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardSpec {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Kind of local terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalKind {
    #[default]
    PlainShell,
    AssistantCli,
}

impl TerminalKind {
    /// Token used inside persistent backend session names.
    pub fn backend_token(&self) -> &'static str {
        match self {
            TerminalKind::PlainShell => "shell",
            TerminalKind::AssistantCli => "assistant",
        }
    }

    pub fn from_backend_token(token: &str) -> Option<Self> {
        match token {
            "shell" => Some(TerminalKind::PlainShell),
            "assistant" => Some(TerminalKind::AssistantCli),
            _ => None,
        }
    }

    pub const ALL: [TerminalKind; 2] = [TerminalKind::PlainShell, TerminalKind::AssistantCli];
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalKind::PlainShell => write!(f, "plain-shell"),
            TerminalKind::AssistantCli => write!(f, "assistant-cli"),
        }
    }
}

/// Options for starting (or re-attaching) a local terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStartParams {
    pub session_id: String,
    #[serde(default)]
    pub kind: TerminalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// Remote-shell family requests (`ssh.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SshRequest {
    #[serde(rename = "ssh.connect")]
    Connect(ConnectParams),
    #[serde(rename = "ssh.startShell", rename_all = "camelCase")]
    StartShell {
        session_id: String,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    #[serde(rename = "ssh.input", rename_all = "camelCase")]
    Input { session_id: String, data: String },
    #[serde(rename = "ssh.resize", rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "ssh.closeShell", rename_all = "camelCase")]
    CloseShell { session_id: String },
    #[serde(rename = "ssh.listShells")]
    ListShells,
    #[serde(rename = "ssh.disconnect")]
    Disconnect,
    #[serde(rename = "ssh.portForward")]
    PortForward(ForwardSpec),
    #[serde(rename = "ssh.stopPortForward", rename_all = "camelCase")]
    StopPortForward { local_port: u16 },
    #[serde(rename = "ssh.listPortForwards")]
    ListPortForwards,
}

/// Local-terminal family requests (`terminal.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalRequest {
    #[serde(rename = "terminal.start")]
    Start(TerminalStartParams),
    #[serde(rename = "terminal.input", rename_all = "camelCase")]
    Input { session_id: String, data: String },
    #[serde(rename = "terminal.resize", rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal.close", rename_all = "camelCase")]
    Close {
        session_id: String,
        #[serde(default)]
        kill: bool,
    },
    #[serde(rename = "terminal.list")]
    List,
    #[serde(rename = "terminal.listManaged")]
    ListManaged,
    #[serde(rename = "terminal.killManaged", rename_all = "camelCase")]
    KillManaged {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<TerminalKind>,
    },
}

/// Log tailer family requests (`log.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LogRequest {
    #[serde(rename = "log.watch")]
    Watch { path: String },
    #[serde(rename = "log.unwatch")]
    Unwatch,
}

/// Frame family selected by the `type` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFamily {
    Ssh,
    Terminal,
    Log,
}

impl FrameFamily {
    /// Resolve the family of a frame type such as `ssh.startShell`.
    pub fn of(frame_type: &str) -> Option<Self> {
        let (prefix, operation) = frame_type.split_once('.')?;
        if operation.is_empty() {
            return None;
        }
        match prefix {
            "ssh" => Some(FrameFamily::Ssh),
            "terminal" => Some(FrameFamily::Terminal),
            "log" => Some(FrameFamily::Log),
            _ => None,
        }
    }
}

/// A parsed inbound frame, already routed to its family.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Ssh(SshRequest),
    Terminal(TerminalRequest),
    Log(LogRequest),
}

impl InboundFrame {
    /// Parse a JSON text frame, dispatching on the `type` prefix.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::InvalidFrame(format!("Invalid JSON: {}", e)))?;

        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::InvalidFrame("Missing frame type".to_string()))?;

        let family = FrameFamily::of(frame_type).ok_or_else(|| {
            RelayError::InvalidFrame(format!("Unknown frame type: {}", frame_type))
        })?;
        let frame_type = frame_type.to_string();

        let parsed = match family {
            FrameFamily::Ssh => serde_json::from_value(value).map(InboundFrame::Ssh),
            FrameFamily::Terminal => serde_json::from_value(value).map(InboundFrame::Terminal),
            FrameFamily::Log => serde_json::from_value(value).map(InboundFrame::Log),
        };

        parsed.map_err(|e| RelayError::InvalidFrame(format!("Invalid {} frame: {}", frame_type, e)))
    }
}

/// Metadata of an open remote shell channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellInfo {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
    /// RFC3339 creation timestamp
    pub created_at: String,
}

/// Metadata of an active port forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardInfo {
    pub local_port: u16,
    pub local_address: String,
    pub remote_host: String,
    pub remote_port: u16,
}

/// A local terminal tracked by one control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub session_id: String,
    pub kind: TerminalKind,
    /// RFC3339 creation timestamp
    pub created_at: String,
    /// Whether a local process is currently attached
    pub attached: bool,
}

/// A live persistent backend session, discovered system-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedTerminalInfo {
    /// Sanitized session id recovered from the backend name
    pub session_id: String,
    pub kind: TerminalKind,
    pub backend_name: String,
}

/// Record kind of an assistant log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEventKind {
    User,
    Assistant,
    System,
    Summary,
    #[serde(other)]
    Other,
}

/// One structured record parsed from an append-only JSON-lines log.
///
/// Well-known fields are typed; every other field of the record is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub kind: LogEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Receives output chunks of one session, in order.
pub type DataCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Invoked once when a session ends.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Frames sent from the relay to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "ssh.connectResult")]
    ConnectResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "ssh.shellStarted", rename_all = "camelCase")]
    ShellStarted {
        session_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "ssh.shellClosed", rename_all = "camelCase")]
    ShellClosed { session_id: String },
    #[serde(rename = "ssh.output", rename_all = "camelCase")]
    ShellOutput { session_id: String, data: String },
    #[serde(rename = "ssh.shellList")]
    ShellList { shells: Vec<ShellInfo> },
    #[serde(rename = "ssh.disconnected")]
    Disconnected,
    #[serde(rename = "ssh.portForwardResult", rename_all = "camelCase")]
    PortForwardResult {
        success: bool,
        local_port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "ssh.portForwardStopped", rename_all = "camelCase")]
    PortForwardStopped { local_port: u16, success: bool },
    #[serde(rename = "ssh.portForwardList")]
    PortForwardList { forwards: Vec<ForwardInfo> },
    #[serde(rename = "terminal.startResult", rename_all = "camelCase")]
    TerminalStartResult {
        success: bool,
        session_id: String,
        kind: TerminalKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "terminal.output", rename_all = "camelCase")]
    TerminalOutput { session_id: String, data: String },
    #[serde(rename = "terminal.closed", rename_all = "camelCase")]
    TerminalClosed { session_id: String },
    #[serde(rename = "terminal.list")]
    TerminalList { terminals: Vec<TerminalInfo> },
    #[serde(rename = "terminal.managedList")]
    ManagedTerminalList { terminals: Vec<ManagedTerminalInfo> },
    #[serde(rename = "terminal.killManagedResult", rename_all = "camelCase")]
    KillManagedResult { session_id: String, success: bool },
    #[serde(rename = "log.watchResult")]
    LogWatchResult {
        success: bool,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "log.events")]
    LogEvents { path: String, events: Vec<LogEvent> },
    #[serde(rename = "error")]
    Error { message: String },
}
