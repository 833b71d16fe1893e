//! One local terminal session entry.

use std::sync::{Arc, Mutex as StdMutex};

use crate::relay::types::{CloseCallback, TerminalInfo, TerminalKind};

use super::pty::PtyProcess;

/// Close callback of one attachment, taken by whoever fires or disarms it first.
pub(crate) type CloseSlot = Arc<StdMutex<Option<CloseCallback>>>;

pub(crate) fn arm(on_close: CloseCallback) -> CloseSlot {
    Arc::new(StdMutex::new(Some(on_close)))
}

pub(crate) fn take_close(slot: &CloseSlot) -> Option<CloseCallback> {
    slot.lock().ok().and_then(|mut armed| armed.take())
}

/// A local terminal: attached while it has a live process, detached otherwise.
pub struct LocalTerminalSession {
    pub(crate) session_id: String,
    pub(crate) kind: TerminalKind,
    pub(crate) created_at: String,
    /// Name of the persistent backend session, if any
    pub(crate) backend_name: Option<String>,
    pub(crate) process: Option<Arc<PtyProcess>>,
    /// Bumped on every attach so a stale exit never touches a newer process
    pub(crate) generation: u64,
    pub(crate) close_slot: CloseSlot,
}

impl LocalTerminalSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn kind(&self) -> TerminalKind {
        self.kind
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.backend_name.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.process
            .as_ref()
            .is_some_and(|process| process.is_running())
    }

    /// The attached process, if it is still running.
    pub(crate) fn live_process(&self) -> Option<&Arc<PtyProcess>> {
        self.process.as_ref().filter(|process| process.is_running())
    }

    /// Drop the close callback without firing it.
    pub(crate) fn disarm(&self) {
        drop(take_close(&self.close_slot));
    }

    pub fn info(&self) -> TerminalInfo {
        TerminalInfo {
            session_id: self.session_id.clone(),
            kind: self.kind,
            created_at: self.created_at.clone(),
            attached: self.is_attached(),
        }
    }
}
