//! Per-identity local terminal state machine.
//!
//! ```text
//! absent -> attached -> detached <-> attached -> removed
//! ```
//!
//! - **start** on an absent id attaches to (or creates) the backend session,
//!   or spawns the target process directly when the backend is not persistent.
//! - The attached process exiting moves a persistent session to **detached**:
//!   the entry stays so a later start can re-attach. Direct sessions are
//!   removed instead, since nothing survives their process.
//! - **start** on a detached id re-attaches if the backend session still
//!   exists, and fails otherwise.
//! - **close** removes the entry. Without `kill` only the local attach
//!   process dies and the backend session can be revived by id later.
//!
//! Output produced by a backend session while it is detached is not replayed
//! on re-attach beyond what the multiplexer itself redraws.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::relay::config::TerminalSettings;
use crate::relay::error::{RelayError, Result};
use crate::relay::types::{
    CloseCallback, DataCallback, TerminalInfo, TerminalKind, TerminalStartParams,
};

use super::assistant::{default_shell, invocation_line, resolve_assistant_cli};
use super::backend::{AttachRequest, SessionBackend, backend_session_name};
use super::pty::{ExitCallback, PtyProcess};
use super::session::{CloseSlot, LocalTerminalSession, arm, take_close};

/// Outcome of a successful [`LocalTerminalManager::start_terminal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalStarted {
    /// Persistent backend session the terminal runs in
    pub backend_name: Option<String>,
    /// Attached to a backend session that already existed
    pub reattached: bool,
}

/// The local terminals of one control-connection identity.
pub struct LocalTerminalManager {
    identity: String,
    backend: Arc<dyn SessionBackend>,
    settings: TerminalSettings,
    sessions: Arc<DashMap<String, LocalTerminalSession>>,
    next_generation: AtomicU64,
}

/// What a start resolved to before anything is spawned.
struct StartPlan {
    kind: TerminalKind,
    created_at: String,
    backend_name: Option<String>,
    reattached: bool,
}

impl LocalTerminalManager {
    pub fn new(
        identity: impl Into<String>,
        backend: Arc<dyn SessionBackend>,
        settings: TerminalSettings,
    ) -> Self {
        Self {
            identity: identity.into(),
            backend,
            settings,
            sessions: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start or re-attach the terminal `params.session_id`.
    ///
    /// Output goes to `on_data`. `on_close` fires once if the attached
    /// process ends on its own; an explicit [`close_terminal`] disarms it.
    ///
    /// [`close_terminal`]: LocalTerminalManager::close_terminal
    pub async fn start_terminal(
        &self,
        params: &TerminalStartParams,
        on_data: DataCallback,
        on_close: CloseCallback,
    ) -> Result<TerminalStarted> {
        let session_id = params.session_id.as_str();
        let plan = self.plan_start(params).await?;
        let persistent = self.backend.is_persistent();

        let request = self.attach_request(params, plan.kind);
        let name = plan
            .backend_name
            .clone()
            .unwrap_or_else(|| session_id.to_string());
        let command = self.backend.attach_command(&name, &request);

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let close_slot = arm(on_close);
        let on_exit = self.exit_handler(session_id, generation, close_slot.clone());

        let process = Arc::new(PtyProcess::spawn(
            command,
            params.cols,
            params.rows,
            on_data,
            on_exit,
        )?);

        let session = LocalTerminalSession {
            session_id: session_id.to_string(),
            kind: plan.kind,
            created_at: plan.created_at,
            backend_name: plan.backend_name.clone(),
            process: Some(process.clone()),
            generation,
            close_slot: close_slot.clone(),
        };

        match self.sessions.entry(session_id.to_string()) {
            // A concurrent start for the same id attached first
            Entry::Occupied(existing) if existing.get().is_attached() => {
                drop(take_close(&close_slot));
                process.kill();
                return Err(RelayError::DuplicateSession(session_id.to_string()));
            }
            Entry::Occupied(mut existing) => {
                existing.insert(session);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
        }

        // Exited before it was recorded; nothing left to keep for a direct session
        if !persistent && !process.is_running() {
            self.sessions
                .remove_if(session_id, |_, s| s.generation == generation);
        }

        if persistent && !plan.reattached && plan.kind == TerminalKind::AssistantCli {
            self.type_invocation(process, &request);
        }

        info!(
            "Terminal {} ({}) {} for {} via {}",
            session_id,
            plan.kind,
            if plan.reattached { "re-attached" } else { "started" },
            self.identity,
            self.backend.name()
        );

        Ok(TerminalStarted {
            backend_name: plan.backend_name,
            reattached: plan.reattached,
        })
    }

    async fn plan_start(&self, params: &TerminalStartParams) -> Result<StartPlan> {
        let session_id = params.session_id.as_str();

        let existing = self.sessions.get(session_id).map(|entry| {
            (
                entry.is_attached(),
                entry.kind,
                entry.created_at.clone(),
                entry.backend_name.clone(),
            )
        });

        match existing {
            Some((true, ..)) => Err(RelayError::DuplicateSession(session_id.to_string())),
            Some((false, kind, created_at, Some(name))) => {
                if self.backend.exists(&name).await {
                    Ok(StartPlan {
                        kind,
                        created_at,
                        backend_name: Some(name),
                        reattached: true,
                    })
                } else {
                    self.sessions.remove_if(session_id, |_, s| !s.is_attached());
                    warn!("Backend session {} for terminal {} is gone", name, session_id);
                    Err(RelayError::Backend(format!(
                        "Backend session '{}' no longer exists",
                        name
                    )))
                }
            }
            // A dead direct session can only be started fresh
            Some((false, _, _, None)) => {
                self.sessions.remove_if(session_id, |_, s| !s.is_attached());
                self.fresh_plan(params).await
            }
            None => self.fresh_plan(params).await,
        }
    }

    async fn fresh_plan(&self, params: &TerminalStartParams) -> Result<StartPlan> {
        let created_at = chrono::Utc::now().to_rfc3339();
        if !self.backend.is_persistent() {
            return Ok(StartPlan {
                kind: params.kind,
                created_at,
                backend_name: None,
                reattached: false,
            });
        }

        let name = backend_session_name(params.kind, &params.session_id);
        let reattached = self.backend.exists(&name).await;
        Ok(StartPlan {
            kind: params.kind,
            created_at,
            backend_name: Some(name),
            reattached,
        })
    }

    fn attach_request(&self, params: &TerminalStartParams, kind: TerminalKind) -> AttachRequest {
        let cwd = params.cwd.as_ref().map(PathBuf::from);
        match kind {
            TerminalKind::PlainShell => {
                // Multiplexers start their own shell and take no shell arguments
                let args = if self.backend.is_persistent() {
                    if !params.extra_args.is_empty() {
                        debug!(
                            "Ignoring extra args {:?} for shell {} on {} backend",
                            params.extra_args,
                            params.session_id,
                            self.backend.name()
                        );
                    }
                    Vec::new()
                } else {
                    params.extra_args.clone()
                };
                AttachRequest {
                    cwd,
                    program: default_shell(),
                    args,
                }
            }
            TerminalKind::AssistantCli => AttachRequest {
                cwd,
                program: resolve_assistant_cli(&self.settings.assistant_cli),
                args: params.extra_args.clone(),
            },
        }
    }

    /// Exit of one attachment: detach or drop the entry, then fire `on_close`.
    fn exit_handler(
        &self,
        session_id: &str,
        generation: u64,
        close_slot: CloseSlot,
    ) -> ExitCallback {
        let sessions = self.sessions.clone();
        let persistent = self.backend.is_persistent();
        let session_id = session_id.to_string();

        Box::new(move |code| {
            if persistent {
                if let Some(mut entry) = sessions.get_mut(&session_id)
                    && entry.generation == generation
                {
                    entry.process = None;
                    info!("Terminal {} detached (exit {:?})", session_id, code);
                }
            } else if sessions
                .remove_if(&session_id, |_, s| s.generation == generation)
                .is_some()
            {
                info!("Terminal {} exited ({:?})", session_id, code);
            }

            if let Some(on_close) = take_close(&close_slot) {
                on_close();
            }
        })
    }

    /// Type the CLI invocation into a freshly created backend session.
    fn type_invocation(&self, process: Arc<PtyProcess>, request: &AttachRequest) {
        let line = invocation_line(&request.program, &request.args);
        let delay = self.settings.assistant_launch_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !process.write(line.into_bytes()) {
                debug!("Terminal exited before the assistant could be launched");
            }
        });
    }

    /// Queue input. Returns `false` if the session has no attached process.
    pub fn write(&self, session_id: &str, data: Vec<u8>) -> bool {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.live_process().map(|process| process.write(data)))
            .unwrap_or(false)
    }

    /// Returns `false` if the session has no attached process.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.live_process().map(|process| process.resize(cols, rows)))
            .unwrap_or(false)
    }

    /// Remove a terminal. `kill` also terminates its backend session.
    ///
    /// Returns `false` if the id was unknown.
    pub async fn close_terminal(&self, session_id: &str, kill: bool) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };

        session.disarm();
        if let Some(process) = &session.process {
            process.kill();
        }

        if kill && let Some(name) = &session.backend_name {
            match self.backend.kill(name).await {
                Ok(true) => info!("Killed backend session {}", name),
                Ok(false) => debug!("Backend session {} was already gone", name),
                Err(e) => warn!("Failed to kill backend session {}: {}", name, e),
            }
        } else {
            info!("Terminal {} closed for {}", session_id, self.identity);
        }
        true
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        self.sessions.iter().map(|entry| entry.value().info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every terminal, each independently of the others.
    pub async fn remove_all(&self, kill: bool) {
        let session_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        futures::future::join_all(
            session_ids
                .iter()
                .map(|session_id| self.close_terminal(session_id, kill)),
        )
        .await;
    }
}
