//! Local terminal pool: one manager per control-connection identity.
//!
//! Backend sessions outlive both the manager and the relay process, so the
//! pool can also enumerate and kill relay-named backend sessions system-wide.
//! A client reconnecting under a new identity uses this to find and reclaim
//! the terminals it owned before.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::relay::config::TerminalSettings;
use crate::relay::error::Result;
use crate::relay::types::{
    CloseCallback, DataCallback, ManagedTerminalInfo, TerminalInfo, TerminalKind,
    TerminalStartParams,
};

use super::backend::{SessionBackend, backend_session_name, parse_backend_name, select_backend};
use super::manager::{LocalTerminalManager, TerminalStarted};

pub struct LocalTerminalPool {
    backend: Arc<dyn SessionBackend>,
    settings: TerminalSettings,
    managers: DashMap<String, Arc<LocalTerminalManager>>,
}

impl LocalTerminalPool {
    /// Pool on the backend selected by `settings.backend`.
    pub fn new(settings: TerminalSettings) -> Self {
        let backend = select_backend(settings.backend);
        Self::with_backend(backend, settings)
    }

    pub fn with_backend(backend: Arc<dyn SessionBackend>, settings: TerminalSettings) -> Self {
        Self {
            backend,
            settings,
            managers: DashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn manager(&self, identity: &str) -> Option<Arc<LocalTerminalManager>> {
        self.managers.get(identity).map(|entry| entry.value().clone())
    }

    fn manager_or_create(&self, identity: &str) -> Arc<LocalTerminalManager> {
        self.managers
            .entry(identity.to_string())
            .or_insert_with(|| {
                Arc::new(LocalTerminalManager::new(
                    identity,
                    self.backend.clone(),
                    self.settings.clone(),
                ))
            })
            .value()
            .clone()
    }

    pub async fn start_terminal(
        &self,
        identity: &str,
        params: &TerminalStartParams,
        on_data: DataCallback,
        on_close: CloseCallback,
    ) -> Result<TerminalStarted> {
        self.manager_or_create(identity)
            .start_terminal(params, on_data, on_close)
            .await
    }

    /// Queue input; `false` when the terminal has no attached process.
    pub fn write(&self, identity: &str, session_id: &str, data: Vec<u8>) -> bool {
        self.manager(identity)
            .is_some_and(|manager| manager.write(session_id, data))
    }

    pub fn resize(&self, identity: &str, session_id: &str, cols: u16, rows: u16) -> bool {
        self.manager(identity)
            .is_some_and(|manager| manager.resize(session_id, cols, rows))
    }

    pub async fn close_terminal(&self, identity: &str, session_id: &str, kill: bool) -> bool {
        match self.manager(identity) {
            Some(manager) => manager.close_terminal(session_id, kill).await,
            None => false,
        }
    }

    pub fn list(&self, identity: &str) -> Vec<TerminalInfo> {
        self.manager(identity)
            .map(|manager| manager.list())
            .unwrap_or_default()
    }

    /// Every live relay-named backend session on this host.
    pub async fn list_managed(&self) -> Result<Vec<ManagedTerminalInfo>> {
        let names = self.backend.list().await?;
        Ok(names
            .into_iter()
            .filter_map(|name| {
                parse_backend_name(&name).map(|(kind, session_id)| ManagedTerminalInfo {
                    session_id,
                    kind,
                    backend_name: name,
                })
            })
            .collect())
    }

    /// Kill the backend session(s) of `session_id` without needing a pool entry.
    ///
    /// With no `kind`, both kinds are tried. Any local entry for the id is
    /// dropped too. Returns `true` if a backend session was killed.
    pub async fn kill_managed(&self, session_id: &str, kind: Option<TerminalKind>) -> Result<bool> {
        let kinds: Vec<TerminalKind> = match kind {
            Some(kind) => vec![kind],
            None => TerminalKind::ALL.to_vec(),
        };

        let managers: Vec<Arc<LocalTerminalManager>> =
            self.managers.iter().map(|e| e.value().clone()).collect();
        for manager in managers {
            manager.close_terminal(session_id, false).await;
        }

        let mut killed = false;
        for kind in kinds {
            let name = backend_session_name(kind, session_id);
            if self.backend.kill(&name).await? {
                info!("Killed managed terminal {}", name);
                killed = true;
            }
        }
        Ok(killed)
    }

    /// Control-connection teardown.
    ///
    /// With `kill` false backend sessions survive for a later re-attach.
    pub async fn remove_all(&self, identity: &str, kill: bool) {
        if let Some((_, manager)) = self.managers.remove(identity) {
            let count = manager.len();
            manager.remove_all(kill).await;
            if count > 0 {
                info!(
                    "Released {} local terminal(s) for {} (kill: {})",
                    count, identity, kill
                );
            }
        }
    }

    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::terminal::manager::tests::{FakeBackend, callbacks, read_until, settings, start_params};

    fn pool() -> (LocalTerminalPool, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        (LocalTerminalPool::with_backend(backend.clone(), settings()), backend)
    }

    mod identities {
        use super::*;

        #[tokio::test]
        async fn test_same_session_id_per_identity_is_independent() {
            let (pool, _) = pool();
            let (on_data, _rx, on_close, _) = callbacks();
            pool.start_terminal("c1", &start_params("t1", TerminalKind::PlainShell), on_data, on_close)
                .await
                .unwrap();

            assert_eq!(pool.list("c1").len(), 1);
            assert!(pool.list("c2").is_empty());
            assert!(!pool.write("c2", "t1", b"x".to_vec()));

            pool.remove_all("c1", true).await;
        }

        #[tokio::test]
        async fn test_reconnect_under_new_identity_reattaches() {
            let (pool, _) = pool();
            let (on_data, _rx, on_close, _) = callbacks();
            pool.start_terminal("old", &start_params("t1", TerminalKind::PlainShell), on_data, on_close)
                .await
                .unwrap();
            pool.remove_all("old", false).await;
            assert_eq!(pool.manager_count(), 0);

            let (on_data, mut rx, on_close, _) = callbacks();
            let started = pool
                .start_terminal("new", &start_params("t1", TerminalKind::PlainShell), on_data, on_close)
                .await
                .unwrap();
            assert!(started.reattached);
            assert!(pool.write("new", "t1", b"back\n".to_vec()));
            read_until(&mut rx, "back").await;

            pool.remove_all("new", true).await;
        }

        #[tokio::test]
        async fn test_close_unknown_identity() {
            let (pool, _) = pool();
            assert!(!pool.close_terminal("nobody", "t1", true).await);
            assert!(!pool.resize("nobody", "t1", 80, 24));
        }
    }

    mod managed {
        use super::*;

        #[tokio::test]
        async fn test_list_managed_filters_foreign_sessions() {
            let (pool, backend) = pool();
            backend.sessions.lock().unwrap().extend([
                "relay-shell-a".to_string(),
                "relay-assistant-b".to_string(),
                "main".to_string(),
            ]);

            let mut managed = pool.list_managed().await.unwrap();
            managed.sort_by(|a, b| a.session_id.cmp(&b.session_id));

            assert_eq!(
                managed,
                vec![
                    ManagedTerminalInfo {
                        session_id: "a".to_string(),
                        kind: TerminalKind::PlainShell,
                        backend_name: "relay-shell-a".to_string(),
                    },
                    ManagedTerminalInfo {
                        session_id: "b".to_string(),
                        kind: TerminalKind::AssistantCli,
                        backend_name: "relay-assistant-b".to_string(),
                    },
                ]
            );
        }

        #[tokio::test]
        async fn test_kill_removes_from_both_listings() {
            let (pool, backend) = pool();
            let (on_data, _rx, on_close, _) = callbacks();
            pool.start_terminal("c1", &start_params("t1", TerminalKind::PlainShell), on_data, on_close)
                .await
                .unwrap();
            assert_eq!(pool.list_managed().await.unwrap().len(), 1);

            assert!(pool.close_terminal("c1", "t1", true).await);

            assert!(pool.list("c1").is_empty());
            assert!(pool.list_managed().await.unwrap().is_empty());
            assert!(!backend.has("relay-shell-t1"));
        }

        #[tokio::test]
        async fn test_kill_managed_without_pool_entry() {
            let (pool, backend) = pool();
            backend
                .sessions
                .lock()
                .unwrap()
                .insert("relay-assistant-orphan".to_string());

            assert!(pool.kill_managed("orphan", None).await.unwrap());
            assert!(!backend.has("relay-assistant-orphan"));
            assert!(!pool.kill_managed("orphan", None).await.unwrap());
        }

        #[tokio::test]
        async fn test_kill_managed_drops_local_entry() {
            let (pool, backend) = pool();
            let (on_data, _rx, on_close, _) = callbacks();
            pool.start_terminal("c1", &start_params("t1", TerminalKind::PlainShell), on_data, on_close)
                .await
                .unwrap();

            assert!(
                pool.kill_managed("t1", Some(TerminalKind::PlainShell))
                    .await
                    .unwrap()
            );
            assert!(pool.list("c1").is_empty());
            assert!(!backend.has("relay-shell-t1"));
        }
    }
}
