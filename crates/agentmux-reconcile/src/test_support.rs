use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use agentmux_protocol::backend::{BackendSession, SessionBackend, SessionProbe};
use agentmux_protocol::error::{BackendError, BackendResult};
use agentmux_protocol::ids::WorkspaceId;
use agentmux_protocol::session::Workspace;

pub fn workspace(id: &str) -> Workspace {
    Workspace {
        id: WorkspaceId::new(id),
        name: id.to_owned(),
        root: PathBuf::from(format!("/tmp/checkouts/{id}")),
    }
}

#[derive(Debug, Clone)]
struct StubSession {
    alive: bool,
    exit_code: Option<i32>,
    last_activity: DateTime<Utc>,
}

/// In-memory session backend with per-operation call counters.
#[derive(Debug, Default)]
pub struct StubBackend {
    healthy: AtomicBool,
    sessions: Mutex<BTreeMap<String, StubSession>>,
    failing_prefixes: Mutex<Vec<String>>,
    health_calls: AtomicUsize,
    list_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    kill_calls: AtomicUsize,
}

impl StubBackend {
    pub fn healthy() -> Self {
        let backend = Self::default();
        backend.healthy.store(true, Ordering::SeqCst);
        backend
    }

    pub fn unhealthy() -> Self {
        Self::default()
    }

    pub fn add_session(&self, name: &str, alive: bool) {
        let mut sessions = self.sessions.lock().expect("stub session lock");
        sessions.insert(
            name.to_owned(),
            StubSession {
                alive,
                exit_code: None,
                last_activity: Utc::now(),
            },
        );
    }

    pub fn set_activity(&self, name: &str, last_activity: DateTime<Utc>) {
        let mut sessions = self.sessions.lock().expect("stub session lock");
        if let Some(session) = sessions.get_mut(name) {
            session.last_activity = last_activity;
        }
    }

    pub fn mark_dead(&self, name: &str, exit_code: Option<i32>) {
        let mut sessions = self.sessions.lock().expect("stub session lock");
        if let Some(session) = sessions.get_mut(name) {
            session.alive = false;
            session.exit_code = exit_code;
        }
    }

    pub fn has_session(&self, name: &str) -> bool {
        let sessions = self.sessions.lock().expect("stub session lock");
        sessions.contains_key(name)
    }

    pub fn fail_listing_for(&self, prefix: &str) {
        let mut failing = self.failing_prefixes.lock().expect("stub prefix lock");
        failing.push(prefix.to_owned());
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn backend_calls(&self) -> usize {
        self.list_calls() + self.probe_calls() + self.kill_calls()
    }
}

#[async_trait]
impl SessionBackend for StubBackend {
    async fn spawn_session(
        &self,
        name: &str,
        _workdir: &Path,
        _command: Option<&str>,
    ) -> BackendResult<()> {
        self.add_session(name, true);
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> BackendResult<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().expect("stub session lock");
        if sessions.remove(name).is_none() {
            return Err(BackendError::SessionNotFound(name.to_owned()));
        }
        Ok(())
    }

    async fn detach_session(&self, _name: &str) -> BackendResult<()> {
        Ok(())
    }

    fn attach_command(&self, name: &str) -> Vec<String> {
        vec!["stub-attach".to_owned(), name.to_owned()]
    }

    async fn list_sessions(&self, prefix: &str) -> BackendResult<Vec<BackendSession>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        {
            let failing = self.failing_prefixes.lock().expect("stub prefix lock");
            if failing.iter().any(|failing| failing == prefix) {
                return Err(BackendError::Timeout(format!("list-sessions {prefix}")));
            }
        }
        let sessions = self.sessions.lock().expect("stub session lock");
        Ok(sessions
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, session)| BackendSession {
                name: name.clone(),
                last_activity: Some(session.last_activity),
            })
            .collect())
    }

    async fn probe_session(&self, name: &str) -> BackendResult<SessionProbe> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let sessions = self.sessions.lock().expect("stub session lock");
        match sessions.get(name) {
            Some(session) => Ok(SessionProbe {
                alive: session.alive,
                exit_code: session.exit_code,
            }),
            None => Ok(SessionProbe {
                alive: false,
                exit_code: None,
            }),
        }
    }

    async fn health_check(&self) -> BackendResult<()> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::BinaryNotFound("tmux".to_owned()))
        }
    }
}
