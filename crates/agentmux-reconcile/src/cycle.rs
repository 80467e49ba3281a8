use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use agentmux_config::SyncConfig;
use agentmux_protocol::backend::SessionBackend;
use agentmux_protocol::event::{
    AppEvent, ErrorEvent, SessionStoppedEvent, SessionSyncReport, TabAction,
};
use agentmux_protocol::ids::WorkspaceId;
use agentmux_protocol::session::{SessionTab, TabStatus, Workspace};
use agentmux_pump::MessagePump;
use agentmux_store::{SessionStore, StoreResult, WorkspaceSnapshot};
use agentmux_supervisor::{spawn_command, CommandError};

use crate::model::TabModel;
use crate::sync::{run_sync_pass, KnownSession, SyncSnapshot};

/// A pass that has not reported back after this long is considered lost and
/// no longer blocks new passes.
const SYNC_PASS_STUCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub gc_sweep: Duration,
    pub session_retention: Duration,
    pub debounce: Duration,
    pub self_save_window: Duration,
}

impl From<&SyncConfig> for ReconcilerConfig {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            interval: sync.interval(),
            gc_sweep: sync.gc_sweep(),
            session_retention: sync.session_retention(),
            debounce: sync.debounce(),
            self_save_window: sync.self_save_window(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// The consumer half of the reconciliation cycle.
///
/// Owned by the single consumer loop; every method runs inside it, so the
/// tab model, dirty set and local-save markers need no locks. All external
/// work is snapshotted out to a background pass and comes back as a
/// [`SessionSyncReport`] through the pump.
pub struct Reconciler {
    config: ReconcilerConfig,
    backend: Arc<dyn SessionBackend>,
    store: SessionStore,
    pump: Arc<MessagePump>,
    workspaces: Vec<Workspace>,
    model: TabModel,
    token: u64,
    sync_started_at: Option<Instant>,
    backend_available: Option<bool>,
    last_stale_sweep: Option<Instant>,
    dirty: BTreeSet<WorkspaceId>,
    debounce_armed: bool,
    local_saves: HashMap<WorkspaceId, Instant>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        backend: Arc<dyn SessionBackend>,
        store: SessionStore,
        pump: Arc<MessagePump>,
        workspaces: Vec<Workspace>,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            pump,
            workspaces,
            model: TabModel::default(),
            token: 0,
            sync_started_at: None,
            backend_available: None,
            last_stale_sweep: None,
            dirty: BTreeSet::new(),
            debounce_armed: false,
            local_saves: HashMap::new(),
        }
    }

    pub fn model(&self) -> &TabModel {
        &self.model
    }

    pub fn current_token(&self) -> u64 {
        self.token
    }

    pub fn has_unpersisted_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub(crate) fn stale_sweep_due(&self) -> bool {
        match self.last_stale_sweep {
            None => true,
            Some(last_run) => last_run.elapsed() >= self.config.gc_sweep,
        }
    }

    /// Rehydrates persisted records at startup. Statuses are kept as
    /// persisted; the first status-sync pass corrects them against ground
    /// truth.
    pub fn load_persisted(&mut self) -> StoreResult<usize> {
        let mut loaded = 0;
        for workspace in &self.workspaces {
            let Some(snapshot) = self.store.load(&workspace.id)? else {
                continue;
            };
            for tab in snapshot.sessions {
                self.model.insert(tab);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Issues the next tick carrying the current token; a config change in
    /// the meantime turns the tick into a stale no-op on arrival.
    pub fn schedule_next_tick(&self) {
        let token = self.token;
        let interval = self.config.interval;
        let enqueue_pump = Arc::clone(&self.pump);
        spawn_command(Arc::clone(&self.pump), "sync-tick", async move {
            tokio::time::sleep(interval).await;
            enqueue_pump.enqueue(AppEvent::SyncTick { token });
            Ok::<(), CommandError>(())
        });
    }

    /// Applies a runtime interval override. Increments the token so any
    /// in-flight tick or pass issued under the old cadence is discarded.
    pub fn set_interval(&mut self, interval: Duration) {
        self.token += 1;
        self.config.interval = interval;
        tracing::info!(
            interval_secs = interval.as_secs(),
            token = self.token,
            "sync interval changed"
        );
        self.schedule_next_tick();
    }

    /// Routes one pump delivery. Events this subsystem does not own are
    /// handed back for the UI shell.
    pub fn handle_event(&mut self, event: AppEvent) -> Option<AppEvent> {
        match event {
            AppEvent::SyncTick { token } => {
                self.handle_tick(token);
                None
            }
            AppEvent::SyncReport(report) => {
                self.handle_report(report);
                None
            }
            AppEvent::FlushDirty => {
                self.handle_flush();
                None
            }
            AppEvent::PathChanged { path } => {
                self.handle_path_changed(&path);
                None
            }
            AppEvent::Action(action) => {
                self.handle_action(action);
                None
            }
            other => Some(other),
        }
    }

    pub fn handle_tick(&mut self, token: u64) {
        if token != self.token {
            tracing::trace!(
                tick_token = token,
                current_token = self.token,
                "dropping stale sync tick"
            );
            return;
        }

        // Reschedule before anything can fail so the cycle never stalls.
        self.schedule_next_tick();

        if self.backend_available == Some(false) {
            return;
        }
        if let Some(started_at) = self.sync_started_at {
            if started_at.elapsed() < SYNC_PASS_STUCK_TIMEOUT {
                tracing::debug!("sync pass already in flight, skipping tick");
                return;
            }
            tracing::warn!("previous sync pass never reported, starting a new one");
        }

        self.sync_started_at = Some(Instant::now());
        let snapshot = self.sync_snapshot();
        let backend = Arc::clone(&self.backend);
        let report_pump = Arc::clone(&self.pump);
        spawn_command(Arc::clone(&self.pump), "session-sync", async move {
            let report = run_sync_pass(backend, snapshot).await;
            report_pump.enqueue(AppEvent::SyncReport(report));
            Ok::<(), CommandError>(())
        });
    }

    pub fn handle_report(&mut self, report: SessionSyncReport) {
        self.sync_started_at = None;

        if report.token != self.token {
            tracing::trace!(
                report_token = report.token,
                current_token = self.token,
                "discarding stale sync report"
            );
            return;
        }
        if report.backend_unavailable {
            self.backend_available = Some(false);
            tracing::warn!("session backend unavailable, reconciliation suspended");
            return;
        }
        self.backend_available = Some(true);
        if report.stale_sweep_ran {
            self.last_stale_sweep = Some(Instant::now());
        }

        let now = Utc::now();

        for discovered in report.discovered {
            if self
                .model
                .find_by_backend_session(&discovered.backend_session)
                .is_some()
            {
                continue;
            }
            tracing::info!(
                session = discovered.backend_session.as_str(),
                workspace = discovered.workspace_id.as_str(),
                "adopted out-of-band session"
            );
            self.model.insert(SessionTab::adopted(
                discovered.workspace_id.clone(),
                discovered.backend_session,
                now,
            ));
            self.mark_dirty(discovered.workspace_id);
        }

        for probed in report.probed {
            let Some(tab) = self
                .model
                .find_by_backend_session_mut(&probed.backend_session)
            else {
                continue;
            };
            if !probed.probe.alive && tab.status != TabStatus::Stopped {
                tab.status = TabStatus::Stopped;
                tab.stopped_at = Some(now);
                tab.exit_code = probed.probe.exit_code;
                let stopped = SessionStoppedEvent {
                    workspace_id: tab.workspace_id.clone(),
                    backend_session: tab.backend_session.clone(),
                    exit_code: tab.exit_code,
                };
                let workspace_id = tab.workspace_id.clone();
                tracing::info!(
                    session = stopped.backend_session.as_str(),
                    "tracked session stopped"
                );
                self.pump.enqueue(AppEvent::SessionStopped(stopped));
                self.mark_dirty(workspace_id);
            } else if probed.probe.alive && tab.status == TabStatus::Stopped {
                tab.status = TabStatus::Running;
                tab.stopped_at = None;
                tab.exit_code = None;
                let workspace_id = tab.workspace_id.clone();
                self.mark_dirty(workspace_id);
            }
        }

        for error in report.workspace_errors {
            tracing::warn!(
                workspace = error.workspace_id.as_str(),
                detail = error.detail.as_str(),
                "workspace sync error"
            );
            self.pump.enqueue(AppEvent::Error(ErrorEvent {
                source: format!("session-sync:{}", error.workspace_id.as_str()),
                detail: error.detail,
            }));
        }

        self.arm_debounce();
    }

    /// Drains the dirty set: one write per workspace, tagged with the
    /// Local-Save Marker so the watcher can recognize self-writes.
    pub fn handle_flush(&mut self) {
        self.debounce_armed = false;
        let dirty = std::mem::take(&mut self.dirty);
        for workspace_id in dirty {
            let Some(workspace) = self
                .workspaces
                .iter()
                .find(|workspace| workspace.id == workspace_id)
                .cloned()
            else {
                continue;
            };
            let snapshot = WorkspaceSnapshot {
                workspace,
                sessions: self.model.workspace_tabs(&workspace_id).to_vec(),
            };
            match self.store.save(&snapshot) {
                Ok(()) => {
                    self.local_saves.insert(workspace_id, Instant::now());
                }
                Err(error) => {
                    tracing::error!(
                        workspace = workspace_id.as_str(),
                        error = %error,
                        "failed to persist workspace session state"
                    );
                    self.pump.enqueue(AppEvent::Error(ErrorEvent {
                        source: format!("save:{}", workspace_id.as_str()),
                        detail: error.to_string(),
                    }));
                }
            }
        }
    }

    pub fn handle_path_changed(&mut self, path: &Path) {
        let Some(workspace_id) = self.workspace_for_path(path) else {
            return;
        };
        if let Some(saved_at) = self.local_saves.get(&workspace_id) {
            if saved_at.elapsed() <= self.config.self_save_window {
                tracing::trace!(
                    workspace = workspace_id.as_str(),
                    "ignoring self-originated state file change"
                );
                return;
            }
        }

        // Externally-originated write (another instance, manual edit):
        // adopt records we do not know about; the next status-sync settles
        // their liveness.
        match self.store.load(&workspace_id) {
            Ok(Some(snapshot)) => {
                for tab in snapshot.sessions {
                    if self
                        .model
                        .find_by_backend_session(&tab.backend_session)
                        .is_none()
                    {
                        tracing::info!(
                            session = tab.backend_session.as_str(),
                            workspace = workspace_id.as_str(),
                            "adopted session from external state change"
                        );
                        self.model.insert(tab);
                    }
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    workspace = workspace_id.as_str(),
                    error = %error,
                    "failed to reload externally changed state"
                );
            }
        }
    }

    pub fn handle_action(&mut self, action: TabAction) {
        match action {
            TabAction::Launch {
                workspace_id,
                tab_name,
                command,
            } => {
                let Some(workspace) = self
                    .workspaces
                    .iter()
                    .find(|workspace| workspace.id == workspace_id)
                    .cloned()
                else {
                    tracing::warn!(
                        workspace = workspace_id.as_str(),
                        "launch requested for unknown workspace"
                    );
                    return;
                };
                let session_name = workspace.session_name(&tab_name);
                if self.model.find_by_backend_session(&session_name).is_some() {
                    tracing::warn!(
                        session = session_name.as_str(),
                        "launch requested for an existing session"
                    );
                    return;
                }

                self.model.insert(SessionTab::adopted(
                    workspace_id.clone(),
                    session_name.clone(),
                    Utc::now(),
                ));
                let backend = Arc::clone(&self.backend);
                spawn_command(Arc::clone(&self.pump), "launch-session", async move {
                    backend
                        .spawn_session(&session_name, &workspace.root, command.as_deref())
                        .await
                        .map_err(|error| CommandError::Failed(error.to_string()))
                });
                self.mark_dirty(workspace_id);
                self.arm_debounce();
            }
            TabAction::Close { workspace_id, tab_id } => {
                let Some(tab) = self.model.remove(&workspace_id, &tab_id) else {
                    return;
                };
                let backend = Arc::clone(&self.backend);
                let session = tab.backend_session.clone();
                spawn_command(Arc::clone(&self.pump), "close-session", async move {
                    backend
                        .kill_session(&session)
                        .await
                        .map_err(|error| CommandError::Failed(error.to_string()))
                });
                self.mark_dirty(workspace_id);
                self.arm_debounce();
            }
            TabAction::Detach { workspace_id, tab_id } => {
                let Some(tab) = self.model.find_mut(&workspace_id, &tab_id) else {
                    return;
                };
                if tab.status != TabStatus::Running {
                    return;
                }
                tab.status = TabStatus::Detached;
                let backend = Arc::clone(&self.backend);
                let session = tab.backend_session.clone();
                spawn_command(Arc::clone(&self.pump), "detach-session", async move {
                    backend
                        .detach_session(&session)
                        .await
                        .map_err(|error| CommandError::Failed(error.to_string()))
                });
                self.mark_dirty(workspace_id);
                self.arm_debounce();
            }
            TabAction::Reattach { workspace_id, tab_id } => {
                let Some(tab) = self.model.find_mut(&workspace_id, &tab_id) else {
                    return;
                };
                if tab.status != TabStatus::Detached {
                    return;
                }
                tab.status = TabStatus::Running;
                self.mark_dirty(workspace_id);
                self.arm_debounce();
            }
        }
    }

    fn mark_dirty(&mut self, workspace_id: WorkspaceId) {
        self.dirty.insert(workspace_id);
    }

    /// Arms the debounce timer once; rapid successive changes coalesce into
    /// a single flush.
    fn arm_debounce(&mut self) {
        if self.dirty.is_empty() || self.debounce_armed {
            return;
        }
        self.debounce_armed = true;
        let debounce = self.config.debounce;
        let enqueue_pump = Arc::clone(&self.pump);
        spawn_command(Arc::clone(&self.pump), "save-debounce", async move {
            tokio::time::sleep(debounce).await;
            enqueue_pump.enqueue(AppEvent::FlushDirty);
            Ok::<(), CommandError>(())
        });
    }

    fn sync_snapshot(&self) -> SyncSnapshot {
        let persisted_workspace_ids = self.store.list_workspace_ids().unwrap_or_else(|error| {
            tracing::warn!(error = %error, "failed to list persisted workspaces");
            Vec::new()
        });
        SyncSnapshot {
            token: self.token,
            probe_availability: self.backend_available.is_none(),
            workspaces: self.workspaces.clone(),
            known_sessions: self
                .model
                .iter()
                .map(|tab| KnownSession {
                    workspace_id: tab.workspace_id.clone(),
                    backend_session: tab.backend_session.clone(),
                })
                .collect(),
            persisted_workspace_ids,
            run_stale_sweep: self.stale_sweep_due(),
            session_retention: self.config.session_retention,
            now: Utc::now(),
        }
    }

    fn workspace_for_path(&self, path: &Path) -> Option<WorkspaceId> {
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        self.workspaces
            .iter()
            .find(|workspace| workspace.id.as_str() == stem)
            .map(|workspace| workspace.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use agentmux_protocol::event::{AppEvent, SessionSyncReport, TabAction};
    use agentmux_protocol::ids::{TabId, WorkspaceId};
    use agentmux_protocol::session::TabStatus;
    use agentmux_pump::MessagePump;
    use agentmux_store::SessionStore;

    use crate::test_support::{workspace, StubBackend};

    use super::{Reconciler, ReconcilerConfig};

    const TEST_TIMEOUT: Duration = Duration::from_secs(30);

    struct Harness {
        reconciler: Reconciler,
        backend: Arc<StubBackend>,
        receiver: mpsc::UnboundedReceiver<AppEvent>,
        shutdown: CancellationToken,
        store: SessionStore,
        _store_dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(workspaces: Vec<&str>, backend: StubBackend) -> Self {
            let backend = Arc::new(backend);
            let pump = Arc::new(MessagePump::default());
            let (sender, receiver) = mpsc::unbounded_channel();
            pump.set_message_sender(sender).expect("register sender");
            let shutdown = CancellationToken::new();
            {
                let pump = Arc::clone(&pump);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pump.run(shutdown).await });
            }

            let store_dir = tempfile::tempdir().expect("create temp store dir");
            let store = SessionStore::new(store_dir.path());
            let reconciler = Reconciler::new(
                ReconcilerConfig::default(),
                backend.clone(),
                store.clone(),
                pump,
                workspaces.into_iter().map(workspace).collect(),
            );

            Self {
                reconciler,
                backend,
                receiver,
                shutdown,
                store,
                _store_dir: store_dir,
            }
        }

        /// Receives pump deliveries, routing reconciler-owned events into the
        /// reconciler, until `predicate` matches a passed-through or routed
        /// event. Unrelated events keep flowing like in the real consumer.
        async fn drive_until(&mut self, predicate: impl Fn(&AppEvent) -> bool) -> AppEvent {
            timeout(TEST_TIMEOUT, async {
                loop {
                    let event = self
                        .receiver
                        .recv()
                        .await
                        .expect("pump consumer stays alive");
                    let matched = predicate(&event);
                    let passthrough = self.reconciler.handle_event(event.clone());
                    if matched {
                        return event;
                    }
                    drop(passthrough);
                }
            })
            .await
            .expect("expected event never arrived")
        }

        async fn drive_one_sync_pass(&mut self) {
            let token = self.reconciler.current_token();
            self.reconciler.handle_tick(token);
            self.drive_until(|event| matches!(event, AppEvent::SyncReport(_)))
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_adopts_external_sessions_as_running_records() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        backend.add_session("ws1-agent-b", true);
        let mut harness = Harness::new(vec!["ws1"], backend);
        assert!(harness.reconciler.model().is_empty());

        harness.drive_one_sync_pass().await;

        let model = harness.reconciler.model();
        assert_eq!(model.len(), 2);
        let names: Vec<&str> = model
            .workspace_tabs(&WorkspaceId::new("ws1"))
            .iter()
            .map(|tab| tab.backend_session.as_str())
            .collect();
        assert_eq!(names, vec!["ws1-agent-a", "ws1-agent-b"]);
        assert_eq!(model.running_count(), 2);

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn externally_killed_session_stops_and_emits_one_critical_event() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        harness.drive_one_sync_pass().await;
        assert_eq!(harness.reconciler.model().running_count(), 1);

        harness.backend.mark_dead("ws1-agent-a", Some(137));
        harness.drive_one_sync_pass().await;

        let stopped = harness
            .drive_until(|event| matches!(event, AppEvent::SessionStopped(_)))
            .await;
        match stopped {
            AppEvent::SessionStopped(event) => {
                assert_eq!(event.backend_session, "ws1-agent-a");
                assert_eq!(event.exit_code, Some(137));
            }
            other => panic!("expected session stopped, got {other:?}"),
        }

        let record = harness
            .reconciler
            .model()
            .find_by_backend_session("ws1-agent-a")
            .expect("record kept");
        assert_eq!(record.status, TabStatus::Stopped);
        assert_eq!(record.exit_code, Some(137));
        assert!(record.stopped_at.is_some());

        // A further pass must not emit a second stopped event.
        harness.drive_one_sync_pass().await;
        harness.reconciler.handle_flush();
        while let Ok(event) = harness.receiver.try_recv() {
            assert!(
                !matches!(event, AppEvent::SessionStopped(_)),
                "duplicate stopped event"
            );
            harness.reconciler.handle_event(event);
        }

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_token_tick_performs_no_side_effects_and_does_not_reschedule() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        let stale_token = harness.reconciler.current_token() + 5;
        harness.reconciler.handle_tick(stale_token);

        let outcome = timeout(Duration::from_secs(60), harness.receiver.recv()).await;
        assert!(outcome.is_err(), "stale tick produced activity: {outcome:?}");
        assert_eq!(harness.backend.backend_calls(), 0);
        assert_eq!(harness.backend.health_calls(), 0);
        assert!(harness.reconciler.model().is_empty());

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn interval_change_invalidates_in_flight_ticks() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        let old_token = harness.reconciler.current_token();
        harness.reconciler.set_interval(Duration::from_secs(3));
        assert_eq!(harness.reconciler.current_token(), old_token + 1);

        // A tick issued before the change arrives late: complete no-op.
        harness.reconciler.handle_tick(old_token);
        assert_eq!(harness.backend.backend_calls(), 0);

        // The fresh tick scheduled by the change drives a pass as usual.
        harness
            .drive_until(|event| matches!(event, AppEvent::SyncReport(_)))
            .await;
        assert_eq!(harness.reconciler.model().len(), 1);

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_backend_skips_sync_work_but_still_reschedules() {
        let backend = StubBackend::unhealthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        let token = harness.reconciler.current_token();
        harness.reconciler.handle_tick(token);
        harness
            .drive_until(|event| matches!(event, AppEvent::SyncReport(_)))
            .await;

        // Availability was probed once and cached; no sync work happened.
        assert_eq!(harness.backend.health_calls(), 1);
        assert_eq!(harness.backend.backend_calls(), 0);
        assert!(harness.reconciler.model().is_empty());

        // Later ticks keep rescheduling without touching the backend.
        harness
            .drive_until(|event| matches!(event, AppEvent::SyncTick { .. }))
            .await;
        harness
            .drive_until(|event| matches!(event, AppEvent::SyncTick { .. }))
            .await;
        assert_eq!(harness.backend.health_calls(), 1);
        assert_eq!(harness.backend.backend_calls(), 0);

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_run_a_single_sync_pass() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        let token = harness.reconciler.current_token();
        harness.reconciler.handle_tick(token);
        harness.reconciler.handle_tick(token);

        harness
            .drive_until(|event| matches!(event, AppEvent::SyncReport(_)))
            .await;
        assert_eq!(harness.backend.list_calls(), 1);

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_changes_coalesce_into_one_debounced_flush() {
        let backend = StubBackend::healthy();
        let mut harness = Harness::new(vec!["ws1"], backend);
        let token = harness.reconciler.current_token();

        let report_a = SessionSyncReport {
            token,
            discovered: vec![agentmux_protocol::event::DiscoveredSession {
                workspace_id: WorkspaceId::new("ws1"),
                backend_session: "ws1-agent-a".to_owned(),
            }],
            ..SessionSyncReport::default()
        };
        let report_b = SessionSyncReport {
            token,
            discovered: vec![agentmux_protocol::event::DiscoveredSession {
                workspace_id: WorkspaceId::new("ws1"),
                backend_session: "ws1-agent-b".to_owned(),
            }],
            ..SessionSyncReport::default()
        };

        harness.reconciler.handle_report(report_a);
        harness.reconciler.handle_report(report_b);
        assert!(harness.reconciler.has_unpersisted_changes());

        harness
            .drive_until(|event| matches!(event, AppEvent::FlushDirty))
            .await;
        assert!(!harness.reconciler.has_unpersisted_changes());

        // Exactly one flush: both records landed in a single write.
        let outcome = timeout(Duration::from_secs(2), harness.receiver.recv()).await;
        assert!(outcome.is_err(), "unexpected second flush: {outcome:?}");

        let persisted = harness
            .store
            .load(&WorkspaceId::new("ws1"))
            .expect("load persisted")
            .expect("document written");
        assert_eq!(persisted.sessions.len(), 2);

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_state_round_trips_through_the_debounce_path() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        harness.drive_one_sync_pass().await;
        harness.backend.mark_dead("ws1-agent-a", Some(0));
        harness.drive_one_sync_pass().await;
        harness
            .drive_until(|event| matches!(event, AppEvent::FlushDirty))
            .await;

        let original = harness
            .reconciler
            .model()
            .find_by_backend_session("ws1-agent-a")
            .expect("record present")
            .clone();

        let mut reloaded = Reconciler::new(
            ReconcilerConfig::default(),
            harness.backend.clone(),
            harness.store.clone(),
            Arc::new(MessagePump::default()),
            vec![workspace("ws1")],
        );
        reloaded.load_persisted().expect("load persisted");

        let restored = reloaded
            .model()
            .find_by_backend_session("ws1-agent-a")
            .expect("record restored");
        assert_eq!(restored.backend_session, original.backend_session);
        assert_eq!(restored.status, original.status);
        assert_eq!(restored.started_at, original.started_at);
        assert_eq!(restored.stopped_at, original.stopped_at);
        assert_eq!(restored.exit_code, original.exit_code);

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn self_originated_state_changes_are_suppressed_by_the_marker() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        harness.drive_one_sync_pass().await;
        harness
            .drive_until(|event| matches!(event, AppEvent::FlushDirty))
            .await;

        // Simulate another instance adding a record to the same document.
        let mut external = harness
            .store
            .load(&WorkspaceId::new("ws1"))
            .expect("load")
            .expect("present");
        external.sessions.push(agentmux_protocol::session::SessionTab::adopted(
            WorkspaceId::new("ws1"),
            "ws1-agent-ext",
            chrono::Utc::now(),
        ));
        harness.store.save(&external).expect("external save");

        let state_path = harness.store.root().join("ws1.json");

        // Within the self-save window the change is treated as our own.
        harness.reconciler.handle_path_changed(&state_path);
        assert!(harness
            .reconciler
            .model()
            .find_by_backend_session("ws1-agent-ext")
            .is_none());

        // Past the window it is external and the record is adopted.
        tokio::time::advance(Duration::from_secs(5)).await;
        harness.reconciler.handle_path_changed(&state_path);
        assert!(harness
            .reconciler
            .model()
            .find_by_backend_session("ws1-agent-ext")
            .is_some());

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sweep_is_gated_between_passes() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);

        assert!(harness.reconciler.stale_sweep_due());
        harness.drive_one_sync_pass().await;
        assert!(!harness.reconciler.stale_sweep_due());

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn close_action_removes_the_record_and_kills_the_session() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);
        harness.drive_one_sync_pass().await;

        harness.reconciler.handle_action(TabAction::Close {
            workspace_id: WorkspaceId::new("ws1"),
            tab_id: TabId::new("ws1-agent-a"),
        });

        assert!(harness.reconciler.model().is_empty());
        timeout(TEST_TIMEOUT, async {
            while harness.backend.has_session("ws1-agent-a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend session was never killed");

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn launch_action_spawns_the_backend_session_and_creates_a_record() {
        let backend = StubBackend::healthy();
        let mut harness = Harness::new(vec!["ws1"], backend);

        harness.reconciler.handle_action(TabAction::Launch {
            workspace_id: WorkspaceId::new("ws1"),
            tab_name: "agent-a".to_owned(),
            command: Some("claude".to_owned()),
        });

        let record = harness
            .reconciler
            .model()
            .find_by_backend_session("ws1-agent-a")
            .expect("record created");
        assert_eq!(record.display_name, "agent-a");
        assert_eq!(record.status, TabStatus::Running);

        timeout(TEST_TIMEOUT, async {
            while !harness.backend.has_session("ws1-agent-a") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend session was never spawned");

        // A duplicate launch leaves the model unchanged.
        harness.reconciler.handle_action(TabAction::Launch {
            workspace_id: WorkspaceId::new("ws1"),
            tab_name: "agent-a".to_owned(),
            command: None,
        });
        assert_eq!(harness.reconciler.model().len(), 1);

        harness.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn detach_and_reattach_toggle_the_record_status() {
        let backend = StubBackend::healthy();
        backend.add_session("ws1-agent-a", true);
        let mut harness = Harness::new(vec!["ws1"], backend);
        harness.drive_one_sync_pass().await;

        let workspace_id = WorkspaceId::new("ws1");
        let tab_id = TabId::new("ws1-agent-a");

        harness.reconciler.handle_action(TabAction::Detach {
            workspace_id: workspace_id.clone(),
            tab_id: tab_id.clone(),
        });
        assert_eq!(
            harness
                .reconciler
                .model()
                .find_by_backend_session("ws1-agent-a")
                .expect("record present")
                .status,
            TabStatus::Detached
        );

        harness.reconciler.handle_action(TabAction::Reattach {
            workspace_id,
            tab_id,
        });
        assert_eq!(
            harness
                .reconciler
                .model()
                .find_by_backend_session("ws1-agent-a")
                .expect("record present")
                .status,
            TabStatus::Running
        );

        harness.shutdown.cancel();
    }
}
