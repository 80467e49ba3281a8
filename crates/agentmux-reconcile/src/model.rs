use std::collections::BTreeMap;

use agentmux_protocol::ids::{TabId, WorkspaceId};
use agentmux_protocol::session::{SessionTab, TabStatus};

/// The in-memory record of open sessions per workspace.
///
/// Owned by the single consumer; mutated only by reconciliation report
/// application and explicit user actions, so no lock guards it.
#[derive(Debug, Default)]
pub struct TabModel {
    tabs: BTreeMap<WorkspaceId, Vec<SessionTab>>,
}

impl TabModel {
    pub fn insert(&mut self, tab: SessionTab) {
        let entries = self.tabs.entry(tab.workspace_id.clone()).or_default();
        match entries
            .iter_mut()
            .find(|existing| existing.backend_session == tab.backend_session)
        {
            Some(existing) => *existing = tab,
            None => entries.push(tab),
        }
    }

    pub fn remove(&mut self, workspace_id: &WorkspaceId, tab_id: &TabId) -> Option<SessionTab> {
        let entries = self.tabs.get_mut(workspace_id)?;
        let index = entries.iter().position(|tab| &tab.id == tab_id)?;
        Some(entries.remove(index))
    }

    pub fn workspace_tabs(&self, workspace_id: &WorkspaceId) -> &[SessionTab] {
        self.tabs
            .get(workspace_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find_by_backend_session(&self, backend_session: &str) -> Option<&SessionTab> {
        self.tabs
            .values()
            .flatten()
            .find(|tab| tab.backend_session == backend_session)
    }

    pub fn find_by_backend_session_mut(
        &mut self,
        backend_session: &str,
    ) -> Option<&mut SessionTab> {
        self.tabs
            .values_mut()
            .flatten()
            .find(|tab| tab.backend_session == backend_session)
    }

    pub fn find_mut(
        &mut self,
        workspace_id: &WorkspaceId,
        tab_id: &TabId,
    ) -> Option<&mut SessionTab> {
        self.tabs
            .get_mut(workspace_id)?
            .iter_mut()
            .find(|tab| &tab.id == tab_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionTab> {
        self.tabs.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.tabs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        self.iter()
            .filter(|tab| tab.status == TabStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use agentmux_protocol::ids::{TabId, WorkspaceId};
    use agentmux_protocol::session::{SessionTab, TabStatus};

    use super::TabModel;

    fn tab(workspace: &str, name: &str) -> SessionTab {
        SessionTab::adopted(
            WorkspaceId::new(workspace),
            format!("{workspace}-{name}"),
            Utc::now(),
        )
    }

    #[test]
    fn insert_replaces_a_record_with_the_same_backend_session() {
        let mut model = TabModel::default();
        model.insert(tab("ws1", "agent-a"));

        let mut replacement = tab("ws1", "agent-a");
        replacement.status = TabStatus::Stopped;
        model.insert(replacement);

        assert_eq!(model.len(), 1);
        assert_eq!(
            model
                .find_by_backend_session("ws1-agent-a")
                .expect("record present")
                .status,
            TabStatus::Stopped
        );
    }

    #[test]
    fn adopted_records_derive_display_name_from_the_namespace() {
        let record = tab("ws1", "agent-a");
        assert_eq!(record.display_name, "agent-a");
        assert_eq!(record.backend_session, "ws1-agent-a");
        assert!(record.status.is_running());
    }

    #[test]
    fn remove_returns_the_removed_record() {
        let mut model = TabModel::default();
        model.insert(tab("ws1", "agent-a"));
        model.insert(tab("ws1", "agent-b"));

        let removed = model
            .remove(&WorkspaceId::new("ws1"), &TabId::new("ws1-agent-a"))
            .expect("record removed");
        assert_eq!(removed.backend_session, "ws1-agent-a");
        assert_eq!(model.len(), 1);
        assert!(model.find_by_backend_session("ws1-agent-a").is_none());
    }

    #[test]
    fn workspace_tabs_are_scoped_to_one_workspace() {
        let mut model = TabModel::default();
        model.insert(tab("ws1", "agent-a"));
        model.insert(tab("ws2", "agent-a"));

        assert_eq!(model.workspace_tabs(&WorkspaceId::new("ws1")).len(), 1);
        assert_eq!(model.workspace_tabs(&WorkspaceId::new("missing")).len(), 0);
    }
}
