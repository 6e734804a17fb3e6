use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use octorouter_core::{ItemLineage, Report, ReportId};
use octorouter_storage::{ActionRecord, LineageStore, StorageError};
use papaya::HashMap as PapayaHashMap;
use tokio::sync::RwLock;

/// Identity of a lineage edge; the item hash is payload, not identity.
type EdgeKey = (ReportId, usize, ReportId, usize);

#[derive(Debug, Default)]
struct LineageGraph {
    edges: HashSet<EdgeKey>,
    parents: HashMap<ReportId, Vec<ReportId>>,
    children: HashMap<ReportId, Vec<ReportId>>,
}

impl LineageGraph {
    /// Returns `true` if `target` is `from` or one of its ancestors, counting
    /// both recorded and `pending` edges.
    fn reaches_ancestor(
        &self,
        from: ReportId,
        target: ReportId,
        pending: &[(ReportId, ReportId)],
    ) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(parents) = self.parents.get(&node) {
                stack.extend(parents.iter().copied());
            }
            stack.extend(
                pending
                    .iter()
                    .filter(|(_, child)| *child == node)
                    .map(|(parent, _)| *parent),
            );
        }
        false
    }

    fn link(&mut self, parent: ReportId, child: ReportId) {
        let parents = self.parents.entry(child).or_default();
        if !parents.contains(&parent) {
            parents.push(parent);
        }
        let children = self.children.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }
}

/// In-memory lineage store.
///
/// Reports live in a papaya lock-free HashMap; the edge graph and action log sit
/// behind `RwLock`s so a batch of edges is checked and applied atomically.
#[derive(Debug, Default)]
pub struct InMemoryLineageStore {
    reports: Arc<PapayaHashMap<ReportId, Report>>,
    graph: RwLock<LineageGraph>,
    actions: RwLock<HashMap<ReportId, Vec<ActionRecord>>>,
}

impl InMemoryLineageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_count(&self) -> usize {
        self.reports.pin().len()
    }

    /// All recorded reports, in no particular order.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.pin().values().cloned().collect()
    }
}

#[async_trait]
impl LineageStore for InMemoryLineageStore {
    async fn record_report(&self, report: &Report) -> Result<(), StorageError> {
        let guard = self.reports.pin();
        guard.get_or_insert_with(report.id, || report.clone());
        Ok(())
    }

    async fn record_lineage(&self, edges: &[ItemLineage]) -> Result<(), StorageError> {
        let mut graph = self.graph.write().await;
        let mut pending: Vec<(ReportId, ReportId)> = Vec::new();
        let mut new_keys = Vec::new();

        for edge in edges {
            let key: EdgeKey = (
                edge.parent_report_id,
                edge.parent_index,
                edge.child_report_id,
                edge.child_index,
            );
            if graph.edges.contains(&key) || new_keys.contains(&key) {
                continue;
            }
            // the new edge closes a cycle if the child is already an ancestor of the parent
            if graph.reaches_ancestor(edge.parent_report_id, edge.child_report_id, &pending) {
                return Err(StorageError::lineage_cycle(
                    edge.parent_report_id,
                    edge.child_report_id,
                ));
            }
            pending.push((edge.parent_report_id, edge.child_report_id));
            new_keys.push(key);
        }

        for (parent, child) in pending {
            graph.link(parent, child);
        }
        graph.edges.extend(new_keys);
        Ok(())
    }

    async fn report(&self, id: ReportId) -> Result<Option<Report>, StorageError> {
        Ok(self.reports.pin().get(&id).cloned())
    }

    async fn parents_of(&self, id: ReportId) -> Result<Vec<ReportId>, StorageError> {
        let graph = self.graph.read().await;
        Ok(graph.parents.get(&id).cloned().unwrap_or_default())
    }

    async fn children_of(&self, id: ReportId) -> Result<Vec<ReportId>, StorageError> {
        let graph = self.graph.read().await;
        Ok(graph.children.get(&id).cloned().unwrap_or_default())
    }

    async fn record_action(&self, record: ActionRecord) -> Result<(), StorageError> {
        let mut actions = self.actions.write().await;
        actions.entry(record.report_id).or_default().push(record);
        Ok(())
    }

    async fn actions_for(&self, report_id: ReportId) -> Result<Vec<ActionRecord>, StorageError> {
        let actions = self.actions.read().await;
        Ok(actions.get(&report_id).cloned().unwrap_or_default())
    }
}
