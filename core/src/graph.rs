//! Canvas topology analysis (§4.9): ready-node selection over a DAG of
//! directed connections, and connected-component isolation over the same
//! graph treated as undirected ("streams").

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{CanvasLayout, NodeType};

struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    fn new(ids: impl Iterator<Item = String>) -> Self {
        let parent = ids.map(|id| (id.clone(), id)).collect();
        Self { parent }
    }

    fn find(&mut self, id: &str) -> String {
        let p = self.parent.get(id).cloned().unwrap_or_else(|| id.to_string());
        if p == id {
            return p;
        }
        let root = self.find(&p);
        self.parent.insert(id.to_string(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

/// Executes the topology of one canvas: in-degree tracking for readiness and
/// union-find for stream isolation. Owns no I/O; all state is in-memory and
/// mutated only through `on_node_complete`.
pub struct GraphExecutor {
    node_ids: Vec<String>,
    node_types: HashMap<String, NodeType>,
    successors: HashMap<String, Vec<String>>,
    in_degree: BTreeMap<String, u32>,
    completed: BTreeSet<String>,
    components: HashMap<String, BTreeSet<String>>,
}

impl GraphExecutor {
    pub fn new(canvas: &CanvasLayout) -> Self {
        let node_ids: Vec<String> = canvas.nodes.iter().map(|n| n.id.clone()).collect();
        let node_types = canvas
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.node_type))
            .collect();

        let mut in_degree: BTreeMap<String, u32> = node_ids.iter().map(|id| (id.clone(), 0)).collect();
        let mut successors: HashMap<String, Vec<String>> = node_ids.iter().map(|id| (id.clone(), Vec::new())).collect();

        let mut uf = UnionFind::new(node_ids.iter().cloned());

        for conn in &canvas.connections {
            if let Some(deg) = in_degree.get_mut(&conn.target_node_id) {
                *deg += 1;
            }
            successors
                .entry(conn.source_node_id.clone())
                .or_default()
                .push(conn.target_node_id.clone());
            uf.union(&conn.source_node_id, &conn.target_node_id);
        }

        let mut components: HashMap<String, BTreeSet<String>> = HashMap::new();
        for id in &node_ids {
            let root = uf.find(id);
            components.entry(root).or_default().insert(id.clone());
        }

        Self {
            node_ids,
            node_types,
            successors,
            in_degree,
            completed: BTreeSet::new(),
            components,
        }
    }

    /// Any node whose in-degree is zero and that has not completed, lowest
    /// node-id wins for determinism across calls.
    pub fn get_ready_node(&self) -> Option<String> {
        self.in_degree
            .iter()
            .filter(|(id, deg)| **deg == 0 && !self.completed.contains(*id))
            .map(|(id, _)| id.clone())
            .next()
    }

    /// Decrement in-degree of successors and mark `id` complete. No-op if
    /// `id` is unknown or already completed.
    pub fn on_node_complete(&mut self, id: &str) {
        if !self.node_ids.iter().any(|n| n == id) || self.completed.contains(id) {
            return;
        }
        self.completed.insert(id.to_string());
        if let Some(successors) = self.successors.get(id).cloned() {
            for succ in successors {
                if let Some(deg) = self.in_degree.get_mut(&succ) {
                    *deg = deg.saturating_sub(1);
                }
            }
        }
    }

    /// Partition of node ids into connected components (undirected).
    pub fn isolate_streams(&self) -> Vec<BTreeSet<String>> {
        let mut streams: Vec<BTreeSet<String>> = self.components.values().cloned().collect();
        streams.sort_by(|a, b| a.iter().next().cmp(&b.iter().next()));
        streams
    }

    /// Components containing at least one `execute`-type node; if none
    /// exist anywhere in the canvas, returns every component (backward
    /// compatibility — see Open Questions in SPEC_FULL.md).
    pub fn get_executable_streams(&self) -> Vec<BTreeSet<String>> {
        let any_execute = self.node_types.values().any(|t| *t == NodeType::Execute);
        let streams = self.isolate_streams();
        if !any_execute {
            return streams;
        }
        streams
            .into_iter()
            .filter(|component| {
                component
                    .iter()
                    .any(|id| self.node_types.get(id) == Some(&NodeType::Execute))
            })
            .collect()
    }

    pub fn get_stream_for_node(&self, id: &str) -> Option<BTreeSet<String>> {
        self.isolate_streams()
            .into_iter()
            .find(|component| component.contains(id))
    }

    pub fn waiting_count(&self, id: &str) -> Option<u32> {
        self.in_degree.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanvasConnection, CanvasNode};

    fn node(id: &str, node_type: NodeType) -> CanvasNode {
        CanvasNode {
            id: id.to_string(),
            node_type,
            workflow_id: None,
            backend_affinity: None,
            fallback_strategy: crate::models::FallbackStrategy::AskUser,
            parameter_values: serde_json::Value::Null,
        }
    }

    fn conn(id: &str, from: &str, to: &str) -> CanvasConnection {
        CanvasConnection {
            id: id.to_string(),
            source_node_id: from.to_string(),
            target_node_id: to.to_string(),
        }
    }

    #[test]
    fn empty_canvas_has_no_ready_node() {
        let canvas = CanvasLayout::default();
        let exec = GraphExecutor::new(&canvas);
        assert!(exec.get_ready_node().is_none());
        assert!(exec.isolate_streams().is_empty());
    }

    #[test]
    fn isolate_streams_partitions_mixed_graph() {
        // A -> B, C -> D, E (isolated)
        let canvas = CanvasLayout {
            nodes: vec![
                node("A", NodeType::Workflow),
                node("B", NodeType::Workflow),
                node("C", NodeType::Workflow),
                node("D", NodeType::Workflow),
                node("E", NodeType::Workflow),
            ],
            connections: vec![conn("c1", "A", "B"), conn("c2", "C", "D")],
        };
        let exec = GraphExecutor::new(&canvas);
        let streams = exec.isolate_streams();
        assert_eq!(streams.len(), 3);

        let total: usize = streams.iter().map(|s| s.len()).sum();
        assert_eq!(total, 5);

        let mut all_nodes = BTreeSet::new();
        for s in &streams {
            for n in s {
                assert!(all_nodes.insert(n.clone()), "node appeared in two components");
            }
        }
    }

    #[test]
    fn get_executable_streams_falls_back_to_all_when_no_execute_node() {
        let canvas = CanvasLayout {
            nodes: vec![node("A", NodeType::Workflow), node("B", NodeType::Workflow)],
            connections: vec![],
        };
        let exec = GraphExecutor::new(&canvas);
        assert_eq!(exec.get_executable_streams().len(), 2);
    }

    #[test]
    fn get_executable_streams_filters_to_components_with_execute_node() {
        let canvas = CanvasLayout {
            nodes: vec![
                node("A", NodeType::Workflow),
                node("B", NodeType::Execute),
                node("C", NodeType::Workflow),
            ],
            connections: vec![conn("c1", "A", "B")],
        };
        let exec = GraphExecutor::new(&canvas);
        let streams = exec.get_executable_streams();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].contains("A") && streams[0].contains("B"));
    }

    #[test]
    fn on_node_complete_unblocks_successor() {
        let canvas = CanvasLayout {
            nodes: vec![node("A", NodeType::Workflow), node("B", NodeType::Workflow)],
            connections: vec![conn("c1", "A", "B")],
        };
        let mut exec = GraphExecutor::new(&canvas);
        assert_eq!(exec.get_ready_node(), Some("A".to_string()));
        exec.on_node_complete("A");
        assert_eq!(exec.get_ready_node(), Some("B".to_string()));
        exec.on_node_complete("B");
        assert!(exec.get_ready_node().is_none());
    }

    #[test]
    fn get_stream_for_node_returns_none_for_unknown_node() {
        let canvas = CanvasLayout { nodes: vec![node("A", NodeType::Workflow)], connections: vec![] };
        let exec = GraphExecutor::new(&canvas);
        assert!(exec.get_stream_for_node("ghost").is_none());
        assert!(exec.get_stream_for_node("A").is_some());
    }
}
