//! The job dependency graph and its state machine.

use std::collections::{BTreeMap, HashMap, HashSet};

use zephyr_core::{Error, Result};

/// Per-node state. `pending → ready → running → {success, failure}`, with
/// `skipped`/`cancelled` reachable from any pre-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failure | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
struct Node {
    deps: Vec<String>,
    status: NodeStatus,
}

/// What a completion changed beyond the completed node itself.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompletionEffects {
    pub newly_ready: Vec<String>,
    pub newly_skipped: Vec<String>,
}

/// A run's job DAG. Owned exclusively by the scheduler coordinator.
#[derive(Debug, Clone)]
pub struct JobDag {
    // BTreeMap keeps every view deterministic by node name.
    nodes: BTreeMap<String, Node>,
}

impl JobDag {
    /// Validate and build. Every dependency must exist and the graph must be
    /// acyclic. Nodes without dependencies start `ready`, the rest `pending`.
    pub fn build(nodes: Vec<(String, Vec<String>)>) -> Result<Self> {
        let names: HashSet<&str> = nodes.iter().map(|(name, _)| name.as_str()).collect();
        for (name, deps) in &nodes {
            for dep in deps {
                if !names.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        job: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let dag = Self {
            nodes: nodes
                .into_iter()
                .map(|(name, deps)| {
                    let status = if deps.is_empty() {
                        NodeStatus::Ready
                    } else {
                        NodeStatus::Pending
                    };
                    (name, Node { deps, status })
                })
                .collect(),
        };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        for name in self.nodes.keys() {
            self.visit(name, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if stack.contains(name) {
            return Err(Error::DependencyCycle(name.to_string()));
        }
        if !visited.insert(name) {
            return Ok(());
        }
        stack.insert(name);
        if let Some(node) = self.nodes.get(name) {
            for dep in &node.deps {
                self.visit(dep, visited, stack)?;
            }
        }
        stack.remove(name);
        Ok(())
    }

    /// Nodes currently dispatchable, in name order.
    pub fn ready(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.status == NodeStatus::Ready)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.nodes.get(name).map(|node| node.status)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// `ready → running`.
    pub fn mark_running(&mut self, name: &str) -> Result<()> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("node '{name}'")))?;
        if node.status != NodeStatus::Ready {
            return Err(Error::Internal(format!(
                "node '{name}' dispatched while not ready"
            )));
        }
        node.status = NodeStatus::Running;
        Ok(())
    }

    /// Terminalize a node. On success, `newly_ready` names the nodes whose
    /// dependencies are now all satisfied. On failure, every node that
    /// transitively depends on it and was still `pending` or `ready` becomes
    /// `skipped` and is reported in `newly_skipped`.
    pub fn mark_completed(&mut self, name: &str, success: bool) -> CompletionEffects {
        let Some(node) = self.nodes.get_mut(name) else {
            return CompletionEffects::default();
        };
        if node.status.is_terminal() {
            // Completion racing a cancellation; the first terminal state wins.
            return CompletionEffects::default();
        }
        node.status = if success {
            NodeStatus::Success
        } else {
            NodeStatus::Failure
        };

        if success {
            CompletionEffects {
                newly_ready: self.promote_ready(),
                newly_skipped: Vec::new(),
            }
        } else {
            CompletionEffects {
                newly_ready: Vec::new(),
                newly_skipped: self.skip_dependents(name),
            }
        }
    }

    /// Skip a node (unmet condition) and everything depending on it.
    /// Returns the dependents that were skipped along with it.
    pub fn mark_skipped(&mut self, name: &str) -> Vec<String> {
        if let Some(node) = self.nodes.get_mut(name) {
            if !node.status.is_terminal() {
                node.status = NodeStatus::Skipped;
            }
        }
        self.skip_dependents(name)
    }

    /// Cancel one node if it has not finished.
    pub fn mark_cancelled(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            if !node.status.is_terminal() {
                node.status = NodeStatus::Cancelled;
            }
        }
    }

    /// Every non-terminal node becomes `cancelled`. Returns the nodes that
    /// had not been handed to an executor yet.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let mut never_ran = Vec::new();
        for (name, node) in self.nodes.iter_mut() {
            match node.status {
                NodeStatus::Pending | NodeStatus::Ready => {
                    node.status = NodeStatus::Cancelled;
                    never_ran.push(name.clone());
                }
                NodeStatus::Running => node.status = NodeStatus::Cancelled,
                _ => {}
            }
        }
        never_ran
    }

    fn promote_ready(&mut self) -> Vec<String> {
        let satisfied: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.status == NodeStatus::Pending)
            .filter(|(_, node)| {
                node.deps
                    .iter()
                    .all(|dep| self.status(dep) == Some(NodeStatus::Success))
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &satisfied {
            if let Some(node) = self.nodes.get_mut(name) {
                node.status = NodeStatus::Ready;
            }
        }
        satisfied
    }

    fn skip_dependents(&mut self, failed: &str) -> Vec<String> {
        let mut skipped = Vec::new();
        for name in self.transitive_dependents(failed) {
            if let Some(node) = self.nodes.get_mut(&name) {
                if matches!(node.status, NodeStatus::Pending | NodeStatus::Ready) {
                    node.status = NodeStatus::Skipped;
                    skipped.push(name);
                }
            }
        }
        skipped
    }

    /// Names of every node that depends on `root`, directly or indirectly.
    pub fn transitive_dependents(&self, root: &str) -> Vec<String> {
        let mut dependents: HashSet<String> = HashSet::new();
        let mut frontier = vec![root.to_string()];
        while let Some(current) = frontier.pop() {
            for (name, node) in &self.nodes {
                if node.deps.contains(&current) && dependents.insert(name.clone()) {
                    frontier.push(name.clone());
                }
            }
        }
        let mut sorted: Vec<String> = dependents.into_iter().collect();
        sorted.sort();
        sorted
    }

    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|node| node.status.is_terminal())
    }

    pub fn counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn has_status(&self, status: NodeStatus) -> bool {
        self.nodes.values().any(|node| node.status == status)
    }

    pub fn running_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.status == NodeStatus::Running)
            .count()
    }

    /// Deterministic topological order: every dependency precedes its
    /// dependents; ties broken by name.
    pub fn topological_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        for name in self.nodes.keys() {
            self.topo_visit(name, &mut visited, &mut order);
        }
        order
    }

    fn topo_visit(&self, name: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        if let Some(node) = self.nodes.get(name) {
            for dep in &node.deps {
                self.topo_visit(dep, visited, order);
            }
        }
        order.push(name.to_string());
    }

    /// Parallel layers: each layer's nodes depend only on earlier layers.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<String, usize> = HashMap::new();
        for name in self.topological_order() {
            let level = self.nodes[&name]
                .deps
                .iter()
                .map(|dep| depth.get(dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(name, level);
        }
        let max_level = depth.values().copied().max().unwrap_or(0);
        let mut layers = vec![Vec::new(); max_level + 1];
        for (name, level) in depth {
            layers[level].push(name);
        }
        for layer in &mut layers {
            layer.sort();
        }
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(edges: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn build_rejects_unknown_dependency() {
        let err = JobDag::build(nodes(&[("a", &["ghost"])])).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn build_rejects_cycles() {
        let err = JobDag::build(nodes(&[("a", &["b"]), ("b", &["a"])])).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));

        let err = JobDag::build(nodes(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
    }

    #[test]
    fn roots_start_ready() {
        let dag = JobDag::build(nodes(&[("a", &[]), ("b", &["a"]), ("c", &[])])).unwrap();
        assert_eq!(dag.ready(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(dag.status("b"), Some(NodeStatus::Pending));
    }

    #[test]
    fn linear_chain_completes_in_order() {
        let mut dag =
            JobDag::build(nodes(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])).unwrap();

        assert_eq!(dag.ready(), vec!["a".to_string()]);
        dag.mark_running("a").unwrap();
        assert_eq!(dag.mark_completed("a", true).newly_ready, vec!["b".to_string()]);
        dag.mark_running("b").unwrap();
        assert_eq!(dag.mark_completed("b", true).newly_ready, vec!["c".to_string()]);
        dag.mark_running("c").unwrap();
        assert!(dag.mark_completed("c", true).newly_ready.is_empty());
        assert!(dag.is_complete());
    }

    #[test]
    fn fan_in_waits_for_all_dependencies() {
        let mut dag = JobDag::build(nodes(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("join", &["left", "right"]),
        ]))
        .unwrap();

        dag.mark_running("root").unwrap();
        let effects = dag.mark_completed("root", true);
        assert_eq!(effects.newly_ready, vec!["left".to_string(), "right".to_string()]);

        dag.mark_running("left").unwrap();
        dag.mark_running("right").unwrap();
        assert!(dag.mark_completed("left", true).newly_ready.is_empty());
        assert_eq!(
            dag.mark_completed("right", true).newly_ready,
            vec!["join".to_string()]
        );
    }

    #[test]
    fn failure_skips_transitive_dependents_only() {
        let mut dag = JobDag::build(nodes(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &[]),
        ]))
        .unwrap();

        dag.mark_running("a").unwrap();
        let effects = dag.mark_completed("a", false);
        assert_eq!(
            effects.newly_skipped,
            vec!["b".to_string(), "c".to_string()]
        );

        assert_eq!(dag.status("a"), Some(NodeStatus::Failure));
        assert_eq!(dag.status("b"), Some(NodeStatus::Skipped));
        assert_eq!(dag.status("c"), Some(NodeStatus::Skipped));
        assert_eq!(dag.status("d"), Some(NodeStatus::Ready));

        dag.mark_running("d").unwrap();
        dag.mark_completed("d", true);
        assert!(dag.is_complete());
        assert!(dag.has_status(NodeStatus::Failure));
    }

    #[test]
    fn completion_after_cancellation_is_ignored() {
        let mut dag = JobDag::build(nodes(&[("a", &[]), ("b", &["a"])])).unwrap();
        dag.mark_running("a").unwrap();
        dag.cancel_all();
        assert_eq!(dag.status("a"), Some(NodeStatus::Cancelled));
        assert_eq!(dag.mark_completed("a", true), CompletionEffects::default());
        assert_eq!(dag.status("a"), Some(NodeStatus::Cancelled));
        assert_eq!(dag.status("b"), Some(NodeStatus::Cancelled));
    }

    #[test]
    fn cancel_all_reports_undispatched_nodes() {
        let mut dag = JobDag::build(nodes(&[("a", &[]), ("b", &["a"]), ("c", &[])])).unwrap();
        dag.mark_running("a").unwrap();
        let never_ran = dag.cancel_all();
        assert_eq!(never_ran, vec!["b".to_string(), "c".to_string()]);
        assert!(dag.is_complete());
    }

    #[test]
    fn skipped_condition_cascades() {
        let mut dag = JobDag::build(nodes(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])).unwrap();
        dag.mark_skipped("a");
        assert_eq!(dag.status("a"), Some(NodeStatus::Skipped));
        assert_eq!(dag.status("b"), Some(NodeStatus::Skipped));
        assert_eq!(dag.status("c"), Some(NodeStatus::Skipped));
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let dag = JobDag::build(nodes(&[
            ("deploy", &["build"]),
            ("test", &[]),
            ("build", &["test"]),
        ]))
        .unwrap();
        let order = dag.topological_order();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("test") < pos("build"));
        assert!(pos("build") < pos("deploy"));
    }

    #[test]
    fn layers_group_independent_nodes() {
        let dag = JobDag::build(nodes(&[
            ("root", &[]),
            ("left", &["root"]),
            ("right", &["root"]),
            ("join", &["left", "right"]),
        ]))
        .unwrap();
        let layers = dag.layers();
        assert_eq!(layers[0], vec!["root".to_string()]);
        assert_eq!(layers[1], vec!["left".to_string(), "right".to_string()]);
        assert_eq!(layers[2], vec!["join".to_string()]);
    }
}
