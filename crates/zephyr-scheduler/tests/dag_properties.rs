//! Property tests for the DAG engine.

use proptest::prelude::*;
use std::collections::HashSet;

use zephyr_scheduler::{JobDag, NodeStatus};

/// Random acyclic graphs: node i may only depend on nodes with lower index.
fn acyclic_nodes() -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
    (2usize..10).prop_flat_map(|count| {
        let deps = (0..count)
            .map(|i| proptest::collection::vec(0..count.max(1), 0..=i.min(3)))
            .collect::<Vec<_>>();
        deps.prop_map(move |per_node| {
            (0..count)
                .map(|i| {
                    let deps: HashSet<usize> = per_node[i]
                        .iter()
                        .map(|d| d % i.max(1))
                        .filter(|d| *d < i)
                        .collect();
                    (
                        format!("n{i}"),
                        deps.into_iter().map(|d| format!("n{d}")).collect(),
                    )
                })
                .collect()
        })
    })
}

proptest! {
    /// Acyclic inputs build, and the topological order puts every
    /// dependency before its dependent.
    #[test]
    fn build_succeeds_and_topological_order_is_consistent(nodes in acyclic_nodes()) {
        let dag = JobDag::build(nodes.clone()).unwrap();

        let order = dag.topological_order();
        prop_assert_eq!(order.len(), nodes.len());
        let position: std::collections::HashMap<&String, usize> =
            order.iter().enumerate().map(|(i, n)| (n, i)).collect();
        for (name, deps) in &nodes {
            for dep in deps {
                prop_assert!(position[dep] < position[name], "{dep} must precede {name}");
            }
        }
    }

    /// Adding a back edge to any non-root node introduces a cycle.
    #[test]
    fn back_edge_is_rejected(nodes in acyclic_nodes(), pick in any::<prop::sample::Index>()) {
        let mut nodes = nodes;
        let target = pick.index(nodes.len() - 1) + 1; // never node 0
        let last = nodes.len() - 1;
        let name = nodes[last].0.clone();
        // n_target transitively reaches n_last once n_last depends on it;
        // close the loop from the earlier node.
        nodes[target].1.push(name.clone());
        let dep_for_last = nodes[target].0.clone();
        nodes[last].1.push(dep_for_last);

        // target == last makes a self-loop, otherwise a 2-cycle.
        prop_assert!(JobDag::build(nodes).is_err());
    }

    /// Driving any schedule of ready nodes with random outcomes terminates
    /// with every node terminal.
    #[test]
    fn random_execution_always_terminates(
        nodes in acyclic_nodes(),
        outcomes in proptest::collection::vec(any::<bool>(), 32),
        picks in proptest::collection::vec(any::<prop::sample::Index>(), 32),
    ) {
        let mut dag = JobDag::build(nodes.clone()).unwrap();
        let mut step = 0usize;

        loop {
            let ready = dag.ready();
            if ready.is_empty() {
                break;
            }
            let node = picks[step % picks.len()].get(&ready).clone();
            dag.mark_running(&node).unwrap();
            let success = outcomes[step % outcomes.len()];
            dag.mark_completed(&node, success);
            step += 1;
            prop_assert!(step <= nodes.len(), "more completions than nodes");
        }

        prop_assert!(dag.is_complete(), "no node may stay pending/ready/running");
        for (status, _) in dag.counts() {
            prop_assert!(status.is_terminal());
        }
    }

    /// After a failure, exactly the transitive dependents (not already
    /// terminal) are skipped.
    #[test]
    fn skip_propagation_is_transitive(nodes in acyclic_nodes(), pick in any::<prop::sample::Index>()) {
        let mut dag = JobDag::build(nodes.clone()).unwrap();

        // Run everything up to (not including) the victim as success.
        let victim = pick.get(&dag.node_names()).clone();
        let dependents: HashSet<String> =
            dag.transitive_dependents(&victim).into_iter().collect();

        // Drive successes until the victim is ready.
        while dag.status(&victim) != Some(NodeStatus::Ready) {
            let ready = dag.ready();
            let other = ready.iter().find(|n| **n != victim);
            match other {
                Some(node) => {
                    let node = node.clone();
                    dag.mark_running(&node).unwrap();
                    dag.mark_completed(&node, true);
                }
                None => break,
            }
        }
        prop_assert_eq!(dag.status(&victim), Some(NodeStatus::Ready));

        dag.mark_running(&victim).unwrap();
        dag.mark_completed(&victim, false);

        for name in dag.node_names() {
            let status = dag.status(&name).unwrap();
            if dependents.contains(&name) {
                // A dependent can never have run: its chain includes the
                // victim, which never succeeded.
                prop_assert_eq!(status, NodeStatus::Skipped, "dependent {}", name);
            } else if name == victim {
                prop_assert_eq!(status, NodeStatus::Failure);
            }
        }
    }
}
