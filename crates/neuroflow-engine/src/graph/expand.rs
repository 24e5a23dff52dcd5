use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, info};

use neuroflow_core::error::{FlowError, Result};
use neuroflow_core::types::{IterationTag, PortRef};

use super::dag::Graph;
use super::edge::Connection;
use super::node::Node;
use super::workflow::{ExpandedGraph, IterableBinding, Workflow};

impl Workflow {
    /// Resolve every iterable binding into concrete replicas.
    ///
    /// Bindings expand in declaration order. Each binding replicates the
    /// closure downstream of its bound node once per candidate value;
    /// nodes that declare `join_over` for the binding's source stop the
    /// closure and receive every replica's value instead. The template is
    /// left untouched.
    pub fn expand(&self) -> Result<ExpandedGraph> {
        for node in self.graph.nodes() {
            if let Some(source) = &node.options.join_over {
                if self.graph.node(source).is_none() {
                    return Err(FlowError::InvalidOptions {
                        node: node.id.clone(),
                        message: format!("join_over names unknown node '{}'", source),
                    });
                }
            }
        }

        let mut graph = self.graph.clone();
        for binding in &self.bindings {
            expand_binding(&mut graph, binding)?;
        }
        graph.check_arity()?;
        graph.topological_order()?;

        info!(
            workflow = %self.name(),
            bindings = self.bindings.len(),
            nodes = graph.len(),
            connections = graph.connections.len(),
            "Expanded workflow"
        );
        Ok(ExpandedGraph::new(self.name().to_string(), graph))
    }
}

fn expand_binding(graph: &mut Graph, binding: &IterableBinding) -> Result<()> {
    let source_base = &binding.port.node;
    let field = &binding.port.port;

    let sources: Vec<String> = graph
        .nodes
        .iter()
        .filter(|n| &n.base == source_base)
        .map(|n| n.id.clone())
        .collect();
    if sources.is_empty() {
        return Err(FlowError::UnknownNode(source_base.clone()));
    }
    if binding.values.is_empty() {
        return Err(FlowError::AmbiguousBinding {
            port: binding.port.to_string(),
            message: "no candidate values".into(),
        });
    }
    for source in &sources {
        let port = PortRef::new(source.clone(), field.clone());
        if graph.has_incoming(&port) {
            return Err(FlowError::AmbiguousBinding {
                port: port.to_string(),
                message: "input already has an incoming connection".into(),
            });
        }
    }

    let closure = downstream_closure(graph, &sources, source_base);
    let count = binding.values.len();
    debug!(
        binding = %binding.port,
        values = count,
        closure = closure.len(),
        "Expanding iterable binding"
    );

    // Replica ids per closure node, one per candidate value.
    let mut replicas: HashMap<String, Vec<String>> = HashMap::new();
    let mut nodes = Vec::with_capacity(graph.nodes.len() + closure.len() * (count - 1));
    for node in graph.nodes.drain(..) {
        if !closure.contains(&node.id) {
            nodes.push(node);
            continue;
        }
        let mut ids = Vec::with_capacity(count);
        for (index, value) in binding.values.iter().enumerate() {
            let mut replica = node.clone();
            replica.tags.push(IterationTag {
                field: field.clone(),
                value: value.clone(),
                index,
            });
            replica.id = Node::replica_id(&replica.base, &replica.tags);
            if replica.base == *source_base {
                replica.statics.insert(field.clone(), value.clone());
            }
            ids.push(replica.id.clone());
            nodes.push(replica);
        }
        replicas.insert(node.id, ids);
    }
    graph.nodes = nodes;
    graph.rebuild_index();

    // Each rewired connection keeps its declared index plus the replica
    // position it came from; join ports are renumbered from both below.
    let mut rewired: Vec<(Connection, usize)> = Vec::with_capacity(graph.connections.len());
    let mut joined: BTreeSet<PortRef> = BTreeSet::new();
    for conn in graph.connections.drain(..) {
        let from = replicas.get(&conn.from.node);
        let to = replicas.get(&conn.to.node);
        match (from, to) {
            (None, None) => rewired.push((conn, 0)),
            (Some(from_ids), Some(to_ids)) => {
                for (f, t) in from_ids.iter().zip(to_ids) {
                    rewired.push((
                        Connection::new(
                            PortRef::new(f.clone(), conn.from.port.clone()),
                            PortRef::new(t.clone(), conn.to.port.clone()),
                            conn.index,
                        ),
                        0,
                    ));
                }
            }
            (None, Some(to_ids)) => {
                for t in to_ids {
                    rewired.push((
                        Connection::new(
                            conn.from.clone(),
                            PortRef::new(t.clone(), conn.to.port.clone()),
                            conn.index,
                        ),
                        0,
                    ));
                }
            }
            // Into a join node: one connection per replica.
            (Some(from_ids), None) => {
                joined.insert(conn.to.clone());
                for (position, f) in from_ids.iter().enumerate() {
                    rewired.push((
                        Connection::new(
                            PortRef::new(f.clone(), conn.from.port.clone()),
                            conn.to.clone(),
                            conn.index,
                        ),
                        position,
                    ));
                }
            }
        }
    }

    // Fan-in order: declared index first, candidate position second.
    for port in &joined {
        let mut into: Vec<&mut (Connection, usize)> = rewired
            .iter_mut()
            .filter(|entry| &entry.0.to == port)
            .collect();
        into.sort_by_key(|entry| (entry.0.index, entry.1));
        for (dense, entry) in into.into_iter().enumerate() {
            entry.0.index = dense;
        }
    }
    let connections: Vec<Connection> = rewired.into_iter().map(|(conn, _)| conn).collect();
    graph.connections = connections;
    Ok(())
}

/// Every node reachable from `sources`, excluding joins over `source_base`.
fn downstream_closure(graph: &Graph, sources: &[String], source_base: &str) -> BTreeSet<String> {
    let mut closure = BTreeSet::new();
    let mut queue: VecDeque<&str> = sources.iter().map(String::as_str).collect();
    while let Some(id) = queue.pop_front() {
        if !closure.insert(id.to_string()) {
            continue;
        }
        for next in graph.downstream(id) {
            let joins = graph
                .node(next)
                .and_then(|n| n.options.join_over.as_deref())
                == Some(source_base);
            if !joins {
                queue.push_back(next);
            }
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::PortSpec;
    use crate::graph::options::NodeOptions;
    use crate::units::IdentityUnit;
    use neuroflow_core::traits::Unit;
    use serde_json::json;
    use std::sync::Arc;

    fn identity() -> Arc<dyn Unit> {
        Arc::new(IdentityUnit)
    }

    /// A -> B(iterable over 3 values) -> C(join over B)
    fn join_workflow(fan_in: bool) -> Workflow {
        let mut wf = Workflow::new("wf");
        let a = wf
            .add_unit("A", PortSpec::new().output("x"), identity())
            .unwrap();
        let b = wf
            .add_unit(
                "B",
                PortSpec::new().inputs(&["x", "k"]).output("y"),
                identity(),
            )
            .unwrap();
        let c_ports = if fan_in {
            PortSpec::new().fan_in("y")
        } else {
            PortSpec::new().input("y")
        };
        let c = wf.add_unit("C", c_ports, identity()).unwrap();
        wf.set_options("C", NodeOptions::default().join_over("B"))
            .unwrap();
        wf.connect(&a.output("x"), &b.input("x")).unwrap();
        wf.connect(&b.output("y"), &c.input("y")).unwrap();
        wf.iterate(&b.input("k"), vec![json!(1), json!(2), json!(3)])
            .unwrap();
        wf
    }

    #[test]
    fn test_join_with_fan_in() {
        let expanded = join_workflow(true).expand().unwrap();

        assert_eq!(expanded.replicas_of("A").len(), 1);
        assert_eq!(expanded.replicas_of("B").len(), 3);
        assert_eq!(expanded.replicas_of("C").len(), 1);

        let incoming = expanded.incoming(&PortRef::new("C", "y"));
        let sources: Vec<&str> = incoming.iter().map(|c| c.from.node.as_str()).collect();
        assert_eq!(sources, vec!["_k_1/B", "_k_2/B", "_k_3/B"]);

        // Shared upstream feeds every replica
        for b in expanded.replicas_of("B") {
            let feed = expanded.incoming(&PortRef::new(b.id.clone(), "x"));
            assert_eq!(feed.len(), 1);
            assert_eq!(feed[0].from.node, "A");
        }
    }

    #[test]
    fn test_join_keeps_declared_order_with_shared_source() {
        let mut wf = join_workflow(true);
        let d = wf
            .add_unit("D", PortSpec::new().output("y"), identity())
            .unwrap();
        wf.connect(&d.output("y"), &PortRef::new("C", "y")).unwrap();

        let expanded = wf.expand().unwrap();
        let incoming = expanded.incoming(&PortRef::new("C", "y"));
        let order: Vec<(&str, usize)> = incoming
            .iter()
            .map(|c| (c.from.node.as_str(), c.index))
            .collect();
        assert_eq!(
            order,
            vec![("_k_1/B", 0), ("_k_2/B", 1), ("_k_3/B", 2), ("D", 3)]
        );
    }

    #[test]
    fn test_join_after_shared_source() {
        let mut wf = Workflow::new("wf");
        let d = wf
            .add_unit("D", PortSpec::new().output("y"), identity())
            .unwrap();
        let b = wf
            .add_unit("B", PortSpec::new().input("k").output("y"), identity())
            .unwrap();
        let c = wf
            .add_unit("C", PortSpec::new().fan_in("y"), identity())
            .unwrap();
        wf.set_options("C", NodeOptions::default().join_over("B"))
            .unwrap();
        wf.connect(&d.output("y"), &c.input("y")).unwrap();
        wf.connect(&b.output("y"), &c.input("y")).unwrap();
        wf.iterate(&b.input("k"), vec![json!("x"), json!("y")])
            .unwrap();

        let expanded = wf.expand().unwrap();
        let sources: Vec<(&str, usize)> = expanded
            .incoming(&PortRef::new("C", "y"))
            .iter()
            .map(|c| (c.from.node.as_str(), c.index))
            .collect();
        assert_eq!(sources, vec![("D", 0), ("_k_x/B", 1), ("_k_y/B", 2)]);
    }

    #[test]
    fn test_join_without_fan_in_is_arity_error() {
        let err = join_workflow(false).expand().unwrap_err();
        assert!(matches!(err, FlowError::PortArity { .. }));
    }

    #[test]
    fn test_replicas_carry_value_and_tag() {
        let expanded = join_workflow(true).expand().unwrap();
        let b2 = expanded.node("_k_2/B").unwrap();
        assert_eq!(b2.statics["k"], json!(2));
        assert_eq!(b2.tags.len(), 1);
        assert_eq!(b2.tags[0].index, 1);
        assert_eq!(b2.base, "B");
    }

    #[test]
    fn test_no_bindings_is_identity() {
        let mut wf = Workflow::new("wf");
        let a = wf
            .add_unit("a", PortSpec::new().output("x"), identity())
            .unwrap();
        let b = wf
            .add_unit("b", PortSpec::new().input("x"), identity())
            .unwrap();
        wf.connect(&a.output("x"), &b.input("x")).unwrap();
        let expanded = wf.expand().unwrap();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded.connections(), wf.connections());
    }

    #[test]
    fn test_whole_chain_replicated_without_join() {
        let mut wf = Workflow::new("wf");
        let info = wf
            .add_unit(
                "infosource",
                PortSpec::new().input("subject_id").output("subject_id"),
                identity(),
            )
            .unwrap();
        let ds = wf
            .add_unit(
                "datasource",
                PortSpec::new().input("subject_id").output("func"),
                identity(),
            )
            .unwrap();
        let shared = wf
            .add_unit("settings", PortSpec::new().output("tr"), identity())
            .unwrap();
        let fit = wf
            .add_unit("fit", PortSpec::new().inputs(&["func", "tr"]), identity())
            .unwrap();
        wf.connect(&info.output("subject_id"), &ds.input("subject_id"))
            .unwrap();
        wf.connect(&ds.output("func"), &fit.input("func")).unwrap();
        wf.connect(&shared.output("tr"), &fit.input("tr")).unwrap();
        wf.iterate(&info.input("subject_id"), vec![json!("01"), json!("02")])
            .unwrap();

        let expanded = wf.expand().unwrap();
        assert_eq!(expanded.len(), 7);
        assert!(expanded.node("_subject_id_01/fit").is_some());
        assert!(expanded.node("_subject_id_02/datasource").is_some());
        assert_eq!(expanded.replicas_of("settings").len(), 1);

        let feed = expanded.incoming(&PortRef::new("_subject_id_02/fit", "func"));
        assert_eq!(feed[0].from.node, "_subject_id_02/datasource");
        assert!(expanded.topological_order().is_ok());
        // The template keeps its single copy
        assert_eq!(wf.nodes().len(), 4);
    }

    #[test]
    fn test_overlapping_bindings_multiply() {
        let mut wf = Workflow::new("wf");
        let s = wf
            .add_unit(
                "subjects",
                PortSpec::new().input("subject").output("subject"),
                identity(),
            )
            .unwrap();
        let r = wf
            .add_unit("runs", PortSpec::new().input("run").output("run"), identity())
            .unwrap();
        let fit = wf
            .add_unit(
                "fit",
                PortSpec::new().inputs(&["subject", "run"]),
                identity(),
            )
            .unwrap();
        wf.connect(&s.output("subject"), &fit.input("subject")).unwrap();
        wf.connect(&r.output("run"), &fit.input("run")).unwrap();
        wf.iterate(&s.input("subject"), vec![json!("01"), json!("02")])
            .unwrap();
        wf.iterate(&r.input("run"), vec![json!(1), json!(2), json!(3)])
            .unwrap();

        let expanded = wf.expand().unwrap();
        assert_eq!(expanded.replicas_of("fit").len(), 6);
        assert_eq!(expanded.replicas_of("subjects").len(), 2);
        assert_eq!(expanded.replicas_of("runs").len(), 3);

        let fit = expanded.node("_subject_id_01/_run_2/fit");
        assert!(fit.is_none(), "field names come from the bound port");
        let fit = expanded.node("_subject_01/_run_2/fit").unwrap();
        assert_eq!(fit.tags.len(), 2);
        let run_feed = expanded.incoming(&PortRef::new(fit.id.clone(), "run"));
        assert_eq!(run_feed[0].from.node, "_run_2/runs");
        let subject_feed = expanded.incoming(&PortRef::new(fit.id.clone(), "subject"));
        assert_eq!(subject_feed[0].from.node, "_subject_01/subjects");
    }

    #[test]
    fn test_disjoint_bindings_expand_separately() {
        let mut wf = Workflow::new("wf");
        wf.add_unit("left", PortSpec::new().input("a"), identity())
            .unwrap();
        wf.add_unit("right", PortSpec::new().input("b"), identity())
            .unwrap();
        wf.iterate(&PortRef::new("left", "a"), vec![json!(1), json!(2)])
            .unwrap();
        wf.iterate(&PortRef::new("right", "b"), vec![json!(1), json!(2), json!(3)])
            .unwrap();
        let expanded = wf.expand().unwrap();
        assert_eq!(expanded.len(), 5);
    }

    #[test]
    fn test_empty_candidate_list_rejected() {
        let mut wf = Workflow::new("wf");
        wf.add_unit("a", PortSpec::new().input("x"), identity())
            .unwrap();
        wf.iterate(&PortRef::new("a", "x"), vec![]).unwrap();
        let err = wf.expand().unwrap_err();
        assert!(matches!(err, FlowError::AmbiguousBinding { .. }));
    }
}
