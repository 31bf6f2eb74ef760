//! Graph-shape checks: entry/exit presence, disconnected nodes and cycles.

use std::collections::HashSet;

use crate::compiler::diagnostics::{Findings, Issue, IssueCode};
use crate::flows::NodeType;
use crate::flows::graph::GraphIndex;

pub fn validate(index: &GraphIndex<'_>) -> Findings {
    let mut findings = Findings::default();
    check_sources_and_sinks(index, &mut findings);
    check_disconnected(index, &mut findings);
    detect_cycles(index, &mut findings);
    findings
}

fn check_sources_and_sinks(index: &GraphIndex<'_>, findings: &mut Findings) {
    if !index.nodes().any(|n| n.is(&NodeType::Source)) {
        findings.error(Issue::new(
            IssueCode::NoSource,
            "Flow must have at least one source node",
        ));
    }
    if !index.nodes().any(|n| n.is(&NodeType::Sink)) {
        findings.warn(Issue::new(
            IssueCode::NoSink,
            "Flow has no sink node; its output will not be captured",
        ));
    }
}

fn check_disconnected(index: &GraphIndex<'_>, findings: &mut Findings) {
    for indexed in index.nodes() {
        let node = indexed.node;
        let has_incoming = !index.predecessors(&node.id).is_empty();
        let has_outgoing = !index.successors(&node.id).is_empty();

        if !indexed.is(&NodeType::Source) && !has_incoming {
            findings.warn(
                Issue::new(
                    IssueCode::OrphanNode,
                    format!("Node '{}' has no incoming connections", node.display_name()),
                )
                .on_node(&node.id),
            );
        }
        if !indexed.is(&NodeType::Sink) && !has_outgoing {
            findings.warn(
                Issue::new(
                    IssueCode::DeadEndNode,
                    format!("Node '{}' has no outgoing connections", node.display_name()),
                )
                .on_node(&node.id),
            );
        }
    }
}

/// Depth-first search from every source. A back edge closes a cycle made of
/// the path suffix starting at the revisited node; cycles passing through a
/// loop node are loop bodies feeding back and are allowed.
fn detect_cycles(index: &GraphIndex<'_>, findings: &mut Findings) {
    let mut visited: HashSet<&str> = HashSet::new();

    let sources = index
        .nodes()
        .filter(|n| n.is(&NodeType::Source))
        .map(|n| n.node.id.as_str());

    for start in sources {
        if !visited.insert(start) {
            continue;
        }

        let mut path: Vec<&str> = vec![start];
        let mut on_path: HashSet<&str> = HashSet::from([start]);
        // (node, position of the next successor to explore)
        let mut frames: Vec<(&str, usize)> = vec![(start, 0)];

        while let Some(frame) = frames.last_mut() {
            let node = frame.0;
            let successors = index.successors(node);

            if frame.1 >= successors.len() {
                frames.pop();
                path.pop();
                on_path.remove(node);
                continue;
            }

            let next = successors[frame.1];
            frame.1 += 1;

            if on_path.contains(next) {
                if let Some(begin) = path.iter().position(|id| *id == next) {
                    report_cycle(index, &path[begin..], findings);
                }
            } else if visited.insert(next) {
                path.push(next);
                on_path.insert(next);
                frames.push((next, 0));
            }
        }
    }
}

fn report_cycle(index: &GraphIndex<'_>, cycle: &[&str], findings: &mut Findings) {
    let through_loop = cycle
        .iter()
        .any(|id| index.get(id).is_some_and(|n| n.is(&NodeType::Loop)));
    if through_loop {
        return;
    }

    let Some(&first) = cycle.first() else {
        return;
    };
    let mut labels: Vec<String> = cycle.iter().map(|id| index.label(id)).collect();
    labels.push(index.label(first));

    findings.error(
        Issue::new(
            IssueCode::CycleDetected,
            format!("Cycle detected: {}", labels.join(" → ")),
        )
        .on_node(first),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::FlowDefinition;
    use serde_json::{Value, json};

    fn flow(nodes: Value, edges: Value) -> FlowDefinition {
        serde_json::from_value(json!({"id": "f", "name": "f", "nodes": nodes, "edges": edges}))
            .unwrap()
    }

    fn edges(pairs: &[(&str, &str)]) -> Value {
        Value::Array(
            pairs
                .iter()
                .enumerate()
                .map(|(i, (s, t))| json!({"id": format!("e{i}"), "source": s, "target": t}))
                .collect(),
        )
    }

    fn codes(issues: &[Issue]) -> Vec<IssueCode> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn missing_source_is_an_error_missing_sink_a_warning() {
        let flow = flow(json!([{"id": "a", "type": "ai-block"}]), json!([]));
        let (index, _) = GraphIndex::build(&flow);
        let findings = validate(&index);

        assert_eq!(codes(&findings.errors), vec![IssueCode::NoSource]);
        assert!(codes(&findings.warnings).contains(&IssueCode::NoSink));
    }

    #[test]
    fn orphan_and_dead_end_are_independent_per_node() {
        let flow = flow(
            json!([
                {"id": "s", "type": "source"},
                {"id": "a", "type": "filter", "label": "Lonely"},
                {"id": "k", "type": "sink"}
            ]),
            edges(&[("s", "k")]),
        );
        let (index, _) = GraphIndex::build(&flow);
        let findings = validate(&index);

        assert!(findings.errors.is_empty());
        let warnings: Vec<_> = findings
            .warnings
            .iter()
            .map(|w| (w.code, w.node_id.as_deref()))
            .collect();
        assert_eq!(
            warnings,
            vec![
                (IssueCode::OrphanNode, Some("a")),
                (IssueCode::DeadEndNode, Some("a")),
            ]
        );
    }

    #[test]
    fn plain_cycle_is_reported_once_with_labels() {
        let flow = flow(
            json!([
                {"id": "s", "type": "source"},
                {"id": "a", "type": "ai-block", "label": "A"},
                {"id": "b", "type": "function-block", "label": "B"},
                {"id": "k", "type": "sink"}
            ]),
            edges(&[("s", "a"), ("a", "b"), ("b", "a"), ("a", "k")]),
        );
        let (index, _) = GraphIndex::build(&flow);
        let findings = validate(&index);

        let cycles: Vec<_> = findings
            .errors
            .iter()
            .filter(|e| e.code == IssueCode::CycleDetected)
            .collect();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].message, "Cycle detected: A → B → A");
        assert_eq!(cycles[0].node_id.as_deref(), Some("a"));
    }

    #[test]
    fn loop_body_feedback_is_permitted() {
        let flow = flow(
            json!([
                {"id": "s", "type": "source"},
                {"id": "l", "type": "loop", "data": {"bodyNodeId": "ai"}},
                {"id": "ai", "type": "ai-block"},
                {"id": "k", "type": "sink"}
            ]),
            edges(&[("s", "l"), ("l", "ai"), ("ai", "l"), ("l", "k")]),
        );
        let (index, _) = GraphIndex::build(&flow);
        let findings = validate(&index);

        assert!(!codes(&findings.errors).contains(&IssueCode::CycleDetected));
    }

    #[test]
    fn disjoint_cycles_are_each_reported() {
        let flow = flow(
            json!([
                {"id": "s1", "type": "source"},
                {"id": "s2", "type": "source"},
                {"id": "a", "type": "filter"},
                {"id": "b", "type": "filter"},
                {"id": "c", "type": "gate"},
                {"id": "d", "type": "gate"}
            ]),
            edges(&[("s1", "a"), ("a", "b"), ("b", "a"), ("s2", "c"), ("c", "d"), ("d", "c")]),
        );
        let (index, _) = GraphIndex::build(&flow);
        let findings = validate(&index);

        let cycle_nodes: Vec<_> = findings
            .errors
            .iter()
            .filter(|e| e.code == IssueCode::CycleDetected)
            .filter_map(|e| e.node_id.as_deref())
            .collect();
        assert_eq!(cycle_nodes, vec!["a", "c"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let flow = flow(
            json!([
                {"id": "s", "type": "source"},
                {"id": "a", "type": "filter", "label": "A"},
                {"id": "k", "type": "sink"}
            ]),
            edges(&[("s", "a"), ("a", "a"), ("a", "k")]),
        );
        let (index, _) = GraphIndex::build(&flow);
        let findings = validate(&index);

        assert_eq!(findings.errors.len(), 1);
        assert_eq!(findings.errors[0].message, "Cycle detected: A → A");
    }
}
