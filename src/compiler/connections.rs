//! Per-edge legality and payload references to other nodes.

use crate::compiler::diagnostics::{Findings, Issue, IssueCode};
use crate::flows::NodeType;
use crate::flows::graph::{GraphIndex, NodeKind};

/// Handle name that always selects a router's fallback branch.
pub const DEFAULT_HANDLE: &str = "default";

pub fn validate(index: &GraphIndex<'_>) -> Findings {
    let mut findings = Findings::default();
    check_edges(index, &mut findings);
    check_payload_references(index, &mut findings);
    findings
}

fn check_edges(index: &GraphIndex<'_>, findings: &mut Findings) {
    for edge in index.edges() {
        let Some(source) = index.get(&edge.source) else {
            findings.error(
                Issue::new(
                    IssueCode::InvalidSource,
                    format!("Edge '{}' starts at unknown node '{}'", edge.id, edge.source),
                )
                .on_edge(&edge.id),
            );
            continue;
        };
        let Some(target) = index.get(&edge.target) else {
            findings.error(
                Issue::new(
                    IssueCode::InvalidTarget,
                    format!("Edge '{}' ends at unknown node '{}'", edge.id, edge.target),
                )
                .on_edge(&edge.id),
            );
            continue;
        };

        if source.is(&NodeType::Sink) {
            findings.error(
                Issue::new(
                    IssueCode::InvalidSinkOutput,
                    format!(
                        "Sink '{}' cannot have outgoing connections",
                        source.node.display_name()
                    ),
                )
                .on_node(&source.node.id)
                .on_edge(&edge.id),
            );
        }
        if target.is(&NodeType::Source) {
            findings.error(
                Issue::new(
                    IssueCode::InvalidSourceInput,
                    format!(
                        "Source '{}' cannot have incoming connections",
                        target.node.display_name()
                    ),
                )
                .on_node(&target.node.id)
                .on_edge(&edge.id),
            );
        }

        if let (Some(NodeKind::Router(router)), Some(handle)) =
            (&source.kind, edge.source_handle.as_deref())
        {
            if handle != DEFAULT_HANDLE && !router.knows_route(handle) {
                findings.warn(
                    Issue::new(
                        IssueCode::UnknownRoute,
                        format!(
                            "Router '{}' has no route named '{handle}'",
                            source.node.display_name()
                        ),
                    )
                    .on_node(&source.node.id)
                    .on_edge(&edge.id),
                );
            }
        }
    }
}

fn check_payload_references(index: &GraphIndex<'_>, findings: &mut Findings) {
    for indexed in index.nodes() {
        let node = indexed.node;
        match &indexed.kind {
            Some(NodeKind::Loop(cfg)) if !index.contains(&cfg.body_node_id) => {
                findings.error(
                    Issue::new(
                        IssueCode::InvalidLoopBody,
                        format!(
                            "Loop '{}' refers to missing body node '{}'",
                            node.display_name(),
                            cfg.body_node_id
                        ),
                    )
                    .on_node(&node.id),
                );
            }
            Some(NodeKind::Parallel(cfg)) => {
                for processor in cfg.processors.iter().filter(|p| !index.contains(p)) {
                    findings.error(
                        Issue::new(
                            IssueCode::InvalidParallelTarget,
                            format!(
                                "Parallel '{}' refers to missing processor '{processor}'",
                                node.display_name()
                            ),
                        )
                        .on_node(&node.id),
                    );
                }
            }
            Some(NodeKind::Router(cfg)) => {
                for (route, target) in cfg.routes.iter().filter(|(_, t)| !index.contains(t)) {
                    findings.warn(
                        Issue::new(
                            IssueCode::UnknownRouteTarget,
                            format!(
                                "Route '{route}' of router '{}' points at missing node '{target}'",
                                node.display_name()
                            ),
                        )
                        .on_node(&node.id),
                    );
                }
            }
            _ => {}
        }
    }
}
