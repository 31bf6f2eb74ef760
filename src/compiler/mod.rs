//! Flow graph compiler: validation passes, execution ordering and unit
//! construction.

pub mod connections;
pub mod diagnostics;
pub mod structure;
pub mod units;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::flows::FlowDefinition;
use crate::flows::graph::{GraphIndex, NodeKind};
use crate::flows::schema::check_compatibility;

use self::diagnostics::{Findings, Issue, IssueCode};
use self::units::{CompiledUnit, FlowExecutor, UnitOp};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOptions {
    /// Stop after validation; no executor is built.
    #[serde(default)]
    pub validate_only: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationResult {
    pub success: bool,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
    #[serde(skip)]
    pub executor: Option<FlowExecutor>,
}

impl CompilationResult {
    /// JSON report: the serialized result plus the ordered units when an
    /// executor was built.
    pub fn report(&self) -> serde_json::Value {
        let mut body = serde_json::to_value(self).unwrap_or_default();
        if let (Some(executor), Some(map)) = (&self.executor, body.as_object_mut()) {
            map.insert(
                "units".to_string(),
                serde_json::to_value(executor.units()).unwrap_or_default(),
            );
        }
        body
    }

    fn failed(findings: Findings) -> Self {
        Self {
            success: false,
            errors: findings.errors,
            warnings: findings.warnings,
            executor: None,
        }
    }
}

/// Validate `flow` and, unless `validate_only` is set, build its executor.
///
/// Never fails: every problem is reported as an issue in the result.
/// Compiling the same definition twice yields equal results.
pub fn compile(flow: &FlowDefinition, options: CompileOptions) -> CompilationResult {
    let (index, mut findings) = GraphIndex::build(flow);
    findings.extend(structure::validate(&index));
    findings.extend(connections::validate(&index));
    findings.extend(check_edge_schemas(&index));

    if findings.has_errors() {
        tracing::debug!(
            flow = %flow.id,
            errors = findings.errors.len(),
            warnings = findings.warnings.len(),
            "Flow failed validation"
        );
        return CompilationResult::failed(findings);
    }

    if options.validate_only {
        return CompilationResult {
            success: true,
            errors: Vec::new(),
            warnings: findings.warnings,
            executor: None,
        };
    }

    let mut units = Vec::with_capacity(index.len());
    for id in execution_order(&index) {
        let Some(indexed) = index.get(id) else {
            continue;
        };
        let node = indexed.node;
        let Some(kind) = &indexed.kind else {
            continue;
        };

        let op = match kind.clone() {
            NodeKind::AiBlock(cfg) => UnitOp::AiBlock {
                block_id: cfg.block_id,
                model: cfg.model,
                prompt: cfg.prompt,
            },
            NodeKind::FunctionBlock(cfg) => UnitOp::FunctionBlock {
                block_id: cfg.block_id,
                language: cfg.language,
                code: cfg.code,
            },
            NodeKind::Router(cfg) => UnitOp::Router {
                routes: cfg.routes,
                route_field: cfg.route_field,
                default_route: cfg.default_route,
            },
            NodeKind::Parallel(cfg) => UnitOp::Parallel {
                processors: cfg.processors,
            },
            NodeKind::Loop(cfg) => UnitOp::Loop {
                body_node_id: cfg.body_node_id,
                condition: cfg.condition,
                max_iterations: cfg.max_iterations,
            },
            NodeKind::Filter(cfg) => UnitOp::Filter {
                condition: cfg.condition,
            },
            NodeKind::Gate(cfg) => UnitOp::Gate {
                condition: cfg.condition,
                require_approval: cfg.require_approval,
            },
            NodeKind::Source(cfg) => UnitOp::Source(cfg),
            NodeKind::Sink(cfg) => UnitOp::Sink(cfg),
            NodeKind::Unknown(tag) => {
                findings.warn(
                    Issue::new(
                        IssueCode::UnknownNodeType,
                        format!(
                            "Node '{}' has unknown type '{tag}' and will be skipped",
                            node.display_name()
                        ),
                    )
                    .on_node(&node.id),
                );
                continue;
            }
        };

        units.push(CompiledUnit {
            node_id: node.id.clone(),
            label: node.display_name().to_string(),
            inputs: index
                .predecessors(&node.id)
                .iter()
                .map(|id| id.to_string())
                .collect(),
            input_schema: node.input_schema.clone(),
            output_schema: node.output_schema.clone(),
            op,
        });
    }

    tracing::info!(
        flow = %flow.id,
        units = units.len(),
        warnings = findings.warnings.len(),
        "Compiled flow"
    );

    CompilationResult {
        success: true,
        errors: Vec::new(),
        warnings: findings.warnings,
        executor: Some(FlowExecutor::new(units)),
    }
}

/// One `SCHEMA_MISMATCH` per incompatibility on an edge whose endpoints both
/// exist and declare schemas.
fn check_edge_schemas(index: &GraphIndex<'_>) -> Findings {
    let mut findings = Findings::default();
    for edge in index.edges() {
        let (Some(source), Some(target)) = (index.get(&edge.source), index.get(&edge.target))
        else {
            continue;
        };
        let (Some(output), Some(input)) = (&source.node.output_schema, &target.node.input_schema)
        else {
            continue;
        };

        let check = check_compatibility(output, input, "");
        for error in check.errors {
            findings.error(
                Issue::new(
                    IssueCode::SchemaMismatch,
                    format!(
                        "Output of '{}' does not fit input of '{}': {error}",
                        source.node.display_name(),
                        target.node.display_name()
                    ),
                )
                .on_node(&target.node.id)
                .on_edge(&edge.id),
            );
        }
    }
    findings
}

/// Post-order over the depends-on relation, starting from every node in
/// definition order. Each node follows all predecessors not already on the
/// walk, so loop feedback edges are the only ones pointing backwards.
fn execution_order<'a>(index: &GraphIndex<'a>) -> Vec<&'a str> {
    let mut order = Vec::with_capacity(index.len());
    let mut visited: HashSet<&str> = HashSet::new();

    for root in index.nodes().map(|n| n.node.id.as_str()) {
        if !visited.insert(root) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let predecessors = index.predecessors(node);

            if frame.1 >= predecessors.len() {
                order.push(node);
                stack.pop();
                continue;
            }

            let next = predecessors[frame.1];
            frame.1 += 1;
            if visited.insert(next) {
                stack.push((next, 0));
            }
        }
    }

    order
}
