use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    // Graph index
    DuplicateNodeId,
    InvalidNodeConfig,
    // Structure
    NoSource,
    NoSink,
    OrphanNode,
    DeadEndNode,
    CycleDetected,
    // Connections
    InvalidSource,
    InvalidTarget,
    InvalidSinkOutput,
    InvalidSourceInput,
    UnknownRoute,
    UnknownRouteTarget,
    InvalidLoopBody,
    InvalidParallelTarget,
    // Types
    SchemaMismatch,
    // Compilation
    UnknownNodeType,
}

impl IssueCode {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueCode::DuplicateNodeId => "DUPLICATE_NODE_ID",
            IssueCode::InvalidNodeConfig => "INVALID_NODE_CONFIG",
            IssueCode::NoSource => "NO_SOURCE",
            IssueCode::NoSink => "NO_SINK",
            IssueCode::OrphanNode => "ORPHAN_NODE",
            IssueCode::DeadEndNode => "DEAD_END_NODE",
            IssueCode::CycleDetected => "CYCLE_DETECTED",
            IssueCode::InvalidSource => "INVALID_SOURCE",
            IssueCode::InvalidTarget => "INVALID_TARGET",
            IssueCode::InvalidSinkOutput => "INVALID_SINK_OUTPUT",
            IssueCode::InvalidSourceInput => "INVALID_SOURCE_INPUT",
            IssueCode::UnknownRoute => "UNKNOWN_ROUTE",
            IssueCode::UnknownRouteTarget => "UNKNOWN_ROUTE_TARGET",
            IssueCode::InvalidLoopBody => "INVALID_LOOP_BODY",
            IssueCode::InvalidParallelTarget => "INVALID_PARALLEL_TARGET",
            IssueCode::SchemaMismatch => "SCHEMA_MISMATCH",
            IssueCode::UnknownNodeType => "UNKNOWN_NODE_TYPE",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation or compilation finding. Issues are data: validators
/// collect them and never fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub code: IssueCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
}

impl Issue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
            edge_id: None,
        }
    }

    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn on_edge(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Errors and warnings gathered by one validation pass.
#[derive(Debug, Default, Clone)]
pub struct Findings {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl Findings {
    pub fn error(&mut self, issue: Issue) {
        self.errors.push(issue);
    }

    pub fn warn(&mut self, issue: Issue) {
        self.warnings.push(issue);
    }

    pub fn extend(&mut self, other: Findings) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
