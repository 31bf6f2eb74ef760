pub mod file_store;
pub mod graph;
pub mod schema;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::schema::JsonSchema;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default)]
    pub triggers: Vec<serde_json::Value>,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl FlowDefinition {
    /// Swap in a new graph and bump the version. This is the only way a
    /// stored flow's nodes and edges change.
    pub fn replace_graph(
        &mut self,
        nodes: Vec<FlowNode>,
        edges: Vec<FlowEdge>,
        triggers: Vec<serde_json::Value>,
    ) {
        self.nodes = nodes;
        self.edges = edges;
        self.triggers = triggers;
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub label: String,
    /// Type-specific payload, parsed into a [`graph::NodeKind`] at compile time.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<JsonSchema>,
    #[serde(default)]
    pub position: Position,
}

impl FlowNode {
    /// Human label, falling back to the id for unlabeled nodes.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

/// Node type tag. Tags this build does not know are kept verbatim so the
/// compiler can warn about them instead of rejecting the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    AiBlock,
    FunctionBlock,
    Router,
    Parallel,
    Loop,
    Filter,
    Gate,
    Source,
    Sink,
    Unknown(String),
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::AiBlock,
        NodeType::FunctionBlock,
        NodeType::Router,
        NodeType::Parallel,
        NodeType::Loop,
        NodeType::Filter,
        NodeType::Gate,
        NodeType::Source,
        NodeType::Sink,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            NodeType::AiBlock => "ai-block",
            NodeType::FunctionBlock => "function-block",
            NodeType::Router => "router",
            NodeType::Parallel => "parallel",
            NodeType::Loop => "loop",
            NodeType::Filter => "filter",
            NodeType::Gate => "gate",
            NodeType::Source => "source",
            NodeType::Sink => "sink",
            NodeType::Unknown(tag) => tag,
        }
    }
}

impl From<String> for NodeType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "ai-block" => NodeType::AiBlock,
            "function-block" => NodeType::FunctionBlock,
            "router" => NodeType::Router,
            "parallel" => NodeType::Parallel,
            "loop" => NodeType::Loop,
            "filter" => NodeType::Filter,
            "gate" => NodeType::Gate,
            "source" => NodeType::Source,
            "sink" => NodeType::Sink,
            _ => NodeType::Unknown(tag),
        }
    }
}

impl From<NodeType> for String {
    fn from(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Unknown(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

// --- Typed node payloads ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiBlockConfig {
    pub block_id: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FunctionBlockConfig {
    pub block_id: Option<String>,
    pub language: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    pub route_field: String,
    #[serde(default)]
    pub default_route: Option<String>,
}

impl RouterConfig {
    pub fn knows_route(&self, handle: &str) -> bool {
        self.routes.contains_key(handle) || self.default_route.as_deref() == Some(handle)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub body_node_id: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParallelConfig {
    pub processors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterConfig {
    pub condition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GateConfig {
    pub condition: Option<String>,
    pub require_approval: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Manual,
    Webhook,
    Schedule,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceConfig {
    pub trigger: TriggerKind,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SinkConfig {
    pub sink_kind: String,
    pub config: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_roundtrip() {
        let flow: FlowDefinition = serde_json::from_value(serde_json::json!({
            "id": "f1",
            "name": "Test Flow",
            "nodes": [
                {"id": "n1", "type": "source", "label": "Start", "data": {"trigger": "webhook"}},
                {"id": "n2", "type": "sink"}
            ],
            "edges": [{"id": "e1", "source": "n1", "target": "n2"}]
        }))
        .unwrap();

        assert!(flow.enabled);
        assert_eq!(flow.version, 0);
        assert_eq!(flow.nodes[0].node_type, NodeType::Source);
        assert_eq!(flow.nodes[1].display_name(), "n2");

        let json = serde_json::to_value(&flow).unwrap();
        assert_eq!(json["nodes"][0]["type"], "source");
        assert_eq!(json["edges"][0]["source"], "n1");
        assert!(json["edges"][0].get("sourceHandle").is_none());
    }

    #[test]
    fn test_node_type_serialization() {
        assert_eq!(
            serde_json::to_string(&NodeType::AiBlock).unwrap(),
            "\"ai-block\""
        );
        assert_eq!(
            serde_json::to_string(&NodeType::FunctionBlock).unwrap(),
            "\"function-block\""
        );
        assert_eq!(serde_json::to_string(&NodeType::Loop).unwrap(), "\"loop\"");
    }

    #[test]
    fn test_unknown_node_type_is_preserved() {
        let parsed: NodeType = serde_json::from_str("\"webhook-block\"").unwrap();
        assert_eq!(parsed, NodeType::Unknown("webhook-block".into()));
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            "\"webhook-block\""
        );
    }

    #[test]
    fn test_replace_graph_bumps_version() {
        let mut flow: FlowDefinition =
            serde_json::from_value(serde_json::json!({"id": "f1", "name": "F", "version": 3}))
                .unwrap();
        flow.replace_graph(vec![], vec![], vec![serde_json::json!({"kind": "manual"})]);
        assert_eq!(flow.version, 4);
        assert_eq!(flow.triggers.len(), 1);
    }

    #[test]
    fn test_router_knows_default_route() {
        let router = RouterConfig {
            routes: BTreeMap::from([("yes".to_string(), "n2".to_string())]),
            route_field: "decision".into(),
            default_route: Some("fallback".into()),
        };
        assert!(router.knows_route("yes"));
        assert!(router.knows_route("fallback"));
        assert!(!router.knows_route("no"));
    }
}
