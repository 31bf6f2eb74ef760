//! Id-indexed view over a flow's nodes and edges, shared by the validators
//! and the compiler.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::compiler::diagnostics::{Findings, Issue, IssueCode};
use crate::flows::{
    AiBlockConfig, FilterConfig, FlowDefinition, FlowEdge, FlowNode, FunctionBlockConfig,
    GateConfig, LoopConfig, NodeType, ParallelConfig, RouterConfig, SinkConfig, SourceConfig,
};

/// A node's payload, parsed according to its type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    AiBlock(AiBlockConfig),
    FunctionBlock(FunctionBlockConfig),
    Router(RouterConfig),
    Parallel(ParallelConfig),
    Loop(LoopConfig),
    Filter(FilterConfig),
    Gate(GateConfig),
    Source(SourceConfig),
    Sink(SinkConfig),
    Unknown(String),
}

impl NodeKind {
    pub fn parse(node_type: &NodeType, data: &Value) -> Result<Self, serde_json::Error> {
        Ok(match node_type {
            NodeType::AiBlock => NodeKind::AiBlock(payload(data)?),
            NodeType::FunctionBlock => NodeKind::FunctionBlock(payload(data)?),
            NodeType::Router => NodeKind::Router(payload(data)?),
            NodeType::Parallel => NodeKind::Parallel(payload(data)?),
            NodeType::Loop => NodeKind::Loop(payload(data)?),
            NodeType::Filter => NodeKind::Filter(payload(data)?),
            NodeType::Gate => NodeKind::Gate(payload(data)?),
            NodeType::Source => NodeKind::Source(payload(data)?),
            NodeType::Sink => NodeKind::Sink(payload(data)?),
            NodeType::Unknown(tag) => NodeKind::Unknown(tag.clone()),
        })
    }
}

fn payload<T: DeserializeOwned>(data: &Value) -> Result<T, serde_json::Error> {
    match data {
        Value::Null => serde_json::from_value(Value::Object(Default::default())),
        other => serde_json::from_value(other.clone()),
    }
}

#[derive(Debug)]
pub struct IndexedNode<'a> {
    pub node: &'a FlowNode,
    /// `None` when the payload failed to parse; an `INVALID_NODE_CONFIG`
    /// error has been recorded for it.
    pub kind: Option<NodeKind>,
}

impl IndexedNode<'_> {
    pub fn node_type(&self) -> &NodeType {
        &self.node.node_type
    }

    pub fn is(&self, node_type: &NodeType) -> bool {
        &self.node.node_type == node_type
    }
}

#[derive(Debug)]
pub struct GraphIndex<'a> {
    order: Vec<&'a str>,
    nodes: HashMap<&'a str, IndexedNode<'a>>,
    edges: &'a [FlowEdge],
    outgoing: HashMap<&'a str, Vec<&'a str>>,
    incoming: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> GraphIndex<'a> {
    /// Index the flow. Duplicate ids and unparsable payloads are reported as
    /// errors; the first node with a given id wins.
    pub fn build(flow: &'a FlowDefinition) -> (Self, Findings) {
        let mut findings = Findings::default();
        let mut order = Vec::with_capacity(flow.nodes.len());
        let mut nodes = HashMap::with_capacity(flow.nodes.len());

        for node in &flow.nodes {
            if nodes.contains_key(node.id.as_str()) {
                findings.error(
                    Issue::new(
                        IssueCode::DuplicateNodeId,
                        format!("Node id '{}' is used more than once", node.id),
                    )
                    .on_node(&node.id),
                );
                continue;
            }

            let kind = match NodeKind::parse(&node.node_type, &node.data) {
                Ok(kind) => Some(kind),
                Err(e) => {
                    findings.error(
                        Issue::new(
                            IssueCode::InvalidNodeConfig,
                            format!(
                                "Node '{}' has an invalid {} configuration: {e}",
                                node.display_name(),
                                node.node_type
                            ),
                        )
                        .on_node(&node.id),
                    );
                    None
                }
            };

            order.push(node.id.as_str());
            nodes.insert(node.id.as_str(), IndexedNode { node, kind });
        }

        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &flow.edges {
            if nodes.contains_key(edge.source.as_str())
                && nodes.contains_key(edge.target.as_str())
            {
                outgoing
                    .entry(edge.source.as_str())
                    .or_default()
                    .push(edge.target.as_str());
                incoming
                    .entry(edge.target.as_str())
                    .or_default()
                    .push(edge.source.as_str());
            }
        }

        let index = Self {
            order,
            nodes,
            edges: &flow.edges,
            outgoing,
            incoming,
        };
        (index, findings)
    }

    pub fn get(&self, id: &str) -> Option<&IndexedNode<'a>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = &IndexedNode<'a>> + '_ {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &'a [FlowEdge] {
        self.edges
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Targets of edges leaving `id`, in edge order. Dangling edges are excluded.
    pub fn successors(&self, id: &str) -> &[&'a str] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sources of edges entering `id`, in edge order. Dangling edges are excluded.
    pub fn predecessors(&self, id: &str) -> &[&'a str] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn label(&self, id: &str) -> String {
        self.nodes
            .get(id)
            .map(|n| n.node.display_name().to_string())
            .unwrap_or_else(|| id.to_string())
    }
}
