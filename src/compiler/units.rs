use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::flows::schema::JsonSchema;
use crate::flows::{SinkConfig, SourceConfig};

/// Executable descriptor for one node of a successfully validated flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledUnit {
    pub node_id: String,
    pub label: String,
    /// Nodes feeding this one, in edge order.
    pub inputs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonSchema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<JsonSchema>,
    pub op: UnitOp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UnitOp {
    #[serde(rename_all = "camelCase")]
    AiBlock {
        block_id: Option<String>,
        model: Option<String>,
        prompt: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FunctionBlock {
        block_id: Option<String>,
        language: Option<String>,
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Router {
        routes: BTreeMap<String, String>,
        route_field: String,
        default_route: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Parallel { processors: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Loop {
        body_node_id: String,
        condition: Option<String>,
        max_iterations: u32,
    },
    Filter { condition: String },
    #[serde(rename_all = "camelCase")]
    Gate {
        condition: Option<String>,
        require_approval: bool,
    },
    Source(SourceConfig),
    Sink(SinkConfig),
}

/// The engine that actually runs compiled units (model calls, sandboxed
/// code, routing decisions). Lives outside this crate.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    async fn run_unit(&self, unit: &CompiledUnit, input: Value) -> anyhow::Result<Value>;
}

/// Hands every unit its input back unchanged. Used when no block engine is
/// attached, so flows can be run end to end to check their wiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRunner;

#[async_trait]
impl UnitRunner for PassthroughRunner {
    async fn run_unit(&self, unit: &CompiledUnit, input: Value) -> anyhow::Result<Value> {
        tracing::debug!(node = %unit.label, "Passing input through");
        Ok(input)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitResult {
    Completed { output: Value },
    Failed { error: String },
    /// An upstream unit failed or was skipped.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitOutcome {
    pub node_id: String,
    #[serde(flatten)]
    pub result: UnitResult,
}

/// Handle over the ordered compiled units of one flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowExecutor {
    units: Vec<CompiledUnit>,
}

impl FlowExecutor {
    pub(crate) fn new(units: Vec<CompiledUnit>) -> Self {
        Self { units }
    }

    /// Units in execution order: every unit follows all of its inputs,
    /// except for loop feedback edges.
    pub fn units(&self) -> &[CompiledUnit] {
        &self.units
    }

    pub fn unit(&self, node_id: &str) -> Option<&CompiledUnit> {
        self.units.iter().find(|u| u.node_id == node_id)
    }

    /// Walk the units in order, handing each to `runner`.
    ///
    /// Units without inputs receive `input`. A unit with one input receives
    /// that unit's output; with several, an object keyed by input node id.
    /// Inputs that have not run yet (loop feedback) are ignored. Failures do
    /// not stop the walk, but everything downstream of a failure is skipped.
    pub async fn run(&self, runner: &dyn UnitRunner, input: Value) -> Vec<UnitOutcome> {
        let mut outputs: HashMap<&str, Option<Value>> = HashMap::new();
        let mut outcomes = Vec::with_capacity(self.units.len());

        for unit in &self.units {
            let ready: Vec<(&str, &Option<Value>)> = unit
                .inputs
                .iter()
                .filter_map(|id| outputs.get(id.as_str()).map(|out| (id.as_str(), out)))
                .collect();

            if ready.iter().any(|(_, out)| out.is_none()) {
                tracing::warn!(node = %unit.label, "Skipping unit, upstream did not complete");
                outputs.insert(unit.node_id.as_str(), None);
                outcomes.push(UnitOutcome {
                    node_id: unit.node_id.clone(),
                    result: UnitResult::Skipped,
                });
                continue;
            }

            let unit_input = match ready.as_slice() {
                [] => input.clone(),
                [(_, Some(single))] => single.clone(),
                many => Value::Object(
                    many.iter()
                        .filter_map(|(id, out)| {
                            out.as_ref().map(|v| (id.to_string(), v.clone()))
                        })
                        .collect(),
                ),
            };

            let result = match runner.run_unit(unit, unit_input).await {
                Ok(output) => {
                    tracing::debug!(node = %unit.label, "✓ Unit completed");
                    outputs.insert(unit.node_id.as_str(), Some(output.clone()));
                    UnitResult::Completed { output }
                }
                Err(e) => {
                    let error = format!("{e:#}");
                    tracing::error!(node = %unit.label, error = %error, "✗ Unit failed");
                    outputs.insert(unit.node_id.as_str(), None);
                    UnitResult::Failed { error }
                }
            };
            outcomes.push(UnitOutcome {
                node_id: unit.node_id.clone(),
                result,
            });
        }

        outcomes
    }
}
