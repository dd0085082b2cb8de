/*
 * Copyright Logica Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      https://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Serialized compilation plans.
//!
//! A plan is the compiler's durable output: an ordered list of nodes, each
//! carrying the SQL that materializes it, plus the outputs a caller reads
//! back. Plan JSON is byte-stable for identical input (struct field order is
//! the serialization order, and object keys preserve insertion order), so
//! golden files can compare bytes.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::err::PlanError;

/// Schema tag accepted by this build. Plans carrying any other tag are
/// rejected rather than best-effort interpreted.
pub const PLAN_SCHEMA: &str = "logica_rb.plan.v1";

/// A fully rendered compilation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationPlan {
    pub schema: String,
    pub engine: String,
    /// Predicates the caller asked for, in request order.
    pub final_predicates: Vec<SmolStr>,
    /// Where to read each requested predicate's rows.
    pub outputs: Vec<PlanOutput>,
    /// Nodes in execution order: each may reference only nodes before it.
    pub config: Vec<PlanNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOutput {
    pub predicate: SmolStr,
    /// Name of the `config` node holding this output.
    pub node: SmolStr,
    pub kind: OutputKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    pub name: SmolStr,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub action: NodeAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// A requested output.
    Final,
    /// Scaffolding (for example a grounded recursion layer).
    Intermediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAction {
    pub sql: String,
    pub launcher: Launcher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Launcher {
    /// The node's SQL is one self-contained query.
    Query,
    /// The node's SQL is a script of statements and directives.
    Script,
}

impl CompilationPlan {
    pub fn to_json(&self, pretty: bool) -> Result<String, serde_json::Error> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, PlanError> {
        serde_json::from_str(json).map_err(PlanError::InvalidJson)
    }

    /// Check internal consistency: known schema, every output's node present
    /// in `config`, and no node referencing a node defined after it.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.schema != PLAN_SCHEMA {
            return Err(PlanError::UnsupportedSchema {
                schema: self.schema.clone(),
            });
        }
        for output in &self.outputs {
            if !self.config.iter().any(|node| node.name == output.node) {
                return Err(PlanError::MissingOutputNode {
                    node: output.node.clone(),
                });
            }
        }
        for (position, node) in self.config.iter().enumerate() {
            for later in self.config.iter().skip(position + 1) {
                if contains_word(&node.action.sql, &later.name) {
                    return Err(PlanError::ForwardReference {
                        node: node.name.clone(),
                        referenced: later.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate plan JSON in one step. This is what `validate-plan`
/// calls.
pub fn validate_plan_json(json: &str) -> Result<(), PlanError> {
    CompilationPlan::from_json_str(json)?.validate()
}

/// Whole-word occurrence check, where word characters are `[A-Za-z0-9_]`.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let is_word = |c: u8| c.is_ascii_alphanumeric() || c == b'_';
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(found) = haystack.get(start..).and_then(|tail| tail.find(needle)) {
        let at = start + found;
        let end = at + needle.len();
        let before_ok = at == 0 || bytes.get(at - 1).is_none_or(|&b| !is_word(b));
        let after_ok = bytes.get(end).is_none_or(|&b| !is_word(b));
        if before_ok && after_ok {
            return true;
        }
        start = at + 1;
    }
    false
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use super::*;
    use cool_asserts::assert_matches;

    fn query_node(name: &str, sql: &str, node_type: NodeType) -> PlanNode {
        PlanNode {
            name: SmolStr::new(name),
            node_type,
            action: NodeAction {
                sql: sql.to_string(),
                launcher: Launcher::Query,
            },
        }
    }

    fn single_node_plan() -> CompilationPlan {
        CompilationPlan {
            schema: PLAN_SCHEMA.to_string(),
            engine: "sqlite".to_string(),
            final_predicates: vec![SmolStr::new("Test")],
            outputs: vec![PlanOutput {
                predicate: SmolStr::new("Test"),
                node: SmolStr::new("Test"),
                kind: OutputKind::Table,
            }],
            config: vec![query_node("Test", "SELECT\n  1 AS col0", NodeType::Final)],
        }
    }

    #[test]
    fn well_formed_plan_validates_and_round_trips() {
        let plan = single_node_plan();
        plan.validate().unwrap();
        let json = plan.to_json(true).unwrap();
        let back = CompilationPlan::from_json_str(&json).unwrap();
        assert_eq!(plan, back);
        // Byte stability: serializing again yields identical text.
        assert_eq!(json, back.to_json(true).unwrap());
    }

    #[test]
    fn output_referencing_missing_node_is_rejected() {
        let mut plan = single_node_plan();
        plan.outputs[0].node = SmolStr::new("MissingNode");
        assert_matches!(
            plan.validate(),
            Err(PlanError::MissingOutputNode { node }) => assert_eq!(node, "MissingNode")
        );
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let mut plan = single_node_plan();
        plan.schema = "logica_rb.plan.v2".to_string();
        assert_matches!(
            plan.validate(),
            Err(PlanError::UnsupportedSchema { schema }) => assert_eq!(schema, "logica_rb.plan.v2")
        );
    }

    #[test]
    fn forward_references_are_rejected() {
        let mut plan = single_node_plan();
        plan.config = vec![
            query_node("A", "SELECT * FROM B", NodeType::Intermediate),
            query_node("B", "SELECT 1", NodeType::Final),
        ];
        plan.outputs[0].node = SmolStr::new("B");
        plan.outputs[0].predicate = SmolStr::new("B");
        assert_matches!(
            plan.validate(),
            Err(PlanError::ForwardReference { node, referenced }) => {
                assert_eq!(node, "A");
                assert_eq!(referenced, "B");
            }
        );

        // Substrings of identifiers do not count as references.
        plan.config = vec![
            query_node("A", "SELECT * FROM Bravo", NodeType::Intermediate),
            query_node("B", "SELECT * FROM A", NodeType::Final),
        ];
        plan.validate().unwrap();
    }

    #[test]
    fn truncated_json_reports_the_contract_prefix() {
        let err = validate_plan_json("{").unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON:"));
    }

    #[test]
    fn json_field_order_is_schema_first() {
        let plan = single_node_plan();
        let json = plan.to_json(false).unwrap();
        assert!(json.starts_with("{\"schema\":\"logica_rb.plan.v1\",\"engine\":\"sqlite\""));
        assert!(json.contains("\"kind\":\"table\""));
        assert!(json.contains("\"type\":\"final\""));
        assert!(json.contains("\"launcher\":\"query\""));
    }
}
