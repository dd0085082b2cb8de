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

//! Error types raised eagerly by the compiler, plan validator, safety
//! validator, and executor.
//!
//! Type conflicts are deliberately *not* here: they are data
//! ([`crate::types::BadType`]) and only become a [`CompileError`] when the
//! caller asks for a compiled artifact with conflicts still present.

use miette::Diagnostic;
use serde::Serialize;
use smol_str::SmolStr;
use thiserror::Error;

/// Raised when an engine name does not resolve to a known dialect. This is a
/// hard compile error, never a silent fallback.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("unsupported engine: `{name}`")]
#[diagnostic(
    code(logica::unsupported_engine),
    help("supported engines are `sqlite` and `psql`")
)]
pub struct UnsupportedEngineError {
    /// The engine name that failed to resolve.
    pub name: String,
}

/// Machine-readable reason carried by a [`Violation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    /// A denylisted function was called.
    ForbiddenFunction,
    /// An untrusted source query contained more than one statement.
    MultipleStatements,
}

/// A rejected unsafe SQL construct, found by the static validator. Dynamic
/// sandbox denials deliberately do *not* use this type; they surface as the
/// driver's native authorization error.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(logica::sql_violation))]
pub struct Violation {
    /// Why the SQL was rejected.
    pub reason: ViolationReason,
    /// The offending identifier, when one exists.
    pub identifier: Option<SmolStr>,
    /// Human-readable description.
    pub message: String,
}

impl Violation {
    pub(crate) fn forbidden_function(identifier: &str, engine: &str) -> Self {
        Violation {
            reason: ViolationReason::ForbiddenFunction,
            identifier: Some(SmolStr::new(identifier)),
            message: format!("forbidden function `{identifier}` for engine `{engine}`"),
        }
    }

    pub(crate) fn multiple_statements() -> Self {
        Violation {
            reason: ViolationReason::MultipleStatements,
            identifier: None,
            message: "untrusted source queries must consist of a single statement".to_string(),
        }
    }
}

/// Errors reading or checking a serialized compilation plan.
#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    /// The plan body was not valid JSON. The message prefix is part of the
    /// CLI contract.
    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(logica::plan::invalid_json))]
    InvalidJson(#[source] serde_json::Error),

    /// An output referenced a node absent from `config`. The message text is
    /// part of the CLI contract.
    #[error("outputs references missing node: {node}")]
    #[diagnostic(code(logica::plan::missing_node))]
    MissingOutputNode {
        /// Name of the node the output referenced.
        node: SmolStr,
    },

    /// In script mode, a node referenced a node defined after it.
    #[error("node `{node}` references later-defined node `{referenced}`")]
    #[diagnostic(code(logica::plan::forward_reference))]
    ForwardReference {
        node: SmolStr,
        referenced: SmolStr,
    },

    /// The plan schema tag did not match what this build understands.
    #[error("unsupported plan schema: `{schema}`")]
    #[diagnostic(code(logica::plan::unsupported_schema))]
    UnsupportedSchema { schema: String },
}

/// One type conflict surfaced by compilation, already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeConflict {
    /// Predicate whose signature the conflict appears in.
    pub predicate: SmolStr,
    /// Column of that predicate.
    pub column: SmolStr,
    /// Diagnostic from [`crate::types::BadType::diagnostic_message`].
    pub message: String,
}

fn format_type_conflicts(conflicts: &[TypeConflict]) -> String {
    itertools::join(
        conflicts.iter().map(|c| {
            format!(
                "in `{}` column `{}`: {}",
                c.predicate, c.column, c.message
            )
        }),
        "; ",
    )
}

/// Errors raised by the compilation pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    UnsupportedEngine(#[from] UnsupportedEngineError),

    /// The requested predicate (or one of its dependencies) has no rules.
    #[error("undefined predicate: `{predicate}`")]
    #[diagnostic(code(logica::compile::undefined_predicate))]
    UndefinedPredicate { predicate: SmolStr },

    /// A builtin call did not resolve in the selected dialect library.
    #[error("unknown builtin `{builtin}` for engine `{engine}` (profile `{profile}`)")]
    #[diagnostic(code(logica::compile::unknown_builtin))]
    UnknownBuiltin {
        builtin: SmolStr,
        engine: String,
        profile: String,
    },

    /// A builtin call was made with the wrong number of arguments.
    #[error("builtin `{builtin}` takes {expected} argument(s), got {got}")]
    #[diagnostic(code(logica::compile::builtin_arity))]
    BuiltinArity {
        builtin: SmolStr,
        expected: usize,
        got: usize,
    },

    /// A variable appeared in a head or condition without ever being bound.
    #[error("unbound variable `{variable}` in rule for `{predicate}`")]
    #[diagnostic(code(logica::compile::unbound_variable))]
    UnboundVariable {
        variable: SmolStr,
        predicate: SmolStr,
    },

    /// All type conflicts found in one compilation, aggregated rather than
    /// reported one at a time.
    #[error("{}", format_type_conflicts(conflicts))]
    #[diagnostic(code(logica::compile::type_conflicts))]
    TypeConflicts { conflicts: Vec<TypeConflict> },
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plan_error_messages_match_the_cli_contract() {
        let missing = PlanError::MissingOutputNode {
            node: SmolStr::new("MissingNode"),
        };
        assert_eq!(
            missing.to_string(),
            "outputs references missing node: MissingNode"
        );

        let bad_json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let invalid = PlanError::InvalidJson(bad_json);
        assert!(invalid.to_string().starts_with("Invalid JSON:"));
    }

    #[test]
    fn conflicts_aggregate_into_one_message() {
        let err = CompileError::TypeConflicts {
            conflicts: vec![
                TypeConflict {
                    predicate: SmolStr::new("P"),
                    column: SmolStr::new("col0"),
                    message: "type conflict: `Num` is incompatible with `Str`".to_string(),
                },
                TypeConflict {
                    predicate: SmolStr::new("P"),
                    column: SmolStr::new("col1"),
                    message: "list element is itself a list: `Singular` is incompatible with `[Num]`"
                        .to_string(),
                },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("col0"));
        assert!(message.contains("col1"));
        assert!(message.contains("; "));
    }
}
