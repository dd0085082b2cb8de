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

//! The predicate/rule AST consumed by the compiler.
//!
//! The textual parser/tokenizer is an external collaborator; it hands the
//! core this structure, serialized as JSON. Everything here is plain data
//! with serde derives so the CLI can ingest parser output directly.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeSet;

/// A whole program: the set of rules visible to one compilation call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub rules: Vec<Rule>,
}

/// A named rule: `Head(args) :- body.`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub head: Atom,
    #[serde(default)]
    pub body: Vec<Literal>,
}

/// A predicate application, in a head or a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub predicate: SmolStr,
    #[serde(default)]
    pub args: Vec<Arg>,
}

/// One argument of an atom, positional or named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arg {
    pub name: ArgName,
    pub value: Term,
}

/// Positional arguments become numbered columns (`col0`, `col1`, ...), which
/// is why record types zero-pad numeric field keys when rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgName {
    Pos(usize),
    Named(SmolStr),
}

impl ArgName {
    /// The SQL column name this argument maps to.
    pub fn column_name(&self) -> SmolStr {
        match self {
            ArgName::Pos(i) => SmolStr::new(format!("col{i}")),
            ArgName::Named(name) => name.clone(),
        }
    }
}

/// A body literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    /// Positive predicate call.
    Atom(Atom),
    /// Negated predicate call, compiled to `NOT EXISTS`.
    Negation(Atom),
    /// Equality, used both for binding and for filtering.
    Eq { left: Term, right: Term },
    /// Ordering comparison.
    Cmp { op: CmpOp, left: Term, right: Term },
    /// List membership: `element in list`.
    In { element: Term, list: Term },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

impl CmpOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Ne => "!=",
        }
    }
}

/// A term: variable, constant, structure, or builtin call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    Var(SmolStr),
    Num(f64),
    Str(String),
    Bool(bool),
    List(Vec<Term>),
    /// Record literal; the field set is final (a closed record).
    Record(Vec<(SmolStr, Term)>),
    /// `record.field` access.
    Field { record: Box<Term>, field: SmolStr },
    /// Call to a dialect-library builtin predicate.
    Call { predicate: SmolStr, args: Vec<Term> },
}

impl Program {
    /// Names of all predicates defined by a rule in this program.
    pub fn defined_predicates(&self) -> BTreeSet<SmolStr> {
        self.rules
            .iter()
            .map(|rule| rule.head.predicate.clone())
            .collect()
    }

    /// All rules whose head is `predicate`.
    pub fn rules_for(&self, predicate: &str) -> Vec<&Rule> {
        self.rules
            .iter()
            .filter(|rule| rule.head.predicate == predicate)
            .collect()
    }

    /// The predicates referenced by the bodies of `predicate`'s rules,
    /// restricted to predicates defined in this program (dialect builtins are
    /// not dependencies).
    pub fn dependencies(&self, predicate: &str) -> BTreeSet<SmolStr> {
        let defined = self.defined_predicates();
        let mut deps = BTreeSet::new();
        for rule in self.rules_for(predicate) {
            for literal in &rule.body {
                match literal {
                    Literal::Atom(atom) | Literal::Negation(atom) => {
                        if defined.contains(&atom.predicate) {
                            deps.insert(atom.predicate.clone());
                        }
                    }
                    Literal::Eq { .. } | Literal::Cmp { .. } | Literal::In { .. } => {}
                }
            }
        }
        deps
    }
}

#[cfg(test)]
pub(crate) mod test_programs {
    use super::*;

    pub fn atom(predicate: &str, vars: &[&str]) -> Atom {
        Atom {
            predicate: SmolStr::new(predicate),
            args: vars
                .iter()
                .enumerate()
                .map(|(i, v)| Arg {
                    name: ArgName::Pos(i),
                    value: Term::Var(SmolStr::new(*v)),
                })
                .collect(),
        }
    }

    /// `Test(x) :- x = 1;`
    pub fn single_fact() -> Program {
        Program {
            rules: vec![Rule {
                head: atom("Test", &["x"]),
                body: vec![Literal::Eq {
                    left: Term::Var(SmolStr::new("x")),
                    right: Term::Num(1.0),
                }],
            }],
        }
    }

    /// A linear-recursive reachability program over an `Edge` fact table.
    pub fn reachability() -> Program {
        let edge_rule = Rule {
            head: atom("Edge", &["a", "b"]),
            body: vec![
                Literal::Eq {
                    left: Term::Var(SmolStr::new("a")),
                    right: Term::Num(1.0),
                },
                Literal::Eq {
                    left: Term::Var(SmolStr::new("b")),
                    right: Term::Num(2.0),
                },
            ],
        };
        Program {
            rules: vec![
                edge_rule,
                Rule {
                    head: atom("Reach", &["a", "b"]),
                    body: vec![Literal::Atom(atom("Edge", &["a", "b"]))],
                },
                Rule {
                    head: atom("Reach", &["a", "c"]),
                    body: vec![
                        Literal::Atom(atom("Reach", &["a", "b"])),
                        Literal::Atom(atom("Edge", &["b", "c"])),
                    ],
                },
            ],
        }
    }
}
