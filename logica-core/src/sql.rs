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

//! Translation of one predicate's rules into a SELECT statement.
//!
//! Each rule becomes a SELECT (body atoms as joins, equalities as bindings
//! or filters); multiple rules for one predicate are combined with
//! `UNION ALL`. The output text is deterministic for identical input: items
//! are emitted in argument order and conditions in body order.

use std::collections::BTreeMap;

use itertools::Itertools;
use smol_str::SmolStr;

use crate::ast::{Atom, Literal, Rule, Term};
use crate::dialects::{Engine, Library};
use crate::err::CompileError;

/// Everything the translator needs to render one predicate.
#[derive(Debug)]
pub struct SqlContext<'a> {
    pub engine: Engine,
    pub library: &'a Library,
    /// Maps each referenced predicate to the SQL relation implementing it
    /// (a plan node name, a materialized table, or an unrolled layer).
    pub relations: &'a BTreeMap<SmolStr, SmolStr>,
}

impl SqlContext<'_> {
    fn relation(&self, predicate: &str) -> Result<SmolStr, CompileError> {
        self.relations
            .get(predicate)
            .cloned()
            .ok_or_else(|| CompileError::UndefinedPredicate {
                predicate: SmolStr::new(predicate),
            })
    }
}

/// Render the rules of one predicate as a single SELECT, combining multiple
/// rules with `UNION ALL`.
pub fn predicate_sql(rules: &[Rule], ctx: &SqlContext<'_>) -> Result<String, CompileError> {
    let mut parts = Vec::with_capacity(rules.len());
    for rule in rules {
        parts.push(rule_sql(rule, ctx)?);
    }
    Ok(parts.join("\nUNION ALL\n"))
}

fn rule_sql(rule: &Rule, ctx: &SqlContext<'_>) -> Result<String, CompileError> {
    let mut from_items: Vec<(String, SmolStr)> = Vec::new();
    let mut bindings: BTreeMap<SmolStr, String> = BTreeMap::new();
    let mut conditions: Vec<String> = Vec::new();

    // First pass: positive atoms bind variables to their columns.
    let mut deferred: Vec<(String, &Term)> = Vec::new();
    for literal in &rule.body {
        if let Literal::Atom(atom) = literal {
            let alias = format!("t{}", from_items.len());
            from_items.push((alias.clone(), ctx.relation(&atom.predicate)?));
            for arg in &atom.args {
                let column_expr = format!("{alias}.{}", arg.name.column_name());
                match &arg.value {
                    Term::Var(var) => {
                        if let Some(bound) = bindings.get(var) {
                            conditions.push(format!("{column_expr} = {bound}"));
                        } else {
                            bindings.insert(var.clone(), column_expr);
                        }
                    }
                    other => deferred.push((column_expr, other)),
                }
            }
        }
    }

    // Second pass: propagate equality bindings until a fixpoint, so rules
    // may state equalities in any order.
    let mut pending: Vec<&Literal> = rule
        .body
        .iter()
        .filter(|l| matches!(l, Literal::Eq { .. }))
        .collect();
    loop {
        let mut progressed = false;
        let mut still_pending = Vec::new();
        for literal in pending {
            let Literal::Eq { left, right } = literal else {
                continue;
            };
            match (left, right) {
                (Term::Var(var), other) | (other, Term::Var(var))
                    if !bindings.contains_key(var) =>
                {
                    match render_term(other, &bindings, ctx) {
                        Ok(expr) => {
                            bindings.insert(var.clone(), expr);
                            progressed = true;
                        }
                        Err(_) => still_pending.push(literal),
                    }
                }
                _ => still_pending.push(literal),
            }
        }
        pending = still_pending;
        if !progressed {
            break;
        }
    }
    // Whatever equalities remain are plain filters.
    for literal in pending {
        if let Literal::Eq { left, right } = literal {
            let l = render_term(left, &bindings, ctx)?;
            let r = render_term(right, &bindings, ctx)?;
            conditions.push(format!("{l} = {r}"));
        }
    }

    for (column_expr, term) in deferred {
        let rendered = render_term(term, &bindings, ctx)?;
        conditions.push(format!("{column_expr} = {rendered}"));
    }

    for literal in &rule.body {
        match literal {
            Literal::Atom(_) | Literal::Eq { .. } => {}
            Literal::Cmp { op, left, right } => {
                let l = render_term(left, &bindings, ctx)?;
                let r = render_term(right, &bindings, ctx)?;
                conditions.push(format!("{l} {} {r}", op.as_sql()));
            }
            Literal::In { element, list } => {
                let membership = ctx.library.get("In").ok_or_else(|| {
                    CompileError::UnknownBuiltin {
                        builtin: SmolStr::new("In"),
                        engine: ctx.engine.name().to_string(),
                        profile: String::new(),
                    }
                })?;
                let e = render_term(element, &bindings, ctx)?;
                let l = render_term(list, &bindings, ctx)?;
                conditions.push(membership.instantiate(&[e, l])?);
            }
            Literal::Negation(atom) => {
                conditions.push(negation_sql(atom, &bindings, ctx)?);
            }
        }
    }

    let select_items: Vec<String> = rule
        .head
        .args
        .iter()
        .map(|arg| {
            let expr = match &arg.value {
                Term::Var(var) => {
                    bindings
                        .get(var)
                        .cloned()
                        .ok_or_else(|| CompileError::UnboundVariable {
                            variable: var.clone(),
                            predicate: rule.head.predicate.clone(),
                        })?
                }
                other => render_term(other, &bindings, ctx)?,
            };
            Ok(format!("{expr} AS {}", arg.name.column_name()))
        })
        .collect::<Result<_, CompileError>>()?;

    let mut sql = format!("SELECT\n  {}", select_items.iter().join(",\n  "));
    if !from_items.is_empty() {
        sql.push_str("\nFROM\n  ");
        sql.push_str(
            &from_items
                .iter()
                .map(|(alias, relation)| format!("{relation} AS {alias}"))
                .join(",\n  "),
        );
    }
    if !conditions.is_empty() {
        sql.push_str("\nWHERE\n  ");
        sql.push_str(&conditions.iter().join(" AND\n  "));
    }
    Ok(sql)
}

/// `NOT EXISTS` probe for a negated body atom.
fn negation_sql(
    atom: &Atom,
    bindings: &BTreeMap<SmolStr, String>,
    ctx: &SqlContext<'_>,
) -> Result<String, CompileError> {
    let relation = ctx.relation(&atom.predicate)?;
    let mut probes = Vec::new();
    for arg in &atom.args {
        let expr = render_term(&arg.value, bindings, ctx)?;
        probes.push(format!("x.{} = {expr}", arg.name.column_name()));
    }
    if probes.is_empty() {
        Ok(format!("NOT EXISTS (SELECT 1 FROM {relation} AS x)"))
    } else {
        Ok(format!(
            "NOT EXISTS (SELECT 1 FROM {relation} AS x WHERE {})",
            probes.iter().join(" AND ")
        ))
    }
}

/// Render a term to a SQL expression given the current variable bindings.
fn render_term(
    term: &Term,
    bindings: &BTreeMap<SmolStr, String>,
    ctx: &SqlContext<'_>,
) -> Result<String, CompileError> {
    match term {
        Term::Var(var) => {
            bindings
                .get(var)
                .cloned()
                .ok_or_else(|| CompileError::UnboundVariable {
                    variable: var.clone(),
                    predicate: SmolStr::new(""),
                })
        }
        Term::Num(n) => Ok(render_number(*n)),
        Term::Str(s) => Ok(quote_str(s)),
        Term::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Term::List(items) => {
            let rendered: Vec<String> = items
                .iter()
                .map(|item| render_term(item, bindings, ctx))
                .collect::<Result<_, _>>()?;
            Ok(match ctx.engine {
                Engine::Sqlite => format!("json_array({})", rendered.iter().join(", ")),
                Engine::Psql => format!("ARRAY[{}]", rendered.iter().join(", ")),
            })
        }
        Term::Record(fields) => {
            let rendered: Vec<String> = fields
                .iter()
                .map(|(name, value)| {
                    let value = render_term(value, bindings, ctx)?;
                    Ok(format!("{}, {value}", quote_str(name)))
                })
                .collect::<Result<_, CompileError>>()?;
            Ok(match ctx.engine {
                Engine::Sqlite => format!("json_object({})", rendered.iter().join(", ")),
                Engine::Psql => format!("jsonb_build_object({})", rendered.iter().join(", ")),
            })
        }
        Term::Field { record, field } => {
            let record = render_term(record, bindings, ctx)?;
            Ok(match ctx.engine {
                Engine::Sqlite => format!("json_extract({record}, '$.{field}')"),
                Engine::Psql => format!("({record} ->> {})", quote_str(field)),
            })
        }
        Term::Call { predicate, args } => {
            let builtin =
                ctx.library
                    .get(predicate)
                    .ok_or_else(|| CompileError::UnknownBuiltin {
                        builtin: predicate.clone(),
                        engine: ctx.engine.name().to_string(),
                        profile: String::new(),
                    })?;
            let rendered: Vec<String> = args
                .iter()
                .map(|arg| render_term(arg, bindings, ctx))
                .collect::<Result<_, _>>()?;
            builtin.instantiate(&rendered)
        }
    }
}

/// Integral values print without a fractional part, so `x = 1` renders as
/// `1`, not `1.0`.
fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::ast::test_programs::{self, atom};
    use crate::ast::CmpOp;
    use crate::dialects::{DialectLibraries, LibraryProfile};
    use cool_asserts::assert_matches;

    fn ctx<'a>(
        engine: Engine,
        relations: &'a BTreeMap<SmolStr, SmolStr>,
    ) -> SqlContext<'a> {
        SqlContext {
            engine,
            library: DialectLibraries::all_available().library(engine, LibraryProfile::Safe),
            relations,
        }
    }

    fn self_relations(names: &[&str]) -> BTreeMap<SmolStr, SmolStr> {
        names
            .iter()
            .map(|n| (SmolStr::new(*n), SmolStr::new(*n)))
            .collect()
    }

    #[test]
    fn constant_fact_renders_without_from() {
        let program = test_programs::single_fact();
        let relations = self_relations(&[]);
        let sql = predicate_sql(&program.rules, &ctx(Engine::Sqlite, &relations)).unwrap();
        assert_eq!(sql, "SELECT\n  1 AS col0");
    }

    #[test]
    fn join_binds_shared_variables() {
        // P(a, c) :- Edge(a, b), Edge(b, c);
        let rule = Rule {
            head: atom("P", &["a", "c"]),
            body: vec![
                Literal::Atom(atom("Edge", &["a", "b"])),
                Literal::Atom(atom("Edge", &["b", "c"])),
            ],
        };
        let relations = self_relations(&["Edge"]);
        let sql = predicate_sql(&[rule], &ctx(Engine::Sqlite, &relations)).unwrap();
        assert_eq!(
            sql,
            "SELECT\n  t0.col0 AS col0,\n  t1.col1 AS col1\n\
             FROM\n  Edge AS t0,\n  Edge AS t1\n\
             WHERE\n  t1.col0 = t0.col1"
        );
    }

    #[test]
    fn multiple_rules_union_all() {
        let mut program = test_programs::single_fact();
        let mut second = program.rules[0].clone();
        second.body = vec![Literal::Eq {
            left: Term::Var(SmolStr::new("x")),
            right: Term::Num(2.0),
        }];
        program.rules.push(second);
        let relations = self_relations(&[]);
        let sql = predicate_sql(&program.rules, &ctx(Engine::Sqlite, &relations)).unwrap();
        assert_eq!(sql, "SELECT\n  1 AS col0\nUNION ALL\nSELECT\n  2 AS col0");
    }

    #[test]
    fn comparisons_and_negation_become_filters() {
        // Q(a) :- Edge(a, b), b > 1, !Blocked(a);
        let rule = Rule {
            head: atom("Q", &["a"]),
            body: vec![
                Literal::Atom(atom("Edge", &["a", "b"])),
                Literal::Cmp {
                    op: CmpOp::Gt,
                    left: Term::Var(SmolStr::new("b")),
                    right: Term::Num(1.0),
                },
                Literal::Negation(atom("Blocked", &["a"])),
            ],
        };
        let relations = self_relations(&["Edge", "Blocked"]);
        let sql = predicate_sql(&[rule], &ctx(Engine::Sqlite, &relations)).unwrap();
        assert!(sql.contains("t0.col1 > 1"));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM Blocked AS x WHERE x.col0 = t0.col0)"));
    }

    #[test]
    fn membership_uses_the_dialect_macro() {
        let rule = Rule {
            head: atom("M", &["x"]),
            body: vec![
                Literal::Eq {
                    left: Term::Var(SmolStr::new("x")),
                    right: Term::Num(1.0),
                },
                Literal::In {
                    element: Term::Var(SmolStr::new("x")),
                    list: Term::List(vec![Term::Num(1.0), Term::Num(2.0)]),
                },
            ],
        };
        let relations = self_relations(&[]);
        let sqlite = predicate_sql(&[rule.clone()], &ctx(Engine::Sqlite, &relations)).unwrap();
        assert!(sqlite.contains("1 IN (SELECT value FROM json_each(json_array(1, 2)))"));
        let psql = predicate_sql(&[rule], &ctx(Engine::Psql, &relations)).unwrap();
        assert!(psql.contains("1 = ANY(ARRAY[1, 2])"));
    }

    #[test]
    fn builtin_calls_substitute_macros() {
        let rule = Rule {
            head: atom("F", &["x"]),
            body: vec![Literal::Eq {
                left: Term::Var(SmolStr::new("x")),
                right: Term::Call {
                    predicate: SmolStr::new("Fingerprint"),
                    args: vec![Term::Str("seed".to_string())],
                },
            }],
        };
        let relations = self_relations(&[]);
        let sql = predicate_sql(&[rule], &ctx(Engine::Psql, &relations)).unwrap();
        assert!(sql.contains("md5(('seed')::text)"));
    }

    #[test]
    fn unknown_builtin_is_an_error() {
        let rule = Rule {
            head: atom("F", &["x"]),
            body: vec![Literal::Eq {
                left: Term::Var(SmolStr::new("x")),
                right: Term::Call {
                    predicate: SmolStr::new("Teleport"),
                    args: vec![],
                },
            }],
        };
        let relations = self_relations(&[]);
        assert_matches!(
            predicate_sql(&[rule], &ctx(Engine::Sqlite, &relations)),
            Err(CompileError::UnknownBuiltin { builtin, .. }) => assert_eq!(builtin, "Teleport")
        );
    }

    #[test]
    fn unbound_head_variable_is_an_error() {
        let rule = Rule {
            head: atom("U", &["mystery"]),
            body: vec![],
        };
        let relations = self_relations(&[]);
        assert_matches!(
            predicate_sql(&[rule], &ctx(Engine::Sqlite, &relations)),
            Err(CompileError::UnboundVariable { variable, .. }) => assert_eq!(variable, "mystery")
        );
    }

    #[test]
    fn string_constants_are_quoted() {
        let rule = Rule {
            head: atom("S", &["x"]),
            body: vec![Literal::Eq {
                left: Term::Var(SmolStr::new("x")),
                right: Term::Str("it's".to_string()),
            }],
        };
        let relations = self_relations(&[]);
        let sql = predicate_sql(&[rule], &ctx(Engine::Sqlite, &relations)).unwrap();
        assert!(sql.contains("'it''s' AS col0"));
    }
}
