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

//! Running compiled output against a live database.
//!
//! The executor is driver-agnostic: it talks to an [`EngineConnection`] and
//! resolves the dialect from the connection's adapter-name string. Trusted
//! compilations materialize the script rendering table by table; untrusted
//! ones run the single-statement query rendering, wrapped in the driver
//! sandbox where one exists (SQLite).

use std::path::PathBuf;

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

use crate::compile::{CompilationResult, SqlFormat};
use crate::dialects::Engine;
use crate::err::{UnsupportedEngineError, Violation};
use crate::policy::AccessPolicy;
use crate::recursion::ScriptStep;
use crate::safety;

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

pub type Row = Vec<Value>;

/// Errors surfaced while executing compiled output.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecuteError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    UnsupportedEngine(#[from] UnsupportedEngineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Violation(#[from] Violation),

    /// The driver's own error, message preserved. Sandbox denials arrive
    /// here as the driver's native authorization or read-only error.
    #[error("driver error: {message}")]
    #[diagnostic(code(logica::execute::driver))]
    Driver { message: String },

    /// An output predicate had no node in the executed plan.
    #[error("no output named `{predicate}` in the plan")]
    #[diagnostic(code(logica::execute::missing_output))]
    MissingOutput { predicate: SmolStr },
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for ExecuteError {
    fn from(error: rusqlite::Error) -> Self {
        ExecuteError::Driver {
            message: error.to_string(),
        }
    }
}

/// Resolve the engine from an adapter-name-like string, for example
/// `"sqlite3"` or `"ActiveRecord::ConnectionAdapters::PostgreSQLAdapter"`.
pub fn detect_engine(adapter_name: &str) -> Result<Engine, UnsupportedEngineError> {
    let lowered = adapter_name.to_ascii_lowercase();
    if lowered.contains("sqlite") {
        Ok(Engine::Sqlite)
    } else if lowered.contains("psql") || lowered.contains("postgres") {
        Ok(Engine::Psql)
    } else {
        Err(UnsupportedEngineError {
            name: adapter_name.to_string(),
        })
    }
}

/// A live database connection the executor can drive.
pub trait EngineConnection {
    /// Adapter-name-like string used for engine detection.
    fn adapter_name(&self) -> &str;

    /// Run a query and collect every row.
    fn select_all(&self, sql: &str) -> Result<Vec<Row>, ExecuteError>;

    /// Run a statement for its effect.
    fn exec_query(&self, sql: &str) -> Result<(), ExecuteError>;

    /// Run `f` with this connection sandboxed under `policy`. Engines with
    /// no driver-level authorizer run `f` directly; the static validator is
    /// their only layer.
    fn with_policy<T>(
        &self,
        policy: &AccessPolicy,
        f: impl FnOnce(&dyn EngineConnection) -> Result<T, ExecuteError>,
    ) -> Result<T, ExecuteError>
    where
        Self: Sized,
    {
        let _ = policy;
        f(self)
    }
}

/// Runtime knobs for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// When set, iteration stops early at the next grounding point after
    /// this file appears. Checked between statements, never mid-statement.
    pub stop_signal: Option<PathBuf>,
}

/// Whether a script ran to completion or stopped at a grounding point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
}

#[derive(Debug)]
pub struct Executor<'a, C: EngineConnection> {
    conn: &'a C,
    options: ExecuteOptions,
}

impl<'a, C: EngineConnection> Executor<'a, C> {
    pub fn new(conn: &'a C, options: ExecuteOptions) -> Self {
        Executor { conn, options }
    }

    pub fn engine(&self) -> Result<Engine, UnsupportedEngineError> {
        detect_engine(self.conn.adapter_name())
    }

    /// Materialize a compilation's script rendering: every statement is
    /// checked against the engine denylist, then run in order, honoring
    /// iteration counts and stop checks.
    pub fn materialize(&self, result: &CompilationResult) -> Result<RunOutcome, ExecuteError> {
        let engine = self.engine()?;
        self.run_steps(result.script_steps(), engine, result.policy())
    }

    /// Run a compilation's query rendering and collect the rows. Untrusted
    /// compilations additionally require a single statement and run inside
    /// the driver sandbox on engines that have one.
    pub fn query(&self, result: &CompilationResult) -> Result<Vec<Row>, ExecuteError> {
        let engine = self.engine()?;
        let policy = result.policy();
        let sql = result.sql(SqlFormat::Query);
        safety::validate(&sql, engine, &policy.extra_denied_functions())?;
        if !policy.is_trusted() {
            safety::validate_single_statement(&sql)?;
        }
        if policy.sandboxes(engine) {
            self.conn.with_policy(policy, |conn| conn.select_all(&sql))
        } else {
            if !policy.is_trusted() && engine == Engine::Psql {
                for statement in crate::sandbox::psql::session_prelude() {
                    self.conn.exec_query(statement)?;
                }
            }
            self.conn.select_all(&sql)
        }
    }

    /// Read back one materialized output by predicate name.
    pub fn read_output(
        &self,
        result: &CompilationResult,
        predicate: &str,
    ) -> Result<Vec<Row>, ExecuteError> {
        let output = result
            .plan()
            .outputs
            .iter()
            .find(|output| output.predicate == predicate)
            .ok_or_else(|| ExecuteError::MissingOutput {
                predicate: SmolStr::new(predicate),
            })?;
        self.conn
            .select_all(&format!("SELECT * FROM {}", output.node))
    }

    fn run_steps(
        &self,
        steps: &[ScriptStep],
        engine: Engine,
        policy: &AccessPolicy,
    ) -> Result<RunOutcome, ExecuteError> {
        for step in steps {
            match step {
                ScriptStep::Statement(sql) => {
                    safety::validate(sql, engine, &policy.extra_denied_functions())?;
                    self.conn.exec_query(sql)?;
                }
                ScriptStep::Ground {
                    check_stop: true, ..
                } if self.stop_requested() => {
                    return Ok(RunOutcome::Stopped);
                }
                ScriptStep::Ground { .. } => {}
                ScriptStep::Iterate { repetitions, steps } => {
                    for _ in 0..*repetitions {
                        if self.run_steps(steps, engine, policy)? == RunOutcome::Stopped {
                            return Ok(RunOutcome::Stopped);
                        }
                    }
                }
            }
        }
        Ok(RunOutcome::Completed)
    }

    fn stop_requested(&self) -> bool {
        self.options
            .stop_signal
            .as_deref()
            .is_some_and(|path| path.exists())
    }
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! SQLite-backed [`EngineConnection`].

    use rusqlite::types::ValueRef;
    use rusqlite::Connection;

    use super::{EngineConnection, ExecuteError, Row, Value};
    use crate::policy::AccessPolicy;
    use crate::sandbox::sqlite::with_sandbox;

    #[derive(Debug)]
    pub struct SqliteConnection {
        conn: Connection,
    }

    impl SqliteConnection {
        pub fn open_in_memory() -> Result<Self, ExecuteError> {
            Ok(SqliteConnection {
                conn: Connection::open_in_memory()?,
            })
        }

        pub fn from_connection(conn: Connection) -> Self {
            SqliteConnection { conn }
        }

        pub fn raw(&self) -> &Connection {
            &self.conn
        }
    }

    fn value_from(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }

    pub(super) fn select_all_on(conn: &Connection, sql: &str) -> Result<Vec<Row>, ExecuteError> {
        let mut statement = conn.prepare(sql)?;
        let columns = statement.column_count();
        let mut rows = statement.query([])?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next()? {
            let mut out = Vec::with_capacity(columns);
            for index in 0..columns {
                out.push(value_from(row.get_ref(index)?));
            }
            collected.push(out);
        }
        Ok(collected)
    }

    impl EngineConnection for SqliteConnection {
        fn adapter_name(&self) -> &str {
            "sqlite3"
        }

        fn select_all(&self, sql: &str) -> Result<Vec<Row>, ExecuteError> {
            select_all_on(&self.conn, sql)
        }

        fn exec_query(&self, sql: &str) -> Result<(), ExecuteError> {
            self.conn.execute_batch(sql)?;
            Ok(())
        }

        fn with_policy<T>(
            &self,
            policy: &AccessPolicy,
            f: impl FnOnce(&dyn EngineConnection) -> Result<T, ExecuteError>,
        ) -> Result<T, ExecuteError> {
            with_sandbox(&self.conn, policy, |conn| {
                let borrowed = BorrowedSqlite { conn };
                f(&borrowed)
            })
        }
    }

    /// A connection borrowed for the duration of a sandboxed block.
    struct BorrowedSqlite<'a> {
        conn: &'a Connection,
    }

    impl EngineConnection for BorrowedSqlite<'_> {
        fn adapter_name(&self) -> &str {
            "sqlite3"
        }

        fn select_all(&self, sql: &str) -> Result<Vec<Row>, ExecuteError> {
            select_all_on(self.conn, sql)
        }

        fn exec_query(&self, sql: &str) -> Result<(), ExecuteError> {
            self.conn.execute_batch(sql)?;
            Ok(())
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
#[cfg(test)]
mod test {
    use super::*;
    use cool_asserts::assert_matches;

    #[test]
    fn engine_detection_is_substring_based() {
        assert_eq!(detect_engine("sqlite3").unwrap(), Engine::Sqlite);
        assert_eq!(detect_engine("SQLite").unwrap(), Engine::Sqlite);
        assert_eq!(detect_engine("psql").unwrap(), Engine::Psql);
        assert_eq!(
            detect_engine("ActiveRecord::ConnectionAdapters::PostgreSQLAdapter").unwrap(),
            Engine::Psql
        );
        assert_matches!(
            detect_engine("mysql2"),
            Err(UnsupportedEngineError { name }) => assert_eq!(name, "mysql2")
        );
    }

    #[cfg(feature = "sqlite")]
    mod live {
        use smol_str::SmolStr;

        use super::super::sqlite::SqliteConnection;
        use super::*;
        use crate::ast::test_programs::atom;
        use crate::ast::{Literal, Program, Rule, Term};
        use crate::compile::{CompileOptions, Compiler};
        use crate::dialects::DialectLibraries;

        fn edge_fact(a: f64, b: f64) -> Rule {
            Rule {
                head: atom("Edge", &["a", "b"]),
                body: vec![
                    Literal::Eq {
                        left: Term::Var(SmolStr::new("a")),
                        right: Term::Num(a),
                    },
                    Literal::Eq {
                        left: Term::Var(SmolStr::new("b")),
                        right: Term::Num(b),
                    },
                ],
            }
        }

        fn chain_program() -> Program {
            Program {
                rules: vec![
                    edge_fact(1.0, 2.0),
                    edge_fact(2.0, 3.0),
                    edge_fact(3.0, 4.0),
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

        #[test]
        fn materialize_computes_the_recursive_fixpoint() {
            let program = chain_program();
            let result = Compiler::new(DialectLibraries::all_available())
                .compile(
                    &program,
                    &[SmolStr::new("Reach")],
                    &CompileOptions::new(Engine::Sqlite),
                )
                .unwrap();

            let conn = SqliteConnection::open_in_memory().unwrap();
            let executor = Executor::new(&conn, ExecuteOptions::default());
            assert_eq!(executor.materialize(&result).unwrap(), RunOutcome::Completed);

            let rows = conn
                .select_all("SELECT DISTINCT col0, col1 FROM Reach ORDER BY col0, col1")
                .unwrap();
            let pairs: Vec<(i64, i64)> = rows
                .iter()
                .map(|row| {
                    let get = |v: &Value| match v {
                        Value::Integer(i) => *i,
                        Value::Real(r) => *r as i64,
                        other => panic!("unexpected value {other:?}"),
                    };
                    (get(&row[0]), get(&row[1]))
                })
                .collect();
            assert_eq!(pairs, vec![(1, 2), (1, 3), (1, 4), (2, 3), (2, 4), (3, 4)]);
        }

        #[test]
        fn materialize_reaches_the_full_requested_depth() {
            // A chain 1 -> 2 -> ... -> 9 needs every one of the default
            // eight layers; the iterated script must agree with the
            // unrolled query rendering of the same compilation.
            let mut rules: Vec<Rule> = (1..9).map(|i| edge_fact(i as f64, (i + 1) as f64)).collect();
            rules.push(Rule {
                head: atom("Reach", &["a", "b"]),
                body: vec![Literal::Atom(atom("Edge", &["a", "b"]))],
            });
            rules.push(Rule {
                head: atom("Reach", &["a", "c"]),
                body: vec![
                    Literal::Atom(atom("Reach", &["a", "b"])),
                    Literal::Atom(atom("Edge", &["b", "c"])),
                ],
            });
            let program = Program { rules };
            let result = Compiler::new(DialectLibraries::all_available())
                .compile(
                    &program,
                    &[SmolStr::new("Reach")],
                    &CompileOptions::new(Engine::Sqlite),
                )
                .unwrap();

            let pairs = |rows: &[Row]| -> std::collections::BTreeSet<(i64, i64)> {
                rows.iter()
                    .map(|row| {
                        let get = |v: &Value| match v {
                            Value::Integer(i) => *i,
                            Value::Real(r) => *r as i64,
                            other => panic!("unexpected value {other:?}"),
                        };
                        (get(&row[0]), get(&row[1]))
                    })
                    .collect()
            };

            let conn = SqliteConnection::open_in_memory().unwrap();
            let executor = Executor::new(&conn, ExecuteOptions::default());
            let queried = pairs(&executor.query(&result).unwrap());
            assert!(queried.contains(&(1, 9)));

            assert_eq!(executor.materialize(&result).unwrap(), RunOutcome::Completed);
            let materialized = pairs(
                &conn
                    .select_all("SELECT DISTINCT col0, col1 FROM Reach")
                    .unwrap(),
            );
            // 8 nodes reach every later node: 8 + 7 + ... + 1 pairs.
            assert_eq!(materialized.len(), 36);
            assert_eq!(materialized, queried);
        }

        #[test]
        fn stop_signal_halts_at_a_grounding_point() {
            let program = chain_program();
            let result = Compiler::new(DialectLibraries::all_available())
                .compile(
                    &program,
                    &[SmolStr::new("Reach")],
                    &CompileOptions::new(Engine::Sqlite),
                )
                .unwrap();

            let dir = tempfile::tempdir().unwrap();
            let stop = dir.path().join("stop");
            std::fs::write(&stop, b"").unwrap();

            let conn = SqliteConnection::open_in_memory().unwrap();
            let executor = Executor::new(
                &conn,
                ExecuteOptions {
                    stop_signal: Some(stop),
                },
            );
            assert_eq!(executor.materialize(&result).unwrap(), RunOutcome::Stopped);
        }

        #[test]
        fn query_runs_without_materializing() {
            let program = chain_program();
            let result = Compiler::new(DialectLibraries::all_available())
                .compile(
                    &program,
                    &[SmolStr::new("Reach")],
                    &CompileOptions::new(Engine::Sqlite),
                )
                .unwrap();

            let conn = SqliteConnection::open_in_memory().unwrap();
            let executor = Executor::new(&conn, ExecuteOptions::default());
            let rows = executor.query(&result).unwrap();
            assert!(rows.contains(&vec![Value::Integer(1), Value::Integer(4)]));
        }

        #[test]
        fn untrusted_query_runs_inside_the_sandbox() {
            // External(x) :- t(x); reads a database table under policy.
            let program = Program {
                rules: vec![Rule {
                    head: atom("External", &["x"]),
                    body: vec![Literal::Atom(atom("t", &["x"]))],
                }],
            };
            let mut options = CompileOptions::new(Engine::Sqlite);
            options.trusted = false;
            options.allowed_relations.insert(SmolStr::new("t"));
            let result = Compiler::new(DialectLibraries::all_available())
                .compile(&program, &[SmolStr::new("External")], &options)
                .unwrap();

            let conn = SqliteConnection::open_in_memory().unwrap();
            conn.raw()
                .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
                .unwrap();
            let executor = Executor::new(&conn, ExecuteOptions::default());
            assert_eq!(executor.query(&result).unwrap(), vec![vec![Value::Integer(7)]]);

            // A relation outside the allowlist is denied by the driver.
            let mut denied = options.clone();
            denied.allowed_relations.clear();
            denied.allowed_relations.insert(SmolStr::new("elsewhere"));
            let result = Compiler::new(DialectLibraries::all_available())
                .compile(&program, &[SmolStr::new("External")], &denied)
                .unwrap();
            assert_matches!(executor.query(&result), Err(ExecuteError::Driver { .. }));
        }

        #[test]
        fn read_output_reads_the_plan_node() {
            let program = chain_program();
            let result = Compiler::new(DialectLibraries::all_available())
                .compile(
                    &program,
                    &[SmolStr::new("Reach")],
                    &CompileOptions::new(Engine::Sqlite),
                )
                .unwrap();

            let conn = SqliteConnection::open_in_memory().unwrap();
            let executor = Executor::new(&conn, ExecuteOptions::default());
            executor.materialize(&result).unwrap();
            assert!(!executor.read_output(&result, "Reach").unwrap().is_empty());
            assert_matches!(
                executor.read_output(&result, "Nope"),
                Err(ExecuteError::MissingOutput { .. })
            );
        }
    }
}
