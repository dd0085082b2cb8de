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

//! Static safety scan of a complete SQL statement or script, independent of
//! its origin (compiler output or a hand-written "source" query).
//!
//! The scan walks the text once, skipping string literals and comments, and
//! reports denylisted function *calls*: an identifier only counts when it is
//! followed by `(`. Schema qualification (`pg_catalog.pg_sleep_for`) and
//! double-quoting (`"pg_reload_conf"`) are normalized away before comparison.
//! This is the first of the two sandbox layers; the dynamic layer lives in
//! [`crate::sandbox`].

use std::collections::BTreeSet;

use smol_str::SmolStr;

use crate::dialects::Engine;
use crate::err::Violation;

/// Engine-specific denylist: exact function names plus name-family prefixes
/// (`pg_sleep` covers `pg_sleep`, `pg_sleep_for`, `pg_sleep_until`).
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    exact: BTreeSet<SmolStr>,
    prefixes: Vec<SmolStr>,
}

impl DenyList {
    pub fn from_parts(
        exact: impl IntoIterator<Item = &'static str>,
        prefixes: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        DenyList {
            exact: exact.into_iter().map(SmolStr::new).collect(),
            prefixes: prefixes.into_iter().map(SmolStr::new).collect(),
        }
    }

    pub(crate) fn matches(&self, name: &str) -> bool {
        self.exact.contains(name) || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

lazy_static::lazy_static! {
    static ref PSQL_DENYLIST: DenyList = DenyList::from_parts(
        [
            "pg_cancel_backend",
            "pg_terminate_backend",
            "lo_import",
            "lo_export",
            "set_config",
            "pg_reload_conf",
        ],
        ["pg_sleep", "dblink"],
    );

    static ref SQLITE_DENYLIST: DenyList = DenyList::from_parts(
        ["load_extension", "readfile", "writefile", "fts3_tokenizer", "edit"],
        [],
    );
}

/// The built-in denylist for an engine.
pub fn engine_denylist(engine: Engine) -> &'static DenyList {
    match engine {
        Engine::Psql => &PSQL_DENYLIST,
        Engine::Sqlite => &SQLITE_DENYLIST,
    }
}

/// Validate a complete SQL text against the engine's denylist merged with a
/// caller-supplied extra denylist (exact names).
pub fn validate(
    sql: &str,
    engine: Engine,
    forbidden_functions: &[SmolStr],
) -> Result<(), Violation> {
    let denylist = engine_denylist(engine);
    for call in called_functions(sql) {
        if denylist.matches(&call) || forbidden_functions.iter().any(|f| f.as_str() == call) {
            return Err(Violation::forbidden_function(&call, engine.name()));
        }
    }
    Ok(())
}

/// Reject multi-statement bodies, which would allow statement stacking in an
/// untrusted "source" query. A trailing semicolon (possibly followed by
/// whitespace or comments) is fine.
pub fn validate_single_statement(sql: &str) -> Result<(), Violation> {
    let mut scanner = Scanner::new(sql);
    let mut seen_terminator = false;
    loop {
        scanner.skip_insignificant();
        let Some(b) = scanner.peek() else {
            return Ok(());
        };
        if seen_terminator {
            return Err(Violation::multiple_statements());
        }
        if b == b';' {
            seen_terminator = true;
        }
        scanner.bump();
    }
}

/// All function names called in `sql`, normalized: lowercased, quotes
/// stripped, schema qualification reduced to the last segment.
fn called_functions(sql: &str) -> Vec<String> {
    let mut scanner = Scanner::new(sql);
    let mut calls = Vec::new();
    loop {
        scanner.skip_insignificant();
        if scanner.peek().is_none() {
            return calls;
        }
        match scanner.read_qualified_name() {
            Some(name) => {
                scanner.skip_insignificant();
                if scanner.peek() == Some(b'(') {
                    calls.push(name);
                }
            }
            None => scanner.bump(),
        }
    }
}

/// A byte cursor over SQL text that knows how to skip literals and comments.
/// Operates on bytes; every structural character it cares about is ASCII, so
/// multi-byte UTF-8 content passes through untouched.
#[derive(Debug)]
struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(sql: &'a str) -> Self {
        Scanner {
            bytes: sql.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    /// Skip whitespace, string literals, and comments. Stops at the first
    /// byte that could start meaningful SQL.
    fn skip_insignificant(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => self.bump(),
                Some(b'\'') => self.skip_quoted(b'\''),
                Some(b'-') if self.peek_at(1) == Some(b'-') => self.skip_line_comment(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => self.skip_block_comment(),
                _ => return,
            }
        }
    }

    /// Skip a quoted region, honoring the doubled-quote escape.
    fn skip_quoted(&mut self, quote: u8) {
        self.bump(); // opening quote
        loop {
            match self.peek() {
                None => return,
                Some(b) if b == quote => {
                    if self.peek_at(1) == Some(quote) {
                        self.bump();
                        self.bump();
                    } else {
                        self.bump();
                        return;
                    }
                }
                Some(_) => self.bump(),
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(b) = self.peek() {
            self.bump();
            if b == b'\n' {
                return;
            }
        }
    }

    /// Block comments nest, per PostgreSQL.
    fn skip_block_comment(&mut self) {
        self.bump();
        self.bump();
        let mut depth = 1usize;
        while depth > 0 {
            match (self.peek(), self.peek_at(1)) {
                (None, _) => return,
                (Some(b'/'), Some(b'*')) => {
                    depth += 1;
                    self.bump();
                    self.bump();
                }
                (Some(b'*'), Some(b'/')) => {
                    depth -= 1;
                    self.bump();
                    self.bump();
                }
                _ => self.bump(),
            }
        }
    }

    /// Read a possibly schema-qualified, possibly quoted name starting at the
    /// cursor. Returns the normalized last segment, or `None` if the cursor
    /// is not at a name.
    fn read_qualified_name(&mut self) -> Option<String> {
        let mut last = self.read_name_segment()?;
        loop {
            let before_dot = self.pos;
            self.skip_insignificant();
            if self.peek() == Some(b'.') {
                self.bump();
                self.skip_insignificant();
                match self.read_name_segment() {
                    Some(segment) => last = segment,
                    None => {
                        self.pos = before_dot;
                        break;
                    }
                }
            } else {
                self.pos = before_dot;
                break;
            }
        }
        Some(last)
    }

    fn read_name_segment(&mut self) -> Option<String> {
        match self.peek() {
            Some(b'"') => {
                let start = self.pos + 1;
                self.skip_quoted(b'"');
                let end = self.pos.saturating_sub(1).max(start);
                let raw = self.bytes.get(start..end).unwrap_or_default();
                Some(
                    String::from_utf8_lossy(raw)
                        .replace("\"\"", "\"")
                        .to_lowercase(),
                )
            }
            Some(b) if b == b'_' || b.is_ascii_alphabetic() => {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == b'_' || b == b'$' || b.is_ascii_alphanumeric() {
                        self.bump();
                    } else {
                        break;
                    }
                }
                let raw = self.bytes.get(start..self.pos).unwrap_or_default();
                Some(String::from_utf8_lossy(raw).to_lowercase())
            }
            _ => None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::err::ViolationReason;
    use cool_asserts::assert_matches;

    #[test]
    fn forbidden_psql_call_is_rejected() {
        assert_matches!(
            validate("SELECT pg_sleep_for('1s')", Engine::Psql, &[]),
            Err(violation) => {
                assert_eq!(violation.reason, ViolationReason::ForbiddenFunction);
                assert_eq!(violation.identifier.as_deref(), Some("pg_sleep_for"));
            }
        );
    }

    #[test]
    fn matches_inside_literals_and_comments_are_skipped() {
        validate("SELECT 'pg_sleep_for(''1s'')'", Engine::Psql, &[]).unwrap();
        validate("/* pg_sleep_for('1s') */ SELECT 1", Engine::Psql, &[]).unwrap();
        validate("-- pg_sleep_for('1s')\nSELECT 1", Engine::Psql, &[]).unwrap();
        // Nested block comments, per PostgreSQL.
        validate("/* outer /* pg_sleep(1) */ still comment */ SELECT 1", Engine::Psql, &[])
            .unwrap();
    }

    #[test]
    fn qualified_and_quoted_names_are_normalized() {
        assert_matches!(
            validate("SELECT pg_catalog.pg_sleep_for('1s')", Engine::Psql, &[]),
            Err(v) => assert_eq!(v.identifier.as_deref(), Some("pg_sleep_for"))
        );
        assert_matches!(
            validate("SELECT \"pg_reload_conf\"()", Engine::Psql, &[]),
            Err(v) => assert_eq!(v.identifier.as_deref(), Some("pg_reload_conf"))
        );
        assert_matches!(
            validate("SELECT pg_catalog.\"pg_sleep\"(1)", Engine::Psql, &[]),
            Err(_)
        );
    }

    #[test]
    fn names_only_count_when_called() {
        // A column merely named like a denylisted function is fine.
        validate("SELECT pg_sleep FROM t", Engine::Psql, &[]).unwrap();
        validate("SELECT set_config FROM settings", Engine::Psql, &[]).unwrap();
        // Whitespace and comments between name and paren still count as a call.
        assert_matches!(
            validate("SELECT pg_sleep /* now */ (1)", Engine::Psql, &[]),
            Err(_)
        );
    }

    #[test]
    fn sqlite_denylist_applies() {
        assert_matches!(
            validate("SELECT load_extension('evil.so')", Engine::Sqlite, &[]),
            Err(_)
        );
        assert_matches!(
            validate("SELECT writefile('/tmp/x', data) FROM t", Engine::Sqlite, &[]),
            Err(_)
        );
        // The psql denylist does not leak into sqlite.
        validate("SELECT pg_sleep_for('1s')", Engine::Sqlite, &[]).unwrap();
    }

    #[test]
    fn caller_denylist_merges_with_builtin() {
        let extra = [SmolStr::new("dangerous_udf")];
        assert_matches!(
            validate("SELECT dangerous_udf(1)", Engine::Sqlite, &extra),
            Err(v) => assert_eq!(v.identifier.as_deref(), Some("dangerous_udf"))
        );
        validate("SELECT dangerous_udf(1)", Engine::Psql, &[]).unwrap();
    }

    #[test]
    fn statement_stacking_is_rejected() {
        assert_matches!(
            validate_single_statement("SELECT 1; DROP TABLE t"),
            Err(v) => assert_eq!(v.reason, ViolationReason::MultipleStatements)
        );
        validate_single_statement("SELECT 1").unwrap();
        validate_single_statement("SELECT 1;").unwrap();
        validate_single_statement("SELECT 1; -- trailing comment\n").unwrap();
        validate_single_statement("SELECT ';'; ").unwrap();
    }
}
