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

//! Dynamic statement-level sandbox.
//!
//! The static validator in [`crate::safety`] runs over SQL text; this module
//! is the second layer, consulted by the database driver for every action a
//! statement attempts. The decision logic ([`PolicyAuthorizer`]) is plain
//! Rust and engine-agnostic; the `sqlite` submodule wires it to SQLite's
//! authorizer callback.

use smol_str::SmolStr;

use crate::policy::AccessPolicy;
use crate::safety::engine_denylist;
use crate::dialects::Engine;

/// One action a statement attempts, as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementAction {
    /// Running a SELECT at all.
    Select,
    /// Reading a column of a relation.
    Read {
        relation: SmolStr,
        column: SmolStr,
    },
    /// Calling a SQL function.
    FunctionCall { name: SmolStr },
    /// Reading a pragma's current value.
    PragmaRead { name: SmolStr },
    /// Changing a pragma.
    PragmaWrite { name: SmolStr },
    /// Anything else: writes, DDL, transaction control, attach.
    Other,
}

/// Verdict on one [`StatementAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Allow,
    Deny,
}

/// Decides whether a statement action is permitted.
pub trait StatementAuthorizer {
    fn authorize(&self, action: &StatementAction) -> AuthOutcome;
}

/// [`StatementAuthorizer`] driven by an [`AccessPolicy`]: read-only access to
/// allowlisted relations, JSON table-valued functions, non-denylisted
/// functions, and the two pragmas the sandbox itself hardens.
#[derive(Debug, Clone)]
pub struct PolicyAuthorizer {
    policy: AccessPolicy,
    engine: Engine,
}

/// Table-valued functions SQLite reports as relation reads. They only ever
/// traverse values already in the statement, so they are always readable.
const VIRTUAL_JSON_RELATIONS: [&str; 2] = ["json_each", "json_tree"];

/// Pragmas a sandboxed statement may read. The sandbox sets these itself on
/// entry, and drivers re-read them when preparing statements.
const READABLE_PRAGMAS: [&str; 2] = ["query_only", "trusted_schema"];

impl PolicyAuthorizer {
    pub fn new(policy: AccessPolicy, engine: Engine) -> Self {
        PolicyAuthorizer { policy, engine }
    }

    fn allows_function(&self, name: &str) -> bool {
        let lowered = name.to_ascii_lowercase();
        if engine_denylist(self.engine).matches(&lowered) {
            return false;
        }
        !self
            .policy
            .forbidden_functions
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&lowered))
    }

    fn allows_read(&self, relation: &str) -> bool {
        let lowered = relation.to_ascii_lowercase();
        if VIRTUAL_JSON_RELATIONS.contains(&lowered.as_str()) {
            return true;
        }
        self.policy.allows_qualified(relation, self.engine)
    }
}

impl StatementAuthorizer for PolicyAuthorizer {
    fn authorize(&self, action: &StatementAction) -> AuthOutcome {
        let allowed = match action {
            StatementAction::Select => true,
            StatementAction::Read { relation, .. } => self.allows_read(relation),
            StatementAction::FunctionCall { name } => self.allows_function(name),
            StatementAction::PragmaRead { name } => READABLE_PRAGMAS
                .contains(&name.to_ascii_lowercase().as_str()),
            StatementAction::PragmaWrite { .. } | StatementAction::Other => false,
        };
        if allowed {
            AuthOutcome::Allow
        } else {
            AuthOutcome::Deny
        }
    }
}

pub mod psql {
    //! PostgreSQL has no driver-level authorizer callback; an untrusted
    //! session is hardened in SQL instead, on top of role-based privilege
    //! separation configured by the operator.

    /// Statements to run at session start before executing untrusted SQL.
    pub fn session_prelude() -> &'static [&'static str] {
        &[
            "SET default_transaction_read_only = on",
            "SET search_path = public",
        ]
    }
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! SQLite wiring: installs a [`PolicyAuthorizer`] as the connection's
    //! authorizer callback and hardens the connection with `query_only` for
    //! the duration of a closure.

    use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
    use rusqlite::Connection;
    use smol_str::SmolStr;

    use super::{AuthOutcome, PolicyAuthorizer, StatementAction, StatementAuthorizer};
    use crate::dialects::Engine;
    use crate::policy::AccessPolicy;

    fn classify(action: &AuthAction<'_>) -> StatementAction {
        match action {
            AuthAction::Select => StatementAction::Select,
            AuthAction::Read {
                table_name,
                column_name,
            } => StatementAction::Read {
                relation: SmolStr::new(table_name),
                column: SmolStr::new(column_name),
            },
            AuthAction::Function { function_name } => StatementAction::FunctionCall {
                name: SmolStr::new(function_name),
            },
            AuthAction::Pragma {
                pragma_name,
                pragma_value,
            } => {
                if pragma_value.is_none() {
                    StatementAction::PragmaRead {
                        name: SmolStr::new(pragma_name),
                    }
                } else {
                    StatementAction::PragmaWrite {
                        name: SmolStr::new(pragma_name),
                    }
                }
            }
            _ => StatementAction::Other,
        }
    }

    fn pragma_flag(conn: &Connection, name: &str) -> Option<bool> {
        conn.pragma_query_value(None, name, |row| row.get::<_, bool>(0))
            .ok()
    }

    /// Restores connection state when the sandboxed closure exits, normally
    /// or by error.
    struct SandboxGuard<'conn> {
        conn: &'conn Connection,
        prior_query_only: Option<bool>,
        prior_trusted_schema: Option<bool>,
    }

    impl Drop for SandboxGuard<'_> {
        fn drop(&mut self) {
            // The authorizer callback is not reentrant, so there is no prior
            // callback to restore; clearing it is exact.
            self.conn
                .authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
            if let Some(prior) = self.prior_query_only {
                let _ = self.conn.pragma_update(None, "query_only", prior);
            }
            if let Some(prior) = self.prior_trusted_schema {
                let _ = self.conn.pragma_update(None, "trusted_schema", prior);
            }
        }
    }

    /// Run `f` with the connection sandboxed under `policy`.
    ///
    /// On entry the connection is hardened (`query_only = 1`,
    /// `trusted_schema = 0`) and the policy authorizer installed; both are
    /// undone when `f` returns, whether it succeeded or not. Hardening is
    /// best-effort: if the build does not support a pragma, the authorizer
    /// alone still sandboxes. Statements denied by the authorizer fail
    /// inside `f` with the driver's native authorization error.
    pub fn with_sandbox<T, E>(
        conn: &Connection,
        policy: &AccessPolicy,
        f: impl FnOnce(&Connection) -> Result<T, E>,
    ) -> Result<T, E> {
        let guard = SandboxGuard {
            conn,
            prior_query_only: pragma_flag(conn, "query_only"),
            prior_trusted_schema: pragma_flag(conn, "trusted_schema"),
        };
        let _ = conn.pragma_update(None, "query_only", true);
        let _ = conn.pragma_update(None, "trusted_schema", false);

        let authorizer = PolicyAuthorizer::new(policy.clone(), Engine::Sqlite);
        conn.authorizer(Some(move |ctx: AuthContext<'_>| {
            match authorizer.authorize(&classify(&ctx.action)) {
                AuthOutcome::Allow => Authorization::Allow,
                AuthOutcome::Deny => Authorization::Deny,
            }
        }));

        let result = f(conn);
        drop(guard);
        result
    }
}
