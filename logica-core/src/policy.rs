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

//! Access policies describing what a compiled query may touch.
//!
//! A policy is decided at compile time and carried alongside the plan to
//! execution, where it drives both the static SQL validator and (for SQLite)
//! the driver-level sandbox.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::dialects::{Engine, LibraryProfile};

/// Whether the source program is trusted to run with full capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Program text comes from the operator; no restrictions apply.
    Trusted,
    /// Program text comes from an outside party; read-only access to the
    /// allowlisted relations and nothing else.
    Untrusted,
}

/// What a program may read and call. An untrusted policy with an empty
/// relation allowlist permits reading nothing at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub trust: TrustLevel,
    /// Relations the program may read. Ignored for trusted programs.
    pub allowed_relations: BTreeSet<SmolStr>,
    /// Schemas denied on top of the engine's built-in set.
    pub denied_schemas: BTreeSet<SmolStr>,
    /// Functions denied on top of the engine's built-in denylist.
    pub forbidden_functions: BTreeSet<SmolStr>,
}

/// System namespaces an untrusted program must never read through, even for
/// an allowlisted bare name.
fn engine_denied_schemas(engine: Engine) -> &'static [&'static str] {
    match engine {
        Engine::Psql => &["pg_catalog", "information_schema"],
        Engine::Sqlite => &["temp"],
    }
}

impl AccessPolicy {
    /// Policy for operator-authored programs.
    pub fn trusted() -> Self {
        AccessPolicy {
            trust: TrustLevel::Trusted,
            allowed_relations: BTreeSet::new(),
            denied_schemas: BTreeSet::new(),
            forbidden_functions: BTreeSet::new(),
        }
    }

    /// Policy for outside programs restricted to the given relations.
    pub fn untrusted(allowed_relations: impl IntoIterator<Item = SmolStr>) -> Self {
        AccessPolicy {
            trust: TrustLevel::Untrusted,
            allowed_relations: allowed_relations.into_iter().collect(),
            denied_schemas: BTreeSet::new(),
            forbidden_functions: BTreeSet::new(),
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trust == TrustLevel::Trusted
    }

    /// The dialect-library profile this policy permits: untrusted programs
    /// never see the file/host I/O builtins.
    pub fn effective_capabilities(&self, _engine: Engine) -> LibraryProfile {
        if self.is_trusted() {
            LibraryProfile::Full
        } else {
            LibraryProfile::Safe
        }
    }

    /// The policy's schema denials merged with the engine's built-in set.
    /// Empty for trusted programs.
    pub fn effective_denied_schemas(&self, engine: Engine) -> BTreeSet<SmolStr> {
        if self.is_trusted() {
            return BTreeSet::new();
        }
        let mut denied = self.denied_schemas.clone();
        denied.extend(engine_denied_schemas(engine).iter().map(|s| SmolStr::new(s)));
        denied
    }

    /// Whether the dynamic sandbox applies when executing on `engine`.
    /// Only SQLite offers a driver-level authorizer; on other engines the
    /// static validator is the only layer.
    pub fn sandboxes(&self, engine: Engine) -> bool {
        !self.is_trusted() && engine == Engine::Sqlite
    }

    /// Whether reading `relation` is permitted. Schema-qualified names are
    /// reduced to their final segment before comparison, matching the
    /// normalization the SQL validator applies.
    pub fn allows_relation(&self, relation: &str) -> bool {
        if self.is_trusted() {
            return true;
        }
        let bare = relation.rsplit('.').next().unwrap_or(relation);
        self.allowed_relations
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(bare))
    }

    /// [`Self::allows_relation`] plus schema checks: a qualified name whose
    /// schema is denied for `engine` never resolves, even when its bare name
    /// is allowlisted.
    pub fn allows_qualified(&self, relation: &str, engine: Engine) -> bool {
        if self.is_trusted() {
            return true;
        }
        if let Some((schema, _)) = relation.rsplit_once('.') {
            let schema = schema.rsplit('.').next().unwrap_or(schema);
            if self
                .effective_denied_schemas(engine)
                .iter()
                .any(|denied| denied.eq_ignore_ascii_case(schema))
            {
                return false;
            }
        }
        self.allows_relation(relation)
    }

    /// The extra function denylist this policy adds on top of the engine's.
    pub fn extra_denied_functions(&self) -> Vec<SmolStr> {
        self.forbidden_functions.iter().cloned().collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trusted_allows_everything() {
        let policy = AccessPolicy::trusted();
        assert!(policy.allows_relation("anything"));
        assert!(!policy.sandboxes(Engine::Sqlite));
        assert!(!policy.sandboxes(Engine::Psql));
    }

    #[test]
    fn untrusted_empty_allowlist_denies_all() {
        let policy = AccessPolicy::untrusted([]);
        assert!(!policy.allows_relation("t"));
        assert!(policy.sandboxes(Engine::Sqlite));
        assert!(!policy.sandboxes(Engine::Psql));
    }

    #[test]
    fn allowlist_matches_case_insensitively_and_unqualified() {
        let policy = AccessPolicy::untrusted([SmolStr::new("Employees")]);
        assert!(policy.allows_relation("employees"));
        assert!(policy.allows_relation("main.EMPLOYEES"));
        assert!(!policy.allows_relation("salaries"));
    }

    #[test]
    fn denied_schemas_override_the_allowlist() {
        let policy = AccessPolicy::untrusted([SmolStr::new("t")]);
        assert!(policy.allows_qualified("main.t", Engine::Sqlite));
        assert!(!policy.allows_qualified("temp.t", Engine::Sqlite));
        assert!(!policy.allows_qualified("pg_catalog.t", Engine::Psql));

        let mut custom = policy.clone();
        custom.denied_schemas.insert(SmolStr::new("audit"));
        assert!(!custom.allows_qualified("audit.t", Engine::Sqlite));

        // Trusted programs are unrestricted.
        assert!(AccessPolicy::trusted().allows_qualified("pg_catalog.t", Engine::Psql));
    }

    #[test]
    fn capabilities_follow_trust() {
        use crate::dialects::LibraryProfile;
        assert_eq!(
            AccessPolicy::trusted().effective_capabilities(Engine::Sqlite),
            LibraryProfile::Full
        );
        assert_eq!(
            AccessPolicy::untrusted([]).effective_capabilities(Engine::Psql),
            LibraryProfile::Safe
        );
    }

    #[test]
    fn policies_round_trip_through_json() {
        let mut policy = AccessPolicy::untrusted([SmolStr::new("t")]);
        policy.forbidden_functions.insert(SmolStr::new("random"));
        let json = serde_json::to_string(&policy).unwrap();
        let back: AccessPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, back);
    }
}
