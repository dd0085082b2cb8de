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

//! Per-engine libraries of built-in predicates, each expressed as a
//! native-SQL macro substitution.
//!
//! The libraries are built once into an explicit [`DialectLibraries`]
//! registry and passed by reference into each compilation call, so tests can
//! substitute fake dialects without touching process-wide state. Selection
//! happens by engine plus [`LibraryProfile`]; the profile is independent of
//! the access-policy sandbox.

mod psql;
mod sqlite;

use std::collections::BTreeMap;

use smol_str::SmolStr;

use crate::err::{CompileError, UnsupportedEngineError};

/// A supported backend dialect. Unknown engine names are a hard compile
/// error, never a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Engine {
    Sqlite,
    Psql,
}

impl Engine {
    pub fn name(self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::Psql => "psql",
        }
    }

    /// Resolve an engine from its exact name.
    pub fn from_name(name: &str) -> Result<Self, UnsupportedEngineError> {
        match name {
            "sqlite" => Ok(Engine::Sqlite),
            "psql" => Ok(Engine::Psql),
            other => Err(UnsupportedEngineError {
                name: other.to_string(),
            }),
        }
    }
}

/// Which capability profile of a dialect library to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LibraryProfile {
    /// Excludes file/host I/O builtins entirely.
    #[default]
    Safe,
    /// The whole library, including file/host I/O builtins.
    Full,
}

impl LibraryProfile {
    pub fn name(self) -> &'static str {
        match self {
            LibraryProfile::Safe => "safe",
            LibraryProfile::Full => "full",
        }
    }
}

/// One built-in predicate: a native-SQL template with `{0}`, `{1}`, ...
/// placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinDef {
    pub name: SmolStr,
    pub arity: usize,
    pub template: String,
}

impl BuiltinDef {
    pub fn new(name: &str, arity: usize, template: &str) -> Self {
        BuiltinDef {
            name: SmolStr::new(name),
            arity,
            template: template.to_string(),
        }
    }

    /// Substitute rendered argument SQL into the template.
    pub fn instantiate(&self, args: &[String]) -> Result<String, CompileError> {
        if args.len() != self.arity {
            return Err(CompileError::BuiltinArity {
                builtin: self.name.clone(),
                expected: self.arity,
                got: args.len(),
            });
        }
        let mut sql = self.template.clone();
        for (i, arg) in args.iter().enumerate() {
            sql = sql.replace(&format!("{{{i}}}"), arg);
        }
        Ok(sql)
    }
}

/// The built-in predicate definitions for one engine and profile.
#[derive(Debug, Clone, Default)]
pub struct Library {
    builtins: BTreeMap<SmolStr, BuiltinDef>,
}

impl Library {
    pub fn from_builtins(builtins: impl IntoIterator<Item = BuiltinDef>) -> Self {
        Library {
            builtins: builtins
                .into_iter()
                .map(|b| (b.name.clone(), b))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinDef> {
        self.builtins.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &SmolStr> {
        self.builtins.keys()
    }
}

/// Registry of all dialect libraries, keyed by engine and profile. Built once
/// and passed by reference; every known engine/profile pair is populated by
/// construction.
#[derive(Debug, Clone)]
pub struct DialectLibraries {
    pub sqlite_safe: Library,
    pub sqlite_full: Library,
    pub psql_safe: Library,
    pub psql_full: Library,
}

lazy_static::lazy_static! {
    static ref ALL_AVAILABLE_LIBRARIES: DialectLibraries = DialectLibraries::build_all_available();
}

impl DialectLibraries {
    /// Build the registry with every bundled dialect.
    pub fn build_all_available() -> Self {
        DialectLibraries {
            sqlite_safe: sqlite::library(LibraryProfile::Safe),
            sqlite_full: sqlite::library(LibraryProfile::Full),
            psql_safe: psql::library(LibraryProfile::Safe),
            psql_full: psql::library(LibraryProfile::Full),
        }
    }

    /// The process-wide registry of bundled dialects.
    pub fn all_available() -> &'static DialectLibraries {
        &ALL_AVAILABLE_LIBRARIES
    }

    pub fn library(&self, engine: Engine, profile: LibraryProfile) -> &Library {
        match (engine, profile) {
            (Engine::Sqlite, LibraryProfile::Safe) => &self.sqlite_safe,
            (Engine::Sqlite, LibraryProfile::Full) => &self.sqlite_full,
            (Engine::Psql, LibraryProfile::Safe) => &self.psql_safe,
            (Engine::Psql, LibraryProfile::Full) => &self.psql_full,
        }
    }
}
