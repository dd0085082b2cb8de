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

//! Compiler from Logica (a Datalog dialect) to SQL, targeting SQLite and
//! PostgreSQL.
//!
//! The pipeline runs type inference over predicate rules (structural
//! unification with open and closed records), lowers recursion into bounded
//! unrolled or iterative form, renders engine-specific SQL through a dialect
//! library, and emits a byte-stable [`plan::CompilationPlan`]. Execution of
//! untrusted programs is guarded twice: a static denylist scan of the SQL
//! text ([`safety`]) and, on SQLite, a driver-level authorizer sandbox
//! ([`sandbox`]).
//!
//! The `sqlite` cargo feature enables the bundled SQLite connection and the
//! live half of the sandbox.

#![forbid(unsafe_code)]

pub mod ast;
pub mod compile;
pub mod dialects;
pub mod err;
pub mod executor;
pub mod plan;
pub mod policy;
pub mod recursion;
pub mod safety;
pub mod sandbox;
pub mod sql;
pub mod types;

pub use compile::{CompileOptions, CompilationResult, Compiler, SqlFormat};
pub use dialects::{DialectLibraries, Engine, LibraryProfile};
pub use err::{CompileError, PlanError, UnsupportedEngineError, Violation};
pub use plan::{CompilationPlan, PLAN_SCHEMA};
pub use policy::{AccessPolicy, TrustLevel};
