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

//! Command-line interface to the Logica-to-SQL compiler.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::io::Read;
use std::path::PathBuf;
use std::process::{ExitCode, Termination};

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::{miette, Result};
use smol_str::SmolStr;

use logica_core::ast::Program;
use logica_core::compile::DEFAULT_RECURSION_DEPTH;
use logica_core::plan::validate_plan_json;
use logica_core::{
    CompilationResult, CompileOptions, Compiler, DialectLibraries, Engine, LibraryProfile,
    SqlFormat,
};

#[derive(Parser, Debug)]
#[command(name = "logica", author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a predicate and print its SQL
    Print(PrintArgs),
    /// Compile a predicate and print its plan JSON
    Plan(PlanArgs),
    /// Check a serialized plan for internal consistency
    ValidatePlan(ValidatePlanArgs),
}

/// Exit code of the CLI process.
#[derive(Eq, PartialEq, Debug, Copy, Clone)]
pub enum LogicaExitCode {
    /// The command completed successfully.
    Success,
    /// The command failed.
    Failure,
}

impl Termination for LogicaExitCode {
    fn report(self) -> ExitCode {
        match self {
            LogicaExitCode::Success => ExitCode::SUCCESS,
            LogicaExitCode::Failure => ExitCode::FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineArg {
    Sqlite,
    Psql,
}

impl From<EngineArg> for Engine {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Sqlite => Engine::Sqlite,
            EngineArg::Psql => Engine::Psql,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProfileArg {
    /// Only builtins safe for untrusted programs
    #[default]
    Safe,
    /// The full builtin set, including file access
    Full,
}

impl From<ProfileArg> for LibraryProfile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Safe => LibraryProfile::Safe,
            ProfileArg::Full => LibraryProfile::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FormatArg {
    /// One self-contained query
    #[default]
    Query,
    /// A statement script with recursion iterated
    Script,
}

impl From<FormatArg> for SqlFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Query => SqlFormat::Query,
            FormatArg::Script => SqlFormat::Script,
        }
    }
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    /// Predicate to compile
    pub predicate: String,
    /// Target engine
    #[arg(long, value_enum)]
    pub engine: EngineArg,
    /// Dialect library profile
    #[arg(long, value_enum, default_value_t)]
    pub profile: ProfileArg,
    /// Treat the program as untrusted (sandboxed, allowlisted reads only)
    #[arg(long)]
    pub untrusted: bool,
    /// Relation an untrusted program may read; repeatable
    #[arg(long = "allow", value_name = "RELATION")]
    pub allowed_relations: Vec<String>,
    /// Recursion depth to unroll or iterate to
    #[arg(long, value_name = "N", default_value_t = DEFAULT_RECURSION_DEPTH)]
    pub depth: u32,
    /// File containing the program AST as JSON; reads stdin when omitted
    #[arg(long = "program", value_name = "FILE")]
    pub program: Option<PathBuf>,
}

impl CompileArgs {
    fn options(&self) -> CompileOptions {
        let mut options = CompileOptions::new(self.engine.into());
        options.profile = self.profile.into();
        options.trusted = !self.untrusted;
        options.allowed_relations = self
            .allowed_relations
            .iter()
            .map(SmolStr::new)
            .collect::<BTreeSet<_>>();
        options.recursion_depth = self.depth;
        options
    }

    fn read_program(&self) -> Result<Program> {
        let text = match &self.program {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| miette!("failed to open {}: {e}", path.display()))?,
            None => {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .map_err(|e| miette!("failed to read program from stdin: {e}"))?;
                buffer
            }
        };
        serde_json::from_str(&text).map_err(|e| miette!("failed to parse program JSON: {e}"))
    }

    fn compile(&self) -> Result<CompilationResult> {
        let program = self.read_program()?;
        Compiler::new(DialectLibraries::all_available())
            .compile(&program, &[SmolStr::new(&self.predicate)], &self.options())
            .map_err(|e| miette!("{e}"))
    }
}

#[derive(Args, Debug)]
pub struct PrintArgs {
    #[command(flatten)]
    pub compile: CompileArgs,
    /// SQL rendering to print
    #[arg(long, value_enum, default_value_t)]
    pub format: FormatArg,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub compile: CompileArgs,
    /// Print single-line JSON instead of pretty-printed
    #[arg(long)]
    pub compact: bool,
}

#[derive(Args, Debug)]
pub struct ValidatePlanArgs {
    /// Plan JSON file, or `-` for stdin
    pub path: String,
}

pub fn print_sql(args: &PrintArgs) -> LogicaExitCode {
    match args.compile.compile() {
        Ok(result) => {
            println!("{}", result.sql(args.format.into()).trim_end_matches('\n'));
            LogicaExitCode::Success
        }
        Err(err) => {
            eprintln!("{err}");
            LogicaExitCode::Failure
        }
    }
}

pub fn print_plan(args: &PlanArgs) -> LogicaExitCode {
    let rendered = args
        .compile
        .compile()
        .and_then(|result| result.plan_json(!args.compact).map_err(|e| miette!("{e}")));
    match rendered {
        Ok(json) => {
            println!("{json}");
            LogicaExitCode::Success
        }
        Err(err) => {
            eprintln!("{err}");
            LogicaExitCode::Failure
        }
    }
}

pub fn validate_plan(args: &ValidatePlanArgs) -> LogicaExitCode {
    let text = if args.path == "-" {
        let mut buffer = String::new();
        match std::io::stdin().read_to_string(&mut buffer) {
            Ok(_) => buffer,
            Err(err) => {
                eprintln!("failed to read plan from stdin: {err}");
                return LogicaExitCode::Failure;
            }
        }
    } else {
        match std::fs::read_to_string(&args.path) {
            Ok(text) => text,
            Err(err) => {
                eprintln!("failed to open {}: {err}", args.path);
                return LogicaExitCode::Failure;
            }
        }
    };
    match validate_plan_json(&text) {
        Ok(()) => {
            println!("OK");
            LogicaExitCode::Success
        }
        Err(err) => {
            eprintln!("{err}");
            LogicaExitCode::Failure
        }
    }
}
