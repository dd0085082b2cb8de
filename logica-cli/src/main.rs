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

#![forbid(unsafe_code)]

use clap::Parser;
use logica_cli::{print_plan, print_sql, validate_plan, Cli, Commands, LogicaExitCode};

fn main() -> LogicaExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Print(args) => print_sql(&args),
        Commands::Plan(args) => print_plan(&args),
        Commands::ValidatePlan(args) => validate_plan(&args),
    }
}
