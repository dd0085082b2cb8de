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

// PANIC SAFETY tests
#![allow(clippy::expect_used)]
// PANIC SAFETY tests
#![allow(clippy::unwrap_used)]
use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

/// `Test(x) :- x = 1;` as the JSON the parser boundary accepts.
const SINGLE_FACT: &str = r#"{"rules":[{"head":{"predicate":"Test","args":[{"name":{"pos":0},"value":{"var":"x"}}]},"body":[{"eq":{"left":{"var":"x"},"right":{"num":1}}}]}]}"#;

fn logica() -> Command {
    Command::cargo_bin("logica").expect("binary exists")
}

fn temp_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write");
    file
}

#[test]
fn print_emits_the_golden_query() {
    let program = temp_file(SINGLE_FACT);
    logica()
        .arg("print")
        .arg("Test")
        .arg("--engine")
        .arg("sqlite")
        .arg("--program")
        .arg(program.path())
        .assert()
        .success()
        .stdout("SELECT\n  1 AS col0;\n");
}

#[test]
fn print_reads_the_program_from_stdin() {
    logica()
        .arg("print")
        .arg("Test")
        .arg("--engine")
        .arg("sqlite")
        .write_stdin(SINGLE_FACT)
        .assert()
        .success()
        .stdout("SELECT\n  1 AS col0;\n");
}

#[test]
fn print_script_emits_statements_and_directives() {
    let program = temp_file(SINGLE_FACT);
    logica()
        .arg("print")
        .arg("Test")
        .arg("--engine")
        .arg("sqlite")
        .arg("--format")
        .arg("script")
        .arg("--program")
        .arg(program.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("CREATE TABLE Test AS"))
        .stdout(predicate::str::contains("-- ground Test"));
}

#[test]
fn print_rejects_an_unknown_predicate() {
    let program = temp_file(SINGLE_FACT);
    logica()
        .arg("print")
        .arg("Missing")
        .arg("--engine")
        .arg("sqlite")
        .arg("--program")
        .arg(program.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("undefined predicate: `Missing`"));
}

#[test]
fn plan_emits_tagged_json() {
    let program = temp_file(SINGLE_FACT);
    logica()
        .arg("plan")
        .arg("Test")
        .arg("--engine")
        .arg("sqlite")
        .arg("--program")
        .arg(program.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"schema\": \"logica_rb.plan.v1\""))
        .stdout(predicate::str::contains("\"predicate\": \"Test\""))
        .stdout(predicate::str::contains("\"launcher\": \"query\""));
}

#[test]
fn plan_round_trips_through_validate_plan() {
    let program = temp_file(SINGLE_FACT);
    let output = logica()
        .arg("plan")
        .arg("Test")
        .arg("--engine")
        .arg("sqlite")
        .arg("--program")
        .arg(program.path())
        .output()
        .expect("plan runs");
    assert!(output.status.success());

    logica()
        .arg("validate-plan")
        .arg("-")
        .write_stdin(output.stdout)
        .assert()
        .success()
        .stdout("OK\n");
}

#[test]
fn validate_plan_accepts_a_well_formed_plan_file() {
    let plan = temp_file(
        r#"{
  "schema": "logica_rb.plan.v1",
  "engine": "sqlite",
  "final_predicates": ["Test"],
  "outputs": [{"predicate": "Test", "node": "Test", "kind": "table"}],
  "config": [
    {"name": "Test", "type": "final",
     "action": {"sql": "SELECT\n  1 AS col0", "launcher": "query"}}
  ]
}"#,
    );
    logica()
        .arg("validate-plan")
        .arg(plan.path())
        .assert()
        .success()
        .stdout("OK\n");
}

#[test]
fn validate_plan_reports_a_missing_output_node() {
    let plan = temp_file(
        r#"{
  "schema": "logica_rb.plan.v1",
  "engine": "sqlite",
  "final_predicates": ["Test"],
  "outputs": [{"predicate": "Test", "node": "MissingNode", "kind": "table"}],
  "config": [
    {"name": "Test", "type": "final",
     "action": {"sql": "SELECT 1", "launcher": "query"}}
  ]
}"#,
    );
    logica()
        .arg("validate-plan")
        .arg(plan.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains(
            "outputs references missing node: MissingNode",
        ));
}

#[test]
fn validate_plan_reports_truncated_json() {
    let plan = temp_file("{");
    logica()
        .arg("validate-plan")
        .arg(plan.path())
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid JSON:"));
}
