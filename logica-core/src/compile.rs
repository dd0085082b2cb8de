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

//! The compilation pipeline: type inference, recursion lowering, SQL
//! rendering, and plan assembly.
//!
//! Compilation is a synchronous single pass per call. The dialect registry
//! is passed in by reference rather than read from a global, so tests can
//! substitute fake libraries.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use smol_str::SmolStr;

use crate::ast::{Atom, Literal, Program, Rule, Term};
use crate::dialects::{DialectLibraries, Engine, LibraryProfile};
use crate::err::{CompileError, TypeConflict};
use crate::plan::{
    CompilationPlan, Launcher, NodeAction, NodeType, OutputKind, PlanNode, PlanOutput,
    PLAN_SCHEMA,
};
use crate::policy::AccessPolicy;
use crate::recursion::{
    iterative_shape, layer_name, layer_rules, recursive_covers, render_script, Cover,
    ScriptStep,
};
use crate::sql::{predicate_sql, SqlContext};
use crate::types::{Type, TypeArena, TypeRef};

/// Default number of recursive layers unrolled or iterated when the caller
/// does not say otherwise.
pub const DEFAULT_RECURSION_DEPTH: u32 = 8;

/// Caller-supplied knobs for one compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub engine: Engine,
    pub profile: LibraryProfile,
    /// Trusted programs run unsandboxed with the full relation set.
    pub trusted: bool,
    /// Relations an untrusted program may read.
    pub allowed_relations: BTreeSet<SmolStr>,
    pub recursion_depth: u32,
}

impl CompileOptions {
    pub fn new(engine: Engine) -> Self {
        CompileOptions {
            engine,
            profile: LibraryProfile::Safe,
            trusted: true,
            allowed_relations: BTreeSet::new(),
            recursion_depth: DEFAULT_RECURSION_DEPTH,
        }
    }

    fn policy(&self) -> AccessPolicy {
        if self.trusted {
            AccessPolicy::trusted()
        } else {
            AccessPolicy::untrusted(self.allowed_relations.iter().cloned())
        }
    }

    /// The profile actually used: untrusted compilations are clamped to the
    /// policy's capabilities, whatever the caller asked for.
    fn effective_profile(&self) -> LibraryProfile {
        if self.trusted {
            self.profile
        } else {
            self.policy().effective_capabilities(self.engine)
        }
    }
}

/// Which rendering of the compiled SQL to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlFormat {
    /// One self-contained query (recursion unrolled into a `WITH` chain).
    Query,
    /// A script of statements and executor directives (recursion iterated
    /// over grounded tables).
    Script,
}

/// Everything one compilation produces. Both SQL renderings and the plan
/// JSON are byte-stable for identical input.
#[derive(Debug)]
pub struct CompilationResult {
    plan: CompilationPlan,
    policy: AccessPolicy,
    query_sql: String,
    script_steps: Vec<ScriptStep>,
    signatures: BTreeMap<SmolStr, BTreeMap<SmolStr, String>>,
}

impl CompilationResult {
    pub fn plan(&self) -> &CompilationPlan {
        &self.plan
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn sql(&self, format: SqlFormat) -> String {
        match format {
            SqlFormat::Query => format!("{};", self.query_sql),
            SqlFormat::Script => render_script(&self.script_steps),
        }
    }

    pub fn plan_json(&self, pretty: bool) -> Result<String, serde_json::Error> {
        self.plan.to_json(pretty)
    }

    pub fn script_steps(&self) -> &[ScriptStep] {
        &self.script_steps
    }

    /// Inferred column types per defined predicate, rendered.
    pub fn signatures(&self) -> &BTreeMap<SmolStr, BTreeMap<SmolStr, String>> {
        &self.signatures
    }
}

/// One execution unit in dependency order: a single non-recursive predicate,
/// or a whole recursive cover.
#[derive(Debug)]
enum Unit {
    Single(SmolStr),
    Cover(Cover),
}

#[derive(Debug)]
pub struct Compiler<'a> {
    libraries: &'a DialectLibraries,
}

impl<'a> Compiler<'a> {
    pub fn new(libraries: &'a DialectLibraries) -> Self {
        Compiler { libraries }
    }

    /// Compile `predicates` of `program` into a plan plus SQL renderings.
    /// The query rendering targets the first requested predicate.
    pub fn compile(
        &self,
        program: &Program,
        predicates: &[SmolStr],
        options: &CompileOptions,
    ) -> Result<CompilationResult, CompileError> {
        let defined = program.defined_predicates();
        for requested in predicates {
            if !defined.contains(requested) {
                return Err(CompileError::UndefinedPredicate {
                    predicate: requested.clone(),
                });
            }
        }

        let reachable = reachable_predicates(program, predicates, &defined);
        let signatures = infer_signatures(program, &reachable)?;
        let units = ordered_units(program, &reachable);

        let library = self.libraries.library(options.engine, options.effective_profile());
        let mut relations: BTreeMap<SmolStr, SmolStr> = BTreeMap::new();
        // Referenced-but-undefined predicates read database relations of the
        // same name.
        for predicate in &reachable {
            if !defined.contains(predicate) {
                relations.insert(predicate.clone(), predicate.clone());
            }
        }

        let requested: BTreeSet<&SmolStr> = predicates.iter().collect();
        let mut config: Vec<PlanNode> = Vec::new();
        let mut script_steps: Vec<ScriptStep> = Vec::new();

        for unit in &units {
            match unit {
                Unit::Single(predicate) => {
                    let ctx = SqlContext {
                        engine: options.engine,
                        library,
                        relations: &relations,
                    };
                    let rules: Vec<Rule> =
                        program.rules_for(predicate).into_iter().cloned().collect();
                    let sql = predicate_sql(&rules, &ctx)?;
                    config.push(PlanNode {
                        name: predicate.clone(),
                        node_type: node_type(predicate, &requested),
                        action: NodeAction {
                            sql: sql.clone(),
                            launcher: Launcher::Query,
                        },
                    });
                    script_steps.push(ScriptStep::Statement(format!(
                        "CREATE TABLE {predicate} AS\n{sql}"
                    )));
                    script_steps.push(ScriptStep::Ground {
                        relation: predicate.clone(),
                        check_stop: false,
                    });
                    relations.insert(predicate.clone(), predicate.clone());
                }
                Unit::Cover(cover) => {
                    let (core, last) = self.cover_script(program, cover, &relations, options)?;
                    let mut members = cover.members.iter();
                    if let Some(first) = members.next() {
                        // The first member's node runs the whole fixpoint
                        // and materializes its own table; the remaining
                        // members just read their final layer.
                        let mut node_steps = core.clone();
                        node_steps.extend(finalize_member(first, last));
                        config.push(PlanNode {
                            name: first.clone(),
                            node_type: node_type(first, &requested),
                            action: NodeAction {
                                sql: render_script(&node_steps),
                                launcher: Launcher::Script,
                            },
                        });
                        for member in members {
                            config.push(PlanNode {
                                name: member.clone(),
                                node_type: node_type(member, &requested),
                                action: NodeAction {
                                    sql: format!("SELECT * FROM {}", layer_name(member, last)),
                                    launcher: Launcher::Query,
                                },
                            });
                        }
                    }
                    script_steps.extend(core);
                    for member in &cover.members {
                        script_steps.extend(finalize_member(member, last));
                        relations.insert(member.clone(), member.clone());
                    }
                }
            }
        }

        let query_sql = match predicates.first() {
            Some(target) => self.query_sql(program, target, &units, &relations, options)?,
            None => String::new(),
        };

        let plan = CompilationPlan {
            schema: PLAN_SCHEMA.to_string(),
            engine: options.engine.name().to_string(),
            final_predicates: predicates.to_vec(),
            outputs: predicates
                .iter()
                .map(|predicate| PlanOutput {
                    predicate: predicate.clone(),
                    node: predicate.clone(),
                    kind: OutputKind::Table,
                })
                .collect(),
            config,
        };

        Ok(CompilationResult {
            plan,
            policy: options.policy(),
            query_sql,
            script_steps,
            signatures,
        })
    }

    /// Script steps computing one recursive cover up to its last layer:
    /// ignition layers, then a bounded iteration block advancing two layers
    /// per pass with a stop check after each grounding. Returns the steps
    /// and the index of the layer holding the result.
    fn cover_script(
        &self,
        program: &Program,
        cover: &Cover,
        outer_relations: &BTreeMap<SmolStr, SmolStr>,
        options: &CompileOptions,
    ) -> Result<(Vec<ScriptStep>, u32), CompileError> {
        let library = self.libraries.library(options.engine, options.effective_profile());
        let shape = iterative_shape(options.recursion_depth);
        let mut steps = Vec::new();

        // Layer relations reference themselves by name.
        let mut relations = outer_relations.clone();
        for member in &cover.members {
            for layer in 0..2 {
                let name = layer_name(member, layer);
                relations.insert(name.clone(), name);
            }
        }

        let layer_sql = |member: &SmolStr,
                         previous: Option<u32>,
                         relations: &BTreeMap<SmolStr, SmolStr>|
         -> Result<String, CompileError> {
            let rules = layer_rules(program, cover, member, previous);
            let ctx = SqlContext {
                engine: options.engine,
                library,
                relations,
            };
            predicate_sql(&rules, &ctx)
        };

        for member in &cover.members {
            let sql = layer_sql(member, None, &relations)?;
            steps.push(ScriptStep::Statement(format!(
                "CREATE TABLE {} AS\n{sql}",
                layer_name(member, 0)
            )));
            steps.push(ScriptStep::Ground {
                relation: layer_name(member, 0),
                check_stop: false,
            });
        }
        if shape.ignition_steps > 1 {
            for member in &cover.members {
                let sql = layer_sql(member, Some(0), &relations)?;
                steps.push(ScriptStep::Statement(format!(
                    "CREATE TABLE {} AS\n{sql}",
                    layer_name(member, 1)
                )));
                steps.push(ScriptStep::Ground {
                    relation: layer_name(member, 1),
                    check_stop: true,
                });
            }

            // Each pass runs the two-layer pattern the repetition count is
            // computed for: promote layer 1 to layer 0 and recompute layer 1,
            // twice, advancing the fixpoint by two layers per member.
            let mut body = Vec::new();
            for _ in 0..2 {
                for member in &cover.members {
                    body.push(ScriptStep::Statement(format!(
                        "DROP TABLE {}",
                        layer_name(member, 0)
                    )));
                    body.push(ScriptStep::Statement(format!(
                        "ALTER TABLE {} RENAME TO {}",
                        layer_name(member, 1),
                        layer_name(member, 0)
                    )));
                }
                for member in &cover.members {
                    let sql = layer_sql(member, Some(0), &relations)?;
                    body.push(ScriptStep::Statement(format!(
                        "CREATE TABLE {} AS\n{sql}",
                        layer_name(member, 1)
                    )));
                    body.push(ScriptStep::Ground {
                        relation: layer_name(member, 1),
                        check_stop: true,
                    });
                }
            }
            steps.push(ScriptStep::Iterate {
                repetitions: shape.repetitions,
                steps: body,
            });
        }

        let last = if shape.ignition_steps > 1 { 1 } else { 0 };
        Ok((steps, last))
    }

    /// Self-contained query for `target`: dependencies (with recursion
    /// unrolled to `recursion_depth` layers) become a `WITH` chain.
    fn query_sql(
        &self,
        program: &Program,
        target: &SmolStr,
        units: &[Unit],
        relations: &BTreeMap<SmolStr, SmolStr>,
        options: &CompileOptions,
    ) -> Result<String, CompileError> {
        let library = self.libraries.library(options.engine, options.effective_profile());
        let depth = options.recursion_depth;
        let mut ctes: Vec<(SmolStr, String)> = Vec::new();
        let mut target_select: Option<String> = None;

        let mut relations = relations.clone();
        for unit in units {
            if let Unit::Cover(cover) = unit {
                for member in &cover.members {
                    for layer in 0..=depth {
                        let name = layer_name(member, layer);
                        relations.insert(name.clone(), name);
                    }
                }
            }
        }

        for unit in units {
            match unit {
                Unit::Single(predicate) => {
                    let ctx = SqlContext {
                        engine: options.engine,
                        library,
                        relations: &relations,
                    };
                    let rules: Vec<Rule> =
                        program.rules_for(predicate).into_iter().cloned().collect();
                    let sql = predicate_sql(&rules, &ctx)?;
                    if predicate == target {
                        target_select = Some(sql);
                        break;
                    }
                    ctes.push((predicate.clone(), sql));
                }
                Unit::Cover(cover) => {
                    for layer in 0..=depth {
                        for member in &cover.members {
                            let rules =
                                layer_rules(program, cover, member, layer.checked_sub(1));
                            let ctx = SqlContext {
                                engine: options.engine,
                                library,
                                relations: &relations,
                            };
                            let sql = predicate_sql(&rules, &ctx)?;
                            ctes.push((layer_name(member, layer), sql));
                        }
                    }
                    if cover.contains(target) {
                        target_select =
                            Some(format!("SELECT * FROM {}", layer_name(target, depth)));
                        break;
                    }
                    for member in &cover.members {
                        ctes.push((
                            member.clone(),
                            format!("SELECT * FROM {}", layer_name(member, depth)),
                        ));
                    }
                }
            }
        }

        // PANIC SAFETY: `units` always contains the requested target.
        #[allow(clippy::expect_used)]
        let target_select = target_select.expect("target present in ordered units");
        if ctes.is_empty() {
            Ok(target_select)
        } else {
            let chain = ctes
                .iter()
                .map(|(name, sql)| format!("{name} AS (\n{sql}\n)"))
                .join(",\n");
            Ok(format!("WITH\n{chain}\n{target_select}"))
        }
    }
}

/// Materialize a cover member's table from its last computed layer.
fn finalize_member(member: &SmolStr, last: u32) -> Vec<ScriptStep> {
    vec![
        ScriptStep::Statement(format!(
            "CREATE TABLE {member} AS SELECT * FROM {}",
            layer_name(member, last)
        )),
        ScriptStep::Ground {
            relation: member.clone(),
            check_stop: false,
        },
    ]
}

fn node_type(predicate: &SmolStr, requested: &BTreeSet<&SmolStr>) -> NodeType {
    if requested.contains(predicate) {
        NodeType::Final
    } else {
        NodeType::Intermediate
    }
}

/// Predicates referenced by a rule body, defined or not.
fn referenced_predicates(rule: &Rule) -> impl Iterator<Item = &SmolStr> {
    rule.body.iter().filter_map(|literal| match literal {
        Literal::Atom(atom) | Literal::Negation(atom) => Some(&atom.predicate),
        _ => None,
    })
}

/// All predicates reachable from the requested set, defined ones expanded
/// transitively.
fn reachable_predicates(
    program: &Program,
    requested: &[SmolStr],
    defined: &BTreeSet<SmolStr>,
) -> BTreeSet<SmolStr> {
    let mut reachable = BTreeSet::new();
    let mut stack: Vec<SmolStr> = requested.to_vec();
    while let Some(predicate) = stack.pop() {
        if !reachable.insert(predicate.clone()) {
            continue;
        }
        if defined.contains(&predicate) {
            for rule in program.rules_for(&predicate) {
                for referenced in referenced_predicates(rule) {
                    if !reachable.contains(referenced) {
                        stack.push(referenced.clone());
                    }
                }
            }
        }
    }
    reachable
}

/// Defined reachable predicates in dependency order, recursive covers
/// collapsed into one unit each. Covers form a DAG once collapsed, so a
/// postorder walk is a topological order.
fn ordered_units(program: &Program, reachable: &BTreeSet<SmolStr>) -> Vec<Unit> {
    let defined = program.defined_predicates();
    let covers = recursive_covers(program);
    let cover_index: BTreeMap<&SmolStr, usize> = covers
        .iter()
        .enumerate()
        .flat_map(|(i, cover)| cover.members.iter().map(move |m| (m, i)))
        .collect();

    let mut order: Vec<Unit> = Vec::new();
    let mut emitted_covers: BTreeSet<usize> = BTreeSet::new();
    let mut visited: BTreeSet<SmolStr> = BTreeSet::new();

    fn visit(
        predicate: &SmolStr,
        program: &Program,
        defined: &BTreeSet<SmolStr>,
        covers: &[Cover],
        cover_index: &BTreeMap<&SmolStr, usize>,
        visited: &mut BTreeSet<SmolStr>,
        emitted_covers: &mut BTreeSet<usize>,
        order: &mut Vec<Unit>,
    ) {
        if !defined.contains(predicate) || !visited.insert(predicate.clone()) {
            return;
        }
        if let Some(&index) = cover_index.get(predicate) {
            // PANIC SAFETY: `cover_index` values index into `covers`.
            #[allow(clippy::indexing_slicing)]
            let cover = &covers[index];
            for member in &cover.members {
                visited.insert(member.clone());
            }
            for deps in cover.direct_args.values() {
                for dep in deps {
                    visit(
                        dep,
                        program,
                        defined,
                        covers,
                        cover_index,
                        visited,
                        emitted_covers,
                        order,
                    );
                }
            }
            if emitted_covers.insert(index) {
                order.push(Unit::Cover(cover.clone()));
            }
            return;
        }
        for rule in program.rules_for(predicate) {
            let deps: BTreeSet<&SmolStr> = referenced_predicates(rule).collect();
            for dep in deps {
                visit(
                    dep,
                    program,
                    defined,
                    covers,
                    cover_index,
                    visited,
                    emitted_covers,
                    order,
                );
            }
        }
        order.push(Unit::Single(predicate.clone()));
    }

    for predicate in reachable {
        visit(
            predicate,
            program,
            &defined,
            &covers,
            &cover_index,
            &mut visited,
            &mut emitted_covers,
            &mut order,
        );
    }
    order
}

/// Infer per-column types for every defined reachable predicate, failing
/// with the aggregated conflict list if any column unifies to a bad type.
fn infer_signatures(
    program: &Program,
    reachable: &BTreeSet<SmolStr>,
) -> Result<BTreeMap<SmolStr, BTreeMap<SmolStr, String>>, CompileError> {
    let defined = program.defined_predicates();
    let mut arena = TypeArena::new();
    let mut signatures: BTreeMap<SmolStr, BTreeMap<SmolStr, TypeRef>> = BTreeMap::new();

    let mut column_ref = |signatures: &mut BTreeMap<SmolStr, BTreeMap<SmolStr, TypeRef>>,
                          arena: &mut TypeArena,
                          predicate: &SmolStr,
                          column: SmolStr|
     -> TypeRef {
        *signatures
            .entry(predicate.clone())
            .or_default()
            .entry(column)
            .or_insert_with(|| arena.fresh())
    };

    for predicate in reachable {
        for rule in program.rules_for(predicate) {
            let mut env: BTreeMap<SmolStr, TypeRef> = BTreeMap::new();

            let mut unify_atom = |atom: &Atom,
                                  signatures: &mut BTreeMap<SmolStr, BTreeMap<SmolStr, TypeRef>>,
                                  arena: &mut TypeArena,
                                  env: &mut BTreeMap<SmolStr, TypeRef>| {
                // Undefined predicates read external relations of unknown
                // schema; their columns stay unconstrained.
                let constrain = defined.contains(&atom.predicate);
                for arg in &atom.args {
                    let term_ref = term_type(&arg.value, arena, env);
                    if constrain {
                        let column = column_ref(
                            signatures,
                            arena,
                            &atom.predicate,
                            arg.name.column_name(),
                        );
                        arena.unify(column, term_ref);
                    }
                }
            };

            unify_atom(&rule.head, &mut signatures, &mut arena, &mut env);
            for literal in &rule.body {
                match literal {
                    Literal::Atom(atom) | Literal::Negation(atom) => {
                        unify_atom(atom, &mut signatures, &mut arena, &mut env);
                    }
                    Literal::Eq { left, right } => {
                        let l = term_type(left, &mut arena, &mut env);
                        let r = term_type(right, &mut arena, &mut env);
                        arena.unify(l, r);
                    }
                    Literal::Cmp { left, right, .. } => {
                        let l = term_type(left, &mut arena, &mut env);
                        let r = term_type(right, &mut arena, &mut env);
                        arena.unify(l, r);
                    }
                    Literal::In { element, list } => {
                        let e = term_type(element, &mut arena, &mut env);
                        let l = term_type(list, &mut arena, &mut env);
                        arena.unify_list_element(l, e);
                    }
                }
            }
        }
    }

    let mut conflicts: Vec<TypeConflict> = Vec::new();
    let mut rendered: BTreeMap<SmolStr, BTreeMap<SmolStr, String>> = BTreeMap::new();
    for (predicate, columns) in &signatures {
        for (column, &type_ref) in columns {
            let concrete = arena.very_concrete_type(type_ref);
            if let Some(bad) = concrete.find_bad() {
                conflicts.push(TypeConflict {
                    predicate: predicate.clone(),
                    column: column.clone(),
                    message: bad.diagnostic_message(),
                });
            }
            rendered
                .entry(predicate.clone())
                .or_default()
                .insert(column.clone(), arena.render(type_ref));
        }
    }
    if conflicts.is_empty() {
        Ok(rendered)
    } else {
        Err(CompileError::TypeConflicts { conflicts })
    }
}

/// The type of a term, allocating into `arena` and binding variables in
/// `env`.
fn term_type(
    term: &Term,
    arena: &mut TypeArena,
    env: &mut BTreeMap<SmolStr, TypeRef>,
) -> TypeRef {
    match term {
        Term::Var(var) => *env.entry(var.clone()).or_insert_with(|| arena.fresh()),
        Term::Num(_) => arena.alloc(Type::Num),
        Term::Str(_) => arena.alloc(Type::Str),
        Term::Bool(_) => arena.alloc(Type::Bool),
        Term::List(items) => {
            let element = arena.fresh();
            for item in items {
                let item_ref = term_type(item, arena, env);
                arena.unify(element, item_ref);
            }
            let list = arena.fresh();
            arena.unify_list_element(list, element);
            list
        }
        Term::Record(fields) => {
            let record = arena.fresh();
            for (name, value) in fields {
                let value_ref = term_type(value, arena, env);
                arena.unify_record_field(record, name, value_ref);
            }
            record
        }
        Term::Field { record, field } => {
            let record_ref = term_type(record, arena, env);
            let value = arena.fresh();
            arena.unify_record_field(record_ref, field, value);
            value
        }
        Term::Call { args, .. } => {
            for arg in args {
                term_type(arg, arena, env);
            }
            arena.fresh()
        }
    }
}
