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

//! Lowering of recursive predicates into bounded, dialect-portable iterative
//! SQL. Native recursive SQL cannot be relied on uniformly across engines,
//! so self-referential predicates are compiled either by bounded unrolling
//! (`depth + 1` sequential layers) or, in script mode, by a flat iterative
//! evaluation with explicit grounding checkpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use smol_str::SmolStr;

use crate::ast::{Literal, Program, Rule};

/// The set of predicate names mutually involved in one recursive cycle,
/// together with each member's non-recursive input predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cover {
    pub members: BTreeSet<SmolStr>,
    /// Per member, the predicates it reads that are *not* part of the cycle.
    pub direct_args: BTreeMap<SmolStr, BTreeSet<SmolStr>>,
}

impl Cover {
    pub fn contains(&self, predicate: &str) -> bool {
        self.members.contains(predicate)
    }
}

/// Compute the recursive covers of a program: strongly connected components
/// of the predicate dependency graph that actually contain a cycle (size
/// above one, or a self-loop).
pub fn recursive_covers(program: &Program) -> Vec<Cover> {
    let predicates: Vec<SmolStr> = program.defined_predicates().into_iter().collect();
    let edges: BTreeMap<SmolStr, BTreeSet<SmolStr>> = predicates
        .iter()
        .map(|p| (p.clone(), program.dependencies(p)))
        .collect();

    let mut covers = Vec::new();
    for component in strongly_connected_components(&predicates, &edges) {
        let is_cycle = component.len() > 1
            || component.iter().any(|p| {
                edges
                    .get(p)
                    .map(|deps| deps.contains(p))
                    .unwrap_or(false)
            });
        if !is_cycle {
            continue;
        }
        let members: BTreeSet<SmolStr> = component.into_iter().collect();
        let direct_args = members
            .iter()
            .map(|member| {
                let inputs: BTreeSet<SmolStr> = edges
                    .get(member)
                    .map(|deps| deps.difference(&members).cloned().collect())
                    .unwrap_or_default();
                (member.clone(), inputs)
            })
            .collect();
        covers.push(Cover {
            members,
            direct_args,
        });
    }
    covers.sort_by(|a, b| a.members.cmp(&b.members));
    covers
}

/// Iterative Tarjan SCC. The recursion stack is explicit so deep rule graphs
/// cannot overflow the call stack.
fn strongly_connected_components(
    nodes: &[SmolStr],
    edges: &BTreeMap<SmolStr, BTreeSet<SmolStr>>,
) -> Vec<Vec<SmolStr>> {
    #[derive(Default)]
    struct State {
        index: BTreeMap<SmolStr, usize>,
        lowlink: BTreeMap<SmolStr, usize>,
        on_stack: BTreeSet<SmolStr>,
        stack: Vec<SmolStr>,
        next_index: usize,
        components: Vec<Vec<SmolStr>>,
    }

    enum Frame {
        Enter(SmolStr),
        Resume(SmolStr, Vec<SmolStr>, usize),
    }

    let mut state = State::default();
    for start in nodes {
        if state.index.contains_key(start) {
            continue;
        }
        let mut work = vec![Frame::Enter(start.clone())];
        while let Some(frame) = work.pop() {
            match frame {
                Frame::Enter(v) => {
                    if state.index.contains_key(&v) {
                        continue;
                    }
                    state.index.insert(v.clone(), state.next_index);
                    state.lowlink.insert(v.clone(), state.next_index);
                    state.next_index += 1;
                    state.stack.push(v.clone());
                    state.on_stack.insert(v.clone());
                    let successors: Vec<SmolStr> = edges
                        .get(&v)
                        .map(|deps| deps.iter().cloned().collect())
                        .unwrap_or_default();
                    work.push(Frame::Resume(v, successors, 0));
                }
                Frame::Resume(v, successors, mut next) => {
                    let mut descended = false;
                    while let Some(w) = successors.get(next) {
                        next += 1;
                        match state.index.get(w) {
                            None => {
                                work.push(Frame::Resume(v.clone(), successors.clone(), next));
                                work.push(Frame::Enter(w.clone()));
                                descended = true;
                                break;
                            }
                            Some(w_index) => {
                                if state.on_stack.contains(w) {
                                    let w_index = *w_index;
                                    let low =
                                        state.lowlink.get(&v).copied().unwrap_or(w_index);
                                    state.lowlink.insert(v.clone(), low.min(w_index));
                                }
                            }
                        }
                    }
                    if descended {
                        continue;
                    }
                    // All successors visited; fold lowlinks and maybe pop a
                    // component rooted at `v`.
                    let v_low = {
                        let mut low = state.lowlink.get(&v).copied().unwrap_or(0);
                        for w in &successors {
                            if state.on_stack.contains(w) {
                                if let Some(w_low) = state.lowlink.get(w) {
                                    low = low.min(*w_low);
                                }
                            }
                        }
                        state.lowlink.insert(v.clone(), low);
                        low
                    };
                    if Some(&v_low) == state.index.get(&v) {
                        let mut component = Vec::new();
                        while let Some(w) = state.stack.pop() {
                            state.on_stack.remove(&w);
                            let done = w == v;
                            component.push(w);
                            if done {
                                break;
                            }
                        }
                        state.components.push(component);
                    }
                }
            }
        }
    }
    state.components
}

/// Name of the unrolled layer `i` of predicate `predicate`.
pub fn layer_name(predicate: &str, layer: u32) -> SmolStr {
    SmolStr::new(format!("{predicate}_r{layer}"))
}

/// Rewrite the rules of one cover member for a single unrolled layer:
/// references to cover members are bound to the previous layer's relation
/// name; with no previous layer, rules that reference the cover are dropped
/// so the layer terminates with no further recursive reference.
pub fn layer_rules(
    program: &Program,
    cover: &Cover,
    member: &str,
    previous: Option<u32>,
) -> Vec<Rule> {
    let mut rules = Vec::new();
    for rule in program.rules_for(member) {
        let recursive = rule.body.iter().any(|literal| match literal {
            Literal::Atom(atom) | Literal::Negation(atom) => cover.contains(&atom.predicate),
            _ => false,
        });
        match previous {
            None if recursive => continue,
            None => rules.push((*rule).clone()),
            Some(prev) => {
                let mut rewritten = (*rule).clone();
                for literal in &mut rewritten.body {
                    if let Literal::Atom(atom) | Literal::Negation(atom) = literal {
                        if cover.contains(&atom.predicate) {
                            atom.predicate = layer_name(&atom.predicate, prev);
                        }
                    }
                }
                rules.push(rewritten);
            }
        }
    }
    rules
}

/// Shape of a flat iterative lowering: how many layers the ignition phase
/// unrolls, and how many times the two-layer iteration pattern repeats to
/// honor the requested depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterativeShape {
    pub ignition_steps: u32,
    pub repetitions: u32,
}

/// Two layers are primed during ignition; the remaining depth is covered two
/// layers per repetition.
pub fn iterative_shape(depth: u32) -> IterativeShape {
    let ignition_steps = 2u32.min(depth + 1);
    let repetitions = (depth + 1 - ignition_steps) / 2 + 1;
    IterativeShape {
        ignition_steps,
        repetitions,
    }
}

/// One step of a lowered SQL script. `Statement` bodies are plain SQL; the
/// other steps are directives interpreted by the executor, which is what
/// keeps generated SQL size bounded for deep recursion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Statement(String),
    /// Materialization checkpoint. When `check_stop` is set the executor
    /// consults the external stop-signal file here, allowing cooperative
    /// early termination between iterations (never mid-statement).
    Ground {
        relation: SmolStr,
        check_stop: bool,
    },
    /// Repeat `steps` exactly `repetitions` times.
    Iterate {
        repetitions: u32,
        steps: Vec<ScriptStep>,
    },
}

/// Render script steps to SQL text. Directives become structured comments,
/// and an `Iterate` body is written once with its repetition count, so the
/// text stays proportional to the program rather than to the depth.
pub fn render_script(steps: &[ScriptStep]) -> String {
    let mut out = String::new();
    render_script_into(&mut out, steps, 0);
    out
}

fn render_script_into(out: &mut String, steps: &[ScriptStep], indent: usize) {
    let pad = "  ".repeat(indent);
    for step in steps {
        match step {
            ScriptStep::Statement(sql) => {
                for line in sql.lines() {
                    let _ = writeln!(out, "{pad}{line}");
                }
                // Statements render multi-line; terminate after the last line.
                if out.ends_with('\n') {
                    out.pop();
                }
                out.push_str(";\n");
            }
            ScriptStep::Ground {
                relation,
                check_stop,
            } => {
                let suffix = if *check_stop { " (stop check)" } else { "" };
                let _ = writeln!(out, "{pad}-- ground {relation}{suffix}");
            }
            ScriptStep::Iterate { repetitions, steps } => {
                let _ = writeln!(out, "{pad}-- iterate {repetitions} times");
                render_script_into(out, steps, indent + 1);
                let _ = writeln!(out, "{pad}-- end iterate");
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
#[cfg(test)]
mod test {
    use super::*;
    use crate::ast::test_programs;

    #[test]
    fn reachability_has_one_cover() {
        let program = test_programs::reachability();
        let covers = recursive_covers(&program);
        assert_eq!(covers.len(), 1);
        let cover = &covers[0];
        assert!(cover.contains("Reach"));
        assert!(!cover.contains("Edge"));
        assert_eq!(
            cover.direct_args.get("Reach").unwrap(),
            &BTreeSet::from([SmolStr::new("Edge")])
        );
    }

    #[test]
    fn non_recursive_programs_have_no_covers() {
        let program = test_programs::single_fact();
        assert!(recursive_covers(&program).is_empty());
    }

    #[test]
    fn mutual_recursion_forms_one_cover() {
        use crate::ast::test_programs::atom;
        use crate::ast::{Literal, Program, Rule};
        let program = Program {
            rules: vec![
                Rule {
                    head: atom("Even", &["n"]),
                    body: vec![Literal::Atom(atom("Odd", &["n"]))],
                },
                Rule {
                    head: atom("Odd", &["n"]),
                    body: vec![Literal::Atom(atom("Even", &["n"]))],
                },
            ],
        };
        let covers = recursive_covers(&program);
        assert_eq!(covers.len(), 1);
        assert_eq!(
            covers[0].members,
            BTreeSet::from([SmolStr::new("Even"), SmolStr::new("Odd")])
        );
    }

    #[test]
    fn layer_zero_drops_recursive_rules() {
        let program = test_programs::reachability();
        let covers = recursive_covers(&program);
        let cover = &covers[0];
        let base = layer_rules(&program, cover, "Reach", None);
        assert_eq!(base.len(), 1);

        let layer1 = layer_rules(&program, cover, "Reach", Some(0));
        assert_eq!(layer1.len(), 2);
        let rewritten = layer1
            .iter()
            .flat_map(|r| &r.body)
            .filter_map(|l| match l {
                Literal::Atom(a) => Some(a.predicate.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(rewritten.contains(&"Reach_r0"));
        assert!(!rewritten.contains(&"Reach"));
    }

    #[test]
    fn iterative_shape_honors_the_depth_formula() {
        // repetitions = (depth + 1 - ignition_steps) / 2 + 1
        assert_eq!(
            iterative_shape(8),
            IterativeShape {
                ignition_steps: 2,
                repetitions: 4
            }
        );
        assert_eq!(
            iterative_shape(1),
            IterativeShape {
                ignition_steps: 2,
                repetitions: 1
            }
        );
        assert_eq!(iterative_shape(0).ignition_steps, 1);
    }

    #[test]
    fn script_rendering_is_bounded_and_nested() {
        let steps = vec![
            ScriptStep::Statement("CREATE TABLE r0 AS SELECT 1".to_string()),
            ScriptStep::Ground {
                relation: SmolStr::new("Reach"),
                check_stop: true,
            },
            ScriptStep::Iterate {
                repetitions: 4,
                steps: vec![ScriptStep::Statement("SELECT 2".to_string())],
            },
        ];
        let rendered = render_script(&steps);
        assert_eq!(
            rendered,
            "CREATE TABLE r0 AS SELECT 1;\n\
             -- ground Reach (stop check)\n\
             -- iterate 4 times\n\
             \x20\x20SELECT 2;\n\
             -- end iterate\n"
        );
    }
}
