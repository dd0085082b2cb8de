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

//! Defines the type structure used when inferring column and variable types
//! for a rule graph, and various utilities for constructing, rendering, and
//! comparing types.
//!
//! Two representations exist. [`Type`] is the arena-facing structure whose
//! compound members point at other arena cells through [`TypeRef`]; it is
//! created and mutated only during one compilation call. [`ConcreteType`] is
//! the fully dereferenced export structure produced by
//! [`TypeArena::very_concrete_type`], safe to hold after the arena is gone.

mod reference;

pub use reference::{TypeArena, TypeRef};

use serde::Serialize;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::fmt::Write;

/// The arena-facing type structure. Compound types hold [`TypeRef`]s into the
/// owning [`TypeArena`] rather than boxed children, so that unification can
/// redirect shared substructure in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Unconstrained. Yields to any other operand during unification.
    Any,
    /// Anything that is not a list. The constraint placed on list elements.
    Singular,
    /// Anything usable in a sequence position: a string or a list.
    Sequential,
    Num,
    Str,
    Bool,
    Time,
    /// A list with the given element type.
    Array(TypeRef),
    /// A record that may acquire further fields.
    OpenRecord(BTreeMap<SmolStr, TypeRef>),
    /// A record whose field set is final.
    ClosedRecord(BTreeMap<SmolStr, TypeRef>),
    /// A recorded conflict. Absorbing: once produced it never unifies further.
    Bad(BadType),
}

impl Type {
    /// Total rank order used both to pick the surviving cell during
    /// unification (union-by-rank) and as the deterministic tie-break basis.
    /// `Bad` outranks everything so that conflicts absorb.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Type::Any => 0,
            Type::Singular => 1,
            Type::Sequential => 2,
            Type::Num => 3,
            Type::Str => 4,
            Type::Bool => 5,
            Type::Time => 6,
            Type::Array(_) => 7,
            Type::OpenRecord(_) => 8,
            Type::ClosedRecord(_) => 9,
            Type::Bad(_) => 10,
        }
    }

    pub(crate) fn is_bad(&self) -> bool {
        matches!(self, Type::Bad(_))
    }
}

/// A recorded unification conflict. Carries the two conflicting operands
/// already rendered to strings, so the value stays meaningful after the arena
/// that produced it is discarded. Conflicts are data, not errors: they
/// propagate freely and become a human diagnostic only when one is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BadType {
    /// Rendering of the lower-ranked operand.
    pub left: String,
    /// Rendering of the higher-ranked operand.
    pub right: String,
    /// Structured cause, when one of the specially-phrased conflicts applies.
    pub hint: Option<BadTypeHint>,
}

/// Causes that get special diagnostic phrasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BadTypeHint {
    /// A closed record was addressed with a field it does not have.
    MissingField(SmolStr),
    /// A list element was constrained to be a list.
    ListElementIsList,
}

impl BadType {
    /// The sentinel produced when dereferencing hits a reference cycle.
    pub fn cycle_sentinel() -> Self {
        BadType {
            left: "...".to_string(),
            right: "...".to_string(),
            hint: None,
        }
    }

    pub fn is_cycle_sentinel(&self) -> bool {
        self.left == "..." && self.right == "..." && self.hint.is_none()
    }

    /// Render this conflict as a human diagnostic. Called only at the point a
    /// message is requested, which lets callers aggregate conflicts instead
    /// of failing on the first.
    pub fn diagnostic_message(&self) -> String {
        match &self.hint {
            Some(BadTypeHint::MissingField(field)) => format!(
                "missing addressed record field `{}`: `{}` is incompatible with `{}`",
                field, self.left, self.right
            ),
            Some(BadTypeHint::ListElementIsList) => format!(
                "list element is itself a list: `{}` is incompatible with `{}`",
                self.left, self.right
            ),
            None => format!(
                "type conflict: `{}` is incompatible with `{}`",
                self.left, self.right
            ),
        }
    }
}

/// Fully dereferenced type structure for export. Produced by
/// [`TypeArena::very_concrete_type`]; owns its children outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConcreteType {
    Any,
    Singular,
    Sequential,
    Num,
    Str,
    Bool,
    Time,
    Array(Box<ConcreteType>),
    OpenRecord(BTreeMap<SmolStr, ConcreteType>),
    ClosedRecord(BTreeMap<SmolStr, ConcreteType>),
    Bad(BadType),
}

impl ConcreteType {
    pub fn is_bad(&self) -> bool {
        matches!(self, ConcreteType::Bad(_))
    }

    /// The first conflict found anywhere inside this type, depth-first.
    pub fn find_bad(&self) -> Option<&BadType> {
        match self {
            ConcreteType::Bad(bad) => Some(bad),
            ConcreteType::Array(element) => element.find_bad(),
            ConcreteType::OpenRecord(fields) | ConcreteType::ClosedRecord(fields) => {
                fields.values().find_map(ConcreteType::find_bad)
            }
            _ => None,
        }
    }
}

/// Sort key for record fields. Keys that are entirely digits are zero-padded
/// so that positional columns (`0`, `1`, ..., `10`) interleave in numeric
/// order with named fields rather than lexicographic order.
pub(crate) fn field_sort_key(name: &str) -> String {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
        format!("{name:0>20}")
    } else {
        name.to_string()
    }
}

fn render_fields(out: &mut String, fields: &BTreeMap<SmolStr, ConcreteType>, open: bool) {
    let mut ordered: Vec<(&SmolStr, &ConcreteType)> = fields.iter().collect();
    ordered.sort_by_key(|(name, _)| field_sort_key(name));
    out.push('{');
    for (i, (name, ty)) in ordered.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        // Infallible on String.
        let _ = write!(out, "{}: {}", name, render_type(ty));
    }
    if open {
        if !ordered.is_empty() {
            out.push_str(", ");
        }
        out.push_str("...");
    }
    out.push('}');
}

/// Deterministic pretty-printer. Output is independent of field insertion
/// order and stable across runs, so it is safe to use in golden tests and in
/// `BadType` payloads.
pub fn render_type(ty: &ConcreteType) -> String {
    match ty {
        ConcreteType::Any => "Any".to_string(),
        ConcreteType::Singular => "Singular".to_string(),
        ConcreteType::Sequential => "Sequential".to_string(),
        ConcreteType::Num => "Num".to_string(),
        ConcreteType::Str => "Str".to_string(),
        ConcreteType::Bool => "Bool".to_string(),
        ConcreteType::Time => "Time".to_string(),
        ConcreteType::Array(element) => format!("[{}]", render_type(element)),
        ConcreteType::OpenRecord(fields) => {
            let mut out = String::new();
            render_fields(&mut out, fields, true);
            out
        }
        ConcreteType::ClosedRecord(fields) => {
            let mut out = String::new();
            render_fields(&mut out, fields, false);
            out
        }
        ConcreteType::Bad(bad) => format!("BadType({}, {})", bad.left, bad.right),
    }
}
