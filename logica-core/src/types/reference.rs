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

//! The type reference arena: a union-find-with-payload graph of type cells.
//!
//! Each cell either holds a concrete [`Type`] or points at another cell.
//! Unification redirects the lower-ranked cell at the higher-ranked cell and
//! writes the merged type into the survivor, so every reference to either
//! operand observes the merge. Dereference chains are guarded by a visited
//! set; a cycle degrades to the [`BadType`] sentinel instead of looping.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use smol_str::SmolStr;

use super::{field_sort_key, render_type, BadType, BadTypeHint, ConcreteType, Type};

/// Index of a type cell in a [`TypeArena`]. Only minted by
/// [`TypeArena::alloc`], so a `TypeRef` is always in bounds for the arena
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeRef(u32);

impl TypeRef {
    fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
enum Cell {
    Concrete(Type),
    Link(TypeRef),
}

/// Arena of type cells. Created fresh for each compilation call and discarded
/// after rendering; nothing in it escapes except [`ConcreteType`] exports.
#[derive(Debug, Default)]
pub struct TypeArena {
    cells: Vec<Cell>,
}

impl TypeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new cell holding `ty`.
    pub fn alloc(&mut self, ty: Type) -> TypeRef {
        let index = u32::try_from(self.cells.len()).unwrap_or(u32::MAX);
        self.cells.push(Cell::Concrete(ty));
        TypeRef(index)
    }

    /// Allocate a fresh unconstrained cell.
    pub fn fresh(&mut self) -> TypeRef {
        self.alloc(Type::Any)
    }

    fn cell(&self, r: TypeRef) -> &Cell {
        // PANIC SAFETY: `TypeRef`s are only minted by `alloc`, so the index is in bounds
        #[allow(clippy::indexing_slicing)]
        &self.cells[r.index() as usize]
    }

    fn set(&mut self, r: TypeRef, cell: Cell) {
        // PANIC SAFETY: `TypeRef`s are only minted by `alloc`, so the index is in bounds
        #[allow(clippy::indexing_slicing)]
        {
            self.cells[r.index() as usize] = cell;
        }
    }

    /// Follow a link chain without mutating. `None` means the chain is
    /// cyclic.
    fn follow(&self, r: TypeRef) -> Option<TypeRef> {
        let mut visited = HashSet::new();
        let mut current = r;
        loop {
            if !visited.insert(current) {
                return None;
            }
            match self.cell(current) {
                Cell::Concrete(_) => return Some(current),
                Cell::Link(next) => current = *next,
            }
        }
    }

    /// Follow a link chain to its concrete root, compressing the path. A
    /// cyclic chain is broken by overwriting the entry cell with the cycle
    /// sentinel, which then serves as the root.
    pub fn resolve(&mut self, r: TypeRef) -> TypeRef {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = r;
        let root = loop {
            if !visited.insert(current) {
                self.set(r, Cell::Concrete(Type::Bad(BadType::cycle_sentinel())));
                break r;
            }
            match self.cell(current) {
                Cell::Concrete(_) => break current,
                Cell::Link(next) => {
                    path.push(current);
                    current = *next;
                }
            }
        };
        for waypoint in path {
            if waypoint != root {
                self.set(waypoint, Cell::Link(root));
            }
        }
        root
    }

    /// The concrete type at a root returned by [`Self::resolve`]. Roots are
    /// concrete by construction; a stale link degrades to the sentinel rather
    /// than panicking.
    fn concrete_clone(&self, root: TypeRef) -> Type {
        match self.cell(root) {
            Cell::Concrete(ty) => ty.clone(),
            Cell::Link(_) => Type::Bad(BadType::cycle_sentinel()),
        }
    }

    /// Whether the type reachable from `r` resolved to a conflict.
    pub fn is_bad(&mut self, r: TypeRef) -> bool {
        let root = self.resolve(r);
        self.concrete_clone(root).is_bad()
    }

    /// Unify the types of two references representing the same program
    /// location. Never fails: conflicts are recorded as absorbing
    /// [`Type::Bad`] values and propagate through later unifications.
    pub fn unify(&mut self, a: TypeRef, b: TypeRef) {
        let ra = self.resolve(a);
        let rb = self.resolve(b);
        if ra == rb {
            return;
        }
        let ta = self.concrete_clone(ra);
        let tb = self.concrete_clone(rb);
        // Union by rank; ties break toward the lower cell index so the result
        // is deterministic regardless of argument order.
        let ((lo, tlo), (hi, thi)) = if (ta.rank(), ra.index()) <= (tb.rank(), rb.index()) {
            ((ra, ta), (rb, tb))
        } else {
            ((rb, tb), (ra, ta))
        };
        let merged = self.merge(&tlo, &thi, lo, hi);
        self.set(hi, Cell::Concrete(merged));
        self.set(lo, Cell::Link(hi));
    }

    /// Attach one newly observed element type to an existing list aggregate.
    /// List elements must themselves be singular; constraining an element to
    /// be a list records the specially-phrased conflict.
    pub fn unify_list_element(&mut self, list: TypeRef, element: TypeRef) {
        let singular = self.alloc(Type::Singular);
        self.unify(element, singular);
        let array = self.alloc(Type::Array(element));
        self.unify(list, array);
    }

    /// Attach one newly observed field type to an existing record aggregate.
    pub fn unify_record_field(&mut self, record: TypeRef, field: &str, value: TypeRef) {
        let mut fields = BTreeMap::new();
        fields.insert(SmolStr::new(field), value);
        let observation = self.alloc(Type::OpenRecord(fields));
        self.unify(record, observation);
    }

    /// Merge two concrete types, `tlo` ranking at or below `thi`. Compound
    /// operands unify their children in place, so the merge may allocate and
    /// redirect further cells.
    fn merge(&mut self, tlo: &Type, thi: &Type, lo: TypeRef, hi: TypeRef) -> Type {
        match (tlo, thi) {
            // Bad outranks everything, so an absorbed conflict sits on the
            // `hi` side unless both operands are already bad.
            (_, Type::Bad(bad)) | (Type::Bad(bad), _) => Type::Bad(bad.clone()),

            (Type::Any, _) => thi.clone(),

            (Type::Singular, Type::Singular) => Type::Singular,
            // Str is the only type that is both singular and sequential.
            (Type::Singular, Type::Sequential) => Type::Str,
            (Type::Singular, Type::Array(_)) => {
                self.conflict(lo, hi, Some(BadTypeHint::ListElementIsList))
            }
            (Type::Singular, _) => thi.clone(),

            (Type::Sequential, Type::Sequential) => Type::Sequential,
            (Type::Sequential, Type::Str) => Type::Str,
            (Type::Sequential, Type::Array(element)) => Type::Array(*element),
            (Type::Sequential, _) => self.conflict(lo, hi, None),

            (Type::Num, Type::Num) => Type::Num,
            (Type::Str, Type::Str) => Type::Str,
            (Type::Bool, Type::Bool) => Type::Bool,
            (Type::Time, Type::Time) => Type::Time,
            (Type::Num | Type::Str | Type::Bool | Type::Time, _) => self.conflict(lo, hi, None),

            (Type::Array(ea), Type::Array(eb)) => {
                self.unify(*ea, *eb);
                let element = self.resolve(*eb);
                if self.concrete_clone(element).is_bad() {
                    // A bad element makes the whole array bad.
                    self.conflict(lo, hi, None)
                } else {
                    Type::Array(element)
                }
            }
            (Type::Array(_), _) => self.conflict(lo, hi, None),

            (Type::OpenRecord(a), Type::OpenRecord(b)) => {
                self.merge_open_open(a.clone(), b, lo, hi)
            }
            (Type::OpenRecord(open), Type::ClosedRecord(closed)) => {
                self.merge_open_closed(open, closed.clone(), lo, hi)
            }
            (Type::ClosedRecord(a), Type::ClosedRecord(b)) => {
                self.merge_closed_closed(a, b.clone(), lo, hi)
            }
            (Type::OpenRecord(_) | Type::ClosedRecord(_), _) => self.conflict(lo, hi, None),
        }
    }

    /// Structural field-wise merge of two open records: the union of their
    /// fields, shared fields unified.
    fn merge_open_open(
        &mut self,
        mut merged: BTreeMap<SmolStr, TypeRef>,
        other: &BTreeMap<SmolStr, TypeRef>,
        lo: TypeRef,
        hi: TypeRef,
    ) -> Type {
        for (name, their) in other {
            match merged.entry(name.clone()) {
                Entry::Occupied(ours) => self.unify(*ours.get(), *their),
                Entry::Vacant(slot) => {
                    slot.insert(*their);
                }
            }
        }
        self.finish_record_merge(merged, lo, hi, /* closed= */ false)
    }

    /// An open record is compatible with a closed record only if its field
    /// names are a subset of the closed record's fields.
    fn merge_open_closed(
        &mut self,
        open: &BTreeMap<SmolStr, TypeRef>,
        closed: BTreeMap<SmolStr, TypeRef>,
        lo: TypeRef,
        hi: TypeRef,
    ) -> Type {
        if let Some(missing) = first_missing_field(open, &closed) {
            return self.conflict(lo, hi, Some(BadTypeHint::MissingField(missing)));
        }
        for (name, ours) in open {
            if let Some(their) = closed.get(name) {
                self.unify(*ours, *their);
            }
        }
        self.finish_record_merge(closed, lo, hi, /* closed= */ true)
    }

    /// Closed records are compatible only with identical field-name sets.
    fn merge_closed_closed(
        &mut self,
        a: &BTreeMap<SmolStr, TypeRef>,
        b: BTreeMap<SmolStr, TypeRef>,
        lo: TypeRef,
        hi: TypeRef,
    ) -> Type {
        if let Some(missing) = first_missing_field(a, &b).or_else(|| first_missing_field(&b, a)) {
            return self.conflict(lo, hi, Some(BadTypeHint::MissingField(missing)));
        }
        for (name, ours) in a {
            if let Some(their) = b.get(name) {
                self.unify(*ours, *their);
            }
        }
        self.finish_record_merge(b, lo, hi, /* closed= */ true)
    }

    /// Normalize merged record fields to their roots; a bad field makes the
    /// whole record bad.
    fn finish_record_merge(
        &mut self,
        fields: BTreeMap<SmolStr, TypeRef>,
        lo: TypeRef,
        hi: TypeRef,
        closed: bool,
    ) -> Type {
        let mut normalized = BTreeMap::new();
        for (name, field) in fields {
            let root = self.resolve(field);
            if self.concrete_clone(root).is_bad() {
                return self.conflict(lo, hi, None);
            }
            normalized.insert(name, root);
        }
        if closed {
            Type::ClosedRecord(normalized)
        } else {
            Type::OpenRecord(normalized)
        }
    }

    /// Record a conflict between the types currently reachable from `lo` and
    /// `hi`, rendering both operands while they are still observable.
    fn conflict(&mut self, lo: TypeRef, hi: TypeRef, hint: Option<BadTypeHint>) -> Type {
        Type::Bad(BadType {
            left: self.render(lo),
            right: self.render(hi),
            hint,
        })
    }

    /// Fully dereference the structure reachable from `r` for export. A
    /// per-call visited set guards against cyclic structure: revisiting a
    /// cell on the current path yields the sentinel instead of recursing
    /// forever.
    pub fn very_concrete_type(&self, r: TypeRef) -> ConcreteType {
        let mut visited = HashSet::new();
        self.very_concrete_inner(r, &mut visited)
    }

    fn very_concrete_inner(&self, r: TypeRef, visited: &mut HashSet<TypeRef>) -> ConcreteType {
        let Some(root) = self.follow(r) else {
            return ConcreteType::Bad(BadType::cycle_sentinel());
        };
        if !visited.insert(root) {
            return ConcreteType::Bad(BadType::cycle_sentinel());
        }
        let out = match self.cell(root) {
            Cell::Concrete(ty) => match ty {
                Type::Any => ConcreteType::Any,
                Type::Singular => ConcreteType::Singular,
                Type::Sequential => ConcreteType::Sequential,
                Type::Num => ConcreteType::Num,
                Type::Str => ConcreteType::Str,
                Type::Bool => ConcreteType::Bool,
                Type::Time => ConcreteType::Time,
                Type::Array(element) => {
                    ConcreteType::Array(Box::new(self.very_concrete_inner(*element, visited)))
                }
                Type::OpenRecord(fields) => {
                    ConcreteType::OpenRecord(self.concrete_fields(fields, visited))
                }
                Type::ClosedRecord(fields) => {
                    ConcreteType::ClosedRecord(self.concrete_fields(fields, visited))
                }
                Type::Bad(bad) => ConcreteType::Bad(bad.clone()),
            },
            Cell::Link(_) => ConcreteType::Bad(BadType::cycle_sentinel()),
        };
        visited.remove(&root);
        out
    }

    fn concrete_fields(
        &self,
        fields: &BTreeMap<SmolStr, TypeRef>,
        visited: &mut HashSet<TypeRef>,
    ) -> BTreeMap<SmolStr, ConcreteType> {
        fields
            .iter()
            .map(|(name, field)| (name.clone(), self.very_concrete_inner(*field, visited)))
            .collect()
    }

    /// Render the type reachable from `r` to its deterministic string form.
    pub fn render(&self, r: TypeRef) -> String {
        render_type(&self.very_concrete_type(r))
    }

    #[cfg(test)]
    fn set_link_for_test(&mut self, r: TypeRef, to: TypeRef) {
        self.set(r, Cell::Link(to));
    }
}

/// First field of `from` (in rendered field order) that `into` lacks.
fn first_missing_field(
    from: &BTreeMap<SmolStr, TypeRef>,
    into: &BTreeMap<SmolStr, TypeRef>,
) -> Option<SmolStr> {
    let mut names: Vec<&SmolStr> = from.keys().collect();
    names.sort_by_key(|name| field_sort_key(name));
    names
        .into_iter()
        .find(|name| !into.contains_key(*name))
        .cloned()
}
