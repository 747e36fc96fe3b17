//! Variable identities and the process-local registry.
//!
//! Every [`Variable`] is a small opaque handle allocated through a
//! [`Context`]; there is no global/static registry (see DESIGN.md §"no
//! singletons"). Fresh-name generation is monotonic for the lifetime of a
//! `Context`: once issued, an id is never reused, even if the variable it
//! named is later dropped from every rule.

#![allow(missing_docs)]

use std::fmt;

/// Distinguishes *program variables* (tracked semantic state) from
/// *temporary variables* (universally quantified at the rule level: Farkas
/// coefficients, iteration counters, linearisation monomials, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum VarKind {
    Program,
    Temp,
}

/// A variable handle: a stable id plus a human-readable name kept only for
/// display/proof-sketch purposes (identity is the id, never the name).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Variable(pub(crate) u32);

impl Variable {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct VarRecord {
    name: String,
    kind: VarKind,
}

/// Process-local (not process-wide) registry of variables and expressions.
///
/// A single `Context` is threaded by `&mut` reference through every public
/// engine operation; there is deliberately no global mutable state. Two
/// `Context`s never share ids, so handles from one must never be used with
/// another (this is a logic error, not a soundness one, since ids are just
/// opaque `u32`s — but callers should treat it as undefined behavior at the
/// semantic level).
#[derive(Debug, Clone, Default)]
pub struct Context {
    records: Vec<VarRecord>,
    name_lookup: std::collections::HashMap<String, Variable>,
    pub(crate) exprs: crate::expr::Arena,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or look up) a named program variable. Declaring the same
    /// name twice returns the same `Variable`.
    pub fn program_var(&mut self, name: impl Into<String>) -> Variable {
        self.named_var(name, VarKind::Program)
    }

    fn named_var(&mut self, name: impl Into<String>, kind: VarKind) -> Variable {
        let name = name.into();
        if let Some(v) = self.name_lookup.get(&name) {
            debug_assert_eq!(self.records[v.0 as usize].kind, kind);
            return *v;
        }
        let id = Variable(self.records.len() as u32);
        self.records.push(VarRecord { name: name.clone(), kind });
        self.name_lookup.insert(name, id);
        id
    }

    /// Allocate a fresh temporary variable with a naming prefix
    /// (`"l"` for Farkas multipliers, `"N"` for iteration counters, `"z"` for
    /// linearisation monomials, ...). Never called while iterating over the
    /// variable list (see spec.md §5 concurrency contract).
    pub fn fresh_temp(&mut self, prefix: &str) -> Variable {
        let id = Variable(self.records.len() as u32);
        let name = format!("{prefix}{}", id.0);
        self.records.push(VarRecord { name, kind: VarKind::Temp });
        id
    }

    pub fn kind(&self, v: Variable) -> VarKind {
        self.records[v.0 as usize].kind
    }

    pub fn is_program(&self, v: Variable) -> bool {
        self.kind(v) == VarKind::Program
    }

    pub fn is_temp(&self, v: Variable) -> bool {
        self.kind(v) == VarKind::Temp
    }

    pub fn name(&self, v: Variable) -> &str {
        &self.records[v.0 as usize].name
    }

    pub fn program_vars(&self) -> impl Iterator<Item = Variable> + '_ {
        (0..self.records.len())
            .map(|i| Variable(i as u32))
            .filter(move |v| self.is_program(*v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_var_is_idempotent_by_name() {
        let mut cx = Context::new();
        let a = cx.program_var("x");
        let b = cx.program_var("x");
        assert_eq!(a, b);
    }

    #[test]
    fn fresh_temp_never_collides() {
        let mut cx = Context::new();
        let a = cx.fresh_temp("l");
        let b = cx.fresh_temp("l");
        assert_ne!(a, b);
        assert!(cx.is_temp(a) && cx.is_temp(b));
    }

    #[test]
    fn program_and_temp_kinds_are_distinct() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let t = cx.fresh_temp("N");
        assert!(cx.is_program(x));
        assert!(cx.is_temp(t));
    }
}
