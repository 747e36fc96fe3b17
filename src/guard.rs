//! Guards: conjunctions of relational atoms, and the canonical ≤-normal form
//! used throughout the Farkas and backward-acceleration machinery.
//!
//! `spec.md` §3: "A guard is a finite conjunction of relational atoms using
//! one of `<, ≤, =, ≥, >`; disequality is disallowed." [`Rel`] has no
//! variant for `≠`, so a disequality simply cannot be constructed — the
//! `UnsupportedShape` error kind (`spec.md` §7) is reserved for a parser
//! rejecting such input before it ever reaches this type.

use std::collections::BTreeMap;

use num_traits::{One, Zero};
use thiserror::Error;

use crate::expr::{Coeff, ExprId};
use crate::var::{Context, Variable};

/// One of the five allowed relational operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Rel {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

/// A single relational atom `lhs REL rhs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Atom {
    pub lhs: ExprId,
    pub rel: Rel,
    pub rhs: ExprId,
}

/// A guard: the conjunction of its atoms (an empty guard is `true`).
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Guard {
    pub atoms: Vec<Atom>,
}

/// A single normalized linear atom `Σ cᵢ·xᵢ ≤ bound`, used as one row of the
/// `A x ≤ b` system that Farkas' lemma (§4.4) and backward-acceleration
/// monotonicity checks (§4.6) both consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormAtom {
    pub coeffs: BTreeMap<Variable, Coeff>,
    pub bound: Coeff,
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("atom is not polynomial-linear once expanded (disallowed by the ≤-normal form)")]
    NotLinear,
    #[error("solve-term-for-variable: {0}")]
    Solve(#[from] SolveError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SolveError {
    #[error("variable does not occur with degree 1")]
    NotDegreeOne,
    #[error("coefficient policy violated: {0}")]
    PolicyViolated(&'static str),
}

impl Guard {
    pub fn is_true(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn free_vars(&self, cx: &Context) -> std::collections::BTreeSet<Variable> {
        let mut out = std::collections::BTreeSet::new();
        for a in &self.atoms {
            out.extend(cx.exprs.free_vars(a.lhs));
            out.extend(cx.exprs.free_vars(a.rhs));
        }
        out
    }

    /// Normalizes every atom to one or two `≤` rows (`spec.md` §3/§4.1):
    /// `A<B` becomes `A+1≤B`; `A=B` splits into `A≤B` and `B≤A`;
    /// `A≥B`/`A>B` are the mirrored forms of `≤`/`<`.
    pub fn to_le_atoms(&self, cx: &mut Context) -> Result<Vec<NormAtom>, GuardError> {
        let mut out = Vec::with_capacity(self.atoms.len());
        for atom in &self.atoms {
            for (l, r) in le_pairs(cx, atom) {
                out.push(le_row(cx, l, r)?);
            }
        }
        Ok(out)
    }

    /// The guard rewritten so every atom is `≤` (equalities split into a
    /// pair of atoms, as required before some rule-chaining / Farkas steps).
    pub fn rewritten_to_le(&self, cx: &mut Context) -> Guard {
        let mut atoms = Vec::new();
        for atom in &self.atoms {
            for (l, r) in le_pairs(cx, atom) {
                atoms.push(Atom { lhs: l, rel: Rel::Le, rhs: r });
            }
        }
        Guard { atoms }
    }

    /// `¬G`, pushed down to a disjunction-free representation is not always
    /// possible for a conjunction of atoms with > 1 atom (the true negation
    /// is a disjunction); this helper is only valid/used for single-atom
    /// guards such as reduced-guard atoms in the Farkas driver (§4.4 M1).
    pub fn negate_atom(cx: &mut Context, atom: &Atom) -> Atom {
        // ¬(A<B) = A≥B ; ¬(A≤B) = A>B ; ¬(A=B) is not a single atom (handled
        // by callers specially) ; ¬(A≥B) = A<B ; ¬(A>B) = A≤B.
        let Atom { lhs, rel, rhs } = *atom;
        match rel {
            Rel::Lt => Atom { lhs, rel: Rel::Ge, rhs },
            Rel::Le => Atom { lhs, rel: Rel::Gt, rhs },
            Rel::Ge => Atom { lhs, rel: Rel::Lt, rhs },
            Rel::Gt => Atom { lhs, rel: Rel::Le, rhs },
            Rel::Eq => {
                let _ = cx;
                // Not expressible as one atom; caller must special-case Eq.
                Atom { lhs, rel: Rel::Eq, rhs }
            }
        }
    }
}

/// `le_pairs` turns one atom into the `(lhs, rhs)` pairs of its `≤` rewrite,
/// already shifted by the `+1` integer-semantics offset where needed.
fn le_pairs(cx: &mut Context, atom: &Atom) -> Vec<(ExprId, ExprId)> {
    let Atom { lhs, rel, rhs } = *atom;
    match rel {
        Rel::Le => vec![(lhs, rhs)],
        Rel::Lt => {
            let one = cx.exprs.one();
            let lhs1 = cx.exprs.add(lhs, one);
            vec![(lhs1, rhs)]
        }
        Rel::Ge => vec![(rhs, lhs)],
        Rel::Gt => {
            let one = cx.exprs.one();
            let rhs1 = cx.exprs.add(rhs, one);
            vec![(rhs1, lhs)]
        }
        Rel::Eq => vec![(lhs, rhs), (rhs, lhs)],
    }
}

/// Turn `l ≤ r` into the row `Σ cᵢ·xᵢ ≤ bound` of `(l - r) ≤ 0`.
fn le_row(cx: &mut Context, l: ExprId, r: ExprId) -> Result<NormAtom, GuardError> {
    let diff = cx.exprs.sub(l, r);
    if !cx.exprs.is_linear(diff) {
        return Err(GuardError::NotLinear);
    }
    let vars: Vec<Variable> = cx.exprs.free_vars(diff).into_iter().collect();
    let mut coeffs = BTreeMap::new();
    for v in vars {
        let c1 = cx.exprs.coeff_at_degree(diff, v, 1);
        if let Some(c) = cx.exprs.as_constant(c1) {
            if !c.is_zero() {
                coeffs.insert(v, c);
            }
        }
    }
    let bound = cx.exprs.constant_term(diff);
    Ok(NormAtom { coeffs, bound: -bound })
}

/// Coefficient-policy choices for [`solve_for_var`] (`spec.md` §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoeffPolicy {
    /// (a) the coefficient of `x` must be exactly `+1` or `-1`.
    UnitCoeff,
    /// (b) any nonzero rational constant coefficient, provided the result
    /// is guaranteed integer-valued for integer inputs. We check this
    /// conservatively: the coefficient must be an integer that evenly
    /// divides every coefficient (and the constant term) of the remainder.
    IntegerValued,
    /// (c) any nonzero rational constant coefficient, no further check.
    AnyRational,
}

/// `spec.md` §4.1 solve-term-for-variable: given `p` with `x` occurring at
/// degree exactly 1, return `t` such that `p = 0 ↔ x = t`.
pub fn solve_for_var(
    cx: &mut Context,
    p: ExprId,
    x: Variable,
    policy: CoeffPolicy,
) -> Result<ExprId, SolveError> {
    if cx.exprs.degree_in(p, x) != 1 {
        return Err(SolveError::NotDegreeOne);
    }
    let a_id = cx.exprs.coeff_at_degree(p, x, 1);
    let b_id = cx.exprs.coeff_at_degree(p, x, 0);
    let a = cx
        .exprs
        .as_constant(a_id)
        .ok_or(SolveError::PolicyViolated("coefficient of x is not a rational constant"))?;
    if a.is_zero() {
        return Err(SolveError::NotDegreeOne);
    }

    match policy {
        CoeffPolicy::UnitCoeff => {
            if a.is_one() {
                let neg_b = cx.exprs.neg(b_id);
                Ok(neg_b)
            } else if a == -Coeff::one() {
                Ok(b_id)
            } else {
                Err(SolveError::PolicyViolated("coefficient of x is not ±1"))
            }
        }
        CoeffPolicy::IntegerValued => {
            if !a.is_integer() {
                return Err(SolveError::PolicyViolated("coefficient is not an integer"));
            }
            let a_int = a.to_integer();
            if cx.exprs.all_coeffs_divisible_by(b_id, &a_int) {
                let t = cx.exprs.scale(b_id, Coeff::new(num_bigint::BigInt::from(-1), a_int));
                Ok(t)
            } else {
                Err(SolveError::PolicyViolated(
                    "coefficient does not evenly divide the remainder; integrality not guaranteed",
                ))
            }
        }
        CoeffPolicy::AnyRational => {
            let inv = Coeff::new(num_bigint::BigInt::from(-1), num_bigint::BigInt::from(1)) / &a;
            Ok(cx.exprs.scale(b_id, inv))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lt_rewrites_to_le_with_integer_offset() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let n = cx.program_var("N");
        let xe = cx.exprs.var(x);
        let ne = cx.exprs.var(n);
        let atom = Atom { lhs: xe, rel: Rel::Lt, rhs: ne };
        let rows = Guard { atoms: vec![atom] }.to_le_atoms(&mut cx).unwrap();
        assert_eq!(rows.len(), 1);
        // x + 1 <= N  <=>  x - N <= -1
        assert_eq!(rows[0].bound, Coeff::from_integer(num_bigint::BigInt::from(-1)));
    }

    #[test]
    fn eq_splits_into_two_le_rows() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let y = cx.program_var("y");
        let xe = cx.exprs.var(x);
        let ye = cx.exprs.var(y);
        let atom = Atom { lhs: xe, rel: Rel::Eq, rhs: ye };
        let rows = Guard { atoms: vec![atom] }.to_le_atoms(&mut cx).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn solve_for_var_unit_coeff() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let n = cx.program_var("N");
        let xe = cx.exprs.var(x);
        let ne = cx.exprs.var(n);
        // p = x - N ; solving p = 0 for x gives x = N
        let p = cx.exprs.sub(xe, ne);
        let t = solve_for_var(&mut cx, p, x, CoeffPolicy::UnitCoeff).unwrap();
        assert_eq!(t, ne);
    }

    #[test]
    fn solve_for_var_rejects_nonlinear_degree() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let xe = cx.exprs.var(x);
        let p = cx.exprs.pow(xe, 2);
        assert_eq!(solve_for_var(&mut cx, p, x, CoeffPolicy::AnyRational), Err(SolveError::NotDegreeOne));
    }
}
