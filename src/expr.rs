//! Expression arena: canonical, hash-consed arithmetic terms.
//!
//! An [`Expression`] is not a tree of `Box`ed nodes; it is an index
//! ([`ExprId`]) into a [`Arena`] of hash-consed, *already expanded*
//! polynomials (`spec.md` §3's canonical-expanded-form invariant is thus a
//! structural property of the arena rather than something callers must
//! remember to re-establish). This mirrors the `other_examples` reference
//! `ekuiter-clausy` arena (a hash-consed DAG of boolean sub-expressions),
//! adapted from boolean formulas to arithmetic terms as the design notes
//! direct ("model... with indices into a location table").
//!
//! A term is either an ordinary multivariate polynomial over [`Variable`]s
//! with [`Coeff`] (arbitrary-precision rational) coefficients, or the
//! distinguished [`Term::NonTerm`] sentinel meaning "infinite cost"
//! (spec.md §3). Arithmetic on `NonTerm` absorbs: any operation involving it
//! again yields `NonTerm`.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Zero};

use crate::var::Variable;

/// Arbitrary-precision rational coefficient.
pub type Coeff = BigRational;

/// A monomial is a sorted map from variable to its (nonzero) exponent; the
/// empty map represents the monomial `1`.
pub type Monomial = BTreeMap<Variable, u32>;

/// A polynomial in expanded form: sorted map from monomial to its nonzero
/// coefficient. The empty map represents the zero polynomial.
pub type Polynomial = BTreeMap<Monomial, Coeff>;

/// Opaque handle into an [`Arena`]. Two ids compare equal iff the underlying
/// terms are structurally equal (hash-consing guarantee).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ExprId(pub(crate) u32);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Term {
    Poly(Polynomial),
    NonTerm,
}

/// Hash-consed store of all expressions built during an analysis run.
///
/// Owned by [`crate::var::Context`]; never global. Substitution never
/// mutates an existing entry — it interns a new (possibly already-seen)
/// term and returns its id, so old [`ExprId`]s remain valid and unchanged.
#[derive(Debug, Clone, Default)]
pub struct Arena {
    terms: Vec<Term>,
    lookup: HashMap<Term, ExprId>,
}

impl Arena {
    fn intern(&mut self, t: Term) -> ExprId {
        if let Some(id) = self.lookup.get(&t) {
            return *id;
        }
        let id = ExprId(self.terms.len() as u32);
        self.lookup.insert(t.clone(), id);
        self.terms.push(t);
        id
    }

    fn get(&self, id: ExprId) -> &Term {
        &self.terms[id.0 as usize]
    }

    /// The distinguished nonterm sentinel ("infinite cost").
    pub fn nonterm(&mut self) -> ExprId {
        self.intern(Term::NonTerm)
    }

    pub fn is_nonterm(&self, id: ExprId) -> bool {
        matches!(self.get(id), Term::NonTerm)
    }

    pub fn constant(&mut self, n: Coeff) -> ExprId {
        let mut p = Polynomial::new();
        if !n.is_zero() {
            p.insert(Monomial::new(), n);
        }
        self.intern(Term::Poly(p))
    }

    pub fn from_i64(&mut self, n: i64) -> ExprId {
        self.constant(BigRational::from_integer(BigInt::from(n)))
    }

    pub fn zero(&mut self) -> ExprId {
        self.intern(Term::Poly(Polynomial::new()))
    }

    pub fn one(&mut self) -> ExprId {
        self.from_i64(1)
    }

    pub fn var(&mut self, v: Variable) -> ExprId {
        let mut m = Monomial::new();
        m.insert(v, 1);
        let mut p = Polynomial::new();
        p.insert(m, Coeff::one());
        self.intern(Term::Poly(p))
    }

    pub fn add(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.get(a).clone(), self.get(b).clone()) {
            (Term::NonTerm, _) | (_, Term::NonTerm) => self.nonterm(),
            (Term::Poly(p), Term::Poly(q)) => self.intern(Term::Poly(poly_add(&p, &q))),
        }
    }

    pub fn neg(&mut self, a: ExprId) -> ExprId {
        match self.get(a).clone() {
            Term::NonTerm => self.nonterm(),
            Term::Poly(p) => {
                let q: Polynomial = p.into_iter().map(|(m, c)| (m, -c)).collect();
                self.intern(Term::Poly(q))
            }
        }
    }

    pub fn sub(&mut self, a: ExprId, b: ExprId) -> ExprId {
        let nb = self.neg(b);
        self.add(a, nb)
    }

    pub fn mul(&mut self, a: ExprId, b: ExprId) -> ExprId {
        match (self.get(a).clone(), self.get(b).clone()) {
            (Term::NonTerm, _) | (_, Term::NonTerm) => self.nonterm(),
            (Term::Poly(p), Term::Poly(q)) => self.intern(Term::Poly(poly_mul(&p, &q))),
        }
    }

    pub fn scale(&mut self, a: ExprId, k: Coeff) -> ExprId {
        let c = self.constant(k);
        self.mul(a, c)
    }

    pub fn pow(&mut self, a: ExprId, k: u32) -> ExprId {
        if k == 0 {
            return self.one();
        }
        let mut acc = a;
        for _ in 1..k {
            acc = self.mul(acc, a);
        }
        acc
    }

    /// Simultaneous substitution of every variable in `map` by its
    /// replacement expression; variables not present in `map` are left as
    /// themselves. This realizes "variable -> term" substitution (spec.md
    /// §4.1) and, because it is simultaneous, is the operation used to apply
    /// an [`crate::its::Update`] to a guard/cost (no sequential-substitution
    /// ordering hazard).
    pub fn substitute(&mut self, id: ExprId, map: &BTreeMap<Variable, ExprId>) -> ExprId {
        let p = match self.get(id).clone() {
            Term::NonTerm => return self.nonterm(),
            Term::Poly(p) => p,
        };
        let mut acc = self.zero();
        for (mono, coeff) in p {
            let mut term = self.constant(coeff);
            for (v, exp) in mono {
                let base = map.get(&v).copied().unwrap_or_else(|| self.var(v));
                let powered = self.pow(base, exp);
                term = self.mul(term, powered);
            }
            acc = self.add(acc, term);
        }
        acc
    }

    /// Free (occurring) variables of an expression.
    pub fn free_vars(&self, id: ExprId) -> BTreeSet<Variable> {
        match self.get(id) {
            Term::NonTerm => BTreeSet::new(),
            Term::Poly(p) => {
                let mut out = BTreeSet::new();
                for mono in p.keys() {
                    out.extend(mono.keys().copied());
                }
                out
            }
        }
    }

    /// Degree of `id` in `v` (0 if `v` does not occur).
    pub fn degree_in(&self, id: ExprId, v: Variable) -> u32 {
        match self.get(id) {
            Term::NonTerm => 0,
            Term::Poly(p) => p.keys().map(|m| *m.get(&v).unwrap_or(&0)).max().unwrap_or(0),
        }
    }

    /// The coefficient polynomial of `v^k` in `id` (v factored out of every
    /// matching monomial). `spec.md` §4.1's "coefficient-at-degree".
    pub fn coeff_at_degree(&mut self, id: ExprId, v: Variable, k: u32) -> ExprId {
        let p = match self.get(id).clone() {
            Term::NonTerm => return self.nonterm(),
            Term::Poly(p) => p,
        };
        let mut out = Polynomial::new();
        for (mono, coeff) in p {
            let exp = *mono.get(&v).unwrap_or(&0);
            if exp != k {
                continue;
            }
            let mut reduced = mono;
            reduced.remove(&v);
            *out.entry(reduced).or_insert_with(Coeff::zero) += coeff;
        }
        out.retain(|_, c| !c.is_zero());
        self.intern(Term::Poly(out))
    }

    /// True iff `id` is linear (total degree ≤ 1) when every variable
    /// *outside* `vars` is treated as a parameter/coefficient — i.e. no
    /// monomial has combined exponent > 1 over the variables in `vars`.
    /// `spec.md` §4.1's "linearity test in a given variable set".
    pub fn is_linear_in(&self, id: ExprId, vars: &BTreeSet<Variable>) -> bool {
        match self.get(id) {
            Term::NonTerm => true,
            Term::Poly(p) => p.keys().all(|m| {
                let deg: u32 = m.iter().filter(|(v, _)| vars.contains(v)).map(|(_, e)| *e).sum();
                deg <= 1
            }),
        }
    }

    /// True iff `id` does not mention any variable with exponent ≥ 2 and
    /// every monomial is a product of distinct variables raised to the power
    /// 1 — i.e. `id` is linear in *all* of its free variables.
    pub fn is_linear(&self, id: ExprId) -> bool {
        self.is_linear_in(id, &self.free_vars(id))
    }

    /// True iff some monomial of `id` has nonzero exponent in both `a` and
    /// `b` simultaneously (used by [`crate::linearize`] to tell a genuine
    /// cross term `x*y` apart from `x` and `y` merely both occurring
    /// somewhere in the same polynomial).
    pub fn monomial_mentions_both(&self, id: ExprId, a: Variable, b: Variable) -> bool {
        match self.get(id) {
            Term::NonTerm => false,
            Term::Poly(p) => p.keys().any(|m| m.get(&a).copied().unwrap_or(0) > 0 && m.get(&b).copied().unwrap_or(0) > 0),
        }
    }

    /// Total degree (max monomial degree), 0 for constants/zero/NonTerm.
    pub fn total_degree(&self, id: ExprId) -> u32 {
        match self.get(id) {
            Term::NonTerm => 0,
            Term::Poly(p) => p.keys().map(|m| m.values().sum::<u32>()).max().unwrap_or(0),
        }
    }

    /// True iff every monomial coefficient of `id` is an integer divisible
    /// by `k` (used by [`crate::guard::solve_for_var`]'s `IntegerValued`
    /// policy to guarantee the solved term is integer-valued on integer
    /// inputs).
    pub fn all_coeffs_divisible_by(&self, id: ExprId, k: &BigInt) -> bool {
        match self.get(id) {
            Term::NonTerm => false,
            Term::Poly(p) => {
                if k.is_zero() {
                    return p.is_empty();
                }
                p.values().all(|c| c.is_integer() && (c.to_integer() % k).is_zero())
            }
        }
    }

    /// The coefficient of the constant monomial (`1`) in `id`; `0` if absent.
    pub fn constant_term(&self, id: ExprId) -> Coeff {
        match self.get(id) {
            Term::NonTerm => Coeff::zero(),
            Term::Poly(p) => p.get(&Monomial::new()).cloned().unwrap_or_else(Coeff::zero),
        }
    }

    pub fn is_constant(&self, id: ExprId) -> bool {
        match self.get(id) {
            Term::NonTerm => false,
            Term::Poly(p) => p.is_empty() || (p.len() == 1 && p.contains_key(&Monomial::new())),
        }
    }

    /// The constant value of `id`, if it is a constant polynomial.
    pub fn as_constant(&self, id: ExprId) -> Option<Coeff> {
        match self.get(id) {
            Term::NonTerm => None,
            Term::Poly(p) => {
                if p.is_empty() {
                    Some(Coeff::zero())
                } else if p.len() == 1 {
                    p.get(&Monomial::new()).cloned()
                } else {
                    None
                }
            }
        }
    }

    /// Render `id` as a human-readable string using `ctx` for variable
    /// names; used only for the proof sketch (never parsed back).
    pub fn render(&self, ctx: &crate::var::Context, id: ExprId) -> String {
        match self.get(id) {
            Term::NonTerm => "⊤∞".to_string(),
            Term::Poly(p) => {
                if p.is_empty() {
                    return "0".to_string();
                }
                let mut parts = Vec::new();
                for (mono, coeff) in p {
                    let mut factors = Vec::new();
                    if !coeff.is_one() || mono.is_empty() {
                        factors.push(format!("{coeff}"));
                    }
                    for (v, e) in mono {
                        if *e == 1 {
                            factors.push(ctx.name(*v).to_string());
                        } else {
                            factors.push(format!("{}^{e}", ctx.name(*v)));
                        }
                    }
                    parts.push(factors.join("*"));
                }
                parts.join(" + ")
            }
        }
    }
}

fn monomial_mul(a: &Monomial, b: &Monomial) -> Monomial {
    let mut out = a.clone();
    for (v, e) in b {
        *out.entry(*v).or_insert(0) += e;
    }
    out
}

fn poly_add(p: &Polynomial, q: &Polynomial) -> Polynomial {
    let mut out = p.clone();
    for (m, c) in q {
        let entry = out.entry(m.clone()).or_insert_with(Coeff::zero);
        *entry += c;
    }
    out.retain(|_, c| !c.is_zero());
    out
}

fn poly_mul(p: &Polynomial, q: &Polynomial) -> Polynomial {
    let mut out = Polynomial::new();
    for (m1, c1) in p {
        for (m2, c2) in q {
            let m = monomial_mul(m1, m2);
            let entry = out.entry(m).or_insert_with(Coeff::zero);
            *entry += c1 * c2;
        }
    }
    out.retain(|_, c| !c.is_zero());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::Context;

    #[test]
    fn hash_consing_dedupes_structurally_equal_terms() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let e1 = cx.exprs.var(x);
        let one = cx.exprs.one();
        let e2 = cx.exprs.add(e1, cx.exprs.zero());
        let _ = one;
        assert_eq!(e1, e2);
    }

    #[test]
    fn degree_and_coeff_at_degree_roundtrip() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let x_expr = cx.exprs.var(x);
        let x2 = cx.exprs.pow(x_expr, 2);
        let three = cx.exprs.from_i64(3);
        let term = cx.exprs.mul(three, x2); // 3x^2
        assert_eq!(cx.exprs.degree_in(term, x), 2);
        let c2 = cx.exprs.coeff_at_degree(term, x, 2);
        assert_eq!(cx.exprs.as_constant(c2), Some(Coeff::from_integer(BigInt::from(3))));
    }

    #[test]
    fn substitute_is_simultaneous_not_sequential() {
        // x := y, y := x  should swap, not collapse to x=y=same value.
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let y = cx.program_var("y");
        let xe = cx.exprs.var(x);
        let ye = cx.exprs.var(y);
        let mut map = BTreeMap::new();
        map.insert(x, ye);
        map.insert(y, xe);
        let sum = cx.exprs.add(xe, cx.exprs.scale(ye, Coeff::from_integer(BigInt::from(2))));
        // sum = x + 2y; after simultaneous subst (x->y, y->x): y + 2x
        let subst = cx.exprs.substitute(sum, &map);
        let expected = cx.exprs.add(ye, cx.exprs.scale(xe, Coeff::from_integer(BigInt::from(2))));
        assert_eq!(subst, expected);
    }

    #[test]
    fn nonterm_absorbs_arithmetic() {
        let mut cx = Context::new();
        let one = cx.exprs.one();
        let nt = cx.exprs.nonterm();
        let sum = cx.exprs.add(one, nt);
        assert!(cx.exprs.is_nonterm(sum));
    }

    #[test]
    fn linearity_test_rejects_quadratic_terms() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let xe = cx.exprs.var(x);
        let x2 = cx.exprs.pow(xe, 2);
        assert!(cx.exprs.is_linear(xe));
        assert!(!cx.exprs.is_linear(x2));
    }
}
