//! Linearisation (`spec.md` §4.5): rewrites nonlinear monomials `x^k` (k≥2)
//! and `x·y` (distinct vars) to fresh variables, so downstream Farkas /
//! backward-acceleration code only ever sees linear guards and updates.
//!
//! A substitution is only installed when it is *sound*: every variable in
//! the monomial must be (a) not updated by the rule being linearised, and
//! (b) not occurring elsewhere outside monomial-shaped contexts (so the
//! same occurrence of `x` isn't simultaneously folded into `x²` and left
//! free as a linear term). Soundness is checked conservatively — over
//! approximated, never under — exactly once per candidate monomial, rather
//! than tracked incrementally, so a rejected monomial never partially
//! mutates the rule.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::expr::ExprId;
use crate::guard::{Atom, Guard};
use crate::its::{Rule, Update};
use crate::var::{Context, Variable};

#[derive(Debug, Error)]
pub enum LinearizeError {
    #[error("rule is not polynomial (contains the nonterm sentinel or an unsupported shape)")]
    NotPolynomial,
    #[error("no sound nonlinear monomial could be abstracted")]
    NoProgress,
}

/// Reverses a [`linearize`] pass: maps each fresh variable back to the
/// monomial (expressed as an [`ExprId`]) it stands for. Applied to a closed
/// form after acceleration to recover the answer in original variables
/// (`spec.md` §4.5: "the inverse substitution is applied to obtain the
/// result in original variables").
#[derive(Debug, Clone, Default)]
pub struct InverseSubst {
    /// fresh variable -> original monomial expression.
    pub to_original: BTreeMap<Variable, ExprId>,
    /// non-negativity side conditions introduced for even powers.
    pub nonneg: Vec<Variable>,
}

impl InverseSubst {
    pub fn is_empty(&self) -> bool {
        self.to_original.is_empty()
    }

    /// Substitute every fresh variable occurring in `id` by its original
    /// monomial, recursively (a monomial's own variables are never
    /// themselves fresh, by construction, so one pass suffices).
    pub fn apply(&self, cx: &mut Context, id: ExprId) -> ExprId {
        if self.to_original.is_empty() {
            return id;
        }
        cx.exprs.substitute(id, &self.to_original)
    }

    pub fn extend_guard(&self, cx: &mut Context, guard: &Guard) -> Guard {
        let mut atoms = guard.atoms.clone();
        for &z in &self.nonneg {
            let ze = cx.exprs.var(z);
            let zero = cx.exprs.zero();
            atoms.push(Atom { lhs: ze, rel: crate::guard::Rel::Ge, rhs: zero });
        }
        Guard { atoms }
    }
}

/// One nonlinear monomial candidate found while scanning a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Monomial {
    Power(Variable, u32),
    Product(Variable, Variable),
}

/// Collect every `x^k` (k>=2) and `x*y` (x!=y) monomial occurring anywhere
/// in the rule's guard/cost/update right-hand sides.
fn candidate_monomials(cx: &Context, rule: &Rule) -> Vec<Monomial> {
    let mut ids = Vec::new();
    for atom in &rule.guard.atoms {
        ids.push(atom.lhs);
        ids.push(atom.rhs);
    }
    ids.push(rule.cost);
    for b in &rule.branches {
        ids.extend(b.update.values().copied());
    }

    let mut found = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for id in ids {
        if cx.exprs.is_nonterm(id) {
            continue;
        }
        for mono in monomials_of(cx, id) {
            if seen.insert(mono.clone()) {
                found.push(mono);
            }
        }
    }
    found
}

/// Every degree->=2 single-variable power and every distinct-variable
/// product occurring in `id`'s expanded polynomial.
fn monomials_of(cx: &Context, id: ExprId) -> Vec<Monomial> {
    let mut out = Vec::new();
    for v in cx.exprs.free_vars(id) {
        let d = cx.exprs.degree_in(id, v);
        if d >= 2 {
            out.push(Monomial::Power(v, d));
        }
    }
    let vars: Vec<Variable> = cx.exprs.free_vars(id).into_iter().collect();
    for i in 0..vars.len() {
        for j in (i + 1)..vars.len() {
            // A genuine x*y cross term exists only if some monomial in the
            // polynomial mentions both variables simultaneously.
            if cx.exprs.monomial_mentions_both(id, vars[i], vars[j]) {
                out.push(Monomial::Product(vars[i], vars[j]));
            }
        }
    }
    out
}

/// A monomial's variable set is sound to abstract iff none of them is
/// updated by this rule and none occurs in the rule anywhere outside a
/// context exactly matching this monomial shape. We approximate the
/// "elsewhere" check conservatively: the variable may not occur at any
/// degree other than the one implied by this monomial, in any guard atom,
/// the cost, or any update right-hand side.
fn is_sound(cx: &Context, rule: &Rule, mono: &Monomial) -> bool {
    let (vars, expected_degree): (Vec<Variable>, BTreeMap<Variable, u32>) = match mono {
        Monomial::Power(v, k) => (vec![*v], [(*v, *k)].into_iter().collect()),
        Monomial::Product(a, b) => (vec![*a, *b], [(*a, 1), (*b, 1)].into_iter().collect()),
    };
    for v in &vars {
        if rule.branches.iter().any(|b| b.update.contains_key(v)) {
            return false;
        }
    }
    let mut ids = Vec::new();
    for atom in &rule.guard.atoms {
        ids.push(atom.lhs);
        ids.push(atom.rhs);
    }
    ids.push(rule.cost);
    for b in &rule.branches {
        ids.extend(b.update.values().copied());
    }
    for id in ids {
        if cx.exprs.is_nonterm(id) {
            continue;
        }
        for v in &vars {
            let d = cx.exprs.degree_in(id, *v);
            if d == 0 {
                continue;
            }
            if d != expected_degree[v] {
                return false;
            }
            // For a product monomial, every occurrence of `a` at degree 1
            // must co-occur with `b` (and vice versa) — otherwise `a` also
            // occurs linearly on its own, which this substitution would
            // silently absorb.
            if let Monomial::Product(a, b) = mono {
                if *v == *a && !cx.exprs.monomial_mentions_both(id, *a, *b) {
                    return false;
                }
                if *v == *b && !cx.exprs.monomial_mentions_both(id, *a, *b) {
                    return false;
                }
            }
        }
    }
    true
}

fn monomial_expr(cx: &mut Context, mono: &Monomial) -> ExprId {
    match *mono {
        Monomial::Power(v, k) => {
            let ve = cx.exprs.var(v);
            cx.exprs.pow(ve, k)
        }
        Monomial::Product(a, b) => {
            let ae = cx.exprs.var(a);
            let be = cx.exprs.var(b);
            cx.exprs.mul(ae, be)
        }
    }
}

fn substitute_rule(cx: &mut Context, rule: &mut Rule, mono_expr: ExprId, fresh: Variable) -> bool {
    let fresh_e = cx.exprs.var(fresh);
    let mut map = BTreeMap::new();
    // substitute_expr_for_var below needs a dedicated routine since `Arena`
    // only substitutes variable->expr, not expr->variable; we instead scan
    // for `mono_expr`'s id directly wherever it already occurs structurally
    // (the hash-consed arena guarantees every occurrence of this exact
    // monomial shares the same id).
    let mut changed = false;
    let mut replace = |id: ExprId| -> ExprId {
        if id == mono_expr {
            changed = true;
            fresh_e
        } else {
            id
        }
    };
    for atom in rule.guard.atoms.iter_mut() {
        atom.lhs = replace(atom.lhs);
        atom.rhs = replace(atom.rhs);
    }
    rule.cost = replace(rule.cost);
    for b in rule.branches.iter_mut() {
        for rhs in b.update.values_mut() {
            *rhs = replace(*rhs);
        }
    }
    let _ = &mut map;
    changed
}

/// Attempt one linearisation pass over `rule`, abstracting every sound
/// nonlinear monomial found. Returns the (possibly unmodified) rule plus
/// the accumulated inverse substitution; `Err(NoProgress)` if the rule was
/// already linear (nothing to do — not a failure in the taxonomy sense,
/// callers should just skip calling this).
pub fn linearize(cx: &mut Context, mut rule: Rule) -> Result<(Rule, InverseSubst), LinearizeError> {
    let mut inverse = InverseSubst::default();
    let mut progressed = false;

    loop {
        let candidates = candidate_monomials(cx, &rule);
        let mut applied_this_round = false;
        for mono in candidates {
            if !is_sound(cx, &rule, &mono) {
                continue;
            }
            let mono_expr = monomial_expr(cx, &mono);
            let is_even_power = matches!(mono, Monomial::Power(_, k) if k % 2 == 0);
            let fresh = cx.fresh_temp("z");
            if substitute_rule(cx, &mut rule, mono_expr, fresh) {
                inverse.to_original.insert(fresh, mono_expr);
                if is_even_power {
                    inverse.nonneg.push(fresh);
                }
                applied_this_round = true;
                progressed = true;
            }
        }
        if !applied_this_round {
            break;
        }
    }

    if !progressed {
        return Err(LinearizeError::NoProgress);
    }
    Ok((rule, inverse))
}

/// `true` if `rule`'s guard, cost, and every update right-hand side are
/// already linear in the program variables (nothing to abstract).
pub fn is_already_linear(cx: &Context, rule: &Rule) -> bool {
    let program: std::collections::BTreeSet<Variable> = cx.program_vars().collect();
    let mut ids = Vec::new();
    for atom in &rule.guard.atoms {
        ids.push(atom.lhs);
        ids.push(atom.rhs);
    }
    ids.push(rule.cost);
    for b in &rule.branches {
        ids.extend(b.update.values().copied());
    }
    ids.into_iter().all(|id| cx.exprs.is_nonterm(id) || cx.exprs.is_linear_in(id, &program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Rel;
    use crate::its::{Branch, Location, Provenance};

    fn make_square_rule(cx: &mut Context) -> Rule {
        let x = cx.program_var("x");
        let n = cx.program_var("N");
        let xe = cx.exprs.var(x);
        let ne = cx.exprs.var(n);
        let x2 = cx.exprs.pow(xe, 2);
        let guard = Guard { atoms: vec![Atom { lhs: x2, rel: Rel::Lt, rhs: ne }] };
        let one = cx.exprs.one();
        let x1 = cx.exprs.add(xe, one);
        let mut update = Update::new();
        update.insert(x, x1);
        Rule {
            source: Location(0),
            guard,
            cost: cx.exprs.one(),
            branches: vec![Branch { target: Location(0), update }],
            provenance: Provenance::Source,
        }
    }

    #[test]
    fn abstracts_square_and_records_nonneg() {
        let mut cx = Context::new();
        let rule = make_square_rule(&mut cx);
        let (linearized, inverse) = linearize(&mut cx, rule).unwrap();
        assert!(is_already_linear(&cx, &linearized));
        assert_eq!(inverse.nonneg.len(), 1);
        assert!(!inverse.is_empty());
    }

    #[test]
    fn inverse_substitution_recovers_original_shape() {
        let mut cx = Context::new();
        let rule = make_square_rule(&mut cx);
        let (linearized, inverse) = linearize(&mut cx, rule).unwrap();
        let z = *inverse.to_original.keys().next().unwrap();
        let ze = cx.exprs.var(z);
        let recovered = inverse.apply(&mut cx, ze);
        let x = cx.program_var("x");
        let xe = cx.exprs.var(x);
        let expect = cx.exprs.pow(xe, 2);
        assert_eq!(recovered, expect);
        let _ = linearized;
    }

    #[test]
    fn already_linear_rule_reports_no_progress() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let n = cx.program_var("N");
        let xe = cx.exprs.var(x);
        let ne = cx.exprs.var(n);
        let guard = Guard { atoms: vec![Atom { lhs: xe, rel: Rel::Lt, rhs: ne }] };
        let one = cx.exprs.one();
        let x1 = cx.exprs.add(xe, one);
        let mut update = Update::new();
        update.insert(x, x1);
        let rule = Rule {
            source: Location(0),
            guard,
            cost: cx.exprs.one(),
            branches: vec![Branch { target: Location(0), update }],
            provenance: Provenance::Source,
        };
        assert!(is_already_linear(&cx, &rule));
        assert!(matches!(linearize(&mut cx, rule), Err(LinearizeError::NoProgress)));
    }
}
