//! The metering-function synthesiser (`spec.md` §4.4): the Farkas-lemma
//! core that turns a self-loop's termination argument into an existential
//! linear-arithmetic query.
//!
//! The template `m(x⃗) = c0 + Σ cᵢ·xᵢ` is *not* built as one [`crate::expr`]
//! polynomial (that would make `cᵢ·xᵢ` a degree-2 monomial in the arena's
//! joint variable space and trip the linearity checks meant for genuine
//! program-variable polynomials). Instead the template is represented in
//! plain Rust as [`Template`] — a map from relevant program variable to its
//! fresh coefficient variable — and every Farkas row is assembled by hand
//! from concrete guard/update coefficients plus those template variables.
//! The resulting λ/c system is linear in the *joint* {λ, c} space and is
//! hence solvable by [`crate::smt::LinearArithmeticOracle`] exactly like any
//! other linear-arithmetic query, through the same [`crate::smt::SmtOracle`]
//! facade every other module uses — no bespoke solver path.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use num_traits::{One, Zero};
use thiserror::Error;

use crate::expr::{Coeff, ExprId};
use crate::guard::{Atom, Guard, Rel};
use crate::its::Update;
use crate::smt::{Logic, SatResult, SmtError, SmtOracle};
use crate::var::{Context, Variable};

/// `spec.md` §4.4 failure taxonomy.
#[derive(Debug)]
pub enum MeteringOutcome {
    Success(Template, ExprId),
    /// Reduced guard is empty: the loop has no terminating constraint.
    Unbounded,
    /// A premise or update was not polynomial-linear.
    Nonlinear,
    /// Two relevant variables would require a `min(A,B)`-shaped metering
    /// function; caller should split the loop on `A>B` / `B>A` and retry.
    ConflictVar(Variable, Variable),
    Unsat,
}

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("smt oracle: {0}")]
    Smt(#[from] SmtError),
}

/// `m(x⃗) = c0 + Σ coeffs[x]·x` with `c0`/`coeffs[x]` fresh temp variables.
#[derive(Debug, Clone)]
pub struct Template {
    pub c0: Variable,
    pub coeffs: BTreeMap<Variable, Variable>,
}

impl Template {
    fn new(cx: &mut Context, relevant: &BTreeSet<Variable>) -> Self {
        let c0 = cx.fresh_temp("c");
        let coeffs = relevant.iter().map(|&x| (x, cx.fresh_temp("c"))).collect();
        Template { c0, coeffs }
    }

    /// Materialize `m(x⃗)` as a real expression, once the coefficients have
    /// a concrete model (used to build the accelerated rule's cost/guard).
    pub fn instantiate(&self, cx: &mut Context, model: &BTreeMap<Variable, Coeff>) -> ExprId {
        let val = |v: Variable| model.get(&v).cloned().unwrap_or_else(Coeff::zero);
        let mut acc = cx.exprs.constant(val(self.c0));
        for (&x, &c) in &self.coeffs {
            let xe = cx.exprs.var(x);
            let term = cx.exprs.scale(xe, val(c));
            acc = cx.exprs.add(acc, term);
        }
        acc
    }
}

/// Reduced guard (`spec.md` §4.4 step 1): atoms whose variables are all
/// invariant under `update` cannot change truth value across iterations and
/// so cannot cause termination; drop them. An atom survives if at least one
/// of its variables is mapped by `update` to something other than itself.
pub fn reduced_guard(cx: &mut Context, guard: &Guard, update: &Update) -> Guard {
    let mut atoms = Vec::new();
    for atom in &guard.atoms {
        let mut vars = cx.exprs.free_vars(atom.lhs);
        vars.extend(cx.exprs.free_vars(atom.rhs));
        let changes = vars.iter().any(|v| match update.get(v) {
            None => false,
            Some(&rhs) => rhs != cx.exprs.var(*v),
        });
        if changes {
            atoms.push(*atom);
        }
    }
    Guard { atoms }
}

/// Relevant variables (`spec.md` §4.4 step 2): least fixed point of the
/// reduced guard's free variables, closed under the update's dependencies.
pub fn relevant_variables(cx: &mut Context, reduced: &Guard, update: &Update) -> BTreeSet<Variable> {
    let mut set = reduced.free_vars(cx);
    loop {
        let mut grew = false;
        let snapshot: Vec<Variable> = set.iter().copied().collect();
        for v in snapshot {
            if let Some(&rhs) = update.get(&v) {
                for w in cx.exprs.free_vars(rhs) {
                    if set.insert(w) {
                        grew = true;
                    }
                }
            }
        }
        if !grew {
            break;
        }
    }
    set
}

/// One negated atom per `spec.md` §4.4 M1 (equalities split into both
/// strict directions, since `¬(A=B)` is not itself a single atom).
fn negations(atom: &Atom) -> Vec<Atom> {
    let Atom { lhs, rel, rhs } = *atom;
    match rel {
        Rel::Lt => vec![Atom { lhs, rel: Rel::Ge, rhs }],
        Rel::Le => vec![Atom { lhs, rel: Rel::Gt, rhs }],
        Rel::Ge => vec![Atom { lhs, rel: Rel::Lt, rhs }],
        Rel::Gt => vec![Atom { lhs, rel: Rel::Le, rhs }],
        Rel::Eq => vec![Atom { lhs, rel: Rel::Lt, rhs }, Atom { lhs, rel: Rel::Gt, rhs }],
    }
}

/// Build the joint λ/c linear system for one Farkas-reduced implication
/// `premise ⇒ (Σ coeff_of(x)·x ≤ delta)`, where `coeff_of`/`delta` may
/// themselves mention [`Template`] variables. Returns `Nonlinear` if the
/// premise does not expand to a linear row system.
fn farkas_system(
    cx: &mut Context,
    premise: &Guard,
    relevant: &BTreeSet<Variable>,
    coeff_of: impl Fn(&mut Context, Variable) -> ExprId,
    delta: ExprId,
) -> Result<Option<Guard>, MeteringError> {
    let Ok(rows) = premise.to_le_atoms(cx) else {
        return Ok(None);
    };
    let lambdas: Vec<Variable> = rows.iter().map(|_| cx.fresh_temp("l")).collect();

    let mut atoms = Vec::new();
    let zero = cx.exprs.zero();
    for &lam in &lambdas {
        let lam_e = cx.exprs.var(lam);
        atoms.push(Atom { lhs: lam_e, rel: Rel::Ge, rhs: zero });
    }

    let mut all_premise_vars: BTreeSet<Variable> = BTreeSet::new();
    for row in &rows {
        all_premise_vars.extend(row.coeffs.keys().copied());
    }
    let columns: BTreeSet<Variable> = all_premise_vars.union(relevant).copied().collect();

    for &col in &columns {
        let mut lhs = cx.exprs.zero();
        for (row, &lam) in rows.iter().zip(&lambdas) {
            if let Some(a) = row.coeffs.get(&col) {
                let lam_e = cx.exprs.var(lam);
                let term = cx.exprs.scale(lam_e, a.clone());
                lhs = cx.exprs.add(lhs, term);
            }
        }
        let rhs = if relevant.contains(&col) { coeff_of(cx, col) } else { cx.exprs.zero() };
        atoms.push(Atom { lhs, rel: Rel::Eq, rhs });
    }

    let mut b_lhs = cx.exprs.zero();
    for (row, &lam) in rows.iter().zip(&lambdas) {
        let lam_e = cx.exprs.var(lam);
        let term = cx.exprs.scale(lam_e, row.bound.clone());
        b_lhs = cx.exprs.add(b_lhs, term);
    }
    atoms.push(Atom { lhs: b_lhs, rel: Rel::Le, rhs: delta });

    Ok(Some(Guard { atoms }))
}

/// `spec.md` §4.4: synthesise a metering function for `(guard, update,
/// cost)`. `reduced`/`relevant` are passed in already computed, since the
/// driver also needs them independently for the guard-strengthening
/// heuristic.
pub fn synthesize(
    cx: &mut Context,
    oracle: &mut dyn SmtOracle,
    reduced: &Guard,
    full_guard: &Guard,
    update: &Update,
    relevant: &BTreeSet<Variable>,
    timeout: Duration,
) -> Result<MeteringOutcome, MeteringError> {
    if reduced.is_true() {
        return Ok(MeteringOutcome::Unbounded);
    }

    let template = Template::new(cx, relevant);
    let c0_e = cx.exprs.var(template.c0);
    let coeff_of_m = |cx: &mut Context, x: Variable| -> ExprId {
        cx.exprs.var(*template.coeffs.get(&x).expect("column restricted to relevant vars"))
    };

    // M1: for every negated reduced-guard atom, m(x) <= 0, i.e. Σcᵢxᵢ <= -c0.
    let mut m1_atoms = Vec::new();
    for atom in &reduced.atoms {
        for neg in negations(atom) {
            let premise = Guard { atoms: vec![neg] };
            let neg_c0 = cx.exprs.neg(c0_e);
            let Some(sys) = farkas_system(cx, &premise, relevant, coeff_of_m, neg_c0)? else {
                return Ok(MeteringOutcome::Nonlinear);
            };
            m1_atoms.extend(sys.atoms);
        }
    }

    // M2: G(x) => m(x) > 0, encoded -m(x) <= -1, i.e. Σ(-cᵢ)xᵢ <= c0 - 1.
    let one = cx.exprs.one();
    let delta_m2 = cx.exprs.sub(c0_e, one);
    let coeff_of_neg_m = |cx: &mut Context, x: Variable| -> ExprId {
        let c = cx.exprs.var(*template.coeffs.get(&x).expect("relevant"));
        cx.exprs.neg(c)
    };
    let Some(m2_sys) = farkas_system(cx, full_guard, relevant, coeff_of_neg_m, delta_m2)? else {
        return Ok(MeteringOutcome::Nonlinear);
    };

    // M3: G(x) => m(x) <= m(U(x))+1, i.e. Σ(cₖ - Σᵢ a_ik·cᵢ)xₖ <= 1 + Σᵢ bᵢ·cᵢ.
    let mut a_coeffs: BTreeMap<Variable, BTreeMap<Variable, Coeff>> = BTreeMap::new();
    let mut b_consts: BTreeMap<Variable, Coeff> = BTreeMap::new();
    for &xi in relevant {
        let rhs = update.get(&xi).copied().unwrap_or_else(|| cx.exprs.var(xi));
        if !cx.exprs.is_linear(rhs) {
            return Ok(MeteringOutcome::Nonlinear);
        }
        let mut row = BTreeMap::new();
        for &xk in relevant {
            let c1 = cx.exprs.coeff_at_degree(rhs, xk, 1);
            if let Some(a) = cx.exprs.as_constant(c1) {
                if !a.is_zero() {
                    row.insert(xk, a);
                }
            }
        }
        a_coeffs.insert(xi, row);
        b_consts.insert(xi, cx.exprs.constant_term(rhs));
    }

    let coeff_of_m3 = |cx: &mut Context, xk: Variable| -> ExprId {
        let mut acc = cx.exprs.var(*template.coeffs.get(&xk).expect("relevant"));
        for (&xi, row) in &a_coeffs {
            if let Some(a_ik) = row.get(&xk) {
                let ci = cx.exprs.var(*template.coeffs.get(&xi).expect("relevant"));
                let term = cx.exprs.scale(ci, a_ik.clone());
                acc = cx.exprs.sub(acc, term);
            }
        }
        acc
    };
    let mut delta_m3 = cx.exprs.one();
    for (&xi, b_i) in &b_consts {
        if b_i.is_zero() {
            continue;
        }
        let ci = cx.exprs.var(*template.coeffs.get(&xi).expect("relevant"));
        let term = cx.exprs.scale(ci, b_i.clone());
        delta_m3 = cx.exprs.add(delta_m3, term);
    }
    let Some(m3_sys) = farkas_system(cx, full_guard, relevant, coeff_of_m3, delta_m3)? else {
        return Ok(MeteringOutcome::Nonlinear);
    };

    let mut all_atoms = m1_atoms;
    all_atoms.extend(m2_sys.atoms);
    all_atoms.extend(m3_sys.atoms);
    let joint = Guard { atoms: all_atoms };

    match oracle.model(cx, &joint, Logic::La, timeout) {
        Ok(model) => {
            let m_expr = template.instantiate(cx, &model);
            Ok(MeteringOutcome::Success(template, m_expr))
        }
        Err(SmtError::NoModel) => Ok(MeteringOutcome::Unsat),
        Err(other) => Err(other.into()),
    }
}

/// Guard-strengthening heuristic (`spec.md` §4.4): for each update `v:=k`
/// whose right-hand side only mentions variables *not* themselves updated
/// by this rule, add `G[v↦k]` to the guard. Runs to a fixpoint bounded by
/// the number of update entries (each can fire at most once).
pub fn strengthen_guard(cx: &mut Context, guard: &Guard, update: &Update) -> Guard {
    let mut atoms = guard.atoms.clone();
    for _ in 0..update.len() {
        let mut added_any = false;
        for (&v, &rhs) in update {
            let deps_updated = cx.exprs.free_vars(rhs).iter().any(|w| update.contains_key(w));
            if deps_updated {
                continue;
            }
            let mut subst = BTreeMap::new();
            subst.insert(v, rhs);
            for atom in guard.atoms.clone() {
                let lhs = cx.exprs.substitute(atom.lhs, &subst);
                let rhs2 = cx.exprs.substitute(atom.rhs, &subst);
                let candidate = Atom { lhs, rel: atom.rel, rhs: rhs2 };
                if !atoms.contains(&candidate) {
                    atoms.push(candidate);
                    added_any = true;
                }
            }
        }
        if !added_any {
            break;
        }
    }
    Guard { atoms }
}

/// Temp-var instantiation heuristic (`spec.md` §4.4): for each temporary
/// variable in the guard, collect its constant bounds and try substituting
/// each in turn, capped by `max_per_var`.
pub fn temp_var_instantiations(cx: &mut Context, guard: &Guard, max_per_var: usize) -> Vec<Guard> {
    let mut out = Vec::new();
    let temp_vars: Vec<Variable> = guard.free_vars(cx).into_iter().filter(|v| cx.is_temp(*v)).collect();
    for t in temp_vars {
        let Ok(rows) = guard.to_le_atoms(cx) else { continue };
        let mut bounds = Vec::new();
        for row in &rows {
            if row.coeffs.len() == 1 {
                if let Some(c) = row.coeffs.get(&t) {
                    if c.is_one() {
                        bounds.push(row.bound.clone());
                    } else if *c == -Coeff::one() {
                        bounds.push(-row.bound.clone());
                    }
                }
            }
        }
        bounds.truncate(max_per_var);
        #[cfg(feature = "trace-heuristics")]
        tracing::debug!(var = %cx.name(t), candidates = bounds.len(), "temp-var instantiation candidates");
        for b in bounds {
            let b_id = cx.exprs.constant(b);
            let mut subst = BTreeMap::new();
            subst.insert(t, b_id);
            let atoms = guard
                .atoms
                .iter()
                .map(|a| Atom {
                    lhs: cx.exprs.substitute(a.lhs, &subst),
                    rel: a.rel,
                    rhs: cx.exprs.substitute(a.rhs, &subst),
                })
                .collect();
            out.push(Guard { atoms });
        }
    }
    out
}

/// ConflictVar heuristic detection (`spec.md` §4.4): a crude but sound
/// trigger — if the joint M1/M2/M3 system is unsat, and two relevant
/// variables both appear only as mutual lower bounds of one another in the
/// guard (suggesting a `min(A,B)`-shaped metering function is needed),
/// report them so the caller can split the loop.
pub fn detect_conflict_var(cx: &mut Context, guard: &Guard, relevant: &BTreeSet<Variable>) -> Option<(Variable, Variable)> {
    let rows = guard.to_le_atoms(cx).ok()?;
    let candidates: Vec<Variable> = relevant.iter().copied().collect();
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            let (a, b) = (candidates[i], candidates[j]);
            let shares_row = rows.iter().any(|r| r.coeffs.contains_key(&a) && r.coeffs.contains_key(&b) && r.coeffs.len() == 2);
            if shares_row {
                return Some((a, b));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Rel;
    use crate::smt::LinearArithmeticOracle;

    #[test]
    fn reduced_guard_drops_invariant_atoms() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let y = cx.program_var("y");
        let xe = cx.exprs.var(x);
        let ye = cx.exprs.var(y);
        let zero = cx.exprs.zero();
        // y is never updated by this rule: `y >= 0` can't cause termination.
        let guard = Guard {
            atoms: vec![Atom { lhs: xe, rel: Rel::Lt, rhs: cx.exprs.constant(Coeff::from_integer(num_bigint::BigInt::from(10))) }, Atom {
                lhs: ye,
                rel: Rel::Ge,
                rhs: zero,
            }],
        };
        let one = cx.exprs.one();
        let x1 = cx.exprs.add(xe, one);
        let mut update = Update::new();
        update.insert(x, x1);
        let reduced = reduced_guard(&mut cx, &guard, &update);
        assert_eq!(reduced.atoms.len(), 1);
    }

    #[test]
    fn synthesizes_metering_for_simple_increment_loop() {
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

        let reduced = reduced_guard(&mut cx, &guard, &update);
        let relevant = relevant_variables(&mut cx, &reduced, &update);
        assert!(relevant.contains(&x) && relevant.contains(&n));

        let mut oracle = LinearArithmeticOracle::new();
        let outcome = synthesize(&mut cx, &mut oracle, &reduced, &guard, &update, &relevant, Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, MeteringOutcome::Success(_, _)));
    }

    #[test]
    fn unbounded_when_reduced_guard_empty() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let xe = cx.exprs.var(x);
        let one = cx.exprs.one();
        let x1 = cx.exprs.add(xe, one);
        let mut update = Update::new();
        update.insert(x, x1);
        let reduced = Guard::default();
        let full = Guard::default();
        let relevant = relevant_variables(&mut cx, &reduced, &update);
        let mut oracle = LinearArithmeticOracle::new();
        let outcome = synthesize(&mut cx, &mut oracle, &reduced, &full, &update, &relevant, Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, MeteringOutcome::Unbounded));
    }
}
