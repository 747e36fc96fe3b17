//! Backward acceleration (`spec.md` §4.6): accelerate a self-loop by
//! constructing its *inverse update* and checking the guard is monotone
//! under it, instead of synthesising a metering function. Cheaper than the
//! Farkas route when it applies, so the driver tries it first (`spec.md`
//! §4.9 step 2).

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use num_traits::{One, Zero};
use thiserror::Error;

use crate::expr::{Coeff, ExprId};
use crate::guard::{Atom, CoeffPolicy, Guard, Rel};
use crate::its::{Branch, Rule, Update};
use crate::recurrence::{close_total_cost, RecurrenceError, RecurrenceOracle};
use crate::smt::{Logic, SatResult, SmtError, SmtOracle};
use crate::var::{Context, Variable};

#[derive(Debug, Error)]
pub enum BackwardError {
    #[error("rule is not a linear self-loop")]
    NotApplicable,
    #[error("update for {0} is not linear in its own right-hand side")]
    NonlinearUpdate(Variable),
    #[error("coefficient of {0} in its own update is not a rational constant")]
    NonConstantCoeff(Variable),
    #[error("no valid inverse form for {0} (α=0 and β is fixed by neither U nor U∘U⁻¹)")]
    NoValidInverse(Variable),
    #[error("dependency cycle among update right-hand sides prevents ordering the inversion")]
    Cycle,
    #[error("recurrence oracle: {0}")]
    Recurrence(#[from] RecurrenceError),
    #[error("smt oracle: {0}")]
    Smt(#[from] SmtError),
}

/// Outcome of one backward-acceleration attempt on a self-loop.
#[derive(Debug)]
pub enum BackwardOutcome {
    /// Monotone; here is the accelerated guard/cost/update, in terms of the
    /// fresh iteration counter `n`.
    Success { n: Variable, guard: Guard, cost: ExprId, branch: Branch },
    /// Rule shape doesn't admit this technique at all (not linear, or not a
    /// self-loop) — the driver should fall through to Farkas without
    /// recording this as a failed attempt.
    NotApplicable,
    /// Inverse exists but the guard isn't monotone under it.
    NotMonotone,
}

/// Reverse-dependency order of `update`'s keys: `v` must be inverted after
/// every variable its right-hand side mentions (since those inverses are
/// substituted into `v`'s `β`). Mirrors
/// [`crate::recurrence::StandardRecurrenceOracle`]'s topological sort.
fn inversion_order(cx: &Context, update: &Update) -> Result<Vec<Variable>, BackwardError> {
    let vars: Vec<Variable> = update.keys().copied().collect();
    let deps: BTreeMap<Variable, Vec<Variable>> = vars
        .iter()
        .map(|&v| {
            let rhs = update[&v];
            let d = cx.exprs.free_vars(rhs).into_iter().filter(|w| *w != v && update.contains_key(w)).collect();
            (v, d)
        })
        .collect();

    let mut order = Vec::new();
    let mut state: BTreeMap<Variable, u8> = vars.iter().map(|&v| (v, 0)).collect();
    fn visit(
        v: Variable,
        deps: &BTreeMap<Variable, Vec<Variable>>,
        state: &mut BTreeMap<Variable, u8>,
        order: &mut Vec<Variable>,
    ) -> Result<(), BackwardError> {
        match state.get(&v).copied().unwrap_or(0) {
            2 => return Ok(()),
            1 => return Err(BackwardError::Cycle),
            _ => {}
        }
        state.insert(v, 1);
        for &w in deps.get(&v).into_iter().flatten() {
            visit(w, deps, state, order)?;
        }
        state.insert(v, 2);
        order.push(v);
        Ok(())
    }
    for &v in &vars {
        visit(v, &deps, &mut state, &mut order)?;
    }
    Ok(order)
}

/// Construct `U⁻¹` (`spec.md` §4.6). `guard_vars` are the variables the
/// monotonicity check actually needs an inverse for; anything else falls
/// back to the identity placeholder (form 3) rather than failing the whole
/// rule over an irrelevant variable with an awkward update.
pub fn invert_update(cx: &mut Context, update: &Update, guard_vars: &BTreeSet<Variable>) -> Result<Update, BackwardError> {
    let order = inversion_order(cx, update)?;
    let mut inverse: Update = Update::new();

    for v in order {
        let rhs = update[&v];
        let mut only_v = BTreeSet::new();
        only_v.insert(v);
        if !cx.exprs.is_linear_in(rhs, &only_v) || cx.exprs.degree_in(rhs, v) > 1 {
            return Err(BackwardError::NonlinearUpdate(v));
        }
        let alpha_id = cx.exprs.coeff_at_degree(rhs, v, 1);
        let alpha = cx.exprs.as_constant(alpha_id).ok_or(BackwardError::NonConstantCoeff(v))?;
        let beta_id = cx.exprs.coeff_at_degree(rhs, v, 0);

        if !alpha.is_zero() {
            // v := α·v + β  =>  v := (v - β[U⁻¹ so far]) / α.
            let beta_inv = cx.exprs.substitute(beta_id, &inverse);
            let v_e = cx.exprs.var(v);
            let diff = cx.exprs.sub(v_e, beta_inv);
            let inv_rhs = cx.exprs.scale(diff, Coeff::one() / alpha);
            inverse.insert(v, inv_rhs);
            continue;
        }

        // α = 0: v := β, an overwrite. Three special inverse forms.
        let beta = beta_id;

        // Form 1: β is fixed by U (substituting every other update into β
        // leaves it unchanged) — the loop never actually depends on v's own
        // prior value through β, so β itself (unsubstituted) is a valid
        // pre-image expression.
        let beta_under_u = cx.exprs.substitute(beta, update);
        if beta_under_u == beta {
            inverse.insert(v, beta);
            continue;
        }

        // Form 2: β is fixed by U∘U⁻¹ — substituting the already-computed
        // inverses of β's free variables into β, then forward through U
        // again, reproduces β. The pre-image is β evaluated under the
        // inverse substitution built so far.
        let beta_inv = cx.exprs.substitute(beta, &inverse);
        let beta_inv_then_u = cx.exprs.substitute(beta_inv, update);
        if beta_inv_then_u == beta {
            inverse.insert(v, beta_inv);
            continue;
        }

        // Form 3: v never occurs in the guard, so the monotonicity check
        // never needs its pre-image; identity is an unused placeholder.
        if !guard_vars.contains(&v) {
            inverse.insert(v, cx.exprs.var(v));
            continue;
        }

        return Err(BackwardError::NoValidInverse(v));
    }
    Ok(inverse)
}

/// `G(x⃗) ⇒ Gᵣ(U⁻¹(x⃗))` (`spec.md` §4.6 monotonicity check).
fn is_monotone(
    cx: &mut Context,
    oracle: &mut dyn SmtOracle,
    full_guard: &Guard,
    reduced: &Guard,
    inverse: &Update,
    timeout: Duration,
) -> Result<bool, BackwardError> {
    let atoms: Vec<Atom> = reduced
        .atoms
        .iter()
        .map(|a| Atom { lhs: cx.exprs.substitute(a.lhs, inverse), rel: a.rel, rhs: cx.exprs.substitute(a.rhs, inverse) })
        .collect();
    let under_inverse = Guard { atoms };
    match oracle.implies(cx, full_guard, &under_inverse, Logic::La, timeout)? {
        SatResult::Sat => Ok(true),
        SatResult::Unsat | SatResult::Unknown => Ok(false),
    }
}

/// Attempt backward acceleration of `rule` (`spec.md` §4.6). `rule` must
/// already be a linear self-loop; anything else yields `NotApplicable`.
pub fn accelerate(
    cx: &mut Context,
    oracle: &mut dyn SmtOracle,
    rec: &mut dyn RecurrenceOracle,
    rule: &Rule,
    timeout: Duration,
) -> Result<BackwardOutcome, BackwardError> {
    if !rule.is_self_loop() {
        return Ok(BackwardOutcome::NotApplicable);
    }
    let update = &rule.branches[0].update;
    let guard_vars = rule.guard.free_vars(cx);
    let reduced = crate::farkas::reduced_guard(cx, &rule.guard, update);
    if reduced.is_true() {
        // No terminating constraint at all: backward acceleration has
        // nothing to check monotonicity of; leave this to the Farkas path's
        // dedicated `Unbounded` outcome instead of claiming success here.
        return Ok(BackwardOutcome::NotApplicable);
    }

    let inverse = match invert_update(cx, update, &guard_vars) {
        Ok(inv) => inv,
        Err(BackwardError::NonlinearUpdate(_) | BackwardError::NonConstantCoeff(_) | BackwardError::NoValidInverse(_) | BackwardError::Cycle) => {
            return Ok(BackwardOutcome::NotApplicable)
        }
        Err(e) => return Err(e),
    };

    if !is_monotone(cx, oracle, &rule.guard, &reduced, &inverse, timeout)? {
        return Ok(BackwardOutcome::NotMonotone);
    }

    let n = cx.fresh_temp("N");
    // `RecurrenceFail` (`spec.md` §7) is a local, non-fatal failure: this
    // crate's oracle only closes C-finite/hypergeometric-sum shapes over a
    // polynomial representation, so a genuinely exponential update (e.g.
    // `x'=2x`) is monotone but not closeable here. Soft-fail to
    // `NotApplicable` rather than aborting the whole acceleration attempt.
    let closed = match rec.close(cx, update, n) {
        Ok(c) => c,
        Err(_) => return Ok(BackwardOutcome::NotApplicable),
    };
    let total_cost = match close_total_cost(rec, cx, update, rule.cost, n) {
        Ok(c) => c,
        Err(_) => return Ok(BackwardOutcome::NotApplicable),
    };

    // guard = original guard /\ (original guard)[v -> closed(v) at N-1] /\ N>0
    let n_e = cx.exprs.var(n);
    let one = cx.exprs.one();
    let n_minus_1 = cx.exprs.sub(n_e, one);
    let mut n_sub = BTreeMap::new();
    n_sub.insert(n, n_minus_1);
    let at_n_minus_1: BTreeMap<Variable, ExprId> = closed.iter().map(|(&v, &c)| (v, cx.exprs.substitute(c, &n_sub))).collect();

    let earlier_atoms: Vec<Atom> = rule
        .guard
        .atoms
        .iter()
        .map(|a| Atom { lhs: cx.exprs.substitute(a.lhs, &at_n_minus_1), rel: a.rel, rhs: cx.exprs.substitute(a.rhs, &at_n_minus_1) })
        .collect();

    let mut atoms = rule.guard.atoms.clone();
    atoms.extend(earlier_atoms);
    let zero = cx.exprs.zero();
    atoms.push(Atom { lhs: n_e, rel: Rel::Gt, rhs: zero });
    let guard = Guard { atoms };

    let branch = Branch { target: rule.branches[0].target, update: closed };
    Ok(BackwardOutcome::Success { n, guard, cost: total_cost, branch })
}

/// How the fresh iteration counter `n` should be eliminated (`spec.md`
/// §4.6 last paragraph). Shared by both the backward and Farkas paths,
/// since both close a recurrence in terms of the same kind of counter.
#[derive(Debug, Clone)]
pub enum CounterPlan {
    /// Replace `n` by each of these values, producing one rule per value.
    Values(Vec<ExprId>),
    /// Too many strict upper bounds (or none at all beyond positivity); keep
    /// `n` symbolic in the accelerated rule.
    Symbolic,
}

/// Every candidate upper bound on `n` derivable from `guard`'s atoms, plus
/// whether an exact equality bound was found among them.
fn counter_upper_bounds(cx: &mut Context, guard: &Guard, n: Variable) -> (Vec<ExprId>, bool) {
    let mut uppers = Vec::new();
    let mut has_equality = false;
    for atom in &guard.atoms {
        let diff = cx.exprs.sub(atom.lhs, atom.rhs);
        if cx.exprs.degree_in(diff, n) != 1 {
            continue;
        }
        let Some(coeff) = cx.exprs.as_constant(cx.exprs.coeff_at_degree(diff, n, 1)) else { continue };
        let Ok(t) = crate::guard::solve_for_var(cx, diff, n, CoeffPolicy::AnyRational) else { continue };
        let positive = coeff > Coeff::zero();
        match atom.rel {
            Rel::Eq => {
                uppers.push(t);
                has_equality = true;
            }
            Rel::Le | Rel::Lt if positive => uppers.push(t),
            Rel::Ge | Rel::Gt if !positive => uppers.push(t),
            _ => {}
        }
    }
    (uppers, has_equality)
}

/// Decide how to instantiate `n` in an accelerated guard (`spec.md` §4.6:
/// "an equality bound is preferred... too many strict bounds... kept
/// symbolic"). `max_bounds` is the configured cap on how many separate
/// instantiated rules a symbolic counter may fan out into.
pub fn instantiate_counter(cx: &mut Context, guard: &Guard, n: Variable, max_bounds: usize) -> CounterPlan {
    let (uppers, has_equality) = counter_upper_bounds(cx, guard, n);
    if uppers.is_empty() {
        return CounterPlan::Symbolic;
    }
    if has_equality {
        return CounterPlan::Values(vec![uppers[0]]);
    }
    if uppers.len() > max_bounds {
        return CounterPlan::Symbolic;
    }
    CounterPlan::Values(uppers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::its::{Location, Provenance};
    use crate::recurrence::StandardRecurrenceOracle;
    use crate::smt::LinearArithmeticOracle;
    use num_bigint::BigInt;

    fn increment_rule(cx: &mut Context) -> Rule {
        let x = cx.program_var("x");
        let n = cx.program_var("N");
        let xe = cx.exprs.var(x);
        let ne = cx.exprs.var(n);
        let guard = Guard { atoms: vec![Atom { lhs: xe, rel: Rel::Lt, rhs: ne }] };
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

    fn doubling_rule(cx: &mut Context) -> Rule {
        let x = cx.program_var("x");
        let n = cx.program_var("N");
        let xe = cx.exprs.var(x);
        let ne = cx.exprs.var(n);
        let zero = cx.exprs.zero();
        let guard = Guard {
            atoms: vec![Atom { lhs: xe, rel: Rel::Lt, rhs: ne }, Atom { lhs: xe, rel: Rel::Ge, rhs: zero }],
        };
        let two = cx.exprs.constant(Coeff::from_integer(BigInt::from(2)));
        let x2 = cx.exprs.mul(xe, two);
        let mut update = Update::new();
        update.insert(x, x2);
        Rule {
            source: Location(0),
            guard,
            cost: cx.exprs.one(),
            branches: vec![Branch { target: Location(0), update }],
            provenance: Provenance::Source,
        }
    }

    #[test]
    fn increment_loop_is_backward_monotone() {
        let mut cx = Context::new();
        let rule = increment_rule(&mut cx);
        let mut smt = LinearArithmeticOracle::new();
        let mut rec = StandardRecurrenceOracle::new();
        let outcome = accelerate(&mut cx, &mut smt, &mut rec, &rule, Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, BackwardOutcome::Success { .. }));
    }

    #[test]
    fn doubling_loop_is_monotone_but_not_closeable_to_a_polynomial() {
        // `x'=2x` passes the inverse/monotonicity check (inverse `x'=x/2`,
        // guard `x<N /\ x>=0` is preserved one iteration earlier) but this
        // crate's recurrence oracle only closes C-finite shapes onto the
        // canonical polynomial representation, and `x_0*2^N` isn't one — so
        // acceleration soft-fails to `NotApplicable` rather than claiming a
        // (wrong) polynomial update, leaving this loop to the Farkas/metering
        // route instead.
        let mut cx = Context::new();
        let rule = doubling_rule(&mut cx);
        let mut smt = LinearArithmeticOracle::new();
        let mut rec = StandardRecurrenceOracle::new();
        let outcome = accelerate(&mut cx, &mut smt, &mut rec, &rule, Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, BackwardOutcome::NotApplicable));
    }

    #[test]
    fn non_self_loop_rule_is_not_applicable() {
        let mut cx = Context::new();
        let mut rule = increment_rule(&mut cx);
        rule.branches[0].target = Location(1);
        let mut smt = LinearArithmeticOracle::new();
        let mut rec = StandardRecurrenceOracle::new();
        let outcome = accelerate(&mut cx, &mut smt, &mut rec, &rule, Duration::from_secs(1)).unwrap();
        assert!(matches!(outcome, BackwardOutcome::NotApplicable));
    }

    #[test]
    fn equality_bound_preferred_for_counter_instantiation() {
        let mut cx = Context::new();
        let n = cx.fresh_temp("N");
        let ne = cx.exprs.var(n);
        let five = cx.exprs.constant(Coeff::from_integer(BigInt::from(5)));
        let guard = Guard { atoms: vec![Atom { lhs: ne, rel: Rel::Eq, rhs: five }] };
        let plan = instantiate_counter(&mut cx, &guard, n, 10);
        assert!(matches!(plan, CounterPlan::Values(v) if v.len() == 1));
    }

    #[test]
    fn too_many_strict_bounds_falls_back_to_symbolic() {
        let mut cx = Context::new();
        let n = cx.fresh_temp("N");
        let ne = cx.exprs.var(n);
        let a = cx.exprs.constant(Coeff::from_integer(BigInt::from(1)));
        let b = cx.exprs.constant(Coeff::from_integer(BigInt::from(2)));
        let guard = Guard {
            atoms: vec![Atom { lhs: ne, rel: Rel::Lt, rhs: a }, Atom { lhs: ne, rel: Rel::Lt, rhs: b }],
        };
        let plan = instantiate_counter(&mut cx, &guard, n, 1);
        assert!(matches!(plan, CounterPlan::Symbolic));
    }
}
