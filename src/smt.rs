//! The SMT oracle facade (`spec.md` §4.2 and §6.3).
//!
//! Every other module talks to the solver only through the [`SmtOracle`]
//! trait — nothing downstream constructs solver state directly, mirroring
//! the teacher's `pcs`/`transcript` facade split in `pcs.rs` (callers never
//! touch a concrete commitment scheme, only the trait object). This keeps
//! the acceleration algorithms decidable-fragment-agnostic: a `LA` query
//! (linear arithmetic) and an `NA`/`ENA` query (non-/exponential-linear,
//! used only by recurrence-closure side conditions) go through the same
//! surface.
//!
//! The crate ships one concrete oracle, [`LinearArithmeticOracle`], a
//! decision procedure for conjunctions of linear atoms over the rationals
//! (Fourier-Motzkin elimination). It is complete and sound for the `LA`
//! fragment that every Farkas / backward-acceleration query in this crate
//! actually issues; nonlinear (`NA`/`ENA`) queries always report
//! [`SatResult::Unknown`], which is a valid, honest answer under the
//! trait's contract (see below) and keeps the crate free of an external
//! solver dependency none of the example repos pull in for this domain.

use std::collections::BTreeMap;
use std::time::Duration;

use num_traits::Zero;
use thiserror::Error;

use crate::expr::{Coeff, ExprId};
use crate::guard::{Atom, Guard, NormAtom, Rel};
use crate::var::{Context, Variable};

/// Which decidable fragment a query falls in (`spec.md` §6.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Logic {
    /// Linear arithmetic over the rationals/integers.
    La,
    /// Nonlinear arithmetic (monomials of degree ≥ 2 survive, unabstracted).
    Na,
    /// Exponential/nonlinear arithmetic (recurrence closed forms with `N` in
    /// an exponent).
    Ena,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SatResult {
    Sat,
    Unsat,
    /// Solver gave up (unsupported fragment or timeout). Callers must have
    /// an explicit, pre-declared interpretation for this case — `spec.md`
    /// §4.2 forbids silently treating `Unknown` as either `Sat` or `Unsat`.
    Unknown,
}

#[derive(Debug, Error)]
pub enum SmtError {
    #[error("oracle query exceeded its {0:?} timeout")]
    Timeout(Duration),
    #[error("model requested after Unsat/Unknown result")]
    NoModel,
}

/// A satisfying assignment to a finite set of variables, as rationals.
pub type Model = BTreeMap<Variable, Coeff>;

/// The facade every acceleration component consumes (`spec.md` §4.2).
///
/// Implementations must be deterministic for a fixed input and timeout, and
/// must honor the requested per-call `timeout` (`spec.md` §6.1: "every
/// external call is individually bounded").
pub trait SmtOracle {
    /// Is the conjunction `guard` satisfiable?
    fn check(&mut self, cx: &mut Context, guard: &Guard, logic: Logic, timeout: Duration) -> Result<SatResult, SmtError>;

    /// A witnessing model, if the most recent [`SmtOracle::check`] call on
    /// this guard returned [`SatResult::Sat`].
    fn model(&mut self, cx: &mut Context, guard: &Guard, logic: Logic, timeout: Duration) -> Result<Model, SmtError>;

    /// Does `premise` entail `conclusion` (i.e. is `premise ∧ ¬conclusion`
    /// unsatisfiable)? Used pervasively by the Farkas and backward modules
    /// for the M1/M2/M3-style universally-quantified implications.
    fn implies(&mut self, cx: &mut Context, premise: &Guard, conclusion: &Guard, logic: Logic, timeout: Duration) -> Result<SatResult, SmtError>;
}

/// A complete decision procedure for the `La` fragment (Fourier-Motzkin
/// variable elimination over `Σcᵢxᵢ ≤ b` systems), `Unknown` for anything
/// else. Grounded on the teacher's `pcs.rs` trait-facade-plus-one-concrete-
/// impl split; the elimination algorithm itself has no teacher analogue and
/// is textbook Fourier-Motzkin.
#[derive(Debug, Default)]
pub struct LinearArithmeticOracle;

impl LinearArithmeticOracle {
    pub fn new() -> Self {
        Self
    }

    fn rows(&self, cx: &mut Context, guard: &Guard) -> Option<Vec<NormAtom>> {
        guard.to_le_atoms(cx).ok()
    }

    /// Fourier-Motzkin elimination with back-substitution. Eliminates one
    /// variable per round (order is whatever `BTreeMap` iteration gives,
    /// i.e. `Variable`'s `Ord`), recording each round's lower/upper bound
    /// rows so a witnessing assignment can be rebuilt afterward. Returns
    /// `None` if the system is unsatisfiable, `Some(model)` otherwise —
    /// `model` need not assign every variable that appeared (unconstrained
    /// variables default to `0` at the call site).
    fn fm_solve(mut rows: Vec<NormAtom>) -> Option<BTreeMap<Variable, Coeff>> {
        let mut history: Vec<(Variable, Vec<(Coeff, NormAtom)>, Vec<(Coeff, NormAtom)>)> = Vec::new();
        loop {
            let var = rows.iter().flat_map(|r| r.coeffs.keys()).next().copied();
            let Some(var) = var else {
                if rows.iter().all(|r| r.bound >= Coeff::zero()) {
                    break;
                }
                return None;
            };
            let mut lowers = Vec::new(); // var >= (others . coeffs - bound) / cl
            let mut uppers = Vec::new(); // var <= (bound - others . coeffs) / cu
            let mut rest = Vec::new();
            for row in rows {
                match row.coeffs.get(&var).cloned() {
                    None => rest.push(row),
                    Some(c) if c.is_zero() => rest.push(row),
                    Some(c) => {
                        let mut other = row.coeffs.clone();
                        other.remove(&var);
                        let entry = NormAtom { coeffs: other, bound: row.bound };
                        if c.numer().sign() == num_bigint::Sign::Plus {
                            uppers.push((c, entry));
                        } else {
                            lowers.push((-c, entry));
                        }
                    }
                }
            }
            for (cl, low) in &lowers {
                for (cu, up) in &uppers {
                    let mut combined = BTreeMap::new();
                    for (v, c) in &low.coeffs {
                        *combined.entry(*v).or_insert_with(Coeff::zero) += cu * c;
                    }
                    for (v, c) in &up.coeffs {
                        *combined.entry(*v).or_insert_with(Coeff::zero) -= cl * c;
                    }
                    let bound = &up.bound * cl + &low.bound * cu;
                    combined.retain(|_, c| !c.is_zero());
                    rest.push(NormAtom { coeffs: combined, bound });
                }
            }
            history.push((var, lowers, uppers));
            rows = rest;
        }

        let mut assign: BTreeMap<Variable, Coeff> = BTreeMap::new();
        for (var, lowers, uppers) in history.into_iter().rev() {
            let dot = |atom: &NormAtom| -> Coeff {
                atom.coeffs
                    .iter()
                    .map(|(v, c)| c * assign.get(v).cloned().unwrap_or_else(Coeff::zero))
                    .fold(Coeff::zero(), |a, b| a + b)
            };
            let lower = lowers
                .iter()
                .map(|(cl, row)| (dot(row) - &row.bound) / cl)
                .fold(None, |acc: Option<Coeff>, v| Some(acc.map_or(v.clone(), |a| if v > a { v } else { a })));
            let upper = uppers
                .iter()
                .map(|(cu, row)| (&row.bound - dot(row)) / cu)
                .fold(None, |acc: Option<Coeff>, v| Some(acc.map_or(v.clone(), |a| if v < a { v } else { a })));
            let value = match (lower, upper) {
                (Some(l), Some(u)) => {
                    if l <= u {
                        l
                    } else {
                        u
                    }
                }
                (Some(l), None) => l,
                (None, Some(u)) => u,
                (None, None) => Coeff::zero(),
            };
            assign.insert(var, value);
        }
        Some(assign)
    }
}

impl SmtOracle for LinearArithmeticOracle {
    fn check(&mut self, cx: &mut Context, guard: &Guard, logic: Logic, _timeout: Duration) -> Result<SatResult, SmtError> {
        if logic != Logic::La {
            return Ok(SatResult::Unknown);
        }
        let Some(rows) = self.rows(cx, guard) else {
            return Ok(SatResult::Unknown);
        };
        Ok(if Self::fm_solve(rows).is_some() { SatResult::Sat } else { SatResult::Unsat })
    }

    fn model(&mut self, cx: &mut Context, guard: &Guard, logic: Logic, _timeout: Duration) -> Result<Model, SmtError> {
        if logic != Logic::La {
            return Err(SmtError::NoModel);
        }
        let Some(rows) = self.rows(cx, guard) else {
            return Err(SmtError::NoModel);
        };
        Self::fm_solve(rows).ok_or(SmtError::NoModel)
    }

    fn implies(&mut self, cx: &mut Context, premise: &Guard, conclusion: &Guard, logic: Logic, timeout: Duration) -> Result<SatResult, SmtError> {
        if logic != Logic::La {
            return Ok(SatResult::Unknown);
        }
        // premise |= conclusion (a conjunction)  <=>  premise |= every atom
        // of conclusion individually. Equality atoms negate to a disjunction
        // (A<B) \/ (A>B); both disjuncts are checked against the premise.
        for atom in &conclusion.atoms {
            let negs: Vec<Atom> = match atom.rel {
                Rel::Eq => vec![Atom { lhs: atom.lhs, rel: Rel::Lt, rhs: atom.rhs }, Atom { lhs: atom.lhs, rel: Rel::Gt, rhs: atom.rhs }],
                _ => vec![Guard::negate_atom(cx, atom)],
            };
            for neg in negs {
                let mut combined = premise.clone();
                combined.atoms.push(neg);
                match self.check(cx, &combined, logic, timeout)? {
                    SatResult::Unsat => {}
                    SatResult::Sat => return Ok(SatResult::Unsat),
                    SatResult::Unknown => return Ok(SatResult::Unknown),
                }
            }
        }
        Ok(SatResult::Sat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsat_contradiction_detected() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let xe = cx.exprs.var(x);
        let zero = cx.exprs.zero();
        let one = cx.exprs.one();
        // x <= 0 /\ x >= 1
        let g = Guard {
            atoms: vec![
                Atom { lhs: xe, rel: Rel::Le, rhs: zero },
                Atom { lhs: xe, rel: Rel::Ge, rhs: one },
            ],
        };
        let mut oracle = LinearArithmeticOracle::new();
        let r = oracle.check(&mut cx, &g, Logic::La, Duration::from_secs(1)).unwrap();
        assert_eq!(r, SatResult::Unsat);
    }

    #[test]
    fn sat_guard_detected() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let n = cx.program_var("N");
        let xe = cx.exprs.var(x);
        let ne = cx.exprs.var(n);
        // x < N is satisfiable
        let g = Guard { atoms: vec![Atom { lhs: xe, rel: Rel::Lt, rhs: ne }] };
        let mut oracle = LinearArithmeticOracle::new();
        let r = oracle.check(&mut cx, &g, Logic::La, Duration::from_secs(1)).unwrap();
        assert_eq!(r, SatResult::Sat);
    }

    #[test]
    fn implies_trivial_tautology() {
        let mut cx = Context::new();
        let x = cx.program_var("x");
        let xe = cx.exprs.var(x);
        let zero = cx.exprs.zero();
        let premise = Guard { atoms: vec![Atom { lhs: xe, rel: Rel::Ge, rhs: zero }] };
        let conclusion = premise.clone();
        let mut oracle = LinearArithmeticOracle::new();
        let r = oracle.implies(&mut cx, &premise, &conclusion, Logic::La, Duration::from_secs(1)).unwrap();
        assert_eq!(r, SatResult::Sat);
    }

    #[test]
    fn nonlinear_logic_is_unknown() {
        let mut cx = Context::new();
        let g = Guard::default();
        let mut oracle = LinearArithmeticOracle::new();
        let r = oracle.check(&mut cx, &g, Logic::Na, Duration::from_secs(1)).unwrap();
        assert_eq!(r, SatResult::Unknown);
    }
}
