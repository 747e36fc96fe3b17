//! Verdicts and proof sketches (`spec.md` §6 "Output"): the driver's final
//! answer plus a textual, human-readable (not machine-checked) trace of the
//! transformations that produced it.

use num_rational::BigRational;
use serde::{Deserialize, Serialize};

use crate::expr::ExprId;
use crate::guard::Guard;
use crate::its::RuleId;

/// The runtime-complexity verdict (`spec.md` §6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    Constant,
    /// Rational polynomial degree `d` (a metering function over a product of
    /// `d` nested loops yields degree `d`, not necessarily an integer once
    /// nesting composes fractional contributions).
    Poly(BigRational),
    Exp,
    NestedExp,
    /// No acceleration/chaining improved the initial bound and none of the
    /// finite verdicts above could be justified either (`spec.md` §7: the one
    /// other case besides `ParseFail` that surfaces to the user).
    Unbounded,
    /// A nontermination witness was found (`spec.md` §6.2 `NonTermMode`, and
    /// the `x'=x [x=x]` scenario of `spec.md` §8 scenario 6).
    Nonterm,
    Unknown,
}

/// One transformation recorded in the proof sketch (`spec.md` §6: "a proof
/// sketch lists the transformations applied").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProofStep {
    Simplified { removed: usize },
    BackwardAccelerated { original: RuleId, accelerated: RuleId, counter: String },
    MeteringSynthesized { original: RuleId, accelerated: RuleId, metering: String },
    ConflictVarSplit { original: RuleId, a: String, b: String },
    GuardStrengthened { rule: RuleId },
    TempVarInstantiated { rule: RuleId, variable: String, bound: String },
    Nested { inner: RuleId, outer: RuleId, composed: RuleId },
    ChainedLinear { first: RuleId, second: RuleId, composed: RuleId },
    ChainedBranching { first: RuleId, location: String, composed: RuleId },
    LocationEliminated { location: String, produced: usize },
    PrunedParallel { location_pair: String, kept: usize, dropped: usize },
    AccelerationFailed { rule: RuleId, reason: String },
}

/// The accumulated, ordered trace plus the final verdict and its witness.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProofSketch {
    pub steps: Vec<ProofStep>,
}

impl ProofSketch {
    pub fn push(&mut self, step: ProofStep) {
        self.steps.push(step);
    }

    /// Render as a flat, human-readable listing (`spec.md` §6: "textual and
    /// human-readable, not machine-checkable").
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{i}. {step:?}\n"));
        }
        out
    }
}

/// The final answer: a verdict together with the witnessing rule's guard and
/// cost, and the proof sketch that derived it (`spec.md` §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    pub verdict: Verdict,
    pub witness_guard: Option<Guard>,
    #[serde(skip)]
    pub witness_cost: Option<ExprId>,
    pub sketch: ProofSketch,
}
