//! Crate root: public surface and module map for the loop acceleration and
//! chaining engine.
//!
//! This module is the single canonical entry point for downstream users. It
//! re-exports the handful of types a caller needs to run an analysis
//! (`Context`, `Its`, `Config`, `Report`, `run`) without reaching into the
//! individual submodules, and centralizes the top-level error type that
//! aggregates the module-local ones.
//!
//! ## Invariants
//!
//! - **No unsafe.** The engine is pure symbolic manipulation over an
//!   expression arena; there is no reason to reach for `unsafe` anywhere in
//!   it.
//! - **Single-threaded.** `Context` (variable registry + expression arena)
//!   and `Its` (the rule graph) are owned, passed by `&mut` through the
//!   driver; nothing here is `Sync`-dependent or spawns its own threads.
//! - **Soundness over precision.** Every transformation that cannot be
//!   justified (an oracle timeout, an unclosable recurrence, a nonlinear
//!   guard) is a skip, never a silent "assume the best case".
//!
//! These invariants are enforced by design across the submodules; a local
//! failure always degrades to "this transformation did not apply" rather
//! than to undefined behavior.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use thiserror::Error;

/// Variables and the process-wide (per-`Context`) fresh-name registry.
pub mod var;
/// Hash-consed arithmetic expression arena.
pub mod expr;
/// Guards: conjunctions of relational atoms over expressions.
pub mod guard;
/// The ITS data model: locations, rules, branches, the rule graph.
pub mod its;
/// The SMT oracle facade (`check`/`model`/`implies`) and a linear-arithmetic
/// reference implementation.
pub mod smt;
/// The recurrence oracle: closing C-finite/hypergeometric update recurrences
/// in a symbolic counter.
pub mod recurrence;
/// Monomial-abstracting linearisation of nonlinear rules.
pub mod linearize;
/// The Farkas-lemma metering-function synthesiser.
pub mod farkas;
/// Backward acceleration via inverse-update monotonicity.
pub mod backward;
/// Rule chaining: linear/branching composition and the special shapes the
/// driver uses (path contraction, location elimination, branch chaining).
pub mod chain;
/// Graph simplification and pruning.
pub mod simplify;
/// Verdicts and proof sketches: the engine's output contract.
pub mod proof;
/// Engine configuration (`spec.md` §6).
pub mod config;
/// The acceleration driver: orchestrates every component above per
/// self-loop, to fixpoint, and produces the final report.
pub mod driver;
/// A structured JSON stand-in for "Format B", plus the `ItsSource` trait
/// boundary a real parser would implement (Format A/B text parsing is
/// explicitly out of scope for this crate).
pub mod formats;

// ============================================================================
// Canonical re-exports (centralization)
// ============================================================================

pub use crate::config::{Config, NonTermMode, PolyStrategy};
pub use crate::its::{Its, Location, Rule, RuleId};
pub use crate::proof::{ProofSketch, ProofStep, Report, Verdict};
pub use crate::var::Context;

/// Run the full acceleration-and-chaining pipeline on `its`, using `oracle`
/// for SMT queries and `rec` for recurrence closing (`spec.md` §2 "data
/// flow"). Convenience re-export of [`driver::run`] so the common case needs
/// only `loopaccel::run(...)`.
pub fn run(
    its: &mut Its,
    cx: &mut Context,
    oracle: &mut dyn smt::SmtOracle,
    rec: &mut dyn recurrence::RecurrenceOracle,
    cfg: &Config,
) -> Report {
    driver::run(its, cx, oracle, rec, cfg)
}

/// Aggregates every module-local error kind behind one type for glue code
/// that needs a single `Result` alias (the example binary, `ItsSource`
/// callers) — mirrors how the individual `thiserror` enums (`LoadError`,
/// `SmtError`, `ChainError`, ...) stay local to their modules and are only
/// unified here, at the boundary, rather than threaded as a shared type
/// through every internal signature.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] crate::formats::LoadError),
    #[error(transparent)]
    Smt(#[from] crate::smt::SmtError),
}
