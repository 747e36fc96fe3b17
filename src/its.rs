//! The ITS data model: locations, updates, rules, and the rule graph.
//!
//! Mirrors `spec.md` §3 exactly: a [`Rule`] pairs a source [`Location`] and
//! [`Guard`] with a cost and one or more [`Branch`]es (nondeterministic
//! simultaneous branching — the cost is paid once, every branch's update is
//! applied to a copy of the pre-state). An [`Its`] owns every [`Rule`] ever
//! created, indexed by a stable [`RuleId`] — rules are never physically
//! removed from the backing store (mirrors the teacher's arena-style
//! `Vec`-of-everything discipline in `domain.rs`/`air.rs`); "removal" tombs
//! the slot to `None` so [`RuleId`]s referenced by older [`Provenance`]
//! chains remain dereferenceable for the proof sketch.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::expr::ExprId;
use crate::guard::Guard;
use crate::var::{Context, Variable};

/// Opaque location identifier (`spec.md` §3: "Locations are opaque
/// identifiers").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Location(pub u32);

/// Stable identifier of a rule within one [`Its`]; stays valid even after the
/// rule it names is removed (tombstoned), since [`Provenance`] chains must
/// remain dereferenceable for the proof sketch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RuleId(pub u32);

/// A total function from a finite subset of program variables to
/// expressions; unmentioned variables are the identity (`spec.md` §3).
/// Right-hand sides always refer to the pre-state — this is enforced by
/// construction (every op that *applies* an `Update` substitutes
/// simultaneously via [`crate::expr::Arena::substitute`], never
/// sequentially).
pub type Update = BTreeMap<Variable, ExprId>;

/// One nondeterministic branch of a (possibly branching) rule.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Branch {
    pub target: Location,
    pub update: Update,
}

/// Records which original rule(s) a derived rule's transformation replays,
/// satisfying invariant 4 of `spec.md` §3 ("every rule added during
/// acceleration is labelled with the original rules whose composition it
/// represents").
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Provenance {
    /// A rule as given by the input (parser / `formats` stand-in).
    Source,
    /// Produced by the transformation named in `via`, composed from `from`.
    Derived { via: String, from: Vec<RuleId> },
}

/// A guarded, costed transition: `spec.md` §3.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rule {
    pub source: Location,
    pub guard: Guard,
    /// A polynomial expression, or the arena's nonterm sentinel.
    pub cost: ExprId,
    pub branches: Vec<Branch>,
    pub provenance: Provenance,
}

#[derive(Debug, Error)]
pub enum ItsError {
    #[error("rule has no branches")]
    NoBranches,
    #[error("variable {0} in update/cost is neither a program variable nor guard-bound")]
    UnboundVar(Variable),
    #[error("rule {0:?} not found")]
    NoSuchRule(RuleId),
}

impl Rule {
    /// A rule is *linear* iff it has exactly one right-hand side (`spec.md`
    /// §3); otherwise it is *branching*.
    pub fn is_linear(&self) -> bool {
        self.branches.len() == 1
    }

    pub fn is_branching(&self) -> bool {
        self.branches.len() > 1
    }

    /// A *self-loop*: a linear rule whose single branch targets its own
    /// source location (`spec.md` glossary).
    pub fn is_self_loop(&self) -> bool {
        self.is_linear() && self.branches[0].target == self.source
    }

    pub fn targets(&self) -> impl Iterator<Item = Location> + '_ {
        self.branches.iter().map(|b| b.target)
    }

    /// Invariant 2 of `spec.md` §3: every variable occurring in an update's
    /// right-hand side or in the cost is either a program variable or
    /// occurs in the guard.
    pub fn check_context_bound(&self, cx: &Context) -> Result<(), ItsError> {
        if self.branches.is_empty() {
            return Err(ItsError::NoBranches);
        }
        let guard_vars = self.guard.free_vars(cx);
        let mut check = |id: ExprId| -> Result<(), ItsError> {
            for v in cx.exprs.free_vars(id) {
                if !cx.is_program(v) && !guard_vars.contains(&v) {
                    return Err(ItsError::UnboundVar(v));
                }
            }
            Ok(())
        };
        check(self.cost)?;
        for b in &self.branches {
            for rhs in b.update.values() {
                check(*rhs)?;
            }
        }
        Ok(())
    }

    /// Invariant 5: a rule whose cost is the nonterm sentinel carries an
    /// empty update on its accelerated form (only the guard survives).
    pub fn respects_nonterm_invariant(&self, cx: &Context) -> bool {
        if !cx.exprs.is_nonterm(self.cost) {
            return true;
        }
        self.branches.iter().all(|b| b.update.is_empty())
    }
}

/// The transition-system graph: locations, the distinguished initial
/// location, and every rule ever created (tombstoned slots are kept so
/// provenance stays resolvable).
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Its {
    next_location: u32,
    pub initial: Location,
    rules: Vec<Option<Rule>>,
}

impl Its {
    pub fn new(initial: Location) -> Self {
        Self { next_location: initial.0 + 1, initial, rules: Vec::new() }
    }

    pub fn fresh_location(&mut self) -> Location {
        let id = Location(self.next_location);
        self.next_location += 1;
        id
    }

    pub fn add_rule(&mut self, rule: Rule) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(Some(rule));
        id
    }

    pub fn get(&self, id: RuleId) -> Option<&Rule> {
        self.rules.get(id.0 as usize).and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, id: RuleId) -> Option<&mut Rule> {
        self.rules.get_mut(id.0 as usize).and_then(|o| o.as_mut())
    }

    /// Tombstones a rule (subsumed/unreachable/eliminated-location removal,
    /// `spec.md` §3 "Lifecycle"). Idempotent.
    pub fn remove(&mut self, id: RuleId) {
        if let Some(slot) = self.rules.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn live_rules(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.rules
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (RuleId(i as u32), r)))
    }

    pub fn rules_from(&self, loc: Location) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.live_rules().filter(move |(_, r)| r.source == loc)
    }

    pub fn rules_into(&self, loc: Location) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.live_rules().filter(move |(_, r)| r.targets().any(|t| t == loc))
    }

    pub fn locations(&self) -> std::collections::BTreeSet<Location> {
        let mut out = std::collections::BTreeSet::new();
        out.insert(self.initial);
        for (_, r) in self.live_rules() {
            out.insert(r.source);
            out.extend(r.targets());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.live_rules().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Location {
    fn default() -> Self {
        Location(0)
    }
}
