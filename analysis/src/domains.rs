use core::fmt::Debug;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use itertools::Itertools;

use crate::cfg::{BlockIdOf, ControlFlowGraph, OpPos, OperationOf};

/////////////////////////
// Traits for domains. //
/////////////////////////

/// The lattice part of an abstract domain. Unlike a textbook lattice, the
/// states here do not need to be comparable for equality, only the partial
/// order given by [`AbstractState::leq`] is used to detect stabilization.
///
/// Requirements:
/// * Reflexive: a.leq(a)
/// * Upper bound: a.leq(a.lub(b)) and b.leq(a.lub(b))
/// * Idempotent join: a.lub(a) is equivalent to a in both directions of leq
/// * Finite height, or a join that saturates at some ceiling, so that
///   repeated joins at loop heads stabilize.
pub trait AbstractState: Clone + Debug {
    /// The current state refines (is covered by) `other`.
    fn leq(&self, other: &Self) -> bool;

    /// Least upper bound. Never mutates its operands.
    fn lub(&self, other: &Self) -> Self;
}

/// An abstract domain that can be driven by the fixpoint engine over the
/// operations of a control flow graph.
pub trait AbstractDomain<Cfg: ControlFlowGraph>: AbstractState {
    /// Side information threaded through a whole run: sinks for facts the
    /// domain reports while executing, results of earlier analyses, etc.
    type Context<'ctx>;

    /// The state after executing `op` at `pos`. A total function: anomalies
    /// are handled inside the domain and never escape as errors.
    fn process_instruction(
        &self,
        op: &OperationOf<Cfg>,
        pos: OpPos<BlockIdOf<Cfg>>,
        ctx: &mut Self::Context<'_>,
    ) -> Self;
}

/////////////////////////////////////
// Concrete domain implementations //
/////////////////////////////////////

/// The unit lattice is useful for testing, or as a placeholder when only the
/// reachability computed by the engine is interesting.
impl AbstractState for () {
    fn leq(&self, &(): &Self) -> bool {
        true
    }

    fn lub(&self, &(): &Self) -> Self {}
}

/// Bool is a lattice, where false is bottom and true is top,
/// join is or.
impl AbstractState for bool {
    fn leq(&self, other: &Self) -> bool {
        !*self || *other
    }

    fn lub(&self, other: &Self) -> Self {
        *self || *other
    }
}

/// In the power set lattice, the empty set is bottom, union is join and
/// inclusion is the ordering. Ordered sets keep the debug output and the
/// iteration order deterministic.
#[derive(PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
pub struct PowerSet<T: Ord>(pub BTreeSet<T>);

impl<T: Ord> Default for PowerSet<T> {
    fn default() -> Self {
        Self(BTreeSet::new())
    }
}

impl<T: Ord> Deref for PowerSet<T> {
    type Target = BTreeSet<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Ord> DerefMut for PowerSet<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: Ord> FromIterator<T> for PowerSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: Ord + Debug> Debug for PowerSet<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{{{}}}", self.iter().map(|x| format!("{x:?}")).join(", "))
    }
}

impl<T: Ord + Debug + Clone> AbstractState for PowerSet<T> {
    fn leq(&self, other: &Self) -> bool {
        self.is_subset(other)
    }

    fn lub(&self, other: &Self) -> Self {
        Self(self.union(other).cloned().collect())
    }
}
