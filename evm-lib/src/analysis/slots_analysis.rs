use core::fmt::{Debug, Display};
use std::collections::{BTreeMap, BTreeSet};

use analysis::domains::{AbstractDomain, AbstractState};
use itertools::Itertools;
use log::warn;

use crate::accesses::AccessSet;
use crate::ir::{Cfg, Instruction, ProgramPoint};
use crate::opcodes::Opcode;

use super::{AnalysisContext, FREE_MEMORY_POINTER};

/// An abstract memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u32);

impl Display for SlotId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

pub struct SlotsContext<'ctx> {
    pub analysis: &'ctx mut AnalysisContext,
    pub accesses: &'ctx mut AccessSet,
}

/// Tracks which allocations are open. Reading the free memory pointer opens
/// an allocation, updating it (or leaving the call frame) closes every open
/// one.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SlotsState {
    opened: BTreeSet<ProgramPoint>,
    closing_pairs: BTreeMap<ProgramPoint, BTreeSet<ProgramPoint>>,
    pc_slot: BTreeMap<ProgramPoint, BTreeSet<SlotId>>,
}

fn map_leq<K: Ord, V: Ord>(lhs: &BTreeMap<K, BTreeSet<V>>, rhs: &BTreeMap<K, BTreeSet<V>>) -> bool {
    lhs.iter()
        .all(|(key, values)| rhs.get(key).is_some_and(|other| values.is_subset(other)))
}

fn map_lub<K: Ord + Clone, V: Ord + Clone>(
    lhs: &BTreeMap<K, BTreeSet<V>>,
    rhs: &BTreeMap<K, BTreeSet<V>>,
) -> BTreeMap<K, BTreeSet<V>> {
    let mut result = lhs.clone();
    for (key, values) in rhs {
        result
            .entry(key.clone())
            .or_default()
            .extend(values.iter().cloned());
    }
    result
}

impl SlotsState {
    /// The allocations opened at `pos`.
    pub fn get_slot(&self, pos: ProgramPoint) -> Option<&BTreeSet<SlotId>> {
        self.pc_slot.get(&pos)
    }

    pub fn opened(&self) -> &BTreeSet<ProgramPoint> {
        &self.opened
    }

    /// For each closing program point, the opening points it closed.
    pub fn closing_pairs(&self) -> &BTreeMap<ProgramPoint, BTreeSet<ProgramPoint>> {
        &self.closing_pairs
    }

    fn closes_allocations(op: &Instruction) -> bool {
        match op.opcode() {
            Opcode::MStore => op.annotated_address() == Some(FREE_MEMORY_POINTER),
            Opcode::Return | Opcode::Revert | Opcode::Stop | Opcode::SelfDestruct => true,
            _ => false,
        }
    }
}

impl Debug for SlotsState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "opened {{{}}} :: closing_pairs {{{}}} :: pc_slot {{{}}}",
            self.opened.iter().join(", "),
            self.closing_pairs
                .iter()
                .map(|(k, v)| format!("{k}: {{{}}}", v.iter().join(", ")))
                .join(", "),
            self.pc_slot
                .iter()
                .map(|(k, v)| format!("{k}: {{{}}}", v.iter().join(", ")))
                .join(", ")
        )
    }
}

impl AbstractState for SlotsState {
    fn leq(&self, other: &Self) -> bool {
        self.opened.is_subset(&other.opened)
            && map_leq(&self.pc_slot, &other.pc_slot)
            && map_leq(&self.closing_pairs, &other.closing_pairs)
    }

    fn lub(&self, other: &Self) -> Self {
        Self {
            opened: self.opened.union(&other.opened).copied().collect(),
            closing_pairs: map_lub(&self.closing_pairs, &other.closing_pairs),
            pc_slot: map_lub(&self.pc_slot, &other.pc_slot),
        }
    }
}

impl AbstractDomain<Cfg> for SlotsState {
    type Context<'ctx> = SlotsContext<'ctx>;

    fn process_instruction(
        &self,
        op: &Instruction,
        pos: ProgramPoint,
        ctx: &mut Self::Context<'_>,
    ) -> Self {
        let mut result = self.clone();

        if op.opcode() == Opcode::MLoad && op.annotated_address() == Some(FREE_MEMORY_POINTER) {
            // Reading the pointer again before it is bumped refers to the
            // same allocation.
            let slots: BTreeSet<SlotId> = if self.opened.is_empty() {
                BTreeSet::from([ctx.analysis.fresh_slot(pos)])
            } else {
                self.opened
                    .iter()
                    .filter_map(|opened| self.pc_slot.get(opened))
                    .flatten()
                    .copied()
                    .collect()
            };
            for slot in &slots {
                ctx.accesses.add_allocation_init(pos, *slot);
            }
            result.pc_slot.insert(pos, slots);
            result.opened.insert(pos);
        } else if Self::closes_allocations(op) {
            if self.opened.len() > 1 && op.opcode() != Opcode::Return {
                warn!(
                    "More than one slot closed at {pos}: {{{}}}",
                    self.opened.iter().join(", ")
                );
            }
            for slot in self
                .opened
                .iter()
                .filter_map(|opened| self.pc_slot.get(opened))
                .flatten()
            {
                ctx.accesses.add_allocation_close(pos, *slot);
            }
            result.closing_pairs.insert(pos, self.opened.clone());
            result.opened.clear();
        }

        result
    }
}
