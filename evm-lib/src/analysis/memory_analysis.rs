use core::fmt::Debug;
use std::collections::{BTreeMap, BTreeSet};

use analysis::domains::{AbstractDomain, AbstractState};
use analysis::solvers::Analysis;
use itertools::Itertools;
use log::{debug, warn};

use crate::accesses::{AccessSet, MemAccess, Region};
use crate::ir::{Cfg, Instruction, ProgramPoint};
use crate::opcodes::Opcode;

use super::FREE_MEMORY_POINTER;
use super::offset_analysis::{Offset, OffsetSet, OffsetState, OffsetTarget};
use super::slots_analysis::{SlotId, SlotsState};

pub type MemSet = BTreeSet<MemAccess>;

/// Results of the earlier runs, and the sink for the observed accesses.
pub struct MemoryContext<'ctx> {
    pub slots: &'ctx Analysis<'ctx, Cfg, SlotsState>,
    pub offsets: &'ctx Analysis<'ctx, Cfg, OffsetState>,
    pub accesses: &'ctx mut AccessSet,
}

impl MemoryContext<'_> {
    /// The constants the offset analysis computed right before `pos`.
    fn constants_before(&self, pos: ProgramPoint, stack_pos: Option<usize>) -> Option<&OffsetSet> {
        let state = self
            .offsets
            .state_before(pos)
            .inspect_err(|err| warn!("{pos}: no offset information: {err}"))
            .ok()?;
        state.get_offsets(stack_pos?)
    }

    /// Whether the operand at `stack_pos` is a plain number rather than a
    /// lost address.
    fn is_constant_before(&self, pos: ProgramPoint, stack_pos: Option<usize>) -> bool {
        self.constants_before(pos, stack_pos).is_some_and(|set| {
            !set.is_empty() && set.iter().all(|offset| matches!(offset, Offset::Const(_)))
        })
    }

    fn slots_at(&self, pos: ProgramPoint) -> Option<&BTreeSet<SlotId>> {
        self.slots
            .get_analysis_results(pos, 0)
            .inspect_err(|err| warn!("{pos}: no slot information: {err}"))
            .ok()?
            .get_slot(pos)
    }
}

/// Drops the entries of slots that also have a whole-slot entry.
fn clean_under_top(accesses: impl IntoIterator<Item = MemAccess>) -> MemSet {
    let accesses: MemSet = accesses.into_iter().collect();
    accesses
        .iter()
        .filter(|access| {
            access.offset == Offset::Top || !accesses.contains(&MemAccess::whole(access.slot))
        })
        .copied()
        .collect()
}

fn leq_slots(lhs: &MemSet, rhs: &MemSet) -> bool {
    lhs.iter().all(|l| rhs.iter().any(|r| l.leq(r)))
}

fn add_slots(slots: &MemSet, offsets: &OffsetSet) -> MemSet {
    let bound = OffsetTarget::Memory.bound();
    clean_under_top(
        slots
            .iter()
            .flat_map(|slot| offsets.iter().map(move |offset| slot.add(offset, bound))),
    )
}

/// Weak update of the abstract memory: every location the addresses may
/// denote gets the values added. A whole-slot address absorbs the entries
/// of its slot.
fn weak_store(memory: &mut BTreeMap<MemAccess, MemSet>, addresses: &MemSet, values: &MemSet) {
    for address in addresses {
        if !memory.contains_key(address) && !memory.contains_key(&MemAccess::whole(address.slot)) {
            memory.insert(*address, values.clone());
        }
        let mut absorbed = Vec::new();
        for (elem, content) in memory.iter_mut() {
            if elem.slot != address.slot {
                continue;
            }
            if elem.offset == address.offset
                || elem.offset == Offset::Top
                || address.offset == Offset::Top
            {
                content.extend(values.iter().copied());
            }
            if address.offset == Offset::Top && elem.offset != Offset::Top {
                absorbed.push(*elem);
            }
        }
        for elem in absorbed {
            if let Some(content) = memory.remove(&elem) {
                memory.entry(*address).or_default().extend(content);
            }
        }
    }
}

/// Follows memory addresses as (allocation, offset) pairs through the stack
/// and through memory, and reports every access to the [`AccessSet`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    stack_pos: usize,
    stack: BTreeMap<usize, MemSet>,
    memory: BTreeMap<MemAccess, MemSet>,
}

impl Debug for MemoryState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let render = |set: &MemSet| format!("{{{}}}", set.iter().join(", "));
        write!(
            f,
            "stack^{} = {{{}}} :: memory = {{{}}}",
            self.stack_pos,
            self.stack
                .iter()
                .map(|(k, v)| format!("{k}: {}", render(v)))
                .join(", "),
            self.memory
                .iter()
                .map(|(k, v)| format!("{k}: {}", render(v)))
                .join(", ")
        )
    }
}

impl MemoryState {
    pub fn stack_pos(&self) -> usize {
        self.stack_pos
    }

    pub fn get_addresses(&self, pos: usize) -> Option<&MemSet> {
        self.stack.get(&pos)
    }

    pub fn memory(&self) -> &BTreeMap<MemAccess, MemSet> {
        &self.memory
    }

    fn tracked(&self, pos: Option<usize>) -> Option<&MemSet> {
        self.stack.get(&pos?)
    }

    fn read_precise(&self, pos: Option<usize>, at: ProgramPoint, accesses: &mut AccessSet) {
        match self.tracked(pos) {
            Some(addresses) => {
                for address in addresses {
                    accesses.add_read_access(at, *address);
                }
            }
            None => accesses.add_read_access(at, Region::Unknown),
        }
    }

    fn write_precise(&self, pos: Option<usize>, at: ProgramPoint, accesses: &mut AccessSet) {
        match self.tracked(pos) {
            Some(addresses) => {
                for address in addresses {
                    accesses.add_write_access(at, *address);
                }
            }
            None => accesses.add_write_access(at, Region::Unknown),
        }
    }

    fn read_whole(&self, pos: Option<usize>, at: ProgramPoint, accesses: &mut AccessSet) {
        for address in self.tracked(pos).into_iter().flatten() {
            accesses.add_read_access(at, MemAccess::whole(address.slot));
        }
    }

    /// Like [`Self::read_whole`], but an untracked operand that is not a
    /// known number may point anywhere.
    fn read_operand(&self, pos: Option<usize>, at: ProgramPoint, ctx: &mut MemoryContext<'_>) {
        if self.tracked(pos).is_some() {
            self.read_whole(pos, at, ctx.accesses);
        } else if !ctx.is_constant_before(at, pos) {
            ctx.accesses.add_read_access(at, Region::Unknown);
        }
    }

    fn write_whole(&self, pos: Option<usize>, at: ProgramPoint, accesses: &mut AccessSet) {
        for address in self.tracked(pos).into_iter().flatten() {
            accesses.add_write_access(at, MemAccess::whole(address.slot));
        }
    }

    fn load(&self, top: Option<usize>) -> MemSet {
        let mut result = MemSet::new();
        for address in self.tracked(top).into_iter().flatten() {
            if let Some(content) = self.memory.get(address) {
                result.extend(content);
            }
            if let Some(content) = self.memory.get(&MemAccess::whole(address.slot)) {
                result.extend(content);
            }
            if address.offset == Offset::Top {
                for (_, content) in self.memory.iter().filter(|(elem, _)| elem.slot == address.slot) {
                    result.extend(content);
                }
            }
        }
        result
    }
}

impl AbstractState for MemoryState {
    fn leq(&self, other: &Self) -> bool {
        let stack_leq = self.stack.iter().all(|(pos, set)| {
            other.stack.get(pos).is_some_and(|other_set| leq_slots(set, other_set))
        });
        let covered_by = |address: &MemAccess, set: &MemSet| {
            other
                .memory
                .get(address)
                .is_some_and(|other_set| leq_slots(set, other_set))
        };
        stack_leq
            && self.memory.iter().all(|(address, set)| {
                covered_by(address, set)
                    || (address.offset != Offset::Top && covered_by(&MemAccess::whole(address.slot), set))
            })
    }

    fn lub(&self, other: &Self) -> Self {
        if self.stack_pos != other.stack_pos {
            warn!("Different stacks in memory lub: {self:?} vs {other:?}");
        }
        let mut stack = self.stack.clone();
        for (pos, set) in &other.stack {
            let joined = match stack.get(pos) {
                Some(current) => clean_under_top(current.union(set).copied()),
                None => set.clone(),
            };
            stack.insert(*pos, joined);
        }
        let mut memory = self.memory.clone();
        for (address, values) in &other.memory {
            weak_store(&mut memory, &BTreeSet::from([*address]), values);
        }
        let result = Self {
            stack_pos: self.stack_pos,
            stack,
            memory,
        };
        debug!("Memory lub result: {result:?}");
        result
    }
}

impl AbstractDomain<Cfg> for MemoryState {
    type Context<'ctx> = MemoryContext<'ctx>;

    fn process_instruction(
        &self,
        op: &Instruction,
        pos: ProgramPoint,
        ctx: &mut Self::Context<'_>,
    ) -> Self {
        let opcode = op.opcode();
        let (stack_in, stack_out) = opcode.stack_effect();
        let stack_res = (self.stack_pos + stack_out).saturating_sub(stack_in);
        let top = self.stack_pos.checked_sub(1);
        let below = |depth: usize| self.stack_pos.checked_sub(depth + 1);

        let mut stack = self.stack.clone();
        let mut memory = self.memory.clone();

        if !matches!(opcode, Opcode::Dup(_) | Opcode::Swap(_)) {
            for consumed in self.stack_pos.saturating_sub(stack_in)..self.stack_pos {
                stack.remove(&consumed);
            }
        }

        match opcode {
            Opcode::MLoad if op.annotated_address() == Some(FREE_MEMORY_POINTER) => {
                ctx.accesses.add_read_access(pos, Region::Mem40);
                let fresh: MemSet = ctx
                    .slots_at(pos)
                    .into_iter()
                    .flatten()
                    .map(|slot| MemAccess::new(*slot, Offset::Const(0)))
                    .collect();
                if let (Some(top), false) = (top, fresh.is_empty()) {
                    stack.insert(top, fresh);
                }
            }
            Opcode::Dup(n) => {
                let source = self.stack_pos.checked_sub(n as usize);
                if let Some(value) = source.and_then(|source| self.stack.get(&source)) {
                    stack.insert(self.stack_pos, value.clone());
                }
            }
            Opcode::Swap(n) => {
                if let (Some(top), Some(other)) = (top, below(n as usize)) {
                    match (self.stack.get(&top), self.stack.get(&other)) {
                        (None, Some(value)) => {
                            stack.insert(top, value.clone());
                            stack.remove(&other);
                        }
                        (Some(value), None) => {
                            stack.insert(other, value.clone());
                            stack.remove(&top);
                        }
                        (Some(top_value), Some(other_value)) => {
                            stack.insert(other, top_value.clone());
                            stack.insert(top, other_value.clone());
                        }
                        (None, None) => {}
                    }
                }
            }
            Opcode::Add => {
                if let Some(result) = below(1) {
                    let top_slots = self.tracked(top);
                    let other_slots = self.tracked(below(1));
                    let top_constants = ctx.constants_before(pos, top).cloned();
                    let other_constants = ctx.constants_before(pos, below(1)).cloned();
                    if let Some(slots) = top_slots {
                        let offsets = other_constants.unwrap_or_else(OffsetSet::top);
                        stack.insert(result, add_slots(slots, &offsets));
                    }
                    if let Some(slots) = other_slots {
                        let offsets = top_constants.unwrap_or_else(OffsetSet::top);
                        stack.insert(result, add_slots(slots, &offsets));
                    }
                }
            }
            Opcode::Sub => {
                if let (Some(slots), None, Some(result)) =
                    (self.tracked(top), self.tracked(below(1)), below(1))
                {
                    warn!(
                        "{pos}: subtracting a number from slot {{{}}}, dead stores are not reported",
                        slots.iter().join(", ")
                    );
                    ctx.accesses.set_found_outofslot();
                    stack.insert(result, add_slots(slots, &OffsetSet::top()));
                }
            }
            Opcode::Mul | Opcode::Div | Opcode::And | Opcode::Or | Opcode::Exp | Opcode::Shl | Opcode::Shr => {
                // Masking or scaling a pointer keeps its allocation.
                if let Some(result) = below(1) {
                    let slots: MemSet = [top, below(1)]
                        .into_iter()
                        .filter_map(|operand| self.tracked(operand))
                        .flatten()
                        .copied()
                        .collect();
                    if !slots.is_empty() {
                        stack.insert(result, add_slots(&slots, &OffsetSet::top()));
                    }
                }
            }
            Opcode::MLoad => {
                self.read_precise(top, pos, ctx.accesses);
                let loaded = self.load(top);
                if let (Some(top), false) = (top, loaded.is_empty()) {
                    stack.insert(top, loaded);
                }
            }
            // A single byte never overwrites a whole word.
            Opcode::MStore8 => match self.tracked(top) {
                Some(_) => self.write_whole(top, pos, ctx.accesses),
                None => ctx.accesses.add_write_access(pos, Region::Unknown),
            },
            Opcode::MStore if op.annotated_address() == Some(FREE_MEMORY_POINTER) => {
                ctx.accesses.add_write_access(pos, Region::Mem40);
            }
            Opcode::MStore if op.annotated_address() == Some(4) => {
                ctx.accesses.add_write_access(pos, Region::Mem4);
            }
            Opcode::MStore if op.annotated_address() == Some(32) => {
                ctx.accesses.add_write_access(pos, Region::Mem32);
            }
            Opcode::MStore if op.annotated_address() == Some(0) => {
                ctx.accesses.add_write_access(pos, Region::Mem0);
            }
            Opcode::MStore => {
                self.write_precise(top, pos, ctx.accesses);
                if let (Some(addresses), Some(values)) = (self.tracked(top), self.tracked(below(1))) {
                    weak_store(&mut memory, addresses, values);
                }
            }
            Opcode::Return | Opcode::Revert | Opcode::Log(_) => self.read_operand(top, pos, ctx),
            Opcode::Keccak256 => {
                if self.tracked(top).is_some() {
                    self.read_whole(top, pos, ctx.accesses);
                } else {
                    let hashes_two_words = ctx
                        .constants_before(pos, below(1))
                        .is_some_and(|length| length.contains(Offset::Const(64)));
                    ctx.accesses.add_read_access(pos, Region::Mem0);
                    if hashes_two_words {
                        ctx.accesses.add_read_access(pos, Region::Mem32);
                    }
                }
            }
            Opcode::Call | Opcode::CallCode => {
                self.read_operand(below(3), pos, ctx);
                self.write_whole(below(5), pos, ctx.accesses);
            }
            Opcode::StaticCall | Opcode::DelegateCall => {
                self.read_operand(below(2), pos, ctx);
                self.write_whole(below(4), pos, ctx.accesses);
            }
            Opcode::CallDataCopy | Opcode::CodeCopy | Opcode::ReturnDataCopy => {
                self.write_whole(top, pos, ctx.accesses);
            }
            Opcode::ExtCodeCopy => self.write_whole(below(1), pos, ctx.accesses),
            Opcode::MCopy => {
                self.read_operand(below(1), pos, ctx);
                self.write_whole(top, pos, ctx.accesses);
            }
            Opcode::Create | Opcode::Create2 => self.read_operand(below(1), pos, ctx),
            _ => {}
        }

        stack.retain(|&stack_pos, _| stack_pos < stack_res);

        Self {
            stack_pos: stack_res,
            stack,
            memory,
        }
    }
}
