use core::fmt::{Debug, Display};
use std::collections::{BTreeMap, BTreeSet};

use analysis::domains::{AbstractDomain, AbstractState};
use itertools::Itertools;
use log::{debug, warn};

use crate::accesses::{AccessSet, AccessToken};
use crate::ir::{Cfg, Instruction, ProgramPoint};
use crate::opcodes::Opcode;

/// An abstract address component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Offset {
    Const(u64),
    /// Larger than the tracked bound, otherwise unknown.
    TopK,
    /// Any value.
    Top,
}

impl Offset {
    pub fn is_imprecise(self) -> bool {
        matches!(self, Offset::Top | Offset::TopK)
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Offset::Const(value) => write!(f, "{value}"),
            Offset::TopK => f.write_str("+"),
            Offset::Top => f.write_str("*"),
        }
    }
}

/// The set of offsets a stack slot may hold. Never empty, and a set
/// containing [`Offset::Top`] contains nothing else.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OffsetSet(BTreeSet<Offset>);

impl OffsetSet {
    pub fn top() -> Self {
        Self(BTreeSet::from([Offset::Top]))
    }

    pub fn singleton(offset: Offset) -> Self {
        Self(BTreeSet::from([offset]))
    }

    pub fn from_offsets(offsets: impl IntoIterator<Item = Offset>) -> Self {
        let offsets: BTreeSet<_> = offsets.into_iter().collect();
        if offsets.is_empty() || offsets.contains(&Offset::Top) {
            return Self::top();
        }
        Self(offsets)
    }

    pub fn is_top(&self) -> bool {
        self.0.contains(&Offset::Top)
    }

    pub fn contains(&self, offset: Offset) -> bool {
        self.0.contains(&offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = Offset> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The only concrete value, if the set is a single constant.
    pub fn as_constant(&self) -> Option<u64> {
        match self.0.iter().exactly_one() {
            Ok(Offset::Const(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn leq(&self, other: &Self) -> bool {
        other.is_top() || self.0.is_subset(&other.0)
    }

    pub fn lub(&self, other: &Self) -> Self {
        if self.is_top() || other.is_top() {
            return Self::top();
        }
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Pairwise sums. Sums beyond `bound` and sums with [`Offset::TopK`]
    /// become [`Offset::TopK`].
    pub fn add(&self, other: &Self, bound: u64) -> Self {
        if self.is_top() || other.is_top() {
            return Self::top();
        }
        Self::from_offsets(
            self.iter()
                .flat_map(|lhs| other.iter().map(move |rhs| (lhs, rhs)))
                .map(|pair| match pair {
                    (Offset::Const(a), Offset::Const(b)) => match a.checked_add(b) {
                        Some(sum) if sum <= bound => Offset::Const(sum),
                        _ => Offset::TopK,
                    },
                    _ => Offset::TopK,
                }),
        )
    }
}

impl Debug for OffsetSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{{{}}}", self.0.iter().join(", "))
    }
}

/// What the tracked addresses are used for. This decides which constants are
/// precise enough to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetTarget {
    Memory,
    Storage,
}

impl OffsetTarget {
    /// Constants at or beyond the bound are not tracked.
    pub const fn bound(self) -> u64 {
        match self {
            OffsetTarget::Memory => 128,
            OffsetTarget::Storage => 256,
        }
    }

    /// Memory offsets are tracked in whole words only.
    pub const fn granularity(self) -> u64 {
        match self {
            OffsetTarget::Memory => 32,
            OffsetTarget::Storage => 1,
        }
    }

    fn abstract_constant(self, value: Option<u64>) -> OffsetSet {
        match value {
            Some(value) if value < self.bound() && value % self.granularity() == 0 => {
                OffsetSet::singleton(Offset::Const(value))
            }
            _ => OffsetSet::top(),
        }
    }
}

/// Memory words whose content is followed through MSTORE/MLOAD pairs: the
/// scratch space and the free memory pointer.
const WELL_KNOWN_WORDS: [u64; 3] = [0x00, 0x20, 0x40];

/// Tracks small constants through the evaluation stack.
///
/// Stack positions are counted from the bottom of the stack at the entry of
/// the analysed code, `stack_pos` is the current height. Positions without
/// information are absent from the map.
#[derive(Clone, PartialEq, Eq)]
pub struct OffsetState {
    target: OffsetTarget,
    stack_pos: usize,
    stack: BTreeMap<usize, OffsetSet>,
    memory: BTreeMap<u64, OffsetSet>,
}

impl OffsetState {
    pub fn new(target: OffsetTarget) -> Self {
        Self {
            target,
            stack_pos: 0,
            stack: BTreeMap::new(),
            memory: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> OffsetTarget {
        self.target
    }

    pub fn stack_pos(&self) -> usize {
        self.stack_pos
    }

    /// The offsets at an absolute stack position.
    pub fn get_offsets(&self, pos: usize) -> Option<&OffsetSet> {
        self.stack.get(&pos)
    }

    /// The offsets `depth` items below the top of the stack.
    pub fn from_top(&self, depth: usize) -> Option<&OffsetSet> {
        let pos = self.stack_pos.checked_sub(depth + 1)?;
        self.stack.get(&pos)
    }

    pub fn memory_word(&self, address: u64) -> Option<&OffsetSet> {
        self.memory.get(&address)
    }

    fn value_or_top(&self, pos: Option<usize>, what: &str, at: ProgramPoint) -> OffsetSet {
        match pos.and_then(|pos| self.stack.get(&pos)) {
            Some(value) => value.clone(),
            None => {
                warn!("{at}: {what} of an absent stack value in offset analysis");
                OffsetSet::top()
            }
        }
    }

    fn store_address(&self, op: &Instruction, top: Option<usize>) -> Option<u64> {
        op.annotated_address()
            .or_else(|| self.stack.get(&top?)?.as_constant())
    }

    fn record(&self, pos: ProgramPoint, key: Option<usize>, write: bool, accesses: &mut AccessSet) {
        let keys = key
            .and_then(|key| self.stack.get(&key))
            .cloned()
            .unwrap_or_else(OffsetSet::top);
        for offset in keys.iter() {
            let token = AccessToken::Storage(offset);
            if write {
                accesses.add_write_access(pos, token);
            } else {
                accesses.add_read_access(pos, token);
            }
        }
    }
}

impl Debug for OffsetState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "stack^{} = {{{}}}",
            self.stack_pos,
            self.stack.iter().map(|(k, v)| format!("{k}: {v:?}")).join(", ")
        )?;
        if !self.memory.is_empty() {
            write!(
                f,
                " :: memory = {{{}}}",
                self.memory.iter().map(|(k, v)| format!("{k}: {v:?}")).join(", ")
            )?;
        }
        Ok(())
    }
}

impl AbstractState for OffsetState {
    /// A stack position absent from `self` carries no information. A memory
    /// word absent from a map is unknown, so `other` may only track words
    /// that `self` tracks as well.
    fn leq(&self, other: &Self) -> bool {
        if self.stack_pos != other.stack_pos {
            warn!("Different stacks in offset leq: {self:?} vs {other:?}");
        }
        let stack_leq = self.stack.iter().all(|(pos, value)| {
            other
                .stack
                .get(pos)
                .is_some_and(|other_value| value.leq(other_value))
        });
        stack_leq
            && other.memory.iter().all(|(address, other_value)| {
                self.memory
                    .get(address)
                    .is_some_and(|value| value.leq(other_value))
            })
    }

    fn lub(&self, other: &Self) -> Self {
        debug!("Offset lub: {self:?} and {other:?}");
        if self.stack_pos != other.stack_pos {
            warn!("Different stacks in offset lub: {self:?} vs {other:?}");
        }
        let mut stack = self.stack.clone();
        for (pos, value) in &other.stack {
            stack
                .entry(*pos)
                .and_modify(|current| *current = current.lub(value))
                .or_insert_with(|| value.clone());
        }
        let memory = self
            .memory
            .iter()
            .filter_map(|(address, value)| {
                Some((*address, value.lub(other.memory.get(address)?)))
            })
            .collect();
        let result = Self {
            target: self.target,
            stack_pos: self.stack_pos,
            stack,
            memory,
        };
        debug!("Offset lub result: {result:?}");
        result
    }
}

impl AbstractDomain<Cfg> for OffsetState {
    /// Storage flavoured runs record the observed SLOAD/SSTORE keys.
    type Context<'ctx> = Option<&'ctx mut AccessSet>;

    fn process_instruction(
        &self,
        op: &Instruction,
        pos: ProgramPoint,
        storage: &mut Self::Context<'_>,
    ) -> Self {
        let opcode = op.opcode();
        let (stack_in, stack_out) = opcode.stack_effect();
        let stack_res = match (self.stack_pos + stack_out).checked_sub(stack_in) {
            Some(res) => res,
            None => {
                warn!("{pos}: stack underflow at {op:?} in offset analysis");
                0
            }
        };
        let top = self.stack_pos.checked_sub(1);
        let below_top = self.stack_pos.checked_sub(2);

        let mut stack = self.stack.clone();
        let mut memory = self.memory.clone();

        match opcode {
            Opcode::Push(_) => {
                stack.insert(self.stack_pos, self.target.abstract_constant(op.push_value()));
            }
            Opcode::Dup(n) => {
                let source = self.stack_pos.checked_sub(n as usize);
                match source.and_then(|source| self.stack.get(&source)) {
                    Some(value) => {
                        stack.insert(self.stack_pos, value.clone());
                    }
                    None => warn!("{pos}: {op:?} copying an absent value in offset analysis"),
                }
            }
            Opcode::Swap(n) => {
                if let (Some(top), Some(other)) = (top, top.and_then(|t| t.checked_sub(n as usize))) {
                    let top_value = stack.remove(&top);
                    let other_value = stack.remove(&other);
                    if top_value.is_none() || other_value.is_none() {
                        warn!("{pos}: {op:?} moving an absent value in offset analysis");
                    }
                    if let Some(value) = top_value {
                        stack.insert(other, value);
                    }
                    if let Some(value) = other_value {
                        stack.insert(top, value);
                    }
                } else {
                    warn!("{pos}: {op:?} below the bottom of the stack in offset analysis");
                    if let Some(top) = top {
                        stack.remove(&top);
                    }
                }
            }
            Opcode::Add => {
                let lhs = self.value_or_top(top, "ADD", pos);
                let rhs = self.value_or_top(below_top, "ADD", pos);
                if let Some(result) = below_top {
                    stack.insert(result, lhs.add(&rhs, self.target.bound()));
                }
            }
            Opcode::MLoad => {
                let value = self
                    .store_address(op, top)
                    .and_then(|address| self.memory.get(&address))
                    .cloned()
                    .unwrap_or_else(OffsetSet::top);
                if let Some(top) = top {
                    stack.insert(top, value);
                }
            }
            Opcode::MStore => match self.store_address(op, top) {
                Some(address) if WELL_KNOWN_WORDS.contains(&address) => {
                    let value = below_top
                        .and_then(|pos| self.stack.get(&pos))
                        .cloned()
                        .unwrap_or_else(OffsetSet::top);
                    memory.insert(address, value);
                }
                _ => memory.clear(),
            },
            Opcode::MStore8
            | Opcode::MCopy
            | Opcode::CallDataCopy
            | Opcode::CodeCopy
            | Opcode::ReturnDataCopy
            | Opcode::ExtCodeCopy
            | Opcode::Call
            | Opcode::CallCode
            | Opcode::DelegateCall
            | Opcode::StaticCall => {
                memory.clear();
                set_produced_to_top(&mut stack, self.stack_pos, stack_in, stack_out);
            }
            Opcode::SLoad | Opcode::SStore => {
                if let Some(accesses) = storage.as_deref_mut() {
                    self.record(pos, top, opcode == Opcode::SStore, accesses);
                }
                set_produced_to_top(&mut stack, self.stack_pos, stack_in, stack_out);
            }
            _ => set_produced_to_top(&mut stack, self.stack_pos, stack_in, stack_out),
        }

        stack.retain(|&stack_pos, _| stack_pos < stack_res);

        Self {
            target: self.target,
            stack_pos: stack_res,
            stack,
            memory,
        }
    }
}

/// The default transfer: every produced value is unknown.
fn set_produced_to_top(
    stack: &mut BTreeMap<usize, OffsetSet>,
    stack_pos: usize,
    stack_in: usize,
    stack_out: usize,
) {
    let base = stack_pos.saturating_sub(stack_in);
    for pos in base..base + stack_out {
        stack.insert(pos, OffsetSet::top());
    }
}
