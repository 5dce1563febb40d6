//! Bookkeeping of the memory and storage accesses observed by the domains,
//! and the reachability search classifying writes as live or dead.

use core::fmt::Display;
use std::collections::{BTreeMap, BTreeSet};

use analysis::cfg::{CfgBlock, ControlFlowGraph, OpPos};
use fixedbitset::FixedBitSet;
use itertools::Itertools;
use log::{debug, info};

use crate::analysis::offset_analysis::Offset;
use crate::analysis::slots_analysis::SlotId;
use crate::ir::{BlockId, Cfg, ProgramPoint};
use crate::opcodes::Opcode;

/// Memory words with a fixed role in compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    /// Scratch word at 0x00.
    Mem0,
    /// Word at 0x04.
    Mem4,
    /// Scratch word at 0x20.
    Mem32,
    /// The free memory pointer at 0x40.
    Mem40,
    /// An address nothing is known about.
    Unknown,
}

impl Display for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Region::Mem0 => "mem0",
            Region::Mem4 => "mem4",
            Region::Mem32 => "mem32",
            Region::Mem40 => "mem40",
            Region::Unknown => "unknown",
        })
    }
}

/// An abstract memory address: an allocation and a position inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemAccess {
    pub slot: SlotId,
    pub offset: Offset,
}

impl MemAccess {
    pub fn new(slot: SlotId, offset: Offset) -> Self {
        Self { slot, offset }
    }

    /// The whole allocation.
    pub fn whole(slot: SlotId) -> Self {
        Self::new(slot, Offset::Top)
    }

    pub fn leq(&self, other: &Self) -> bool {
        self.slot == other.slot && (other.offset == Offset::Top || self.offset == other.offset)
    }

    /// Shift the address by `offset`. Results beyond `bound` become
    /// [`Offset::TopK`], results that are not word aligned become
    /// [`Offset::Top`].
    pub fn add(&self, offset: Offset, bound: u64) -> Self {
        let offset = match (self.offset, offset) {
            (Offset::Top, _) | (_, Offset::Top) => Offset::Top,
            (Offset::TopK, _) | (_, Offset::TopK) => Offset::TopK,
            (Offset::Const(a), Offset::Const(b)) => match a.checked_add(b) {
                Some(sum) if sum > bound => Offset::TopK,
                Some(sum) if sum % 32 != 0 => Offset::Top,
                Some(sum) => Offset::Const(sum),
                None => Offset::TopK,
            },
        };
        Self::new(self.slot, offset)
    }
}

impl Display for MemAccess {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "<{},{}>", self.slot, self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessToken {
    Region(Region),
    Memory(MemAccess),
    Storage(Offset),
}

/// The outcome of comparing two abstract addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Equal,
    NotEqual,
    Unknown,
}

impl Display for Relation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Relation::Equal => "==",
            Relation::NotEqual => "!=",
            Relation::Unknown => "UNK",
        })
    }
}

impl AccessToken {
    /// Whether the two accesses may touch the same location. An unknown
    /// memory region may touch any memory location.
    pub fn may_alias(&self, other: &Self) -> bool {
        if self.is_unknown_memory() || other.is_unknown_memory() {
            return self.is_memory() && other.is_memory();
        }
        match (self, other) {
            (AccessToken::Region(a), AccessToken::Region(b)) => a == b,
            (AccessToken::Memory(a), AccessToken::Memory(b)) => {
                a.slot == b.slot
                    && (a.offset == b.offset || a.offset == Offset::Top || b.offset == Offset::Top)
            }
            (AccessToken::Storage(a), AccessToken::Storage(b)) => {
                a == b || *a == Offset::Top || *b == Offset::Top
            }
            _ => false,
        }
    }

    pub fn relation(&self, other: &Self) -> Relation {
        if (self.is_unknown_memory() || other.is_unknown_memory())
            && self.is_memory()
            && other.is_memory()
        {
            return Relation::Unknown;
        }
        match (self, other) {
            (AccessToken::Region(a), AccessToken::Region(b)) if a == b => Relation::Equal,
            (AccessToken::Memory(a), AccessToken::Memory(b)) if a.slot == b.slot => {
                offset_relation(a.offset, b.offset)
            }
            (AccessToken::Storage(a), AccessToken::Storage(b)) => offset_relation(*a, *b),
            _ => Relation::NotEqual,
        }
    }

    pub fn is_memory(&self) -> bool {
        !matches!(self, AccessToken::Storage(_))
    }

    fn is_unknown_memory(&self) -> bool {
        *self == AccessToken::Region(Region::Unknown)
    }
}

fn offset_relation(a: Offset, b: Offset) -> Relation {
    if a.is_imprecise() || b.is_imprecise() {
        Relation::Unknown
    } else if a == b {
        Relation::Equal
    } else {
        Relation::NotEqual
    }
}

/// Lifts [`AccessToken::relation`] to the token sets of two program points.
pub fn relation_of_sets(lhs: &BTreeSet<AccessToken>, rhs: &BTreeSet<AccessToken>) -> Relation {
    if let (Ok(a), Ok(b)) = (lhs.iter().exactly_one(), rhs.iter().exactly_one()) {
        return a.relation(b);
    }
    let any_overlap = lhs
        .iter()
        .cartesian_product(rhs.iter())
        .any(|(a, b)| a.relation(b) != Relation::NotEqual);
    if any_overlap {
        Relation::Unknown
    } else {
        Relation::NotEqual
    }
}

impl Display for AccessToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AccessToken::Region(region) => write!(f, "{region}"),
            AccessToken::Memory(access) => write!(f, "{access}"),
            AccessToken::Storage(offset) => write!(f, "[{offset}]"),
        }
    }
}

impl From<Region> for AccessToken {
    fn from(region: Region) -> Self {
        AccessToken::Region(region)
    }
}

impl From<MemAccess> for AccessToken {
    fn from(access: MemAccess) -> Self {
        AccessToken::Memory(access)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreClass {
    /// The value may be observed by the read at the given point.
    Live { read: ProgramPoint },
    /// The block ends in a REVERT, the write is never observable.
    BeforeRevert,
    /// No read may observe the value.
    Dead,
    /// No read was found, but imprecise address arithmetic was seen during
    /// the run, so nothing is concluded.
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreReport {
    pub point: ProgramPoint,
    pub token: AccessToken,
    pub class: StoreClass,
}

impl StoreReport {
    pub fn is_dead(&self) -> bool {
        matches!(self.class, StoreClass::Dead | StoreClass::BeforeRevert)
    }
}

impl Display for StoreReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.class {
            StoreClass::Live { read } => write!(f, "Found read -> {} : {read}", self.point),
            StoreClass::BeforeRevert => write!(f, "Found write for revert -> {}", self.point),
            StoreClass::Dead => write!(
                f,
                "NOT found read (potential optimization) -> {} {}",
                self.token, self.point
            ),
            StoreClass::Suppressed => write!(
                f,
                "NOT found read (out of slot arithmetic) -> {} {}",
                self.token, self.point
            ),
        }
    }
}

type AccessMap<T> = BTreeMap<ProgramPoint, BTreeSet<T>>;

/// Every access observed at each program point. Only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    reads: AccessMap<AccessToken>,
    writes: AccessMap<AccessToken>,
    allocation_init: AccessMap<SlotId>,
    allocation_close: AccessMap<SlotId>,
    found_outofslot: bool,
}

fn in_block<T>(map: &AccessMap<T>, block: BlockId) -> impl Iterator<Item = (&ProgramPoint, &BTreeSet<T>)> {
    map.range(OpPos::new(block, 0)..=OpPos::new(block, usize::MAX))
}

impl AccessSet {
    pub fn add_read_access(&mut self, pos: ProgramPoint, token: impl Into<AccessToken>) {
        self.reads.entry(pos).or_default().insert(token.into());
    }

    pub fn add_write_access(&mut self, pos: ProgramPoint, token: impl Into<AccessToken>) {
        self.writes.entry(pos).or_default().insert(token.into());
    }

    pub fn add_allocation_init(&mut self, pos: ProgramPoint, slot: SlotId) {
        self.allocation_init.entry(pos).or_default().insert(slot);
    }

    pub fn add_allocation_close(&mut self, pos: ProgramPoint, slot: SlotId) {
        self.allocation_close.entry(pos).or_default().insert(slot);
    }

    pub fn set_found_outofslot(&mut self) {
        self.found_outofslot = true;
    }

    pub fn found_outofslot(&self) -> bool {
        self.found_outofslot
    }

    pub fn reads(&self) -> &AccessMap<AccessToken> {
        &self.reads
    }

    pub fn writes(&self) -> &AccessMap<AccessToken> {
        &self.writes
    }

    pub fn allocation_init(&self) -> &AccessMap<SlotId> {
        &self.allocation_init
    }

    pub fn allocation_close(&self) -> &AccessMap<SlotId> {
        &self.allocation_close
    }

    pub fn reads_in_block(&self, block: BlockId) -> impl Iterator<Item = (&ProgramPoint, &BTreeSet<AccessToken>)> {
        in_block(&self.reads, block)
    }

    pub fn writes_in_block(&self, block: BlockId) -> impl Iterator<Item = (&ProgramPoint, &BTreeSet<AccessToken>)> {
        in_block(&self.writes, block)
    }

    /// Look for a read that may observe the value written to `token` at
    /// `write`, following jump targets and fall-throughs from the block of
    /// the write. A path stops at a block that definitely overwrites the same
    /// location. Returns the first read found.
    pub fn search_read(&self, cfg: &Cfg, write: ProgramPoint, token: &AccessToken) -> Option<ProgramPoint> {
        let written = BTreeSet::from([*token]);
        let mut visited = FixedBitSet::with_capacity(cfg.blocks().len());
        let mut pending = vec![write.block_id];
        while let Some(block_id) = pending.pop() {
            let Some(idx) = cfg.index_of(block_id) else {
                continue;
            };
            if visited.put(idx) {
                continue;
            }

            let read = self
                .reads_in_block(block_id)
                .find(|(pos, tokens)| **pos != write && tokens.iter().any(|t| t.may_alias(token)));
            if let Some((pos, _)) = read {
                return Some(*pos);
            }

            let clobbered = self.writes_in_block(block_id).any(|(pos, tokens)| {
                let after_write = block_id != write.block_id || pos.op_id > write.op_id;
                after_write && relation_of_sets(&written, tokens) == Relation::Equal
            });
            if clobbered {
                debug!("{token} written at {write} is overwritten in block {block_id}");
                continue;
            }

            // Reversed, so the jump target is explored first.
            pending.extend(cfg.blocks()[idx].successors().iter().rev());
        }
        None
    }

    fn ends_in_revert(cfg: &Cfg, pos: ProgramPoint) -> bool {
        cfg.get(pos.block_id)
            .and_then(|block| block.last_opcode())
            .is_some_and(|opcode| opcode == Opcode::Revert)
    }

    /// Classify every recorded write.
    pub fn process_free_mstores(&self, cfg: &Cfg) -> Vec<StoreReport> {
        let mut reports = Vec::new();
        for (&point, tokens) in &self.writes {
            for token in tokens {
                let class = if Self::ends_in_revert(cfg, point) {
                    StoreClass::BeforeRevert
                } else {
                    match self.search_read(cfg, point, token) {
                        Some(read) => StoreClass::Live { read },
                        None if self.found_outofslot => StoreClass::Suppressed,
                        None => StoreClass::Dead,
                    }
                };
                let report = StoreReport {
                    point,
                    token: *token,
                    class,
                };
                info!("MEMRES: {report}");
                reports.push(report);
            }
        }
        reports
    }

    /// The accesses of a block, one line per program point and kind, ordered
    /// by position: `"<index> [I|C|R|W] -> [tokens]"`.
    pub fn cfg_info(&self, block: BlockId) -> Vec<String> {
        fn lines<T: Display>(map: &AccessMap<T>, block: BlockId, kind: &str) -> Vec<(usize, String)> {
            in_block(map, block)
                .map(|(pos, items)| {
                    (
                        pos.op_id,
                        format!("{} [{kind}] -> [{}]", pos.op_id, items.iter().join(", ")),
                    )
                })
                .collect()
        }
        let mut result = lines(&self.allocation_init, block, "I");
        result.extend(lines(&self.allocation_close, block, "C"));
        result.extend(lines(&self.reads, block, "R"));
        result.extend(lines(&self.writes, block, "W"));
        result.sort_by_key(|(op_id, _)| *op_id);
        result.into_iter().map(|(_, line)| line).collect()
    }
}

impl Display for AccessSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        fn section<T: Display>(
            f: &mut core::fmt::Formatter<'_>,
            title: &str,
            map: &AccessMap<T>,
        ) -> core::fmt::Result {
            writeln!(f, "{title}:")?;
            for (pos, items) in map {
                writeln!(f, "  {pos} -> {{{}}}", items.iter().join(", "))?;
            }
            Ok(())
        }
        section(f, "INIT ALLOC", &self.allocation_init)?;
        section(f, "CLOSE ALLOC", &self.allocation_close)?;
        section(f, "READ", &self.reads)?;
        section(f, "WRITE", &self.writes)
    }
}
