use core::fmt::{Debug, Display};
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};

use analysis::cfg::{CfgBlock, ControlFlowGraph, OpPos};

use crate::error::CfgError;
use crate::opcodes::Opcode;

/// A block is identified by the address of its first instruction. Blocks that
/// were duplicated to separate incoming stacks carry a clone index as well.
/// Rendered as `addr` or `addr_clone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId {
    pub address: u64,
    pub clone_index: Option<u32>,
}

impl BlockId {
    pub const fn new(address: u64) -> Self {
        Self {
            address,
            clone_index: None,
        }
    }

    pub const fn cloned(address: u64, clone_index: u32) -> Self {
        Self {
            address,
            clone_index: Some(clone_index),
        }
    }
}

impl From<u64> for BlockId {
    fn from(address: u64) -> Self {
        Self::new(address)
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.clone_index {
            Some(clone) => write!(f, "{}_{clone}", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

impl FromStr for BlockId {
    type Err = CfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CfgError::MalformedBlockId(s.to_owned());
        match s.split_once('_') {
            Some((address, clone)) => Ok(Self::cloned(
                address.parse().map_err(|_| malformed())?,
                clone.parse().map_err(|_| malformed())?,
            )),
            None => Ok(Self::new(s.parse().map_err(|_| malformed())?)),
        }
    }
}

/// Rendered as `"<block>:<index>"`, e.g. `"12_1:3"`.
pub type ProgramPoint = OpPos<BlockId>;

pub fn parse_program_point(s: &str) -> Result<ProgramPoint, CfgError> {
    s.parse()
        .map_err(|_| CfgError::MalformedProgramPoint(s.to_owned()))
}

/// A disassembled instruction: the opcode and the optional textual operand.
/// PUSH operands are hexadecimal immediates, MLOAD/MSTORE operands are
/// decimal addresses annotated by the disassembler.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    opcode: Opcode,
    operand: Option<String>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operand: None,
        }
    }

    pub fn with_operand(opcode: Opcode, operand: impl Into<String>) -> Self {
        Self {
            opcode,
            operand: Some(operand.into()),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn operand(&self) -> Option<&str> {
        self.operand.as_deref()
    }

    /// The immediate of a PUSH. `None` for other opcodes, and for immediates
    /// that do not fit 64 bits (these are far out of any tracked range).
    pub fn push_value(&self) -> Option<u64> {
        match self.opcode {
            Opcode::Push(0) => Some(0),
            Opcode::Push(_) => {
                let operand = self.operand.as_deref()?;
                let digits = operand
                    .strip_prefix("0x")
                    .or_else(|| operand.strip_prefix("0X"))
                    .unwrap_or(operand);
                u64::from_str_radix(digits, 16).ok()
            }
            _ => None,
        }
    }

    /// The memory address annotated on a MLOAD/MSTORE, e.g. `64` for
    /// `MSTORE 64`, the free memory pointer.
    pub fn annotated_address(&self) -> Option<u64> {
        match self.opcode {
            Opcode::MLoad | Opcode::MStore => self.operand.as_deref()?.parse().ok(),
            _ => None,
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.operand {
            Some(operand) => write!(f, "{} {operand}", self.opcode),
            None => write!(f, "{}", self.opcode),
        }
    }
}

impl Debug for Instruction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self}")
    }
}

impl FromStr for Instruction {
    type Err = CfgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let opcode = parts.next().unwrap_or_default().parse()?;
        Ok(Self {
            opcode,
            operand: parts.next().map(str::to_owned),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Terminal,
    Conditional,
    Unconditional,
    FallsTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpTarget {
    None,
    /// The block jumps, but the destination is not statically known.
    Unresolved,
    Block(BlockId),
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    id: BlockId,
    start: u64,
    end: u64,
    kind: BlockKind,
    instructions: Vec<Instruction>,
    jump_target: JumpTarget,
    falls_to: Option<BlockId>,
    jump_destinations: BTreeSet<BlockId>,
    successors: Vec<BlockId>,
}

impl BasicBlock {
    /// Builds a block of any shape, [`Cfg::new`] checks that the shape fits
    /// the kind.
    pub fn new(
        id: BlockId,
        kind: BlockKind,
        instructions: Vec<Instruction>,
        jump_target: JumpTarget,
        falls_to: Option<BlockId>,
    ) -> Self {
        let mut successors = Vec::new();
        if let JumpTarget::Block(target) = jump_target {
            successors.push(target);
        }
        successors.extend(falls_to);
        Self {
            id,
            start: id.address,
            end: id.address,
            kind,
            instructions,
            jump_target,
            falls_to,
            jump_destinations: BTreeSet::new(),
            successors,
        }
    }

    pub fn terminal(id: BlockId, instructions: Vec<Instruction>) -> Self {
        Self::new(id, BlockKind::Terminal, instructions, JumpTarget::None, None)
    }

    pub fn conditional(
        id: BlockId,
        instructions: Vec<Instruction>,
        jump_target: JumpTarget,
        falls_to: BlockId,
    ) -> Self {
        Self::new(
            id,
            BlockKind::Conditional,
            instructions,
            jump_target,
            Some(falls_to),
        )
    }

    pub fn unconditional(id: BlockId, instructions: Vec<Instruction>, jump_target: JumpTarget) -> Self {
        Self::new(id, BlockKind::Unconditional, instructions, jump_target, None)
    }

    pub fn falls_to(id: BlockId, instructions: Vec<Instruction>, next: BlockId) -> Self {
        Self::new(id, BlockKind::FallsTo, instructions, JumpTarget::None, Some(next))
    }

    pub fn with_range(mut self, start: u64, end: u64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Every compile-time destination of a jump with several possible
    /// targets. Kept for reporting, traversals only follow the resolved jump
    /// target and the fall-through.
    pub fn with_jump_destinations(mut self, destinations: impl IntoIterator<Item = BlockId>) -> Self {
        self.jump_destinations.extend(destinations);
        self
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn jump_target(&self) -> JumpTarget {
        self.jump_target
    }

    pub fn get_falls_to(&self) -> Option<BlockId> {
        self.falls_to
    }

    pub fn jump_destinations(&self) -> &BTreeSet<BlockId> {
        &self.jump_destinations
    }

    pub fn last_opcode(&self) -> Option<Opcode> {
        self.instructions.last().map(Instruction::opcode)
    }

    fn check_shape(&self) -> Result<(), CfgError> {
        let has_target = self.jump_target != JumpTarget::None;
        let has_falls_to = self.falls_to.is_some();
        let reason = match self.kind {
            BlockKind::Terminal if has_target || has_falls_to => "has outgoing edges",
            BlockKind::Conditional if !has_target => "has no jump target",
            BlockKind::Conditional if !has_falls_to => "has no fall-through",
            BlockKind::Unconditional if !has_target => "has no jump target",
            BlockKind::Unconditional if has_falls_to => "has a fall-through",
            BlockKind::FallsTo if has_target => "has a jump target",
            BlockKind::FallsTo if !has_falls_to => "has no fall-through",
            _ => return Ok(()),
        };
        Err(CfgError::InvalidBlockShape {
            block: self.id,
            kind: self.kind,
            reason,
        })
    }
}

impl CfgBlock for BasicBlock {
    type Id = BlockId;
    type Operation = Instruction;

    fn id(&self) -> BlockId {
        self.id
    }

    fn operations(&self) -> &[Instruction] {
        &self.instructions
    }

    fn successors(&self) -> &[BlockId] {
        &self.successors
    }
}

/// A finalized control flow graph. Blocks are kept in id order.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,
    index: BTreeMap<BlockId, usize>,
}

impl Cfg {
    pub fn new(mut blocks: Vec<BasicBlock>) -> Result<Self, CfgError> {
        blocks.sort_by_key(|block| block.id);
        let mut index = BTreeMap::new();
        for (idx, block) in blocks.iter().enumerate() {
            block.check_shape()?;
            if index.insert(block.id, idx).is_some() {
                return Err(CfgError::DuplicateBlock(block.id));
            }
        }
        for block in &blocks {
            if let Some(&to) = block.successors.iter().find(|to| !index.contains_key(to)) {
                return Err(CfgError::DanglingEdge { from: block.id, to });
            }
        }
        Ok(Self { blocks, index })
    }

    pub fn get(&self, id: BlockId) -> Option<&BasicBlock> {
        self.block(id)
    }

    pub fn instruction(&self, pos: ProgramPoint) -> Option<&Instruction> {
        self.get(pos.block_id)?.instructions.get(pos.op_id)
    }
}

impl ControlFlowGraph for Cfg {
    type Block = BasicBlock;

    fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    fn index_of(&self, id: BlockId) -> Option<usize> {
        self.index.get(&id).copied()
    }
}

pub fn print(cfg: &Cfg) -> String {
    analysis::cfg::print(cfg, ToString::to_string)
}

/// Parses one instruction per item, e.g. `["PUSH1 0x40", "MLOAD 64"]`.
pub fn parse_instructions<'a>(
    lines: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<Instruction>, CfgError> {
    lines.into_iter().map(str::parse).collect()
}
