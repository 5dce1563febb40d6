use core::fmt::{Debug, Display, Write};
use core::hash::Hash;
use core::str::FromStr;

use fixedbitset::FixedBitSet;

pub trait CfgBlock {
    type Id: Copy + Eq + Ord + Hash + Debug + Display;
    type Operation: Debug;

    fn id(&self) -> Self::Id;
    fn operations(&self) -> &[Self::Operation];

    /// The statically resolved successors. Edges whose target could not be
    /// resolved are not listed.
    fn successors(&self) -> &[Self::Id];
}

pub trait ControlFlowGraph {
    type Block: CfgBlock;

    /// All blocks in a stable order. The position of a block in this slice is
    /// its dense index, see [`ControlFlowGraph::index_of`].
    fn blocks(&self) -> &[Self::Block];

    fn index_of(&self, id: BlockIdOf<Self>) -> Option<usize>;

    fn block(&self, id: BlockIdOf<Self>) -> Option<&Self::Block> {
        self.index_of(id).map(|idx| &self.blocks()[idx])
    }

    fn contains(&self, id: BlockIdOf<Self>) -> bool {
        self.index_of(id).is_some()
    }
}

pub type BlockIdOf<Cfg> = <<Cfg as ControlFlowGraph>::Block as CfgBlock>::Id;
pub type OperationOf<Cfg> = <<Cfg as ControlFlowGraph>::Block as CfgBlock>::Operation;

/// A program point: the position of an operation inside a block. Rendered as
/// `"<block>:<index>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpPos<Id> {
    pub block_id: Id,
    pub op_id: usize,
}

impl<Id> OpPos<Id> {
    pub fn new(block_id: Id, op_id: usize) -> Self {
        Self { block_id, op_id }
    }
}

impl<Id: Display> Display for OpPos<Id> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.block_id, self.op_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpPosParseError<E> {
    #[error("program point {0:?} has no ':' separator")]
    MissingSeparator(String),
    #[error("invalid block id in program point: {0}")]
    Block(E),
    #[error("invalid operation index in program point {0:?}")]
    Index(String),
}

impl<Id: FromStr> FromStr for OpPos<Id> {
    type Err = OpPosParseError<Id::Err>;

    /// Splits on the first `:`. The block part is handed to the block id
    /// parser unchanged, so ids with their own inner structure round-trip.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((block, op)) = s.split_once(':') else {
            return Err(OpPosParseError::MissingSeparator(s.to_owned()));
        };
        let block_id = block.parse().map_err(OpPosParseError::Block)?;
        let op_id = op
            .parse()
            .map_err(|_| OpPosParseError::Index(s.to_owned()))?;
        Ok(Self { block_id, op_id })
    }
}

/// Blocks reachable from `entry` following [`CfgBlock::successors`], as a
/// bit set over the dense block indices.
pub fn reachable_from<Cfg: ControlFlowGraph>(cfg: &Cfg, entry: BlockIdOf<Cfg>) -> FixedBitSet {
    let mut visited = FixedBitSet::with_capacity(cfg.blocks().len());
    let mut stack = vec![entry];
    while let Some(current) = stack.pop() {
        let Some(idx) = cfg.index_of(current) else {
            continue;
        };
        if visited.put(idx) {
            continue;
        }
        stack.extend(cfg.blocks()[idx].successors().iter().copied());
    }
    visited
}

pub fn print<Cfg, OpPrinter>(cfg: &Cfg, printer: OpPrinter) -> String
where
    Cfg: ControlFlowGraph,
    OpPrinter: Fn(&OperationOf<Cfg>) -> String,
{
    let mut output = "digraph CFG {\n".to_owned();
    for block in cfg.blocks() {
        write!(output, "  Node_{}[label=\"", block.id()).unwrap();
        let text: Vec<_> = block.operations().iter().map(&printer).collect();
        output.push_str(&text.join("\\n"));
        output.push_str("\"]\n");
    }
    output.push('\n');
    for block in cfg.blocks() {
        for next in block.successors() {
            writeln!(output, "  Node_{} -> Node_{}", block.id(), next).unwrap();
        }
    }
    output.push_str("}\n");
    output
}
