use std::collections::BTreeMap;

use log::{Level, debug, log};

use super::cfg::{BlockIdOf, CfgBlock, ControlFlowGraph, OpPos};
use super::domains::{AbstractDomain, AbstractState};
use super::error::AnalysisError;

pub type AnalysisResult<T, Cfg> = Result<T, AnalysisError<BlockIdOf<Cfg>>>;

/// The analysis information owned by a single block: the state flowing into
/// the block, the state after its last operation, and the state after each
/// operation.
#[derive(Clone, Debug)]
pub struct BlockAnalysisInfo<D> {
    input_state: D,
    output_state: Option<D>,
    state_per_instr: Vec<D>,
}

impl<D: AbstractState> BlockAnalysisInfo<D> {
    pub fn new(input_state: D) -> Self {
        Self {
            input_state,
            output_state: None,
            state_per_instr: Vec::new(),
        }
    }

    pub fn input_state(&self) -> &D {
        &self.input_state
    }

    /// `None` until the block has been processed at least once.
    pub fn output_state(&self) -> Option<&D> {
        self.output_state.as_ref()
    }

    /// The state after the operation at `pos`.
    pub fn state_at_instr(&self, pos: usize) -> Option<&D> {
        self.state_per_instr.get(pos)
    }

    pub fn states(&self) -> &[D] {
        &self.state_per_instr
    }

    /// Merge a new incoming state. Returns whether the block needs to be
    /// processed again. The per-operation trace is dropped when the input
    /// grows, it is rebuilt by the next [`BlockAnalysisInfo::process_block`].
    pub fn revisit_block(&mut self, incoming: &D) -> bool {
        if incoming.leq(&self.input_state) {
            return false;
        }
        self.input_state = self.input_state.lub(incoming);
        self.state_per_instr.clear();
        true
    }

    /// Replay every operation of `block` starting from the input state.
    pub fn process_block<Cfg>(&mut self, block: &Cfg::Block, ctx: &mut D::Context<'_>, debug: bool)
    where
        Cfg: ControlFlowGraph,
        D: AbstractDomain<Cfg>,
    {
        let level = if debug { Level::Debug } else { Level::Trace };
        log!(level, "Processing {} :: {:?}", block.id(), self.input_state);

        self.state_per_instr.clear();
        let mut current = self.input_state.clone();
        for (op_id, op) in block.operations().iter().enumerate() {
            let pos = OpPos::new(block.id(), op_id);
            current = current.process_instruction(op, pos, ctx);
            log!(level, "      -- {pos} {op:?} -- {current:?}");
            self.state_per_instr.push(current.clone());
        }
        self.output_state = Some(current);
    }
}

/// Replays a block without touching any stored information.
fn replay<Cfg, D>(block: &Cfg::Block, input: &D, ctx: &mut D::Context<'_>) -> D
where
    Cfg: ControlFlowGraph,
    D: AbstractDomain<Cfg>,
{
    let mut current = input.clone();
    for (op_id, op) in block.operations().iter().enumerate() {
        current = current.process_instruction(op, OpPos::new(block.id(), op_id), ctx);
    }
    current
}

/// A worklist solver computing, for every block reachable from the entry,
/// an input state that is stable under joining the output states of its
/// predecessors.
///
/// The worklist is a stack, so the most recently queued block is processed
/// next. Blocks are created lazily the first time an edge reaches them, with
/// the output state of that predecessor as their input state.
///
/// Requirements:
/// * [`AbstractState::lub`] is monotone and the domain has finite height
///   (or saturates), otherwise the solver relies on the node limit.
pub struct Analysis<'cfg, Cfg: ControlFlowGraph, D> {
    cfg: &'cfg Cfg,
    entry: BlockIdOf<Cfg>,
    pending: Vec<BlockIdOf<Cfg>>,
    blocks_info: BTreeMap<BlockIdOf<Cfg>, BlockAnalysisInfo<D>>,
    debug: bool,
    node_limit: usize,
    processed: usize,
}

impl<'cfg, Cfg, D> Analysis<'cfg, Cfg, D>
where
    Cfg: ControlFlowGraph,
    D: AbstractState,
{
    pub fn new(cfg: &'cfg Cfg, entry: BlockIdOf<Cfg>, initial_state: D) -> AnalysisResult<Self, Cfg> {
        if !cfg.contains(entry) {
            return Err(AnalysisError::MissingEntryBlock(entry));
        }
        let mut blocks_info = BTreeMap::new();
        blocks_info.insert(entry, BlockAnalysisInfo::new(initial_state));
        Ok(Self {
            cfg,
            entry,
            pending: vec![entry],
            blocks_info,
            debug: false,
            node_limit: 0,
            processed: 0,
        })
    }

    /// Log every processed operation at debug level instead of trace level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the approximate iteration limit per block. When the limit is
    /// reached, [`Analysis::analyze`] fails with
    /// [`AnalysisError::NoConvergence`]. Zero disables the limit.
    pub fn with_node_limit(mut self, node_limit: usize) -> Self {
        self.node_limit = node_limit;
        self
    }

    pub fn cfg(&self) -> &'cfg Cfg {
        self.cfg
    }

    pub fn entry(&self) -> BlockIdOf<Cfg> {
        self.entry
    }

    /// Number of block visits performed so far, revisits included.
    pub fn processed_blocks(&self) -> usize {
        self.processed
    }

    pub fn get_block_results(&self, block_id: BlockIdOf<Cfg>) -> Option<&BlockAnalysisInfo<D>> {
        self.blocks_info.get(&block_id)
    }

    /// All blocks reached so far, ordered by id.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockIdOf<Cfg>, &BlockAnalysisInfo<D>)> {
        self.blocks_info.iter().map(|(&id, info)| (id, info))
    }

    /// The state after the operation at `pos.op_id + relative` of the block
    /// `pos.block_id`.
    pub fn get_analysis_results(
        &self,
        pos: OpPos<BlockIdOf<Cfg>>,
        relative: isize,
    ) -> AnalysisResult<&D, Cfg> {
        let info = self
            .blocks_info
            .get(&pos.block_id)
            .ok_or(AnalysisError::UnknownBlock(pos.block_id))?;
        let index = pos.op_id as isize + relative;
        usize::try_from(index)
            .ok()
            .and_then(|idx| info.state_at_instr(idx))
            .ok_or(AnalysisError::InstructionOutOfRange {
                block: pos.block_id,
                index,
                len: info.states().len(),
            })
    }

    /// The state right before the operation at `pos`. For the first operation
    /// of a block this is the input state of the block.
    pub fn state_before(&self, pos: OpPos<BlockIdOf<Cfg>>) -> AnalysisResult<&D, Cfg> {
        if pos.op_id == 0 {
            return self
                .blocks_info
                .get(&pos.block_id)
                .map(BlockAnalysisInfo::input_state)
                .ok_or(AnalysisError::UnknownBlock(pos.block_id));
        }
        self.get_analysis_results(pos, -1)
    }
}

impl<'cfg, Cfg, D> Analysis<'cfg, Cfg, D>
where
    Cfg: ControlFlowGraph,
    D: AbstractDomain<Cfg>,
{
    /// Run the worklist until no block needs to be processed again.
    pub fn analyze(&mut self, ctx: &mut D::Context<'_>) -> AnalysisResult<(), Cfg> {
        let cfg = self.cfg;
        let limit = self.node_limit * cfg.blocks().len();
        while let Some(block_id) = self.pending.pop() {
            if limit > 0 && self.processed >= limit {
                return Err(AnalysisError::NoConvergence {
                    processed: self.processed,
                });
            }

            let block = cfg
                .block(block_id)
                .ok_or(AnalysisError::UnknownBlock(block_id))?;
            let info = self
                .blocks_info
                .get_mut(&block_id)
                .ok_or(AnalysisError::UnknownBlock(block_id))?;
            info.process_block::<Cfg>(block, ctx, self.debug);
            self.processed += 1;

            if let Some(output) = info.output_state().cloned() {
                self.process_jumps(block, &output)?;
            }
        }
        debug!(
            "Fixpoint reached after {} block visits over {} blocks",
            self.processed,
            self.blocks_info.len()
        );
        Ok(())
    }

    fn process_jumps(&mut self, block: &Cfg::Block, output: &D) -> AnalysisResult<(), Cfg> {
        for &succ in block.successors() {
            if !self.cfg.contains(succ) {
                return Err(AnalysisError::MissingSuccessor {
                    from: block.id(),
                    to: succ,
                });
            }
            match self.blocks_info.get_mut(&succ) {
                None => {
                    self.blocks_info
                        .insert(succ, BlockAnalysisInfo::new(output.clone()));
                    self.pending.push(succ);
                }
                Some(info) => {
                    if info.revisit_block(output) {
                        debug!("Revisiting block {succ} from {}", block.id());
                        self.pending.push(succ);
                    }
                }
            }
        }
        Ok(())
    }

    /// Check that one more round over every reached block would not change
    /// any input state.
    pub fn is_fixpoint(&self, ctx: &mut D::Context<'_>) -> bool {
        self.blocks_info.iter().all(|(&id, info)| {
            let Some(block) = self.cfg.block(id) else {
                return false;
            };
            let output = replay::<Cfg, D>(block, info.input_state(), ctx);
            block.successors().iter().all(|succ| {
                self.blocks_info
                    .get(succ)
                    .is_some_and(|succ_info| output.leq(succ_info.input_state()))
            })
        })
    }
}
