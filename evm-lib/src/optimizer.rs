//! Turns the results of the access analyses into per-block facts an
//! optimizer can act on.

use core::fmt::Display;
use std::collections::{BTreeMap, BTreeSet};

use analysis::cfg::{CfgBlock, ControlFlowGraph, OpPos};
use analysis::solvers::Analysis;
use itertools::Itertools;
use log::debug;

use crate::accesses::{AccessSet, Relation, StoreReport, relation_of_sets};
use crate::analysis::offset_analysis::{OffsetState, OffsetTarget};
use crate::ir::{BlockId, Cfg, ProgramPoint};
use crate::opcodes::Opcode;

pub type AccessPair = (ProgramPoint, ProgramPoint);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOptimizationInfo {
    pub memory_equal: BTreeSet<AccessPair>,
    pub memory_nonequal: BTreeSet<AccessPair>,
    pub storage_equal: BTreeSet<AccessPair>,
    pub storage_nonequal: BTreeSet<AccessPair>,
    pub dead_writes: BTreeSet<ProgramPoint>,
    pub constant_addresses: BTreeMap<ProgramPoint, u64>,
}

impl BlockOptimizationInfo {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn ordered(lhs: ProgramPoint, rhs: ProgramPoint) -> AccessPair {
    if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) }
}

/// Compares every write of a block with every other access of the same block.
fn relate_accesses(
    accesses: &AccessSet,
    block: BlockId,
    equal: &mut BTreeSet<AccessPair>,
    nonequal: &mut BTreeSet<AccessPair>,
) {
    let others = accesses
        .reads_in_block(block)
        .chain(accesses.writes_in_block(block))
        .collect_vec();
    for (write, written) in accesses.writes_in_block(block) {
        for (other, tokens) in &others {
            if *other == write {
                continue;
            }
            match relation_of_sets(written, tokens) {
                Relation::Equal => {
                    equal.insert(ordered(*write, **other));
                }
                Relation::NotEqual => {
                    nonequal.insert(ordered(*write, **other));
                }
                Relation::Unknown => {}
            }
        }
    }
}

/// Optimization facts for every block of a CFG.
pub struct OptimizationSummary<'cfg> {
    cfg: &'cfg Cfg,
    blocks: BTreeMap<BlockId, BlockOptimizationInfo>,
}

impl<'cfg> OptimizationSummary<'cfg> {
    pub fn new(cfg: &'cfg Cfg) -> Self {
        let blocks = cfg
            .blocks()
            .iter()
            .map(|block| (block.id(), BlockOptimizationInfo::default()))
            .collect();
        Self { cfg, blocks }
    }

    pub fn cfg(&self) -> &'cfg Cfg {
        self.cfg
    }

    pub fn block(&self, id: BlockId) -> Option<&BlockOptimizationInfo> {
        self.blocks.get(&id)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&BlockId, &BlockOptimizationInfo)> {
        self.blocks.iter()
    }

    pub fn process_memory_accesses(&mut self, accesses: &AccessSet) {
        for (&id, info) in &mut self.blocks {
            relate_accesses(accesses, id, &mut info.memory_equal, &mut info.memory_nonequal);
        }
    }

    pub fn process_storage_accesses(&mut self, accesses: &AccessSet) {
        for (&id, info) in &mut self.blocks {
            relate_accesses(accesses, id, &mut info.storage_equal, &mut info.storage_nonequal);
        }
    }

    pub fn add_dead_writes(&mut self, reports: &[StoreReport]) {
        for report in reports.iter().filter(|report| report.is_dead()) {
            if let Some(info) = self.blocks.get_mut(&report.point.block_id) {
                info.dead_writes.insert(report.point);
            }
        }
    }

    /// Records the accesses whose address is a single known constant before
    /// the instruction executes. Memory runs look at MLOAD/MSTORE, storage
    /// runs at SLOAD/SSTORE.
    pub fn process_constancy(&mut self, offsets: &Analysis<'_, Cfg, OffsetState>) {
        let cfg = self.cfg;
        for (id, info) in &mut self.blocks {
            let Some(block) = cfg.get(*id) else {
                continue;
            };
            for (op_id, op) in block.instructions().iter().enumerate() {
                let pos = OpPos::new(*id, op_id);
                let Ok(state) = offsets.state_before(pos) else {
                    continue;
                };
                let relevant = match state.target() {
                    OffsetTarget::Memory => matches!(op.opcode(), Opcode::MLoad | Opcode::MStore),
                    OffsetTarget::Storage => matches!(op.opcode(), Opcode::SLoad | Opcode::SStore),
                };
                if !relevant {
                    continue;
                }
                if let Some(address) = state.from_top(0).and_then(|offsets| offsets.as_constant()) {
                    debug!("{pos}: {op} accesses constant address {address}");
                    info.constant_addresses.insert(pos, address);
                }
            }
        }
    }
}

impl Display for OptimizationSummary<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        fn pairs(
            f: &mut core::fmt::Formatter<'_>,
            title: &str,
            pairs: &BTreeSet<AccessPair>,
        ) -> core::fmt::Result {
            if pairs.is_empty() {
                return Ok(());
            }
            writeln!(
                f,
                "  {title}: {}",
                pairs.iter().map(|(lhs, rhs)| format!("({lhs}, {rhs})")).join(" ")
            )
        }

        for (id, info) in self.blocks.iter().filter(|(_, info)| !info.is_empty()) {
            writeln!(f, "Block {id}:")?;
            pairs(f, "memory equal", &info.memory_equal)?;
            pairs(f, "memory non-equal", &info.memory_nonequal)?;
            pairs(f, "storage equal", &info.storage_equal)?;
            pairs(f, "storage non-equal", &info.storage_nonequal)?;
            if !info.dead_writes.is_empty() {
                writeln!(f, "  dead writes: {}", info.dead_writes.iter().join(" "))?;
            }
            if !info.constant_addresses.is_empty() {
                writeln!(
                    f,
                    "  constant addresses: {}",
                    info.constant_addresses
                        .iter()
                        .map(|(pos, address)| format!("{pos}={address}"))
                        .join(" ")
                )?;
            }
        }
        Ok(())
    }
}
