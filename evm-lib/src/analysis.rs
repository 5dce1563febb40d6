//! The analyses over EVM control flow graphs, and the pipelines chaining
//! them.
//!
//! A memory run needs three fixpoints, each reading the results of the
//! previous ones:
//! 1. [`slots_analysis`] finds the allocations made through the free memory
//!    pointer,
//! 2. [`offset_analysis`] follows small constants through the stack,
//! 3. [`memory_analysis`] combines both into (allocation, offset) addresses
//!    and records every memory access.
//!
//! The recorded accesses are then classified into live and dead writes.

use std::collections::BTreeMap;

use analysis::cfg::{CfgBlock, ControlFlowGraph, reachable_from};
use analysis::solvers::Analysis;
use log::{debug, info};

use crate::accesses::{AccessSet, StoreReport};
use crate::error::Result;
use crate::ir::{BlockId, Cfg, ProgramPoint};
use crate::optimizer::OptimizationSummary;

use memory_analysis::{MemoryContext, MemoryState};
use offset_analysis::{OffsetState, OffsetTarget};
use slots_analysis::{SlotId, SlotsContext, SlotsState};

pub mod memory_analysis;
pub mod offset_analysis;
pub mod slots_analysis;

/// The memory word holding the free memory pointer in compiled code.
pub const FREE_MEMORY_POINTER: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Log every processed instruction at debug level, and dump the
    /// recorded accesses.
    pub debug: bool,
    /// Block visits allowed per block of the CFG before giving up. Zero
    /// means no limit.
    pub node_limit: usize,
    pub entry: BlockId,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            debug: false,
            node_limit: 0,
            entry: BlockId::new(0),
        }
    }
}

/// State shared by the analyses of a single run.
#[derive(Debug, Default)]
pub struct AnalysisContext {
    debug: bool,
    next_slot: u32,
    fresh_slots: BTreeMap<ProgramPoint, SlotId>,
}

impl AnalysisContext {
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            ..Self::default()
        }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    /// The allocation created at `pos`. Asking again for the same program
    /// point returns the same slot.
    pub fn fresh_slot(&mut self, pos: ProgramPoint) -> SlotId {
        let next = &mut self.next_slot;
        *self.fresh_slots.entry(pos).or_insert_with(|| {
            let slot = SlotId(*next);
            *next += 1;
            slot
        })
    }

    pub fn allocated_slots(&self) -> &BTreeMap<ProgramPoint, SlotId> {
        &self.fresh_slots
    }
}

pub struct MemoryAnalysisResult<'cfg> {
    pub context: AnalysisContext,
    pub slots: Analysis<'cfg, Cfg, SlotsState>,
    pub offsets: Analysis<'cfg, Cfg, OffsetState>,
    pub memory: Analysis<'cfg, Cfg, MemoryState>,
    pub accesses: AccessSet,
    pub reports: Vec<StoreReport>,
    pub summary: OptimizationSummary<'cfg>,
}

impl MemoryAnalysisResult<'_> {
    pub fn dead_writes(&self) -> impl Iterator<Item = &StoreReport> {
        self.reports.iter().filter(|report| report.is_dead())
    }
}

pub struct StorageAnalysisResult<'cfg> {
    pub offsets: Analysis<'cfg, Cfg, OffsetState>,
    pub accesses: AccessSet,
    pub summary: OptimizationSummary<'cfg>,
}

fn dump_accesses(cfg: &Cfg, accesses: &AccessSet) {
    debug!("{accesses}");
    for block in cfg.blocks() {
        for line in accesses.cfg_info(block.id()) {
            debug!("  {}: {line}", block.id());
        }
    }
}

/// Finds the memory accesses of `cfg` and classifies its memory writes.
pub fn perform_memory_analysis(cfg: &Cfg, config: AnalysisConfig) -> Result<MemoryAnalysisResult<'_>> {
    info!(
        "Memory analysis of {} blocks started, {} reachable from {}",
        cfg.blocks().len(),
        reachable_from(cfg, config.entry).count_ones(..),
        config.entry
    );
    let mut context = AnalysisContext::new(config.debug);
    let mut accesses = AccessSet::default();

    let mut slots = Analysis::new(cfg, config.entry, SlotsState::default())?
        .with_debug(config.debug)
        .with_node_limit(config.node_limit);
    slots.analyze(&mut SlotsContext {
        analysis: &mut context,
        accesses: &mut accesses,
    })?;
    info!(
        "Slots analysis finished, {} allocations",
        context.allocated_slots().len()
    );

    let mut offsets = Analysis::new(cfg, config.entry, OffsetState::new(OffsetTarget::Memory))?
        .with_debug(config.debug)
        .with_node_limit(config.node_limit);
    offsets.analyze(&mut None)?;

    let mut memory = Analysis::new(cfg, config.entry, MemoryState::default())?
        .with_debug(config.debug)
        .with_node_limit(config.node_limit);
    memory.analyze(&mut MemoryContext {
        slots: &slots,
        offsets: &offsets,
        accesses: &mut accesses,
    })?;
    info!(
        "Memory analysis finished, {} reads and {} writes recorded",
        accesses.reads().len(),
        accesses.writes().len()
    );
    if context.debug() {
        dump_accesses(cfg, &accesses);
    }

    let reports = accesses.process_free_mstores(cfg);

    let mut summary = OptimizationSummary::new(cfg);
    summary.process_memory_accesses(&accesses);
    summary.add_dead_writes(&reports);
    summary.process_constancy(&offsets);

    Ok(MemoryAnalysisResult {
        context,
        slots,
        offsets,
        memory,
        accesses,
        reports,
        summary,
    })
}

/// Finds the storage keys of `cfg` and relates its storage accesses.
pub fn perform_storage_analysis(cfg: &Cfg, config: AnalysisConfig) -> Result<StorageAnalysisResult<'_>> {
    info!("Storage analysis of {} blocks started", cfg.blocks().len());
    let mut accesses = AccessSet::default();

    let mut offsets = Analysis::new(cfg, config.entry, OffsetState::new(OffsetTarget::Storage))?
        .with_debug(config.debug)
        .with_node_limit(config.node_limit);
    offsets.analyze(&mut Some(&mut accesses))?;
    info!(
        "Storage analysis finished, {} reads and {} writes recorded",
        accesses.reads().len(),
        accesses.writes().len()
    );
    if config.debug {
        dump_accesses(cfg, &accesses);
    }

    let mut summary = OptimizationSummary::new(cfg);
    summary.process_storage_accesses(&accesses);
    summary.process_constancy(&offsets);

    Ok(StorageAnalysisResult {
        offsets,
        accesses,
        summary,
    })
}




#[cfg(test)]
mod pipeline_tests;
