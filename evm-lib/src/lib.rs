//! Memory and storage access analyses over disassembled EVM bytecode, built
//! on the fixpoint engine of the `analysis` crate.
//!
//! The entry points are [`perform_memory_analysis`](crate::analysis::perform_memory_analysis) and
//! [`perform_storage_analysis`](crate::analysis::perform_storage_analysis).

pub mod accesses;
pub mod analysis;
pub mod error;
pub mod ir;
pub mod opcodes;
pub mod optimizer;


#[cfg(test)]
mod ir_tests;

#[cfg(test)]
mod opcodes_tests;
