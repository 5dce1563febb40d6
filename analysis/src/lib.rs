//! This crate contains the building blocks of a block-structured
//! [abstract interpreter](https://en.wikipedia.org/wiki/Abstract_interpretation):
//! a minimal control flow graph interface, the lattice contract abstract
//! states have to satisfy, and a worklist solver computing a fixpoint over
//! the blocks reachable from an entry block.
//!
//! The solver is oblivious of the analysed language. Domains receive every
//! operation together with its program point and a caller supplied context,
//! which is how they report side facts (like the memory accesses they
//! observed) while the fixpoint is computed.
//!
//! Look at the evm-lib crate for an example how to define analyses using
//! the helpers in this crate.
//!
//! Some resources to learn more about abstract interpretation:
//! * [Static Program Analysis, Anders Møller and Michael I. Schwartzbach](https://cs.au.dk/~amoeller/spa/)
//! * [Introduction to Static Analysis, Xavier Rival and Kwangkeun Yi](https://mitpress.mit.edu/9780262043410/introduction-to-static-analysis/)
//! * [Data flow analysis: an informal introduction](https://clang.llvm.org/docs/DataFlowAnalysisIntro.html)

/// Trait for defining a control flow graph, program points, and some
/// algorithms to make it easier to work with them.
pub mod cfg;

/// The lattice contract of abstract states, and a couple of small lattices.
pub mod domains;

pub mod error;

/// Implementation of the worklist fixpoint iteration.
pub mod solvers;

pub use error::AnalysisError;

#[cfg(test)]
mod cfg_tests;
