use analysis::AnalysisError;

use crate::ir::{BlockId, BlockKind};

/// Problems with the input program. These are bugs of whoever built the
/// control flow graph and always abort the analysis.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CfgError {
    #[error("unknown opcode {0:?}")]
    UnknownOpcode(String),

    #[error("malformed block id {0:?}")]
    MalformedBlockId(String),

    #[error("malformed program point {0:?}")]
    MalformedProgramPoint(String),

    #[error("block {0} is defined more than once")]
    DuplicateBlock(BlockId),

    #[error("block {from} has an edge to {to}, which is not defined")]
    DanglingEdge { from: BlockId, to: BlockId },

    #[error("{kind:?} block {block} {reason}")]
    InvalidBlockShape {
        block: BlockId,
        kind: BlockKind,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cfg(#[from] CfgError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError<BlockId>),
}

pub type Result<T> = core::result::Result<T, Error>;
