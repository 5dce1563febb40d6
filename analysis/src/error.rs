use core::fmt::{Debug, Display};

/// Configuration errors of a fixpoint run. Precision losses are never
/// reported through this type, they are part of the abstract states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError<Id: Debug + Display> {
    #[error("entry block {0} is not part of the control flow graph")]
    MissingEntryBlock(Id),

    #[error("block {from} has an edge to {to}, which is not part of the control flow graph")]
    MissingSuccessor { from: Id, to: Id },

    #[error("block {0} was never reached by the analysis")]
    UnknownBlock(Id),

    #[error("no state at index {index} of block {block}, which has {len} operations")]
    InstructionOutOfRange { block: Id, index: isize, len: usize },

    #[error("analysis did not converge after processing {processed} blocks")]
    NoConvergence { processed: usize },
}
