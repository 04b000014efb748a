use thiserror::Error;

use crate::InstrRef;

/// Violations of the documented program-representation invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("block {block}: control-flow move is not in the last instruction")]
    ControlFlowNotLast { block: usize },
    #[error("block {block}: jump target {reference} does not resolve")]
    UnresolvedRef { block: usize, reference: InstrRef },
    #[error("block {block}: fall-through off the end of the procedure")]
    FallThroughOffEnd { block: usize },
    #[error("procedure has no basic blocks")]
    EmptyProcedure,
}
