use thiserror::Error;

use relay_machine::MachineError;
use relay_program::ProgramError;

/// Failures that cross the scheduler's public boundary.
///
/// Resource exhaustion never appears here: inside the per-operation state
/// machine it is a return value and a retry, not an error.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No chain of scratch register files bridges a move's source and
    /// destination.  Fatal for the basic block.
    #[error("no connectivity, direct or through scratch registers, for move '{mv}' in block {block}")]
    ConnectivityUnsatisfiable { block: usize, mv: String },

    /// The machine cannot execute a representable program at all.
    #[error(transparent)]
    IllegalMachine(#[from] MachineError),

    /// A constant needs a long-immediate unit the machine does not have.
    #[error("immediate {value} in move '{mv}' needs a long-immediate unit, and the machine has none")]
    NoLongImmediateUnit { value: i64, mv: String },

    /// The input violates a documented representation invariant.
    #[error(transparent)]
    InvalidInput(#[from] ProgramError),

    /// An operation could not be placed after exhausting every retry.  The
    /// recommended recovery is to re-run with bypassing disabled.
    #[error("scheduling failed in block {block}: {detail}")]
    SchedulingFailed { block: usize, detail: String },
}
