//! Program representation for exposed-datapath targets.
//!
//! A procedure is an ordered list of basic blocks; a basic block is an
//! ordered list of instructions; an instruction is the set of moves issued in
//! one cycle, each on its own bus.  Jump targets are held behind the
//! [`InstructionRefManager`] so they survive the scheduler replacing every
//! instruction of a block.

mod basic_block;
mod cfg;
mod error;
mod interpass;
mod moves;
mod refs;
mod terminal;

pub use basic_block::{BasicBlock, Instruction, Procedure};
pub use cfg::{CfgEdge, ControlFlowGraph, CfgNode};
pub use error::ProgramError;
pub use interpass::{keys, Datum, InterPassData};
pub use moves::Move;
pub use refs::{InstrLoc, InstrRef, InstructionRefManager};
pub use terminal::{Guard, OpRef, Register, Terminal};
