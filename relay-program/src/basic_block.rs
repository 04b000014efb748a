use std::fmt;

use crate::Move;

/// The set of moves issued in one cycle.  Distinct buses per move is a
/// schedule invariant, not a structural one; an unscheduled block may hold
/// one move per instruction with no bus at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instruction {
    pub moves: Vec<Move>,
}

impl Instruction {
    pub fn new(moves: Vec<Move>) -> Instruction {
        Instruction { moves }
    }

    pub fn of(m: Move) -> Instruction {
        Instruction { moves: vec![m] }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for m in &self.moves {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{m}")?;
            first = false;
        }
        Ok(())
    }
}

/// A maximal straight-line region.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
    /// Known iteration count, when this block is the body of a counted loop.
    pub trip_count: Option<u32>,
}

impl BasicBlock {
    pub fn new(instructions: Vec<Instruction>) -> BasicBlock {
        BasicBlock {
            instructions,
            trip_count: None,
        }
    }

    /// One move per instruction, in program order.  The usual shape of an
    /// unscheduled block.
    pub fn from_moves(moves: Vec<Move>) -> BasicBlock {
        BasicBlock::new(moves.into_iter().map(Instruction::of).collect())
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn move_count(&self) -> usize {
        self.instructions.iter().map(|i| i.moves.len()).sum()
    }

    pub fn moves(&self) -> impl Iterator<Item = &Move> {
        self.instructions.iter().flat_map(|i| i.moves.iter())
    }

    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

/// An ordered sequence of basic blocks; block 0 is the entry.
#[derive(Debug, Clone, Default)]
pub struct Procedure {
    pub name: String,
    pub blocks: Vec<BasicBlock>,
}

impl Procedure {
    pub fn new(name: impl Into<String>, blocks: Vec<BasicBlock>) -> Procedure {
        Procedure {
            name: name.into(),
            blocks,
        }
    }

    pub fn move_count(&self) -> usize {
        self.blocks.iter().map(|b| b.move_count()).sum()
    }
}
