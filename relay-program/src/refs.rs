use std::fmt;

use rustc_hash::FxHashMap;

/// Position of an instruction: block index within the procedure, instruction
/// index within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrLoc {
    pub block: usize,
    pub index: usize,
}

/// A stable handle to an instruction, used as a jump target.
///
/// The handle survives the scheduler rewriting the instructions of a block;
/// whoever replaces instructions must forward the handles it invalidates (see
/// [`InstructionRefManager::retarget_block`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrRef(pub u32);

impl fmt::Display for InstrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Owner of all outstanding instruction references of one procedure.
#[derive(Debug, Default, Clone)]
pub struct InstructionRefManager {
    targets: FxHashMap<InstrRef, InstrLoc>,
    next: u32,
}

impl InstructionRefManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_ref(&mut self, loc: InstrLoc) -> InstrRef {
        let r = InstrRef(self.next);
        self.next += 1;
        self.targets.insert(r, loc);
        r
    }

    pub fn resolve(&self, r: InstrRef) -> Option<InstrLoc> {
        self.targets.get(&r).copied()
    }

    pub fn redirect(&mut self, r: InstrRef, loc: InstrLoc) {
        self.targets.insert(r, loc);
    }

    /// Forwards every reference into `block` to the block's (new) first
    /// instruction.  Called after a block's instructions are replaced by a
    /// fresh schedule: jump targets within a block are always its entry.
    pub fn retarget_block(&mut self, block: usize) {
        for loc in self.targets.values_mut() {
            if loc.block == block {
                loc.index = 0;
            }
        }
    }

    /// Forwards every reference to `from` so it points at `to`.  Used when a
    /// block gains a predecessor that must now be entered first (e.g. a loop
    /// prolog).
    pub fn retarget_refs(&mut self, from: usize, to: usize) {
        for loc in self.targets.values_mut() {
            if loc.block == from {
                loc.block = to;
                loc.index = 0;
            }
        }
    }

    /// Rewrites block indices after blocks have been inserted or removed;
    /// `map` returns the new index for each old one.
    pub fn renumber_blocks(&mut self, map: impl Fn(usize) -> usize) {
        for loc in self.targets.values_mut() {
            loc.block = map(loc.block);
        }
    }

    pub fn refs_into(&self, block: usize) -> impl Iterator<Item = InstrRef> + '_ {
        self.targets
            .iter()
            .filter(move |(_, loc)| loc.block == block)
            .map(|(r, _)| *r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_follow_replacement() {
        let mut irm = InstructionRefManager::new();
        let r = irm.make_ref(InstrLoc { block: 2, index: 5 });
        irm.retarget_block(2);
        assert_eq!(irm.resolve(r), Some(InstrLoc { block: 2, index: 0 }));

        irm.retarget_refs(2, 7);
        assert_eq!(irm.resolve(r), Some(InstrLoc { block: 7, index: 0 }));
    }
}
