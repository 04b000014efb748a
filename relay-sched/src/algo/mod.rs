//! The block-scheduling algorithms.
//!
//! Every variant satisfies one contract: given a scoped dependence graph and
//! a resource manager, place every move of the block and report the schedule
//! span.  The controller picks the variant from the options; the bottom-up
//! engine carries the shared machinery for the two bottom-up variants.

mod bottom_up;
mod bubble_fish;
pub mod pipeline;
mod top_down;

pub use bottom_up::BottomUpScheduler;
pub use bubble_fish::BubbleFishScheduler;
pub use top_down::TopDownScheduler;

use relay_machine::{Connectivity, Machine};
use relay_program::Register;

use crate::ddg::{Cycle, Ddg, Scope};
use crate::error::ScheduleError;
use crate::renamer::RegisterRenamer;
use crate::resources::ResourceManager;

/// Per-run knobs the engine cares about, distilled from the public options.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub bypass: bool,
    pub bypass_distance: Cycle,
    pub kill_dead_results: bool,
    pub rename_registers: bool,
    /// Swap commutative operands so the better producer triggers.
    pub swap_operands: bool,
    /// Retry a result placement later when its consumers were bypassed.
    pub late_bypass: bool,
}

/// Everything a block pass needs besides the graph and the table.
pub struct BlockContext<'a, 'm> {
    pub machine: &'m Machine,
    pub conn: &'a Connectivity<'m>,
    /// The reserved scratch register of each bridging register file.
    pub scratch: &'a [Register],
    pub renamer: Option<&'a mut RegisterRenamer<'m>>,
}

/// One scheduling algorithm over one basic block.
pub trait BlockPass {
    /// Places every move of the scoped block.  Returns the schedule span in
    /// cycles.  With `test_only`, optimizations that edit the graph
    /// structure are suppressed so the caller can probe feasibility and
    /// rewind placements afterwards.
    fn schedule(
        &mut self,
        ddg: &mut Ddg,
        scope: Scope,
        rm: &mut ResourceManager<'_>,
        ctx: &mut BlockContext<'_, '_>,
        test_only: bool,
    ) -> Result<Cycle, ScheduleError>;

    fn name(&self) -> &'static str;
}
