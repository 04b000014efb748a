//! The default block scheduler.
//!
//! Bottom-up engine with everything switched on: aggressive bypass with the
//! late-bypass fallback rung, commutative-operand swapping, and renaming
//! when the controller supplies a renamer.  The name is historical; the
//! small moves "swim up" past the bubbles the big operations leave behind.

use crate::ddg::{Cycle, Ddg, Scope};
use crate::error::ScheduleError;
use crate::resources::ResourceManager;

use super::bottom_up::BuEngine;
use super::{BlockContext, BlockPass, EngineOptions};

pub struct BubbleFishScheduler {
    pub options: EngineOptions,
}

impl BubbleFishScheduler {
    pub fn new(mut options: EngineOptions) -> Self {
        options.swap_operands = true;
        options.late_bypass = true;
        BubbleFishScheduler { options }
    }
}

impl BlockPass for BubbleFishScheduler {
    fn schedule(
        &mut self,
        ddg: &mut Ddg,
        scope: Scope,
        rm: &mut ResourceManager<'_>,
        ctx: &mut BlockContext<'_, '_>,
        test_only: bool,
    ) -> Result<Cycle, ScheduleError> {
        let mut opts = self.options;
        if test_only {
            opts.bypass = false;
            opts.kill_dead_results = false;
            opts.rename_registers = false;
            opts.swap_operands = false;
        }
        BuEngine::new(ddg, scope, rm, ctx, opts).run()
    }

    fn name(&self) -> &'static str {
        "bubble-fish"
    }
}
