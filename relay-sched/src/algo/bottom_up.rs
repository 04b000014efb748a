//! The bottom-up list scheduler.
//!
//! Moves are placed from the end of the block toward its start.  For every
//! program operation the engine runs a retry ladder: place the result reads
//! as late as they fit (bypassing their consumers when allowed), then the
//! trigger, then the remaining operand writes; whenever a stage fails, undo
//! it, weaken one option (bypass, then late bypass, then the result ceiling)
//! and go again.  All graph surgery performed for a failed attempt — merges,
//! renames, temp-copy placements — is rolled back in reverse order.

use rustc_hash::{FxHashMap, FxHashSet};

use relay_program::Terminal;

use crate::copy_adder::{Chain, CopyAdder};
use crate::ddg::{Cycle, Ddg, NodeId, PoId, Scope};
use crate::error::ScheduleError;
use crate::renamer::RenameUndo;
use crate::resources::ResourceManager;
use crate::selector::BuSelector;

use super::{BlockContext, BlockPass, EngineOptions};

/// How many times the operand stage lowers its ceiling before giving the
/// whole attempt back to the result stage.
const OPERAND_RETRIES: u32 = 5;

pub struct BottomUpScheduler {
    pub options: EngineOptions,
}

impl BlockPass for BottomUpScheduler {
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
            // Feasibility probes must leave the graph structurally intact.
            opts.bypass = false;
            opts.kill_dead_results = false;
            opts.rename_registers = false;
        }
        BuEngine::new(ddg, scope, rm, ctx, opts).run()
    }

    fn name(&self) -> &'static str {
        "bottom-up"
    }
}

pub(crate) struct BuEngine<'e, 'a, 'm, 'r> {
    ddg: &'e mut Ddg,
    scope: Scope,
    rm: &'e mut ResourceManager<'r>,
    ctx: &'e mut BlockContext<'a, 'm>,
    opts: EngineOptions,
    ii: u32,
    end_cycle: Cycle,
    /// Producer -> bypassed consumers with their pre-bypass cycles.
    bypassed: FxHashMap<NodeId, Vec<(NodeId, Cycle)>>,
    deps_copied: FxHashSet<NodeId>,
    /// Original move -> its temp-copy chain.
    temp_chains: FxHashMap<NodeId, Chain>,
    dead_results: FxHashSet<NodeId>,
    /// Renames performed for the operation attempt in flight.
    attempt_renames: Vec<RenameUndo>,
    heights: FxHashMap<NodeId, i64>,
}

impl<'e, 'a, 'm, 'r> BuEngine<'e, 'a, 'm, 'r> {
    pub(crate) fn new(
        ddg: &'e mut Ddg,
        scope: Scope,
        rm: &'e mut ResourceManager<'r>,
        ctx: &'e mut BlockContext<'a, 'm>,
        opts: EngineOptions,
    ) -> Self {
        let ii = rm.initiation_interval();
        let end_cycle = rm.max_cycle();
        let heights = ddg.heights(scope);
        BuEngine {
            ddg,
            scope,
            rm,
            ctx,
            opts,
            ii,
            end_cycle,
            bypassed: FxHashMap::default(),
            deps_copied: FxHashSet::default(),
            temp_chains: FxHashMap::default(),
            dead_results: FxHashSet::default(),
            attempt_renames: Vec::new(),
            heights,
        }
    }

    pub(crate) fn run(mut self) -> Result<Cycle, ScheduleError> {
        if self.ddg.nodes_in(self.scope).next().is_none() {
            return Ok(0);
        }
        if let Some(renamer) = self.ctx.renamer.as_deref_mut() {
            renamer.initialize(self.ddg, self.scope);
        }
        let mut selector = BuSelector::new(self.ddg, self.scope, self.ctx.machine);

        while let Some(group) = selector.candidates(self.ddg) {
            match group.po {
                Some(po) => self.schedule_operation(po, &mut selector)?,
                None => {
                    let node = group.nodes[0];
                    if self.ddg.node(node).mv.destination == Terminal::ReturnAddress {
                        if !self.schedule_move(node, self.end_cycle, None)? {
                            return Err(self.failed(node, "return-address write"));
                        }
                    } else {
                        let mut limit = self.end_cycle;
                        let bypassed = self.bypass_node(node, &mut limit)?;
                        let dead = bypassed
                            && self.opts.kill_dead_results
                            && !self.ddg.result_used(self.scope, node);
                        if dead {
                            self.dead_results.insert(node);
                        } else {
                            self.schedule_plain_move(node)?;
                        }
                    }
                    self.finalize(group.nodes[0], &mut selector)?;
                    self.attempt_renames.clear();
                }
            }
        }

        let unscheduled: Vec<NodeId> = self
            .ddg
            .nodes_in(self.scope)
            .filter(|n| !self.ddg.node(*n).is_scheduled())
            .collect();
        if let Some(first) = unscheduled.first() {
            return Err(self.failed(*first, "ready list drained with moves left over"));
        }

        let bypassed: usize = self.bypassed.values().map(Vec::len).sum();
        if bypassed > 0 {
            tracing::debug!("block {}: {} moves bypassed", self.scope.block, bypassed);
        }
        let span = match (self.rm.smallest_cycle(), self.rm.largest_cycle()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        };
        Ok(span)
    }

    fn failed(&self, node: NodeId, detail: &str) -> ScheduleError {
        ScheduleError::SchedulingFailed {
            block: self.scope.block,
            detail: format!("{detail}: {}", self.ddg.node(node).mv),
        }
    }

    // ------------------------------------------------------------------
    // The per-operation state machine.

    fn schedule_operation(
        &mut self,
        po: PoId,
        selector: &mut BuSelector<'_>,
    ) -> Result<(), ScheduleError> {
        let copy_adder = CopyAdder::new(self.ctx.conn, self.ctx.scratch);
        let chains = copy_adder.add_minimum_copies(self.ddg, self.scope, po)?;
        if !chains.is_empty() {
            selector.invalidate_priorities();
            self.temp_chains.extend(chains);
        }
        if self.opts.swap_operands {
            self.try_swap_operands(po);
        }

        let mut results_start = self.end_cycle;
        let mut bypass = self.opts.bypass;
        let mut late_bypass = false;

        loop {
            if results_start < 0 {
                let seed = self
                    .ddg
                    .operation(po)
                    .operands
                    .first()
                    .or(self.ddg.operation(po).results.first())
                    .copied();
                return Err(self.failed(
                    seed.expect("operation has moves"),
                    "no start cycle admits the operation",
                ));
            }

            let results_ok = self.schedule_result_reads(po, results_start, bypass, late_bypass)?;
            if !results_ok {
                self.unwind_results(po)?;
                self.degrade(&mut bypass, &mut late_bypass, &mut results_start);
                continue;
            }

            if self.schedule_operand_writes(po, results_start)? {
                break;
            }
            self.unwind_operands(po);
            self.unwind_results(po)?;
            self.degrade(&mut bypass, &mut late_bypass, &mut results_start);
        }

        let members: Vec<NodeId> = {
            let op = self.ddg.operation(po);
            op.operands.iter().chain(op.results.iter()).copied().collect()
        };
        for n in members {
            if self.ddg.is_alive(n) {
                self.finalize(n, selector)?;
            }
        }
        self.attempt_renames.clear();
        Ok(())
    }

    /// One rung down the retry ladder.
    fn degrade(&mut self, bypass: &mut bool, late_bypass: &mut bool, results_start: &mut Cycle) {
        // Undo heuristics that served only the failed attempt.
        while let Some(undo) = self.attempt_renames.pop() {
            if let Some(renamer) = self.ctx.renamer.as_deref_mut() {
                renamer.undo(self.ddg, undo);
            }
        }
        if *bypass {
            *bypass = false;
            *late_bypass = self.opts.late_bypass;
            if *late_bypass {
                return;
            }
        } else if *late_bypass {
            *late_bypass = false;
            return;
        }
        *results_start -= 1;
        *bypass = self.opts.bypass;
        *late_bypass = false;
    }

    // ------------------------------------------------------------------
    // Results

    /// Places every result read of `po` at or before `cycle`.  Returns false
    /// when some result would not fit; the caller unwinds.
    fn schedule_result_reads(
        &mut self,
        po: PoId,
        cycle: Cycle,
        bypass: bool,
        late_bypass: bool,
    ) -> Result<bool, ScheduleError> {
        let results: Vec<NodeId> = self.ddg.operation(po).results.to_vec();
        let mut local_max = 0;
        for r in results {
            if !self.ddg.is_alive(r) || self.ddg.node(r).is_scheduled() {
                continue;
            }
            if self.dead_results.contains(&r) {
                continue;
            }
            if bypass {
                let mut limit = cycle + self.opts.bypass_distance;
                let all_bypassed = self.bypass_node(r, &mut limit)?;
                local_max = local_max.max(limit);
                if all_bypassed
                    && self.opts.kill_dead_results
                    && !self.ddg.result_used(self.scope, r)
                {
                    self.dead_results.insert(r);
                    continue;
                }
            }

            let mut bound = cycle;
            if let Some(first_hop) = self.schedule_result_temp_moves(r, cycle)? {
                bound = bound.min(first_hop - 1);
            }
            if !self.schedule_move(r, bound, None)? {
                self.undo_bypass(r)?;
                return Ok(false);
            }
            if late_bypass {
                let mut limit = self.ddg.node(r).cycle.expect("just placed")
                    + self.opts.bypass_distance;
                if self.bypass_node(r, &mut limit)? {
                    // The consumers moved; see whether the write slides later
                    // toward them.
                    let original = self.ddg.node(r).cycle.expect("placed");
                    self.unschedule(r);
                    if !self.schedule_move(r, limit.max(cycle), None)? {
                        if !self.schedule_move(r, original, None)? {
                            return Err(self.failed(r, "late-bypass restore"));
                        }
                    }
                }
            }
            local_max = local_max.max(self.ddg.node(r).cycle.expect("placed"));
        }
        Ok(true)
    }

    /// Schedules the temp chain that forwards `result` to its register,
    /// last hop first.  Returns the first hop's cycle, the bound for the
    /// result itself.
    fn schedule_result_temp_moves(
        &mut self,
        result: NodeId,
        bound: Cycle,
    ) -> Result<Option<Cycle>, ScheduleError> {
        let chain = match self.temp_chains.get(&result) {
            Some(c) => c.clone(),
            None => return Ok(None),
        };
        let mut next_bound = bound;
        for hop in chain.iter().rev() {
            if self.ddg.node(*hop).is_scheduled() {
                next_bound = self.ddg.node(*hop).cycle.expect("scheduled") - 1;
                continue;
            }
            if !self.schedule_move(*hop, next_bound, None)? {
                return Ok(Some(Cycle::MIN / 2));
            }
            next_bound = self.ddg.node(*hop).cycle.expect("placed") - 1;
        }
        Ok(Some(next_bound + 1))
    }

    // ------------------------------------------------------------------
    // Operands

    /// Places the trigger, then the remaining operand writes, of `po`.
    fn schedule_operand_writes(&mut self, po: PoId, cycle: Cycle) -> Result<bool, ScheduleError> {
        let operands: Vec<NodeId> = self.ddg.operation(po).operands.to_vec();
        if operands.iter().all(|o| self.ddg.node(*o).is_scheduled()) {
            return Ok(true);
        }
        let mut ceiling = cycle;
        let mut tries = 0;
        while tries < OPERAND_RETRIES && ceiling >= 0 {
            let trigger = self.find_trigger(po);
            let trigger = match trigger {
                Some(t) => t,
                None => {
                    // Ill-formed input: an operation with no trigger write.
                    return Ok(false);
                }
            };
            if !self.ddg.node(trigger).is_scheduled() {
                if !self.schedule_operand(trigger, ceiling, None)? {
                    ceiling -= 1;
                    tries += 1;
                    continue;
                }
                self.ddg.move_fu_dependencies_to_trigger(po, trigger);
                self.retighten_trigger(trigger, ceiling)?;
            }
            let trigger_cycle = self.ddg.node(trigger).cycle.expect("trigger placed");

            let mut all_placed = true;
            for o in operands.iter().copied() {
                if o == trigger || self.ddg.node(o).is_scheduled() {
                    continue;
                }
                if !self.schedule_operand(o, trigger_cycle, Some(trigger_cycle))? {
                    all_placed = false;
                    break;
                }
            }
            if all_placed {
                return Ok(true);
            }

            for o in operands.iter().copied() {
                if self.ddg.node(o).is_scheduled() {
                    self.unschedule_operand(o);
                }
            }
            ceiling -= 1;
            tries += 1;
        }
        Ok(false)
    }

    /// After the function-unit dependencies land on the trigger, a later
    /// slot may have opened up; take it if the table agrees.
    fn retighten_trigger(&mut self, trigger: NodeId, ceiling: Cycle) -> Result<(), ScheduleError> {
        let placed = self.ddg.node(trigger).cycle.expect("trigger placed");
        let ddg_latest = self
            .ddg
            .latest_cycle(self.scope, trigger, self.ii)
            .unwrap_or(ceiling)
            .min(ceiling);
        if ddg_latest <= placed {
            return Ok(());
        }
        let mv = self.ddg.node(trigger).mv.clone();
        match self.rm.latest_cycle(ddg_latest, &mv, None) {
            Some(better) if better > placed => {
                self.unschedule_operand(trigger);
                if !self.schedule_operand(trigger, better, None)? {
                    // The probe lied only because unassignment shifted the
                    // table; fall back to the original slot.
                    if !self.schedule_operand(trigger, placed, None)? {
                        return Err(self.failed(trigger, "trigger restore"));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// One operand write plus its preceding temp chain.
    fn schedule_operand(
        &mut self,
        node: NodeId,
        cycle: Cycle,
        hold_until: Option<Cycle>,
    ) -> Result<bool, ScheduleError> {
        if !self.schedule_move(node, cycle, hold_until)? {
            return Ok(false);
        }
        let chain = match self.temp_chains.get(&node) {
            Some(c) => c.clone(),
            None => return Ok(true),
        };
        // Chain hops precede the operand: nearest first, each one cycle
        // before its consumer at the latest.
        let mut bound = self.ddg.node(node).cycle.expect("operand placed") - 1;
        for hop in chain.iter().rev() {
            if self.ddg.node(*hop).is_scheduled() {
                bound = self.ddg.node(*hop).cycle.expect("scheduled") - 1;
                continue;
            }
            if !self.schedule_move(*hop, bound, None)? {
                self.unschedule_operand(node);
                return Ok(false);
            }
            bound = self.ddg.node(*hop).cycle.expect("placed") - 1;
        }
        Ok(true)
    }

    fn unschedule_operand(&mut self, node: NodeId) {
        if self.ddg.node(node).is_scheduled() {
            self.unschedule(node);
        }
        if let Some(chain) = self.temp_chains.get(&node) {
            for hop in chain.clone() {
                if self.ddg.node(hop).is_scheduled() {
                    self.unschedule(hop);
                }
            }
        }
    }

    fn find_trigger(&self, po: PoId) -> Option<NodeId> {
        self.ddg.operation(po).operands.iter().copied().find(|o| {
            let node = self.ddg.node(*o);
            match node.mv.destination.as_fu_port() {
                Some((op, operand)) => operand == op.hw(self.ctx.machine).trigger,
                None => false,
            }
        })
    }

    /// Commutative operations read better when the operand with the busier
    /// producer (or the inline constant) writes the trigger port: constants
    /// fuse with immediate transport and late producers keep bypass windows
    /// open.
    fn try_swap_operands(&mut self, po: PoId) {
        let operands = self.ddg.operation(po).operands.clone();
        if operands.len() != 2 {
            return;
        }
        let (a, b) = (operands[0], operands[1]);
        if self.ddg.node(a).is_scheduled() || self.ddg.node(b).is_scheduled() {
            return;
        }
        let hw_op = match self.ddg.node(a).mv.destination.as_fu_port() {
            Some((op, _)) => op,
            None => return,
        };
        let hw = hw_op.hw(self.ctx.machine);
        if !hw.commutative || hw.inputs != 2 {
            return;
        }
        let trigger_idx = hw.trigger;
        let (trig, other) = match (
            self.ddg.node(a).mv.destination.as_fu_port(),
            self.ddg.node(b).mv.destination.as_fu_port(),
        ) {
            (Some((_, ia)), Some((_, _))) if ia == trigger_idx => (a, b),
            (Some(_), Some((_, ib))) if ib == trigger_idx => (b, a),
            _ => return,
        };

        let want_swap = {
            let other_const = self.ddg.node(other).mv.source.is_immediate();
            let trig_const = self.ddg.node(trig).mv.source.is_immediate();
            if other_const != trig_const {
                other_const
            } else {
                let dist = |n: NodeId| {
                    self.ddg
                        .only_register_raw_source(self.scope, n)
                        .and_then(|p| self.heights.get(&p).copied())
                        .unwrap_or(0)
                };
                dist(other) > dist(trig)
            }
        };
        if !want_swap {
            return;
        }

        // Both sources must reach their exchanged ports.
        let copy_adder = CopyAdder::new(self.ctx.conn, self.ctx.scratch);
        let trig_dest = self.ddg.node(trig).mv.destination;
        let other_dest = self.ddg.node(other).mv.destination;
        let mut probe_a = self.ddg.node(trig).mv.clone();
        probe_a.destination = other_dest;
        let mut probe_b = self.ddg.node(other).mv.clone();
        probe_b.destination = trig_dest;
        if !copy_adder.can_transport(&probe_a) || !copy_adder.can_transport(&probe_b) {
            return;
        }
        self.ddg.node_mut(trig).mv.destination = other_dest;
        self.ddg.node_mut(other).mv.destination = trig_dest;
        tracing::trace!("swapped commutative operands of {}", hw.name);
    }

    // ------------------------------------------------------------------
    // Plain moves

    /// Register copy, immediate load, or anything else outside an
    /// operation.
    fn schedule_plain_move(&mut self, node: NodeId) -> Result<(), ScheduleError> {
        let mv = &self.ddg.node(node).mv;
        if mv.source == mv.destination {
            // Copy to self; finalize drops it.
            return Ok(());
        }
        let copy_adder = CopyAdder::new(self.ctx.conn, self.ctx.scratch);
        if let Some(chain) = copy_adder.add_copies_for_move(self.ddg, self.scope, node)? {
            self.temp_chains.insert(node, chain);
        }
        if !self.schedule_move(node, self.end_cycle, None)? {
            return Err(self.failed(node, "register copy"));
        }
        let chain = self.temp_chains.get(&node).cloned().unwrap_or_default();
        let mut bound = self.ddg.node(node).cycle.expect("placed") - 1;
        for hop in chain.iter().rev() {
            if !self.schedule_move(*hop, bound, None)? {
                return Err(self.failed(*hop, "temp copy"));
            }
            bound = self.ddg.node(*hop).cycle.expect("placed") - 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Single-move placement

    /// Bottom-up placement of one move at the latest admissible cycle no
    /// later than `latest`.
    fn schedule_move(
        &mut self,
        node: NodeId,
        latest: Cycle,
        hold_until: Option<Cycle>,
    ) -> Result<bool, ScheduleError> {
        debug_assert!(!self.ddg.node(node).is_scheduled(), "move scheduled twice");
        let is_cf = self.ddg.node(node).mv.is_control_flow(self.ctx.machine);

        let mut ddg_cycle = if is_cf {
            let slot = self.end_cycle - self.ctx.machine.delay_slots() as Cycle;
            if let Some(l) = self.ddg.latest_cycle(self.scope, node, self.ii) {
                if l < slot {
                    return Ok(false);
                }
            }
            slot
        } else {
            self.ddg
                .latest_cycle(self.scope, node, self.ii)
                .unwrap_or(self.end_cycle)
        };

        if !is_cf && self.opts.rename_registers {
            ddg_cycle = self.try_rename_for_later(node, ddg_cycle, latest, hold_until)?;
        }

        // A constant that no bus can carry inline needs the long-immediate
        // machinery; a machine without it cannot run this program.
        if let Terminal::Immediate(value) = self.ddg.node(node).mv.source {
            if !self.ddg.node(node).mv.needs_long_imm
                && !self.rm.can_transport_immediate(&self.ddg.node(node).mv)
            {
                if self.ctx.machine.immediate_units.is_empty() {
                    return Err(ScheduleError::NoLongImmediateUnit {
                        value,
                        mv: self.ddg.node(node).mv.to_string(),
                    });
                }
                self.ddg.node_mut(node).mv.needs_long_imm = true;
            }
        }

        let min_cycle = latest.min(ddg_cycle).min(self.end_cycle);
        let mv = self.ddg.node(node).mv.clone();
        let mut chosen = match self.rm.latest_cycle(min_cycle, &mv, hold_until) {
            Some(c) => c,
            None => return Ok(false),
        };
        let earliest_ddg = self.ddg.earliest_cycle(self.scope, node, self.ii);
        if chosen < earliest_ddg {
            // A bypassed consumer pushed this too early.
            return Ok(false);
        }

        // A pure result read wants to sit near its sibling outputs rather
        // than drift to the ceiling.
        if self.ddg.node(node).source_op.is_some() && self.ddg.node(node).dest_op.is_none() {
            if let Some(po) = self.ddg.node(node).source_op {
                let sibling_max = self
                    .ddg
                    .operation(po)
                    .results
                    .iter()
                    .filter(|s| **s != node)
                    .filter_map(|s| self.ddg.node(*s).cycle)
                    .max();
                if let Some(sib) = sibling_max {
                    if sib < chosen {
                        let floor = earliest_ddg.max(sib);
                        if let Some(closer) =
                            self.rm.earliest_cycle((floor + chosen) / 2, &mv, hold_until)
                        {
                            if closer >= floor && closer < chosen {
                                chosen = closer;
                            }
                        }
                    }
                }
            }
        }

        let bus = match self.rm.assign(chosen, node, &mv, hold_until) {
            Some(b) => b,
            None => return Ok(false),
        };
        self.ddg.place(node, chosen);
        self.ddg.node_mut(node).mv.bus = Some(bus);

        // An operation whose pipeline would drain past the block end would
        // leak into the delay-slot region.
        if let Some(po) = self.ddg.node(node).dest_op {
            if !self.ddg.operation(po).results.is_empty() {
                let hw = self.ddg.operation(po).op.hw(self.ctx.machine);
                if chosen + hw.max_latency() as Cycle > self.end_cycle {
                    self.unschedule(node);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// When only anti dependences hold the move back, renaming the live
    /// range buys the later slot.
    fn try_rename_for_later(
        &mut self,
        node: NodeId,
        ddg_cycle: Cycle,
        latest: Cycle,
        hold_until: Option<Cycle>,
    ) -> Result<Cycle, ScheduleError> {
        if self.ctx.renamer.is_none() {
            return Ok(ddg_cycle);
        }
        let potential = self
            .ddg
            .latest_cycle_ignoring(self.scope, node, self.ii, false, true, false)
            .unwrap_or(self.end_cycle);
        if potential <= ddg_cycle {
            return Ok(ddg_cycle);
        }
        let target = potential.min(latest).min(self.end_cycle);
        let mv = self.ddg.node(node).mv.clone();
        let worth_it = self
            .rm
            .latest_cycle(target, &mv, hold_until)
            .map_or(false, |c| c > ddg_cycle);
        if !worth_it {
            return Ok(ddg_cycle);
        }
        let conn = self.ctx.conn;
        let scope = self.scope;
        if let Some(renamer) = self.ctx.renamer.as_deref_mut() {
            if let Some(undo) =
                renamer.rename_source_register(self.ddg, conn, scope, node, true, true, target)
            {
                self.attempt_renames.push(undo);
                return Ok(self
                    .ddg
                    .latest_cycle(scope, node, self.ii)
                    .unwrap_or(self.end_cycle));
            }
        }
        Ok(ddg_cycle)
    }

    fn unschedule(&mut self, node: NodeId) {
        self.rm.unassign(node);
        self.ddg.unplace(node);
        self.ddg.node_mut(node).mv.bus = None;
    }

    // ------------------------------------------------------------------
    // Bypass

    /// The trigger cycle bounding a rescheduled operand write.
    fn hold_for(&self, node: NodeId) -> Option<Cycle> {
        let po = self.ddg.node(node).dest_op?;
        let trigger = self.find_trigger(po)?;
        if trigger == node {
            return None;
        }
        self.ddg.node(trigger).cycle
    }

    /// Rewrites every consumer of `producer`'s value to read the producer's
    /// own source.  True when all of them were rewritten; `max_cycle` then
    /// reports the latest consumer cycle.
    fn bypass_node(
        &mut self,
        producer: NodeId,
        max_cycle: &mut Cycle,
    ) -> Result<bool, ScheduleError> {
        if !self.opts.bypass {
            return Ok(false);
        }
        let copy_adder = CopyAdder::new(self.ctx.conn, self.ctx.scratch);
        let users = self.ddg.only_register_raw_destinations(self.scope, producer);
        if users.is_empty() {
            return Ok(false);
        }
        let total = users.len();
        let mut bypassed = 0usize;
        let mut local_max = 0;
        for user in users {
            if !self.ddg.guards_allow_bypass(producer, user) {
                continue;
            }
            if self.ddg.only_register_edge_in(self.scope, user).is_none() {
                // Several definitions reach this read.
                continue;
            }
            if !self.ddg.node(user).is_scheduled() {
                // An unscheduled consumer here is a temp hop whose chain
                // exists precisely because the direct path is missing.
                continue;
            }
            let mut probe = self.ddg.node(user).mv.clone();
            probe.source = self.ddg.node(producer).mv.source;
            probe.needs_long_imm = false;
            if !copy_adder.can_transport(&probe) {
                continue;
            }

            let original = self.ddg.node(user).cycle.expect("scheduled consumer");
            let latest_limit = original + self.opts.bypass_distance;
            let earliest_limit = original - 2 * self.opts.bypass_distance;
            let hold = self.hold_for(user);

            self.unschedule(user);
            if !self.ddg.merge(producer, user) {
                if !self.schedule_move(user, original, hold)? {
                    return Err(self.failed(user, "restore after refused merge"));
                }
                continue;
            }

            let start = latest_limit
                .min(*max_cycle)
                .min(hold.unwrap_or(Cycle::MAX));
            let placed = self.schedule_move(user, start, hold)?;
            let cycle = self.ddg.node(user).cycle;
            let acceptable = placed
                && cycle.map_or(false, |c| {
                    c <= latest_limit && c >= earliest_limit && c >= original
                });
            if !acceptable {
                if self.ddg.node(user).is_scheduled() {
                    self.unschedule(user);
                }
                self.ddg.unmerge(producer, user);
                if !self.schedule_move(user, original, hold)? {
                    return Err(self.failed(user, "restore after failed bypass"));
                }
            } else {
                local_max = local_max.max(cycle.expect("accepted"));
                self.bypassed
                    .entry(producer)
                    .or_default()
                    .push((user, original));
                if self.deps_copied.insert(producer) {
                    // An operand of the producer's operation may read the
                    // register the producer writes; keep that ordering even
                    // if the producer later dies.
                    self.ddg.copy_deps_over(producer);
                }
                bypassed += 1;
            }
        }
        if bypassed == total && bypassed > 0 {
            *max_cycle = local_max;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Restores every consumer bypassed off `producer` to its own register
    /// read at its original cycle.
    fn undo_bypass(&mut self, producer: NodeId) -> Result<(), ScheduleError> {
        let list = match self.bypassed.remove(&producer) {
            Some(l) => l,
            None => return Ok(()),
        };
        let mut restore = Vec::with_capacity(list.len());
        for (user, original) in list {
            if self.ddg.node(user).is_scheduled() {
                self.unschedule(user);
            }
            self.ddg.unmerge(producer, user);
            restore.push((user, original));
        }
        for (user, original) in restore {
            let hold = self.hold_for(user);
            if !self.schedule_move(user, original, hold)? {
                return Err(self.failed(user, "reschedule after bypass undo"));
            }
        }
        self.dead_results.remove(&producer);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unwinding

    fn unwind_results(&mut self, po: PoId) -> Result<(), ScheduleError> {
        let results: Vec<NodeId> = self.ddg.operation(po).results.to_vec();
        for r in results {
            if !self.ddg.is_alive(r) {
                continue;
            }
            if self.ddg.node(r).is_scheduled() {
                self.unschedule(r);
            }
            if let Some(chain) = self.temp_chains.get(&r) {
                for hop in chain.clone() {
                    if self.ddg.node(hop).is_scheduled() {
                        self.unschedule(hop);
                    }
                }
            }
            self.dead_results.remove(&r);
            self.undo_bypass(r)?;
        }
        Ok(())
    }

    fn unwind_operands(&mut self, po: PoId) {
        let operands: Vec<NodeId> = self.ddg.operation(po).operands.to_vec();
        for o in operands {
            if self.ddg.is_alive(o) {
                self.unschedule_operand(o);
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion

    /// Wraps up one node: notify the ready list, or carry out a recorded
    /// dead-result elimination.
    fn finalize(&mut self, node: NodeId, selector: &mut BuSelector<'_>) -> Result<(), ScheduleError> {
        if self.ddg.node(node).is_scheduled() {
            selector.notify_scheduled(self.ddg, node);
            if let Some(chain) = self.temp_chains.get(&node) {
                for hop in chain.clone() {
                    if self.ddg.node(hop).is_scheduled() {
                        selector.notify_scheduled(self.ddg, hop);
                    }
                }
            }
            return Ok(());
        }

        let mv = &self.ddg.node(node).mv;
        let dead = self.dead_results.remove(&node);
        let self_copy = mv.source == mv.destination;
        if !(dead && self.opts.kill_dead_results) && !self_copy {
            return Err(self.failed(node, "move did not get scheduled"));
        }

        tracing::debug!("dropping dead move {}", self.ddg.node(node).mv);
        let wide = Scope { include_back_edges: true, ..self.scope };
        let preds = self.ddg.predecessors(wide, node);
        self.ddg.copy_deps_over(node);
        self.ddg.drop_node(node);
        // A chain forwarding a dead value is dead with it.
        if let Some(chain) = self.temp_chains.remove(&node) {
            for hop in chain {
                if self.ddg.is_alive(hop) && !self.ddg.node(hop).is_scheduled() {
                    self.ddg.copy_deps_over(hop);
                    self.ddg.drop_node(hop);
                }
            }
        }
        selector.invalidate_priorities();
        for p in preds {
            selector.might_be_ready(self.ddg, p);
        }
        Ok(())
    }
}
