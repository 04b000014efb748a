//! The procedure-level driver.
//!
//! Builds the control-flow graph and the whole-procedure dependence graph,
//! walks the blocks in four passes (single-block loops, then sink blocks,
//! then blocks whose jump target is already scheduled in reverse order, then
//! the rest), runs the loop pipeliner where it applies and the flat block
//! scheduler everywhere else, and finally writes the placements back into
//! the procedure.  The procedure is untouched until everything succeeded.

use itertools::Itertools;
use petgraph::stable_graph::NodeIndex;
use rustc_hash::FxHashSet;

use relay_machine::{Connectivity, Machine};
use relay_program::{
    keys, ControlFlowGraph, InstructionRefManager, InterPassData, Instruction, Procedure,
    Register,
};

use crate::algo::{
    pipeline, BlockContext, BlockPass, BottomUpScheduler, BubbleFishScheduler, EngineOptions,
    TopDownScheduler,
};
use crate::analyzer;
use crate::ddg::{build_block_ddg, build_ddg, Cycle, Ddg, DumpFormat, NodeId, Scope};
use crate::error::ScheduleError;
use crate::renamer::RegisterRenamer;
use crate::resources::ResourceManager;
use crate::{SchedulerOptions, SchedulerVariant};

/// Schedules a procedure in place.  On error the procedure is unchanged.
pub fn schedule_procedure(
    procedure: &mut Procedure,
    machine: &Machine,
    irm: &mut InstructionRefManager,
    ipd: &InterPassData,
    options: &SchedulerOptions,
) -> Result<(), ScheduleError> {
    if let Some(process) = ipd.names(keys::FUNCTIONS_TO_PROCESS) {
        if !process.contains(&procedure.name) {
            return Ok(());
        }
    }
    if let Some(ignore) = ipd.names(keys::FUNCTIONS_TO_IGNORE) {
        if ignore.contains(&procedure.name) {
            return Ok(());
        }
    }
    machine.validate()?;

    let mut cfg = ControlFlowGraph::build(procedure, machine, irm)?;
    let loop_blocks = loop_block_set(&cfg, options);
    let always_live = pinned_registers(ipd);

    let total_moves: usize = cfg
        .nodes()
        .iter()
        .map(|n| cfg.block(*n).bb.move_count())
        .sum();
    let whole_procedure = options
        .low_mem_threshold
        .map_or(true, |limit| total_moves <= limit);

    if whole_procedure {
        let mut ddg = build_ddg(&cfg, machine, &loop_blocks, &always_live);
        schedule_cfg_ddg(&mut cfg, &mut ddg, machine, irm, ipd, options)?;
    } else {
        tracing::debug!(
            "procedure {}: {total_moves} moves exceed the whole-procedure graph threshold",
            procedure.name
        );
        run_passes(&mut cfg, None, machine, irm, ipd, options, &loop_blocks, &always_live)?;
    }

    cfg.commit(procedure, irm);
    Ok(())
}

/// Same entry point for drivers that already hold the graph pair.
pub fn schedule_cfg_ddg(
    cfg: &mut ControlFlowGraph,
    ddg: &mut Ddg,
    machine: &Machine,
    irm: &mut InstructionRefManager,
    ipd: &InterPassData,
    options: &SchedulerOptions,
) -> Result<(), ScheduleError> {
    let loop_blocks = loop_block_set(cfg, options);
    let always_live = pinned_registers(ipd);
    run_passes(cfg, Some(ddg), machine, irm, ipd, options, &loop_blocks, &always_live)
}

fn loop_block_set(cfg: &ControlFlowGraph, options: &SchedulerOptions) -> FxHashSet<usize> {
    if !options.loop_scheduling {
        return FxHashSet::default();
    }
    cfg.nodes()
        .into_iter()
        .filter(|n| cfg.is_single_block_loop(*n))
        .map(|n| cfg.block(n).origin)
        .collect()
}

/// Registers with meaning outside the procedure body.
fn pinned_registers(ipd: &InterPassData) -> FxHashSet<Register> {
    [
        keys::STACK_POINTER,
        keys::FRAME_POINTER,
        keys::RV_REGISTER,
        keys::RV_HIGH_REGISTER,
    ]
    .iter()
    .filter_map(|k| ipd.register(k))
    .collect()
}

fn renaming_enabled(ipd: &InterPassData, options: &SchedulerOptions) -> bool {
    options.rename_registers
        && ipd.has(keys::STACK_POINTER)
        && ipd.has(keys::FRAME_POINTER)
        && ipd.has(keys::RV_REGISTER)
        && ipd.has(keys::RV_HIGH_REGISTER)
}

fn make_pass(options: &SchedulerOptions, weakened: bool) -> Box<dyn BlockPass> {
    let engine = EngineOptions {
        bypass: options.bypass_distance > 0 && !weakened,
        bypass_distance: options.bypass_distance as Cycle,
        kill_dead_results: options.kill_dead_results && !weakened,
        rename_registers: options.rename_registers && !weakened,
        swap_operands: false,
        late_bypass: true,
    };
    match options.variant {
        SchedulerVariant::TopDown => Box::new(TopDownScheduler),
        SchedulerVariant::BottomUp => Box::new(BottomUpScheduler { options: engine }),
        SchedulerVariant::BubbleFish => Box::new(BubbleFishScheduler::new(engine)),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_passes(
    cfg: &mut ControlFlowGraph,
    mut big_ddg: Option<&mut Ddg>,
    machine: &Machine,
    irm: &mut InstructionRefManager,
    ipd: &InterPassData,
    options: &SchedulerOptions,
    loop_blocks: &FxHashSet<usize>,
    always_live: &FxHashSet<Register>,
) -> Result<(), ScheduleError> {
    let conn = Connectivity::new(machine);

    // Pass 1: single-block loops, so pipelined bodies land before anything
    // schedules around them.
    let pass1: Vec<NodeIndex> = cfg
        .nodes()
        .into_iter()
        .filter(|n| cfg.is_single_block_loop(*n))
        .collect();
    for n in pass1 {
        handle_one(cfg, n, &mut big_ddg, machine, &conn, irm, ipd, options, loop_blocks, always_live)?;
    }

    // Pass 2: blocks with no outgoing jump.
    let pass2: Vec<NodeIndex> = cfg
        .nodes()
        .into_iter()
        .filter(|n| !cfg.is_scheduled(*n) && cfg.jump_successor(*n).is_none())
        .collect();
    for n in pass2 {
        handle_one(cfg, n, &mut big_ddg, machine, &conn, irm, ipd, options, loop_blocks, always_live)?;
    }

    // Pass 3: reverse order, blocks whose jump target is settled.
    let mut nodes = cfg.nodes();
    nodes.reverse();
    for n in nodes {
        if cfg.is_scheduled(n) {
            continue;
        }
        let target_done = cfg.jump_successor(n).map_or(false, |t| cfg.is_scheduled(t));
        if target_done {
            handle_one(cfg, n, &mut big_ddg, machine, &conn, irm, ipd, options, loop_blocks, always_live)?;
        }
    }

    // Pass 4: whatever is left, reverse order.
    let mut nodes = cfg.nodes();
    nodes.reverse();
    for n in nodes {
        if !cfg.is_scheduled(n) {
            handle_one(cfg, n, &mut big_ddg, machine, &conn, irm, ipd, options, loop_blocks, always_live)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_one<'m>(
    cfg: &mut ControlFlowGraph,
    n: NodeIndex,
    big_ddg: &mut Option<&mut Ddg>,
    machine: &'m Machine,
    conn: &Connectivity<'m>,
    irm: &mut InstructionRefManager,
    ipd: &InterPassData,
    options: &SchedulerOptions,
    loop_blocks: &FxHashSet<usize>,
    always_live: &FxHashSet<Register>,
) -> Result<(), ScheduleError> {
    if cfg.is_scheduled(n) {
        return Ok(());
    }
    let origin = cfg.block(n).origin;
    if cfg.block(n).bb.instruction_count() == 0 {
        cfg.set_scheduled(n);
        return Ok(());
    }

    match big_ddg.as_deref_mut() {
        Some(ddg) => handle_block(cfg, n, ddg, machine, conn, irm, ipd, options, loop_blocks),
        None => {
            let mut live_out: FxHashSet<Register> = always_live.clone();
            for other in cfg.nodes() {
                if cfg.block(other).origin != origin {
                    for m in cfg.block(other).bb.moves() {
                        live_out.extend(m.read_registers());
                    }
                }
            }
            let loop_antideps = loop_blocks.contains(&origin);
            let mut ddg =
                build_block_ddg(machine, origin, &cfg.block(n).bb, loop_antideps, live_out);
            handle_block(cfg, n, &mut ddg, machine, conn, irm, ipd, options, loop_blocks)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_block<'m>(
    cfg: &mut ControlFlowGraph,
    n: NodeIndex,
    ddg: &mut Ddg,
    machine: &'m Machine,
    conn: &Connectivity<'m>,
    irm: &mut InstructionRefManager,
    ipd: &InterPassData,
    options: &SchedulerOptions,
    loop_blocks: &FxHashSet<usize>,
) -> Result<(), ScheduleError> {
    let origin = cfg.block(n).origin;
    let scope = Scope { block: origin, include_back_edges: loop_blocks.contains(&origin) };
    let scratch: Vec<Register> = ipd.scratch_registers().to_vec();
    let mut reserved: FxHashSet<Register> = pinned_registers(ipd);
    reserved.extend(scratch.iter().copied());

    let estimate = ddg.critical_path_length(scope);
    tracing::debug!(
        "block {origin}: {} moves, critical path {estimate}",
        cfg.block(n).bb.move_count()
    );
    dump(ddg, scope, options, "before");

    let used_elsewhere = registers_used_outside(cfg, origin);
    let rename_ok = renaming_enabled(ipd, options);

    // The pipelined path first, where it applies.
    if scope.include_back_edges
        && cfg.block(n).bb.trip_count.is_some()
        && block_fully_connected(ddg, scope, conn, &scratch)
    {
        let mut renamer = rename_ok
            .then(|| RegisterRenamer::new(machine, reserved.clone(), used_elsewhere.clone()));
        let mut ctx = BlockContext {
            machine,
            conn,
            scratch: &scratch,
            renamer: renamer.as_mut(),
        };
        if try_loop_schedule(cfg, n, ddg, scope, machine, &mut ctx, irm, options)? {
            cfg.set_scheduled(n);
            irm.retarget_block(origin);
            dump(ddg, scope, options, "after");
            return Ok(());
        }
    }

    // Flat path, with one weakened retry as the failure policy prescribes.
    let mut renamer = rename_ok
        .then(|| RegisterRenamer::new(machine, reserved.clone(), used_elsewhere.clone()));
    let span = match flat_attempt(
        ddg, scope, machine, conn, &scratch, renamer.as_mut(), options, false,
    ) {
        Ok(span) => span,
        Err(ScheduleError::SchedulingFailed { detail, .. }) => {
            tracing::warn!(
                "block {origin}: schedule failed ({detail}); retrying without bypass or renaming"
            );
            pipeline::clear_placements(ddg, scope);
            flat_attempt(ddg, scope, machine, conn, &scratch, None, options, true)?
        }
        Err(e) => return Err(e),
    };

    write_back_flat(cfg, n, ddg, scope);
    irm.retarget_block(origin);
    cfg.set_scheduled(n);
    analyzer::analyze_block(ddg, scope, machine, span);
    dump(ddg, scope, options, "after");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn flat_attempt<'m>(
    ddg: &mut Ddg,
    scope: Scope,
    machine: &'m Machine,
    conn: &Connectivity<'m>,
    scratch: &[Register],
    renamer: Option<&mut RegisterRenamer<'m>>,
    options: &SchedulerOptions,
    weakened: bool,
) -> Result<Cycle, ScheduleError> {
    let mut ctx = BlockContext {
        machine,
        conn,
        scratch,
        renamer,
    };
    let mut pass = make_pass(options, weakened);
    let mut rm = ResourceManager::new(machine, 0);
    pass.schedule(ddg, scope, &mut rm, &mut ctx, false)
}

fn registers_used_outside(cfg: &ControlFlowGraph, origin: usize) -> FxHashSet<Register> {
    let mut used = FxHashSet::default();
    for other in cfg.nodes() {
        let node = cfg.block(other);
        if node.origin == origin {
            continue;
        }
        for m in node.bb.moves() {
            used.extend(m.read_registers());
            used.extend(m.destination_register());
        }
    }
    used
}

/// The loop path refuses blocks that would need temp-copy chains: a chain
/// inside a modulo schedule pins the scratch register across iterations.
fn block_fully_connected(
    ddg: &Ddg,
    scope: Scope,
    conn: &Connectivity<'_>,
    scratch: &[Register],
) -> bool {
    let copy_adder = crate::copy_adder::CopyAdder::new(conn, scratch);
    ddg.nodes_in(scope)
        .all(|id| copy_adder.can_transport(&ddg.node(id).mv))
}

#[allow(clippy::too_many_arguments)]
fn try_loop_schedule(
    cfg: &mut ControlFlowGraph,
    n: NodeIndex,
    ddg: &mut Ddg,
    scope: Scope,
    machine: &Machine,
    ctx: &mut BlockContext<'_, '_>,
    irm: &mut InstructionRefManager,
    options: &SchedulerOptions,
) -> Result<bool, ScheduleError> {
    let trip_count = cfg.block(n).bb.trip_count.unwrap_or(0);
    let rec = pipeline::recurrence_min_ii(ddg, scope);
    let res = pipeline::resource_min_ii(ddg, scope, machine);
    let ii_min = rec.max(res).max(machine.delay_slots() + 1);
    let ii_max = (cfg.block(n).bb.instruction_count() as u32)
        .min(pipeline::MAX_INITIATION_INTERVAL);
    tracing::debug!(
        "loop block {}: trip count {trip_count}, min II {ii_min} (recurrence {rec}, resources {res}), max II {ii_max}",
        scope.block
    );
    if ii_min > ii_max {
        return Ok(false);
    }

    let mut pass = make_pass(options, false);
    let best = match pipeline::search_ii(ddg, scope, machine, ctx, pass.as_mut(), ii_min, ii_max) {
        Some(ii) => ii,
        None => return Ok(false),
    };

    match pipeline::schedule_at_ii(ddg, scope, machine, ctx, pass.as_mut(), best, false) {
        Ok(_) => {}
        Err(e) => {
            tracing::warn!("loop schedule at II={best} failed after a clean probe: {e}");
            pipeline::clear_placements(ddg, scope);
            return Ok(false);
        }
    }

    let schedule = pipeline::extract(ddg, scope, machine, best);
    tracing::debug!(
        "loop block {}: pipelined at II {} ({} prolog, {} epilog cycles)",
        scope.block,
        best,
        schedule.prolog.instruction_count(),
        schedule.epilog.instruction_count()
    );

    cfg.block_mut(n).bb.instructions = schedule.kernel;
    if schedule.prolog.instruction_count() > 0 {
        let prolog = cfg.insert_before(n, schedule.prolog);
        cfg.redirect_outside_jumps(irm, n, prolog, n);
    }
    if schedule.epilog.instruction_count() > 0 {
        cfg.insert_after(n, schedule.epilog);
    }
    Ok(true)
}

/// Copies placements back into the block: one instruction per cycle from
/// the earliest placed move to the latest, empty cycles included.
fn write_back_flat(cfg: &mut ControlFlowGraph, n: NodeIndex, ddg: &Ddg, scope: Scope) {
    let mut placed: Vec<NodeId> = ddg
        .nodes_in(scope)
        .filter(|id| ddg.node(*id).is_scheduled())
        .collect();
    if placed.is_empty() {
        cfg.block_mut(n).bb.instructions = Vec::new();
        return;
    }
    placed.sort();
    let (lo, hi) = placed
        .iter()
        .map(|id| ddg.node(*id).cycle.expect("placed"))
        .minmax()
        .into_option()
        .expect("nonempty");
    let mut instructions: Vec<Instruction> = (lo..=hi).map(|_| Instruction::default()).collect();
    for id in placed {
        let node = ddg.node(id);
        let c = node.cycle.expect("placed");
        instructions[(c - lo) as usize].moves.push(node.mv.clone());
    }
    cfg.block_mut(n).bb.instructions = instructions;
}

fn dump(ddg: &Ddg, scope: Scope, options: &SchedulerOptions, stage: &str) {
    let format = match options.dump_ddg {
        Some(f) => f,
        None => return,
    };
    let (content, ext) = match format {
        DumpFormat::Dot => (ddg.to_dot(scope), "dot"),
        DumpFormat::Xml => (ddg.to_xml(scope), "xml"),
    };
    let path = format!("{}_bb{}_{stage}.{ext}", ddg.name(), scope.block);
    if let Err(e) = std::fs::write(&path, content) {
        tracing::warn!("could not write graph snapshot {path}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_registers_come_from_the_channel() {
        let mut ipd = InterPassData::new();
        assert!(pinned_registers(&ipd).is_empty());
        let sp = Register { rf: relay_machine::RfId(0), index: 15 };
        ipd.set(keys::STACK_POINTER, relay_program::Datum::Register(sp));
        assert!(pinned_registers(&ipd).contains(&sp));
        assert!(!renaming_enabled(&ipd, &SchedulerOptions::default()));
    }
}
