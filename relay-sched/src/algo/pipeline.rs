//! Software pipelining of single-block loops.
//!
//! The body is modulo-scheduled at a fixed initiation interval with the
//! bottom-up engine (end cycle `2·II − 1`, resources reserved mod II), so a
//! kernel instruction interleaves two consecutive iterations.  The smallest
//! working II is found by binary search between the recurrence/resource
//! lower bound and a hard cap; the stage-0 half of the first iteration
//! becomes the prolog, the stage-1 half of the last one the epilog.

use rustc_hash::FxHashMap;

use relay_machine::Machine;
use relay_program::{BasicBlock, Instruction};

use crate::ddg::{Cycle, Ddg, NodeId, Scope};
use crate::error::ScheduleError;
use crate::resources::ResourceManager;

use super::{BlockContext, BlockPass};

/// Keep the search bounded; past this the kernel no longer overlaps
/// anything worth the bookkeeping.
pub const MAX_INITIATION_INTERVAL: u32 = 60;

pub struct LoopSchedule {
    pub ii: u32,
    pub kernel: Vec<Instruction>,
    pub prolog: BasicBlock,
    pub epilog: BasicBlock,
}

/// Lower bound from loop-carried dependence cycles: every chain that wraps
/// around the back edge must fit in one interval.
pub fn recurrence_min_ii(ddg: &Ddg, scope: Scope) -> u32 {
    let dag = Scope { include_back_edges: false, ..scope };
    let back_edges: Vec<(NodeId, NodeId, i64)> = ddg
        .nodes_in(scope)
        .flat_map(|n| {
            ddg.out_edges(Scope { include_back_edges: true, ..scope }, n)
                .filter(|(_, e)| e.back_edge)
                .map(|(_, e)| (e.tail, e.head, e.latency))
                .collect::<Vec<_>>()
        })
        .collect();
    let mut min_ii = 1i64;
    for (tail, head, latency) in back_edges {
        if let Some(path) = longest_path(ddg, dag, head, tail) {
            min_ii = min_ii.max(path + latency);
        }
    }
    min_ii.max(1) as u32
}

/// Lower bound from raw capacity: buses, per-unit initiations, register-file
/// ports.
pub fn resource_min_ii(ddg: &Ddg, scope: Scope, machine: &Machine) -> u32 {
    let nodes: Vec<NodeId> = ddg.nodes_in(scope).collect();
    let moves = nodes.len() as u32;
    let buses = machine.buses.len() as u32;
    let mut min_ii = moves.div_ceil(buses.max(1));

    let mut initiations: FxHashMap<usize, u32> = FxHashMap::default();
    let mut rf_reads: FxHashMap<usize, u32> = FxHashMap::default();
    let mut rf_writes: FxHashMap<usize, u32> = FxHashMap::default();
    for n in &nodes {
        let mv = &ddg.node(*n).mv;
        if let Some((op, operand)) = mv.destination.as_fu_port() {
            if operand == op.hw(machine).trigger {
                *initiations.entry(op.fu.0).or_insert(0) += 1;
            }
        }
        if let Some(r) = mv.source.as_register() {
            *rf_reads.entry(r.rf.0).or_insert(0) += 1;
        }
        if let Some(r) = mv.destination.as_register() {
            *rf_writes.entry(r.rf.0).or_insert(0) += 1;
        }
    }
    for (_, count) in initiations {
        min_ii = min_ii.max(count);
    }
    for (rf, count) in rf_reads {
        min_ii = min_ii.max(count.div_ceil(machine.register_files[rf].read_ports.max(1) as u32));
    }
    for (rf, count) in rf_writes {
        min_ii = min_ii.max(count.div_ceil(machine.register_files[rf].write_ports.max(1) as u32));
    }
    min_ii.max(1)
}

fn longest_path(ddg: &Ddg, scope: Scope, from: NodeId, to: NodeId) -> Option<i64> {
    // Longest distance from `from` over the acyclic part; memoized walk.
    fn walk(
        ddg: &Ddg,
        scope: Scope,
        cur: NodeId,
        to: NodeId,
        memo: &mut FxHashMap<NodeId, Option<i64>>,
    ) -> Option<i64> {
        if cur == to {
            return Some(0);
        }
        if let Some(v) = memo.get(&cur) {
            return *v;
        }
        let mut best: Option<i64> = None;
        for (_, e) in ddg.out_edges(scope, cur) {
            if let Some(rest) = walk(ddg, scope, e.head, to, memo) {
                best = Some(best.map_or(e.latency + rest, |b: i64| b.max(e.latency + rest)));
            }
        }
        memo.insert(cur, best);
        best
    }
    let mut memo = FxHashMap::default();
    walk(ddg, scope, from, to, &mut memo)
}

/// Schedules the loop body at the given interval.  Placements land in the
/// graph; the caller owns clearing them when probing.
pub fn schedule_at_ii(
    ddg: &mut Ddg,
    scope: Scope,
    machine: &Machine,
    ctx: &mut BlockContext<'_, '_>,
    pass: &mut dyn BlockPass,
    ii: u32,
    test_only: bool,
) -> Result<Cycle, ScheduleError> {
    let mut rm = ResourceManager::new(machine, ii);
    rm.set_max_cycle(2 * ii as Cycle - 1);
    pass.schedule(ddg, scope, &mut rm, ctx, test_only)
}

pub fn clear_placements(ddg: &mut Ddg, scope: Scope) {
    let nodes: Vec<NodeId> = ddg.nodes_in(scope).collect();
    for n in nodes {
        if ddg.node(n).is_scheduled() {
            ddg.unplace(n);
            ddg.node_mut(n).mv.bus = None;
        }
    }
}

/// Binary search for the smallest working interval in `[ii_min, ii_max]`.
/// The cap is probed first: if even the most relaxed interval fails there is
/// nothing to search.
pub fn search_ii(
    ddg: &mut Ddg,
    scope: Scope,
    machine: &Machine,
    ctx: &mut BlockContext<'_, '_>,
    pass: &mut dyn BlockPass,
    ii_min: u32,
    ii_max: u32,
) -> Option<u32> {
    if ii_min > ii_max {
        return None;
    }
    let mut feasible = |ii: u32, ddg: &mut Ddg, ctx: &mut BlockContext<'_, '_>| {
        let ok = schedule_at_ii(ddg, scope, machine, ctx, pass, ii, true).is_ok();
        clear_placements(ddg, scope);
        tracing::debug!("loop probe at II={ii}: {}", if ok { "fits" } else { "fails" });
        ok
    };

    if !feasible(ii_max, ddg, ctx) {
        return None;
    }
    let mut lo = ii_min;
    let mut best = ii_max;
    while lo < best {
        // Skewed midpoint: small intervals are where the payoff is, so
        // probe low.
        let mid = ((2 * lo + best) / 3).clamp(lo, best - 1);
        if feasible(mid, ddg, ctx) {
            best = mid;
        } else {
            lo = mid + 1;
        }
    }
    Some(best)
}

/// Carves the scheduled body into kernel, prolog, and epilog.
pub fn extract(ddg: &Ddg, scope: Scope, machine: &Machine, ii: u32) -> LoopSchedule {
    let ii_c = ii as Cycle;
    let mut kernel: Vec<Instruction> = (0..ii).map(|_| Instruction::default()).collect();
    let mut prolog: Vec<Instruction> = (0..ii).map(|_| Instruction::default()).collect();
    let mut epilog: Vec<Instruction> = (0..ii).map(|_| Instruction::default()).collect();

    let mut placed: Vec<NodeId> = ddg.nodes_in(scope).collect();
    placed.sort();
    for n in placed {
        let node = ddg.node(n);
        let cycle = match node.cycle {
            Some(c) => c,
            None => continue,
        };
        let slot = (cycle % ii_c) as usize;
        kernel[slot].moves.push(node.mv.clone());
        if cycle < ii_c {
            // Stage 0: the young half of an iteration; the prolog runs it
            // once for the first iteration.
            prolog[cycle as usize].moves.push(node.mv.clone());
        } else if !node.mv.is_control_flow(machine) {
            // Stage 1 drains in the epilog; the loop branch must not.
            epilog[(cycle - ii_c) as usize].moves.push(node.mv.clone());
        }
    }

    while epilog.last().map_or(false, |i| i.is_empty()) {
        epilog.pop();
    }
    while prolog.last().map_or(false, |i| i.is_empty()) {
        prolog.pop();
    }

    LoopSchedule {
        ii,
        kernel,
        prolog: BasicBlock::new(prolog),
        epilog: BasicBlock::new(epilog),
    }
}
