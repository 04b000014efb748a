//! The legacy top-down list scheduler.
//!
//! Kept for comparison runs and as a fallback of last resort: no bypassing,
//! no renaming, no operand swapping.  Moves are placed from cycle zero
//! upward in dependence order, operands before trigger before results.

use std::collections::BinaryHeap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::copy_adder::CopyAdder;
use crate::ddg::{Cycle, Ddg, NodeId, PoId, Scope};
use crate::error::ScheduleError;
use crate::resources::ResourceManager;

use super::{BlockContext, BlockPass};

pub struct TopDownScheduler;

impl BlockPass for TopDownScheduler {
    fn schedule(
        &mut self,
        ddg: &mut Ddg,
        scope: Scope,
        rm: &mut ResourceManager<'_>,
        ctx: &mut BlockContext<'_, '_>,
        _test_only: bool,
    ) -> Result<Cycle, ScheduleError> {
        TdRun {
            ddg,
            scope,
            rm,
            ctx,
        }
        .run()
    }

    fn name(&self) -> &'static str {
        "top-down"
    }
}

struct TdRun<'e, 'a, 'm, 'r> {
    ddg: &'e mut Ddg,
    scope: Scope,
    rm: &'e mut ResourceManager<'r>,
    ctx: &'e mut BlockContext<'a, 'm>,
}

impl<'e, 'a, 'm, 'r> TdRun<'e, 'a, 'm, 'r> {
    fn run(mut self) -> Result<Cycle, ScheduleError> {
        let scope = Scope { include_back_edges: false, ..self.scope };
        if self.ddg.nodes_in(scope).next().is_none() {
            return Ok(0);
        }

        // Legalize connectivity up front; top-down has no per-operation
        // retry to hang it off.
        let copy_adder = CopyAdder::new(self.ctx.conn, self.ctx.scratch);
        let pos: Vec<PoId> = (0..self.ddg.ops.len() as u32).map(PoId).collect();
        for po in pos {
            let in_scope = self
                .ddg
                .operation(po)
                .operands
                .iter()
                .chain(self.ddg.operation(po).results.iter())
                .any(|n| self.ddg.node(*n).block == scope.block && self.ddg.is_alive(*n));
            if in_scope {
                copy_adder.add_minimum_copies(self.ddg, scope, po)?;
            }
        }
        let plain: Vec<NodeId> = self
            .ddg
            .nodes_in(scope)
            .filter(|n| {
                let node = self.ddg.node(*n);
                !node.is_operation_move() && !node.is_temp_copy
            })
            .collect();
        for n in plain {
            copy_adder.add_copies_for_move(self.ddg, scope, n)?;
        }

        // Criticality: longest path from the block's sources.
        let depths = self.depths(scope);
        let mut heap: BinaryHeap<(i64, u32)> = BinaryHeap::new();
        let mut queued: FxHashSet<NodeId> = FxHashSet::default();
        // Control-flow moves go last so the block end is the true end.
        let control: Vec<NodeId> = self
            .ddg
            .nodes_in(scope)
            .filter(|n| self.ddg.node(*n).mv.is_control_flow(self.ctx.machine))
            .collect();
        for n in self.ddg.nodes_in(scope).collect::<Vec<_>>() {
            if !control.contains(&n) && self.is_ready(scope, n) {
                heap.push((-depths.get(&n).copied().unwrap_or(0), n.0));
                queued.insert(n);
            }
        }

        while let Some((_, raw)) = heap.pop() {
            let node = NodeId(raw);
            if self.ddg.node(node).is_scheduled() || !self.ddg.is_alive(node) {
                continue;
            }
            if !self.is_ready(scope, node) {
                queued.remove(&node);
                continue;
            }
            self.place(scope, node, None)?;
            for succ in self.ddg.successors(scope, node) {
                if !control.contains(&succ) && !queued.contains(&succ) && self.is_ready(scope, succ) {
                    heap.push((-depths.get(&succ).copied().unwrap_or(0), succ.0));
                    queued.insert(succ);
                }
            }
        }

        for n in control {
            let floor = self.rm.largest_cycle().unwrap_or(0);
            self.place(scope, n, Some(floor))?;
        }

        // Reaching the end with unplaced moves is a scheduler bug, not an
        // input problem.
        let leftover = self
            .ddg
            .nodes_in(scope)
            .filter(|n| !self.ddg.node(*n).is_scheduled())
            .count();
        assert_eq!(leftover, 0, "top-down pass left {leftover} moves unscheduled");

        let span = match (self.rm.smallest_cycle(), self.rm.largest_cycle()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        };
        Ok(span)
    }

    fn depths(&self, scope: Scope) -> FxHashMap<NodeId, i64> {
        let mut depths: FxHashMap<NodeId, i64> = FxHashMap::default();
        // Nodes were created in program order, so ascending ids see their
        // predecessors first in this forward-edged graph.
        let mut ids: Vec<NodeId> = self.ddg.nodes_in(scope).collect();
        ids.sort();
        for id in ids {
            let d = self
                .ddg
                .in_edges(scope, id)
                .map(|(_, e)| e.latency + depths.get(&e.tail).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            depths.insert(id, d);
        }
        depths
    }

    fn is_ready(&self, scope: Scope, node: NodeId) -> bool {
        !self.ddg.node(node).is_scheduled()
            && self
                .ddg
                .in_edges(scope, node)
                .all(|(_, e)| self.ddg.node(e.tail).is_scheduled())
    }

    /// Earliest-fit placement for one move.
    fn place(&mut self, scope: Scope, node: NodeId, floor: Option<Cycle>) -> Result<(), ScheduleError> {
        let earliest = self
            .ddg
            .earliest_cycle(scope, node, 0)
            .max(floor.unwrap_or(0));

        if let relay_program::Terminal::Immediate(value) = self.ddg.node(node).mv.source {
            if !self.rm.can_transport_immediate(&self.ddg.node(node).mv) {
                if self.ctx.machine.immediate_units.is_empty() {
                    return Err(ScheduleError::NoLongImmediateUnit {
                        value,
                        mv: self.ddg.node(node).mv.to_string(),
                    });
                }
                self.ddg.node_mut(node).mv.needs_long_imm = true;
            }
        }

        let mv = self.ddg.node(node).mv.clone();
        let cycle = self
            .rm
            .earliest_cycle(earliest, &mv, None)
            .ok_or_else(|| ScheduleError::SchedulingFailed {
                block: scope.block,
                detail: format!("no cycle admits {mv}"),
            })?;
        let bus = self
            .rm
            .assign(cycle, node, &mv, None)
            .expect("probe promised the slot");
        self.ddg.place(node, cycle);
        self.ddg.node_mut(node).mv.bus = Some(bus);
        Ok(())
    }
}
