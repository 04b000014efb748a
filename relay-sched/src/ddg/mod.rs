//! The data-dependence graph: move-nodes and typed latency edges.
//!
//! Nodes and edges live in two arena vectors indexed by small integers;
//! removal tombstones a slot and never reuses it, so node identity is stable
//! across every transformation the scheduler performs (merging for bypass,
//! temp-copy splicing, renaming, dead-result elimination).
//!
//! A per-block view of the procedure graph is a [`Scope`]: the same arenas
//! filtered down to one block's nodes, optionally with the loop back edges.
//! Edits made through any scope are edits of the one underlying graph.

mod builder;
mod dump;

pub use builder::{build_block_ddg, build_ddg};
pub use dump::DumpFormat;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use relay_program::{Move, Register, Terminal};

/// Cycles are wide enough that "a very large placeholder end cycle" never
/// brushes against overflow when latencies are added.
pub type Cycle = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoId(pub u32);

/// Dependence kinds.  Register edges carry the register they order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    RegisterRaw(Register),
    RegisterWar(Register),
    RegisterWaw(Register),
    MemoryRaw,
    MemoryWar,
    MemoryWaw,
    /// Intra-program-operation edge from an operand to a result.
    Operation,
    /// From the definer of a guard register to a move it guards.
    GuardRaw,
}

impl DepKind {
    pub fn is_register_anti(&self) -> bool {
        matches!(self, DepKind::RegisterWar(_) | DepKind::RegisterWaw(_))
    }

    pub fn register(&self) -> Option<Register> {
        match self {
            DepKind::RegisterRaw(r) | DepKind::RegisterWar(r) | DepKind::RegisterWaw(r) => {
                Some(*r)
            }
            _ => None,
        }
    }

    fn is_memory(&self) -> bool {
        matches!(self, DepKind::MemoryRaw | DepKind::MemoryWar | DepKind::MemoryWaw)
    }
}

#[derive(Debug, Clone)]
pub struct DepEdge {
    pub tail: NodeId,
    pub head: NodeId,
    pub kind: DepKind,
    pub latency: i64,
    pub back_edge: bool,
    alive: bool,
}

/// A move plus its placement state and operation membership.
#[derive(Debug, Clone)]
pub struct MoveNode {
    pub mv: Move,
    pub cycle: Option<Cycle>,
    /// Stable identity of the owning basic block (the CFG origin index).
    pub block: usize,
    /// Operation this node reads a result of.
    pub source_op: Option<PoId>,
    /// Operation this node writes an operand of.
    pub dest_op: Option<PoId>,
    /// Inserted by the register copy adder, not present in the input.
    pub is_temp_copy: bool,
    alive: bool,
}

impl MoveNode {
    pub fn is_scheduled(&self) -> bool {
        self.cycle.is_some()
    }

    pub fn is_operation_move(&self) -> bool {
        self.source_op.is_some() || self.dest_op.is_some()
    }
}

/// The moves that together invoke one hardware operation.
#[derive(Debug, Clone)]
pub struct ProgramOperation {
    pub op: relay_program::OpRef,
    /// Operand-writing nodes, in no particular order; each node's destination
    /// terminal carries its operand index.
    pub operands: SmallVec<[NodeId; 2]>,
    /// Result-reading nodes.  Grows when a bypassed consumer is folded in.
    pub results: SmallVec<[NodeId; 2]>,
}

/// A per-block view: `block` filters nodes, `include_back_edges` decides
/// whether the loop-closing edges take part in cycle queries.
#[derive(Debug, Clone, Copy)]
pub struct Scope {
    pub block: usize,
    pub include_back_edges: bool,
}

struct MergeUndo {
    old_source: Terminal,
    old_source_op: Option<PoId>,
    added_edges: Vec<EdgeId>,
    removed_edge: DepEdge,
    pushed_result: bool,
}

/// The procedure-wide dependence graph.
pub struct Ddg {
    name: String,
    nodes: Vec<MoveNode>,
    edges: Vec<DepEdge>,
    out_edges: Vec<SmallVec<[EdgeId; 4]>>,
    in_edges: Vec<SmallVec<[EdgeId; 4]>>,
    pub ops: Vec<ProgramOperation>,
    /// Registers that must survive each block (read by some later block).
    live_out: FxHashMap<usize, FxHashSet<Register>>,
    merges: FxHashMap<(NodeId, NodeId), MergeUndo>,
}

impl Ddg {
    pub fn new(name: impl Into<String>) -> Ddg {
        Ddg {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            out_edges: Vec::new(),
            in_edges: Vec::new(),
            ops: Vec::new(),
            live_out: FxHashMap::default(),
            merges: FxHashMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ---------------------------------------------------------------------
    // Structure

    pub fn add_node(&mut self, mv: Move, block: usize) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(MoveNode {
            mv,
            cycle: None,
            block,
            source_op: None,
            dest_op: None,
            is_temp_copy: false,
            alive: true,
        });
        self.out_edges.push(SmallVec::new());
        self.in_edges.push(SmallVec::new());
        id
    }

    pub fn add_temp_node(&mut self, mv: Move, block: usize) -> NodeId {
        let id = self.add_node(mv, block);
        self.nodes[id.0 as usize].is_temp_copy = true;
        id
    }

    pub fn add_operation(&mut self, op: relay_program::OpRef) -> PoId {
        let id = PoId(self.ops.len() as u32);
        self.ops.push(ProgramOperation {
            op,
            operands: SmallVec::new(),
            results: SmallVec::new(),
        });
        id
    }

    pub fn add_edge(
        &mut self,
        tail: NodeId,
        head: NodeId,
        kind: DepKind,
        latency: i64,
        back_edge: bool,
    ) -> EdgeId {
        debug_assert!(tail != head || back_edge, "self loop without back-edge flag");
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(DepEdge {
            tail,
            head,
            kind,
            latency,
            back_edge,
            alive: true,
        });
        self.out_edges[tail.0 as usize].push(id);
        self.in_edges[head.0 as usize].push(id);
        id
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> DepEdge {
        let e = &mut self.edges[id.0 as usize];
        debug_assert!(e.alive);
        e.alive = false;
        let snapshot = e.clone();
        let tail = snapshot.tail;
        let head = snapshot.head;
        self.out_edges[tail.0 as usize].retain(|x| *x != id);
        self.in_edges[head.0 as usize].retain(|x| *x != id);
        snapshot
    }

    pub fn node(&self, id: NodeId) -> &MoveNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut MoveNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn operation(&self, id: PoId) -> &ProgramOperation {
        &self.ops[id.0 as usize]
    }

    pub fn operation_mut(&mut self, id: PoId) -> &mut ProgramOperation {
        &mut self.ops[id.0 as usize]
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes[id.0 as usize].alive
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive).count()
    }

    pub fn scheduled_node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive && n.cycle.is_some()).count()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(move |id| self.nodes[id.0 as usize].alive)
    }

    pub fn nodes_in(&self, scope: Scope) -> impl Iterator<Item = NodeId> + '_ {
        let block = scope.block;
        self.node_ids()
            .filter(move |id| self.nodes[id.0 as usize].block == block)
    }

    pub fn set_live_out(&mut self, block: usize, regs: FxHashSet<Register>) {
        self.live_out.insert(block, regs);
    }

    pub fn is_live_out(&self, block: usize, reg: Register) -> bool {
        self.live_out
            .get(&block)
            .map_or(false, |set| set.contains(&reg))
    }

    pub fn place(&mut self, id: NodeId, cycle: Cycle) {
        debug_assert!(self.nodes[id.0 as usize].cycle.is_none());
        self.nodes[id.0 as usize].cycle = Some(cycle);
    }

    pub fn unplace(&mut self, id: NodeId) {
        self.nodes[id.0 as usize].cycle = None;
    }

    // ---------------------------------------------------------------------
    // Edge iteration

    fn edge_in_scope(&self, e: &DepEdge, scope: Scope) -> bool {
        if !e.alive || (e.back_edge && !scope.include_back_edges) {
            return false;
        }
        let tail = &self.nodes[e.tail.0 as usize];
        let head = &self.nodes[e.head.0 as usize];
        tail.alive && head.alive && tail.block == scope.block && head.block == scope.block
    }

    pub fn in_edges(&self, scope: Scope, id: NodeId) -> impl Iterator<Item = (EdgeId, &DepEdge)> {
        self.in_edges[id.0 as usize]
            .iter()
            .map(move |eid| (*eid, &self.edges[eid.0 as usize]))
            .filter(move |(_, e)| self.edge_in_scope(e, scope))
    }

    pub fn out_edges(&self, scope: Scope, id: NodeId) -> impl Iterator<Item = (EdgeId, &DepEdge)> {
        self.out_edges[id.0 as usize]
            .iter()
            .map(move |eid| (*eid, &self.edges[eid.0 as usize]))
            .filter(move |(_, e)| self.edge_in_scope(e, scope))
    }

    pub fn predecessors(&self, scope: Scope, id: NodeId) -> FxHashSet<NodeId> {
        self.in_edges(scope, id).map(|(_, e)| e.tail).collect()
    }

    pub fn successors(&self, scope: Scope, id: NodeId) -> FxHashSet<NodeId> {
        self.out_edges(scope, id).map(|(_, e)| e.head).collect()
    }

    // ---------------------------------------------------------------------
    // Cycle bounds

    /// Lower bound on the cycle of `id` from its currently scheduled
    /// predecessors.  Unscheduled predecessors do not constrain (bottom-up
    /// scheduling places them afterwards, earlier in time).
    pub fn earliest_cycle(&self, scope: Scope, id: NodeId, ii: u32) -> Cycle {
        self.earliest_cycle_ignoring(scope, id, ii, false, false)
    }

    /// As [`Ddg::earliest_cycle`], with selected edge classes ignored.
    pub fn earliest_cycle_ignoring(
        &self,
        scope: Scope,
        id: NodeId,
        ii: u32,
        ignore_reg_war: bool,
        ignore_guards: bool,
    ) -> Cycle {
        let mut earliest = 0;
        for (_, e) in self.in_edges(scope, id) {
            match e.kind {
                DepKind::RegisterWar(_) if ignore_reg_war => continue,
                DepKind::GuardRaw if ignore_guards => continue,
                _ => {}
            }
            if let Some(tail_cycle) = self.nodes[e.tail.0 as usize].cycle {
                let adj = if e.back_edge { ii as i64 } else { 0 };
                earliest = earliest.max(tail_cycle + e.latency - adj);
            }
        }
        earliest
    }

    /// Upper bound on the cycle of `id` from its currently scheduled
    /// successors; `None` means unconstrained.
    pub fn latest_cycle(&self, scope: Scope, id: NodeId, ii: u32) -> Option<Cycle> {
        self.latest_cycle_ignoring(scope, id, ii, false, false, false)
    }

    /// As [`Ddg::latest_cycle`], with selected edge classes ignored.  Used to
    /// ask "how late could this go if renaming removed the anti edges".
    pub fn latest_cycle_ignoring(
        &self,
        scope: Scope,
        id: NodeId,
        ii: u32,
        ignore_reg_waw: bool,
        ignore_reg_war: bool,
        ignore_guards: bool,
    ) -> Option<Cycle> {
        let mut latest: Option<Cycle> = None;
        for (_, e) in self.out_edges(scope, id) {
            match e.kind {
                DepKind::RegisterWaw(_) if ignore_reg_waw => continue,
                DepKind::RegisterWar(_) if ignore_reg_war => continue,
                DepKind::GuardRaw if ignore_guards => continue,
                _ => {}
            }
            if let Some(head_cycle) = self.nodes[e.head.0 as usize].cycle {
                let adj = if e.back_edge { ii as i64 } else { 0 };
                let bound = head_cycle - e.latency + adj;
                latest = Some(latest.map_or(bound, |l: Cycle| l.min(bound)));
            }
        }
        latest
    }

    // ---------------------------------------------------------------------
    // Bypass support

    /// The single register-RAW predecessor of `id`, if there is exactly one.
    pub fn only_register_raw_source(&self, scope: Scope, id: NodeId) -> Option<NodeId> {
        let mut sources = self
            .in_edges(scope, id)
            .filter(|(_, e)| matches!(e.kind, DepKind::RegisterRaw(_)) && !e.back_edge)
            .map(|(_, e)| e.tail);
        match (sources.next(), sources.next()) {
            (Some(s), None) => Some(s),
            _ => None,
        }
    }

    /// The nodes reading the register `id` writes, reached by forward
    /// register-RAW edges within the scope.
    pub fn only_register_raw_destinations(&self, scope: Scope, id: NodeId) -> Vec<NodeId> {
        self.out_edges(scope, id)
            .filter(|(_, e)| matches!(e.kind, DepKind::RegisterRaw(_)) && !e.back_edge)
            .map(|(_, e)| e.head)
            .collect()
    }

    /// The incoming register-RAW edge of `id`, if it has exactly one.  A node
    /// with several reaching definitions cannot be bypassed.
    pub fn only_register_edge_in(&self, scope: Scope, id: NodeId) -> Option<EdgeId> {
        let mut edges = self
            .in_edges(scope, id)
            .filter(|(_, e)| matches!(e.kind, DepKind::RegisterRaw(_)))
            .map(|(eid, _)| eid);
        match (edges.next(), edges.next()) {
            (Some(e), None) => Some(e),
            _ => None,
        }
    }

    /// Whether the value `id` produces is still needed: some move reads it,
    /// or it writes a register live past the block.
    pub fn result_used(&self, scope: Scope, id: NodeId) -> bool {
        let node = self.node(id);
        match node.mv.destination {
            Terminal::Register(reg) => {
                if self.is_live_out(node.block, reg) {
                    return true;
                }
            }
            // Values delivered straight into ports are consumed by
            // definition.
            _ => return true,
        }
        let wide = Scope { include_back_edges: true, ..scope };
        self.out_edges(wide, id)
            .any(|(_, e)| matches!(e.kind, DepKind::RegisterRaw(_) | DepKind::GuardRaw))
    }

    /// Whether `user` may take its value straight off `source`'s source: the
    /// bypassed move must fire at least whenever the user does.
    pub fn guards_allow_bypass(&self, source: NodeId, user: NodeId) -> bool {
        let source_guard = &self.node(source).mv.guard;
        let user_guard = &self.node(user).mv.guard;
        source_guard.is_none() || source_guard == user_guard
    }

    /// Rewrites `user` to read from `source`'s source, recording everything
    /// needed to reverse the edit.  Fails (with no edit) when guards forbid
    /// it or no register-RAW edge ties the two nodes.
    pub fn merge(&mut self, source: NodeId, user: NodeId) -> bool {
        if !self.guards_allow_bypass(source, user) {
            return false;
        }
        let raw_edge = self.out_edges[source.0 as usize]
            .iter()
            .copied()
            .find(|eid| {
                let e = &self.edges[eid.0 as usize];
                e.alive && e.head == user && matches!(e.kind, DepKind::RegisterRaw(_))
            });
        let raw_edge = match raw_edge {
            Some(e) => e,
            None => return false,
        };

        let removed_edge = self.remove_edge(raw_edge);

        // The user inherits the producer's value dependencies: where the
        // producer's source came from, and the operation timing if the
        // producer reads a result port.
        let inherited: Vec<(NodeId, DepKind, i64, bool)> = self.in_edges[source.0 as usize]
            .iter()
            .map(|eid| &self.edges[eid.0 as usize])
            .filter(|e| {
                e.alive
                    && matches!(e.kind, DepKind::RegisterRaw(_) | DepKind::Operation)
                    && self.nodes[e.tail.0 as usize].alive
            })
            .map(|e| (e.tail, e.kind, e.latency, e.back_edge))
            .collect();
        let mut added_edges = Vec::with_capacity(inherited.len());
        for (tail, kind, latency, back) in inherited {
            added_edges.push(self.add_edge(tail, user, kind, latency, back));
        }

        let old_source = self.node(user).mv.source;
        let old_source_op = self.node(user).source_op;
        let new_source = self.node(source).mv.source;
        let source_op = self.node(source).source_op;

        self.node_mut(user).mv.source = new_source;
        let mut pushed_result = false;
        if let Some(po) = source_op {
            self.node_mut(user).source_op = Some(po);
            self.operation_mut(po).results.push(user);
            pushed_result = true;
        }

        self.merges.insert(
            (source, user),
            MergeUndo {
                old_source,
                old_source_op,
                added_edges,
                removed_edge,
                pushed_result,
            },
        );
        true
    }

    /// Exact inverse of [`Ddg::merge`].
    pub fn unmerge(&mut self, source: NodeId, user: NodeId) {
        let undo = self
            .merges
            .remove(&(source, user))
            .expect("unmerge without a recorded merge");
        for eid in undo.added_edges {
            if self.edges[eid.0 as usize].alive {
                self.remove_edge(eid);
            }
        }
        let e = undo.removed_edge;
        self.add_edge(e.tail, e.head, e.kind, e.latency, e.back_edge);
        if undo.pushed_result {
            if let Some(po) = self.node(user).source_op {
                self.operation_mut(po).results.retain(|n| *n != user);
            }
        }
        let node = self.node_mut(user);
        node.mv.source = undo.old_source;
        node.source_op = undo.old_source_op;
    }

    // ---------------------------------------------------------------------
    // Node removal

    /// Preserves every ordering that flows through `id` by connecting its
    /// predecessors to its successors with summed latencies.  Call before
    /// [`Ddg::drop_node`].
    pub fn copy_deps_over(&mut self, id: NodeId) {
        let ins: Vec<(NodeId, DepKind, i64, bool)> = self.in_edges[id.0 as usize]
            .iter()
            .map(|eid| &self.edges[eid.0 as usize])
            .filter(|e| e.alive && self.nodes[e.tail.0 as usize].alive)
            .map(|e| (e.tail, e.kind, e.latency, e.back_edge))
            .collect();
        let outs: Vec<(NodeId, DepKind, i64, bool)> = self.out_edges[id.0 as usize]
            .iter()
            .map(|eid| &self.edges[eid.0 as usize])
            .filter(|e| e.alive && self.nodes[e.head.0 as usize].alive)
            .map(|e| (e.head, e.kind, e.latency, e.back_edge))
            .collect();

        for (tail, in_kind, in_lat, in_back) in &ins {
            for (head, out_kind, out_lat, out_back) in &outs {
                if tail == head {
                    continue;
                }
                // Keep the incoming flavor unless it is an operation edge,
                // which must not leak outside its operation.
                let kind = match in_kind {
                    DepKind::Operation => *out_kind,
                    k => *k,
                };
                if matches!(kind, DepKind::Operation) {
                    continue;
                }
                let latency = in_lat + out_lat;
                let back = *in_back || *out_back;
                let exists = self.out_edges[tail.0 as usize].iter().any(|eid| {
                    let e = &self.edges[eid.0 as usize];
                    e.alive
                        && e.head == *head
                        && e.kind == kind
                        && e.latency >= latency
                        && e.back_edge == back
                });
                if !exists {
                    self.add_edge(*tail, *head, kind, latency, back);
                }
            }
        }
    }

    /// Removes `id` and its edges.  The node must be unplaced.
    pub fn drop_node(&mut self, id: NodeId) {
        debug_assert!(self.nodes[id.0 as usize].cycle.is_none());
        let incident: Vec<EdgeId> = self.in_edges[id.0 as usize]
            .iter()
            .chain(self.out_edges[id.0 as usize].iter())
            .copied()
            .collect();
        for eid in incident {
            if self.edges[eid.0 as usize].alive {
                self.remove_edge(eid);
            }
        }
        let (source_op, dest_op) = {
            let node = &mut self.nodes[id.0 as usize];
            node.alive = false;
            (node.source_op, node.dest_op)
        };
        if let Some(po) = source_op {
            self.ops[po.0 as usize].results.retain(|n| *n != id);
        }
        if let Some(po) = dest_op {
            self.ops[po.0 as usize].operands.retain(|n| *n != id);
        }
    }

    /// Once the trigger of `po` is known, dependencies that model the
    /// function-unit state (memory order, side effects) belong on it rather
    /// than whichever operand they were first attached to.
    pub fn move_fu_dependencies_to_trigger(&mut self, po: PoId, trigger: NodeId) {
        let operands: Vec<NodeId> = self.ops[po.0 as usize]
            .operands
            .iter()
            .copied()
            .filter(|n| *n != trigger)
            .collect();
        for n in operands {
            let moved: Vec<EdgeId> = self.in_edges[n.0 as usize]
                .iter()
                .chain(self.out_edges[n.0 as usize].iter())
                .copied()
                .filter(|eid| {
                    let e = &self.edges[eid.0 as usize];
                    e.alive && e.kind.is_memory()
                })
                .collect();
            for eid in moved {
                let e = self.remove_edge(eid);
                if e.tail == n {
                    self.add_edge(trigger, e.head, e.kind, e.latency, e.back_edge);
                } else {
                    self.add_edge(e.tail, trigger, e.kind, e.latency, e.back_edge);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Priorities

    /// Longest latency-weighted path from each node to a sink of the scoped
    /// graph, back edges excluded.  The bottom-up selector schedules the
    /// highest value first.
    pub fn heights(&self, scope: Scope) -> FxHashMap<NodeId, i64> {
        let scope = Scope { include_back_edges: false, ..scope };
        let mut heights = FxHashMap::default();
        let nodes: Vec<NodeId> = self.nodes_in(scope).collect();
        // Repeated relaxation in reverse insertion order converges in one
        // pass for the common forward-built graphs and terminates regardless
        // because the scoped graph is acyclic without back edges.
        let mut stack: Vec<(NodeId, bool)> = nodes.iter().map(|n| (*n, false)).collect();
        let mut visiting = FxHashSet::default();
        while let Some((n, expanded)) = stack.pop() {
            if heights.contains_key(&n) {
                continue;
            }
            if expanded {
                visiting.remove(&n);
                let mut h = 0;
                for (_, e) in self.out_edges(scope, n) {
                    if let Some(hh) = heights.get(&e.head) {
                        h = h.max(e.latency + *hh);
                    }
                }
                heights.insert(n, h);
            } else {
                if !visiting.insert(n) {
                    continue;
                }
                stack.push((n, true));
                for (_, e) in self.out_edges(scope, n) {
                    if !heights.contains_key(&e.head) {
                        stack.push((e.head, false));
                    }
                }
            }
        }
        heights
    }

    /// Longest latency-weighted path from sources to sinks: a cheap lower
    /// bound on the block's schedule length.
    pub fn critical_path_length(&self, scope: Scope) -> i64 {
        self.heights(scope).values().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_machine::{HwOperation, MachineBuilder};
    use relay_program::{BasicBlock, Guard, Move, OpRef, Register};
    use rustc_hash::FxHashSet;

    fn machine() -> relay_machine::Machine {
        let mut b = MachineBuilder::new("t");
        b.register_file("int", 8, 32, 2, 2);
        b.guard_register_file("bool", 2, 1, 1);
        b.function_unit(
            "alu",
            vec![HwOperation::new("add", 2, 2).with_result(3, 1).commutative()],
        );
        b.function_unit(
            "lsu",
            vec![
                HwOperation::new("ld", 1, 1).with_result(2, 2).memory_read(),
                HwOperation::new("st", 2, 2).memory_write(),
            ],
        );
        b.control_unit(3, 1);
        let bus = b.bus("b0", 8, true);
        b.fully_connect(bus);
        b.all_guards(bus);
        b.build().unwrap()
    }

    fn r(i: u16) -> relay_program::Terminal {
        relay_program::Terminal::reg(relay_machine::RfId(0), i)
    }

    fn alu_port(operand: u8) -> relay_program::Terminal {
        relay_program::Terminal::FuPort {
            op: OpRef { fu: relay_machine::FuId(0), op: 0 },
            operand,
        }
    }

    const SCOPE: Scope = Scope { block: 0, include_back_edges: false };

    fn add_block_ddg(moves: Vec<Move>) -> Ddg {
        let machine = machine();
        build_block_ddg(
            &machine,
            0,
            &BasicBlock::from_moves(moves),
            false,
            FxHashSet::default(),
        )
    }

    #[test]
    fn register_edges_from_linear_stream() {
        // write r1; read r1 into the ALU; overwrite r1.
        let ddg = add_block_ddg(vec![
            Move::new(relay_program::Terminal::Immediate(3), r(1)),
            Move::new(r(1), alu_port(1)),
            Move::new(relay_program::Terminal::Immediate(9), r(1)),
        ]);
        let def = NodeId(0);
        let read = NodeId(1);
        let redef = NodeId(2);

        let kinds: Vec<DepKind> = ddg.out_edges(SCOPE, def).map(|(_, e)| e.kind).collect();
        assert!(kinds.iter().any(|k| matches!(k, DepKind::RegisterRaw(_))));
        assert!(kinds.iter().any(|k| matches!(k, DepKind::RegisterWaw(_))));
        let war: Vec<_> = ddg
            .out_edges(SCOPE, read)
            .filter(|(_, e)| matches!(e.kind, DepKind::RegisterWar(_)))
            .map(|(_, e)| e.head)
            .collect();
        assert_eq!(war, vec![redef]);
    }

    #[test]
    fn operation_edges_carry_result_latency() {
        let ddg = add_block_ddg(vec![
            Move::new(r(1), alu_port(1)),
            Move::new(r(2), alu_port(2)),
            Move::new(alu_port(3), r(3)),
        ]);
        assert_eq!(ddg.ops.len(), 1);
        let result = NodeId(2);
        let op_edges: Vec<i64> = ddg
            .in_edges(SCOPE, result)
            .filter(|(_, e)| e.kind == DepKind::Operation)
            .map(|(_, e)| e.latency)
            .collect();
        assert_eq!(op_edges, vec![1, 1]);
    }

    #[test]
    fn guard_edges_use_guard_latency() {
        let b0 = Register { rf: relay_machine::RfId(1), index: 0 };
        let mut guarded = Move::new(r(1), r(2));
        guarded.guard = Some(Guard { register: b0, inverted: false });
        let ddg = add_block_ddg(vec![
            Move::new(relay_program::Terminal::Immediate(1), relay_program::Terminal::Register(b0)),
            guarded,
        ]);
        let e: Vec<_> = ddg
            .in_edges(SCOPE, NodeId(1))
            .filter(|(_, e)| e.kind == DepKind::GuardRaw)
            .map(|(_, e)| (e.tail, e.latency))
            .collect();
        assert_eq!(e, vec![(NodeId(0), 1)]);
    }

    #[test]
    fn memory_order_between_triggers() {
        // store then load: the load's trigger depends on the store's.
        let lsu_st = |operand| relay_program::Terminal::FuPort {
            op: OpRef { fu: relay_machine::FuId(1), op: 1 },
            operand,
        };
        let lsu_ld = |operand| relay_program::Terminal::FuPort {
            op: OpRef { fu: relay_machine::FuId(1), op: 0 },
            operand,
        };
        let ddg = add_block_ddg(vec![
            Move::new(r(1), lsu_st(1)),
            Move::new(r(2), lsu_st(2)), // trigger
            Move::new(r(3), lsu_ld(1)), // trigger
            Move::new(lsu_ld(2), r(4)),
        ]);
        let raw: Vec<_> = ddg
            .in_edges(SCOPE, NodeId(2))
            .filter(|(_, e)| e.kind == DepKind::MemoryRaw)
            .map(|(_, e)| e.tail)
            .collect();
        assert_eq!(raw, vec![NodeId(1)]);
    }

    #[test]
    fn earliest_and_latest_track_placements() {
        let mut ddg = add_block_ddg(vec![
            Move::new(relay_program::Terminal::Immediate(3), r(1)),
            Move::new(r(1), alu_port(1)),
        ]);
        assert_eq!(ddg.earliest_cycle(SCOPE, NodeId(1), 0), 0);
        ddg.place(NodeId(0), 10);
        assert_eq!(ddg.earliest_cycle(SCOPE, NodeId(1), 0), 11);
        assert_eq!(ddg.latest_cycle(SCOPE, NodeId(0), 0), None);
        ddg.place(NodeId(1), 20);
        ddg.unplace(NodeId(0));
        assert_eq!(ddg.latest_cycle(SCOPE, NodeId(0), 0), Some(19));
    }

    #[test]
    fn merge_rewrites_and_unmerge_restores() {
        let mut ddg = add_block_ddg(vec![
            Move::new(relay_program::Terminal::Immediate(3), r(1)),
            Move::new(r(1), alu_port(1)),
        ]);
        let producer = NodeId(0);
        let user = NodeId(1);
        assert!(ddg.merge(producer, user));
        assert_eq!(
            ddg.node(user).mv.source,
            relay_program::Terminal::Immediate(3)
        );
        assert!(!ddg.result_used(SCOPE, producer));

        ddg.unmerge(producer, user);
        assert_eq!(ddg.node(user).mv.source, r(1));
        assert!(ddg.result_used(SCOPE, producer));
    }

    #[test]
    fn merge_refuses_weaker_guard() {
        let b0 = Register { rf: relay_machine::RfId(1), index: 0 };
        let mut producer = Move::new(relay_program::Terminal::Immediate(3), r(1));
        producer.guard = Some(Guard { register: b0, inverted: false });
        let ddg_moves = vec![producer, Move::new(r(1), alu_port(1))];
        let mut ddg = add_block_ddg(ddg_moves);
        // The consumer is unconditional; folding a guarded producer into it
        // would lose the predicate.
        assert!(!ddg.merge(NodeId(0), NodeId(1)));
    }

    #[test]
    fn drop_preserves_transitive_order() {
        // a defines r1, b copies r1 to r2, c reads r2.
        let mut ddg = add_block_ddg(vec![
            Move::new(relay_program::Terminal::Immediate(3), r(1)),
            Move::new(r(1), r(2)),
            Move::new(r(2), alu_port(1)),
        ]);
        let (a, b, c) = (NodeId(0), NodeId(1), NodeId(2));
        ddg.copy_deps_over(b);
        ddg.drop_node(b);
        assert!(!ddg.is_alive(b));

        // The combined edge keeps both hops' latencies.
        ddg.place(a, 5);
        assert_eq!(ddg.earliest_cycle(SCOPE, c, 0), 7);
    }

    #[test]
    fn heights_follow_longest_path() {
        let ddg = add_block_ddg(vec![
            Move::new(relay_program::Terminal::Immediate(3), r(1)),
            Move::new(r(1), alu_port(1)),
            Move::new(r(2), alu_port(2)),
            Move::new(alu_port(3), r(3)),
        ]);
        let h = ddg.heights(SCOPE);
        // imm -> operand (1) -> result (1): height 2 for the constant load.
        assert_eq!(h[&NodeId(3)], 0);
        assert_eq!(h[&NodeId(1)], 1);
        assert_eq!(h[&NodeId(0)], 2);
    }

    #[test]
    fn loop_edges_wrap_the_block() {
        let machine = machine();
        let ddg = build_block_ddg(
            &machine,
            0,
            &BasicBlock::from_moves(vec![
                Move::new(r(1), alu_port(1)),
                Move::new(relay_program::Terminal::Immediate(1), alu_port(2)),
                Move::new(alu_port(3), r(1)),
            ]),
            true,
            FxHashSet::default(),
        );
        let wide = Scope { block: 0, include_back_edges: true };
        let back: Vec<_> = ddg
            .out_edges(wide, NodeId(2))
            .filter(|(_, e)| e.back_edge)
            .map(|(_, e)| (e.head, e.kind))
            .collect();
        // The result write feeds next iteration's upward-exposed read.
        assert!(back
            .iter()
            .any(|(h, k)| *h == NodeId(0) && matches!(k, DepKind::RegisterRaw(_))));
        // And the plain scope hides the wrap.
        assert!(ddg.out_edges(SCOPE, NodeId(2)).all(|(_, e)| !e.back_edge));
    }
}
