//! Live-range register renaming.
//!
//! When an anti dependence (and nothing else) keeps a move from scheduling
//! late enough, rewriting its live range to a register nobody is fighting
//! over removes the edge.  Renaming is a heuristic: every entry point is
//! allowed to fail silently, and every successful rename hands back an undo
//! record so a failing operation attempt can roll it back.

use indexmap::IndexSet;
use rustc_hash::FxHashSet;

use relay_machine::{Connectivity, Machine, RfId};
use relay_program::{Register, Terminal};

use crate::ddg::{Cycle, Ddg, DepEdge, DepKind, EdgeId, NodeId, Scope};

/// Everything needed to reverse one rename.
pub struct RenameUndo {
    /// `(node, old source, old destination, old guard register)` snapshots.
    moves: Vec<(NodeId, Terminal, Terminal)>,
    removed_edges: Vec<DepEdge>,
    added_edges: Vec<EdgeId>,
    /// Register returned to the free pool on undo.
    taken: Option<Register>,
}

struct LiveRange {
    def: NodeId,
    reads: Vec<NodeId>,
    reg: Register,
}

pub struct RegisterRenamer<'m> {
    machine: &'m Machine,
    /// Registers with fixed roles (stack discipline, return values,
    /// connectivity scratch); never candidates, never renamed.
    reserved: FxHashSet<Register>,
    /// Registers referenced in other blocks of the procedure.
    used_elsewhere: FxHashSet<Register>,
    free: IndexSet<Register>,
}

impl<'m> RegisterRenamer<'m> {
    pub fn new(
        machine: &'m Machine,
        reserved: FxHashSet<Register>,
        used_elsewhere: FxHashSet<Register>,
    ) -> Self {
        RegisterRenamer {
            machine,
            reserved,
            used_elsewhere,
            free: IndexSet::new(),
        }
    }

    /// Scans the block and collects the architectural registers no one
    /// touches anywhere: those are free for renaming.
    pub fn initialize(&mut self, ddg: &Ddg, scope: Scope) {
        let mut used: FxHashSet<Register> = self.used_elsewhere.clone();
        used.extend(self.reserved.iter().copied());
        for id in ddg.nodes_in(scope) {
            let mv = &ddg.node(id).mv;
            if let Some(r) = mv.source.as_register() {
                used.insert(r);
            }
            if let Some(r) = mv.destination.as_register() {
                used.insert(r);
            }
            if let Some(g) = mv.guard {
                used.insert(g.register);
            }
        }
        self.free.clear();
        for (i, rf) in self.machine.register_files.iter().enumerate() {
            if rf.guard_capable {
                continue;
            }
            for index in 0..rf.size {
                let reg = Register { rf: RfId(i), index };
                if !used.contains(&reg) {
                    self.free.insert(reg);
                }
            }
        }
    }

    pub fn free_register_count(&self) -> usize {
        self.free.len()
    }

    /// Renames the live range feeding `node`'s source so the range stops
    /// colliding with other uses of the register.
    pub fn rename_source_register(
        &mut self,
        ddg: &mut Ddg,
        conn: &Connectivity<'_>,
        scope: Scope,
        node: NodeId,
        allow_different_rf: bool,
        direct_connect_only: bool,
        latest_cycle: Cycle,
    ) -> Option<RenameUndo> {
        let reg = ddg.node(node).mv.source.as_register()?;
        let range = self.live_range_of_use(ddg, scope, node, reg)?;
        self.rename_live_range(
            ddg,
            conn,
            scope,
            range,
            allow_different_rf,
            direct_connect_only,
            latest_cycle,
        )
    }

    /// Renames the live range defined by `node`'s destination.
    pub fn rename_destination_register(
        &mut self,
        ddg: &mut Ddg,
        conn: &Connectivity<'_>,
        scope: Scope,
        node: NodeId,
        allow_different_rf: bool,
        direct_connect_only: bool,
        latest_cycle: Cycle,
    ) -> Option<RenameUndo> {
        let reg = ddg.node(node).mv.destination.as_register()?;
        let range = self.live_range_of_def(ddg, scope, node, reg)?;
        self.rename_live_range(
            ddg,
            conn,
            scope,
            range,
            allow_different_rf,
            direct_connect_only,
            latest_cycle,
        )
    }

    /// Reverses a rename.
    pub fn undo(&mut self, ddg: &mut Ddg, undo: RenameUndo) {
        for eid in undo.added_edges {
            ddg.remove_edge(eid);
        }
        for e in undo.removed_edges {
            ddg.add_edge(e.tail, e.head, e.kind, e.latency, e.back_edge);
        }
        for (id, source, destination) in undo.moves {
            let mv = &mut ddg.node_mut(id).mv;
            mv.source = source;
            mv.destination = destination;
        }
        if let Some(r) = undo.taken {
            self.free.insert(r);
        }
    }

    // ---------------------------------------------------------------------

    /// The transitive read set of the single in-block definition reaching
    /// `use_node`.  Fails on live-in values, multiple reaching definitions,
    /// loop-carried ranges, and values that must survive the block.
    fn live_range_of_use(
        &self,
        ddg: &Ddg,
        scope: Scope,
        use_node: NodeId,
        reg: Register,
    ) -> Option<LiveRange> {
        let mut defs = ddg
            .in_edges(scope, use_node)
            .filter(|(_, e)| e.kind == DepKind::RegisterRaw(reg) && !e.back_edge)
            .map(|(_, e)| e.tail);
        let def = defs.next()?;
        if defs.next().is_some() {
            return None;
        }
        self.live_range_of_def(ddg, scope, def, reg)
    }

    fn live_range_of_def(
        &self,
        ddg: &Ddg,
        scope: Scope,
        def: NodeId,
        reg: Register,
    ) -> Option<LiveRange> {
        if self.reserved.contains(&reg) || self.used_elsewhere.contains(&reg) {
            return None;
        }
        if ddg.is_live_out(ddg.node(def).block, reg) {
            return None;
        }
        let wide = Scope { include_back_edges: true, ..scope };
        let mut reads = Vec::new();
        for (_, e) in ddg.out_edges(wide, def) {
            match e.kind {
                DepKind::RegisterRaw(r) if r == reg => {
                    if e.back_edge {
                        // Loop-carried value; the range spans iterations.
                        return None;
                    }
                    reads.push(e.head);
                }
                DepKind::GuardRaw => {
                    if ddg.node(e.head).mv.guard.map_or(false, |g| g.register == reg) {
                        // Guard sources stay put.
                        return None;
                    }
                }
                _ => {}
            }
        }
        // Reads with several reaching definitions tie this range to another;
        // renaming one side would break the other.
        for r in &reads {
            let def_count = ddg
                .in_edges(wide, *r)
                .filter(|(_, e)| e.kind == DepKind::RegisterRaw(reg))
                .count();
            if def_count != 1 {
                return None;
            }
        }
        Some(LiveRange { def, reads, reg })
    }

    /// Candidate registers for the range, register reuse first.
    fn candidates(
        &self,
        ddg: &Ddg,
        scope: Scope,
        rf: RfId,
        allow_different_rf: bool,
        latest_cycle: Cycle,
    ) -> Vec<Register> {
        let mut out = Vec::new();
        // A register whose every use in the block is already placed later
        // than this range will ever reach can be shared with it.  Sharing
        // beats burning a fresh register.
        let mut partially_free: IndexSet<Register> = IndexSet::new();
        let mut unusable: FxHashSet<Register> = FxHashSet::default();
        for id in ddg.nodes_in(scope) {
            let node = ddg.node(id);
            for reg in node
                .mv
                .source
                .as_register()
                .into_iter()
                .chain(node.mv.destination.as_register())
            {
                if self.reserved.contains(&reg)
                    || self.used_elsewhere.contains(&reg)
                    || ddg.is_live_out(node.block, reg)
                {
                    unusable.insert(reg);
                    continue;
                }
                match node.cycle {
                    Some(c) if c > latest_cycle => {
                        partially_free.insert(reg);
                    }
                    _ => {
                        unusable.insert(reg);
                    }
                }
            }
            if let Some(g) = node.mv.guard {
                unusable.insert(g.register);
            }
        }
        let width = self.machine.register_file(rf).width;
        let rf_ok = |r: &Register| {
            r.rf == rf || (allow_different_rf && self.machine.register_file(r.rf).width >= width)
        };
        out.extend(
            partially_free
                .into_iter()
                .filter(|r| !unusable.contains(r) && rf_ok(r)),
        );
        out.extend(self.free.iter().copied().filter(|r| rf_ok(r)));
        out
    }

    fn rename_live_range(
        &mut self,
        ddg: &mut Ddg,
        conn: &Connectivity<'_>,
        scope: Scope,
        range: LiveRange,
        allow_different_rf: bool,
        direct_connect_only: bool,
        latest_cycle: Cycle,
    ) -> Option<RenameUndo> {
        let old = range.reg;
        let candidates =
            self.candidates(ddg, scope, old.rf, allow_different_rf, latest_cycle);
        let new = candidates.into_iter().find(|cand| {
            *cand != old
                && (!direct_connect_only || self.range_connected(ddg, conn, &range, *cand))
        })?;

        let mut undo = RenameUndo {
            moves: Vec::new(),
            removed_edges: Vec::new(),
            added_edges: Vec::new(),
            taken: None,
        };
        if self.free.swap_remove(&new) {
            undo.taken = Some(new);
        }

        // Rewrite the terminals.
        let new_term = Terminal::Register(new);
        for id in std::iter::once(range.def).chain(range.reads.iter().copied()) {
            let node = ddg.node(id);
            undo.moves.push((id, node.mv.source, node.mv.destination));
            let mv = &mut ddg.node_mut(id).mv;
            if id == range.def {
                mv.destination = new_term;
            }
            if id != range.def && mv.source == Terminal::Register(old) {
                mv.source = new_term;
            }
        }

        // The edges inside the range keep their shape under the new name;
        // the anti edges that encoded the old name go away.
        self.rewrite_edges(ddg, scope, &range, old, new, &mut undo);

        tracing::trace!(
            "renamed {} -> {} over {} reads",
            old,
            new,
            range.reads.len()
        );
        Some(undo)
    }

    /// Every move of the range must still be representable with the new
    /// register.
    fn range_connected(
        &self,
        ddg: &Ddg,
        conn: &Connectivity<'_>,
        range: &LiveRange,
        new: Register,
    ) -> bool {
        let write = PortProbe::destination(ddg, range.def, new);
        if !write.check(conn) {
            return false;
        }
        range.reads.iter().all(|r| {
            let read = PortProbe::source(ddg, *r, new);
            read.check(conn)
        })
    }

    fn rewrite_edges(
        &mut self,
        ddg: &mut Ddg,
        scope: Scope,
        range: &LiveRange,
        old: Register,
        new: Register,
        undo: &mut RenameUndo,
    ) {
        let wide = Scope { include_back_edges: true, ..scope };
        let members: FxHashSet<NodeId> = std::iter::once(range.def)
            .chain(range.reads.iter().copied())
            .collect();

        // Collect every register edge mentioning the old name that touches
        // the range.
        let mut internal: Vec<EdgeId> = Vec::new();
        let mut boundary: Vec<(EdgeId, bool)> = Vec::new();
        for id in members.iter().copied() {
            for (eid, e) in ddg.in_edges(wide, id).chain(ddg.out_edges(wide, id)) {
                if e.kind.register() != Some(old) {
                    continue;
                }
                if members.contains(&e.tail) && members.contains(&e.head) {
                    if !internal.contains(&eid) {
                        internal.push(eid);
                    }
                } else if !boundary.iter().any(|(x, _)| *x == eid) {
                    boundary.push((eid, e.kind.is_register_anti()));
                }
            }
        }

        // Internal edges: same dependence, new name.
        for eid in internal {
            let e = ddg.remove_edge(eid);
            undo.removed_edges.push(e.clone());
            let kind = match e.kind {
                DepKind::RegisterRaw(_) => DepKind::RegisterRaw(new),
                DepKind::RegisterWar(_) => DepKind::RegisterWar(new),
                DepKind::RegisterWaw(_) => DepKind::RegisterWaw(new),
                k => k,
            };
            undo.added_edges
                .push(ddg.add_edge(e.tail, e.head, kind, e.latency, e.back_edge));
        }
        // Boundary anti edges encoded sharing of the old name; the new name
        // does not share with those nodes.
        for (eid, anti) in boundary {
            if anti {
                undo.removed_edges.push(ddg.remove_edge(eid));
            }
        }

        // If the new name is partially used, order this range before the
        // first write of the sharer.
        let sharer_first_write = ddg.nodes_in(scope).find(|id| {
            !members.contains(id) && ddg.node(*id).mv.destination == Terminal::Register(new)
        });
        if let Some(w) = sharer_first_write {
            for r in range.reads.iter().copied() {
                undo.added_edges
                    .push(ddg.add_edge(r, w, DepKind::RegisterWar(new), 0, false));
            }
            undo.added_edges
                .push(ddg.add_edge(range.def, w, DepKind::RegisterWaw(new), 1, false));
        }
    }
}

/// One end of a prospective rewritten move, for connectivity probing.
struct PortProbe {
    src: Option<relay_machine::PortRef>,
    dst: Option<relay_machine::PortRef>,
    guard: Option<relay_machine::BusGuard>,
    immediate: Option<i64>,
}

impl PortProbe {
    fn source(ddg: &Ddg, node: NodeId, new: Register) -> PortProbe {
        let mv = &ddg.node(node).mv;
        PortProbe {
            src: Terminal::Register(new).source_port(),
            dst: mv.destination.destination_port(),
            guard: mv.guard.map(|g| g.bus_guard()),
            immediate: None,
        }
    }

    fn destination(ddg: &Ddg, node: NodeId, new: Register) -> PortProbe {
        let mv = &ddg.node(node).mv;
        PortProbe {
            src: mv.source.source_port(),
            dst: Terminal::Register(new).destination_port(),
            guard: mv.guard.map(|g| g.bus_guard()),
            immediate: mv.source.as_immediate(),
        }
    }

    fn check(&self, conn: &Connectivity<'_>) -> bool {
        let dst = match self.dst {
            Some(d) => d,
            None => return false,
        };
        match (self.src, self.immediate) {
            (Some(src), _) => conn.is_connected(src, dst, self.guard),
            (None, Some(v)) => {
                conn.can_transport_immediate(v, dst, self.guard)
                    || conn.can_transport_long_immediate(v, dst)
            }
            (None, None) => false,
        }
    }
}
