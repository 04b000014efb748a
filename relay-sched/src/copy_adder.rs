//! Connectivity legalization: temp-register copy chains.
//!
//! When the interconnect has no bus from a move's source to its destination,
//! the move is split into a chain of copies through reserved scratch
//! registers, one per bridging register file.  The chain is spliced into the
//! dependence graph so every ordering that held for the original move holds
//! end-to-end for the chain.

use rustc_hash::FxHashMap;

use relay_machine::{Connectivity, PortRef, RfId};
use relay_program::{Move, Register, Terminal};

use crate::ddg::{Ddg, DepKind, NodeId, PoId, Scope};
use crate::error::ScheduleError;

/// Hops added for one original move, in transport order.  For an operand
/// move the hops precede it (the original keeps the port write); for a
/// result move they follow it (the original keeps the port read).
pub type Chain = Vec<NodeId>;

pub struct CopyAdder<'c, 'm> {
    conn: &'c Connectivity<'m>,
    /// The reserved scratch register of each bridging file.
    scratch_by_rf: FxHashMap<RfId, Register>,
    scratch_rfs: Vec<RfId>,
}

impl<'c, 'm> CopyAdder<'c, 'm> {
    pub fn new(conn: &'c Connectivity<'m>, scratch: &[Register]) -> Self {
        let scratch_by_rf = scratch.iter().map(|r| (r.rf, *r)).collect();
        let scratch_rfs = scratch.iter().map(|r| r.rf).collect();
        CopyAdder {
            conn,
            scratch_by_rf,
            scratch_rfs,
        }
    }

    /// Whether `mv` is representable without help.
    pub fn can_transport(&self, mv: &Move) -> bool {
        let guard = mv.guard.map(|g| g.bus_guard());
        let dst = match mv.destination.destination_port() {
            Some(d) => d,
            None => return true,
        };
        match mv.source {
            Terminal::Immediate(v) => {
                self.conn.can_transport_immediate(v, dst, guard)
                    || self.conn.can_transport_long_immediate(v, dst)
            }
            Terminal::InstructionRef(_) => true,
            _ => match mv.source.source_port() {
                Some(src) => self.conn.is_connected(src, dst, guard),
                None => true,
            },
        }
    }

    /// Adds the minimum chains an operation needs: one per operand or result
    /// move the interconnect cannot carry.  Returns the chains keyed by the
    /// original node.
    pub fn add_minimum_copies(
        &self,
        ddg: &mut Ddg,
        scope: Scope,
        po: PoId,
    ) -> Result<FxHashMap<NodeId, Chain>, ScheduleError> {
        let mut chains = FxHashMap::default();
        let operands: Vec<NodeId> = ddg.operation(po).operands.to_vec();
        let results: Vec<NodeId> = ddg.operation(po).results.to_vec();
        for node in operands {
            if !self.can_transport(&ddg.node(node).mv) {
                let chain = self.add_copies_before(ddg, scope, node)?;
                chains.insert(node, chain);
            }
        }
        for node in results {
            if !self.can_transport(&ddg.node(node).mv) {
                let chain = self.add_copies_after(ddg, scope, node)?;
                chains.insert(node, chain);
            }
        }
        Ok(chains)
    }

    /// Chain for a register-to-register (or immediate-to-register) move.
    pub fn add_copies_for_move(
        &self,
        ddg: &mut Ddg,
        scope: Scope,
        node: NodeId,
    ) -> Result<Option<Chain>, ScheduleError> {
        if self.can_transport(&ddg.node(node).mv) {
            return Ok(None);
        }
        self.add_copies_before(ddg, scope, node).map(Some)
    }

    fn chain_rfs(&self, ddg: &Ddg, node: NodeId) -> Result<Vec<RfId>, ScheduleError> {
        let mv = &ddg.node(node).mv;
        let guard = mv.guard.map(|g| g.bus_guard());
        let dst = mv
            .destination
            .destination_port()
            .expect("chains legalize port or register destinations");
        let found = match mv.source {
            Terminal::Immediate(v) => {
                // The first hop's source is the constant itself, so the
                // entry points are the scratch files some bus can feed it
                // into.
                let mut best: Option<Vec<RfId>> = None;
                for head in &self.scratch_rfs {
                    let reachable = self.conn.can_transport_immediate(
                        v,
                        PortRef::RfWrite(*head),
                        guard,
                    ) || self.conn.can_transport_long_immediate(v, PortRef::RfWrite(*head));
                    if !reachable {
                        continue;
                    }
                    let tail = if self.conn.is_connected(PortRef::RfRead(*head), dst, guard) {
                        Some(vec![*head])
                    } else {
                        self.conn
                            .scratch_chain(PortRef::RfRead(*head), dst, guard, &self.scratch_rfs)
                            .map(|mut rest| {
                                rest.insert(0, *head);
                                rest
                            })
                    };
                    if let Some(chain) = tail {
                        if best.as_ref().map_or(true, |b| chain.len() < b.len()) {
                            best = Some(chain);
                        }
                    }
                }
                best
            }
            _ => {
                let src = mv
                    .source
                    .source_port()
                    .expect("non-immediate chain sources sit on ports");
                self.conn.scratch_chain(src, dst, guard, &self.scratch_rfs)
            }
        };
        found.ok_or_else(|| ScheduleError::ConnectivityUnsatisfiable {
            block: ddg.node(node).block,
            mv: mv.to_string(),
        })
    }

    /// Splices `src -> s1 -> ... -> sk` in front of `node`, which keeps its
    /// destination and ends up reading `sk`.
    fn add_copies_before(
        &self,
        ddg: &mut Ddg,
        scope: Scope,
        node: NodeId,
    ) -> Result<Chain, ScheduleError> {
        let rfs = self.chain_rfs(ddg, node)?;
        let block = ddg.node(node).block;
        let guard = ddg.node(node).mv.guard;
        let original_source = ddg.node(node).mv.source;

        let mut chain = Vec::with_capacity(rfs.len());
        let mut source = original_source;
        for rf in &rfs {
            let scratch = self.scratch_by_rf[rf];
            let mut mv = Move::new(source, Terminal::Register(scratch));
            mv.guard = guard;
            let hop = ddg.add_temp_node(mv, block);
            chain.push(hop);
            source = Terminal::Register(scratch);
        }
        ddg.node_mut(node).mv.source = source;

        // Edges that reached the original through its source now reach the
        // first hop; the hop order is wired with register dependencies on
        // the scratch values.
        let first = chain[0];
        let value_in: Vec<_> = ddg
            .in_edges(Scope { include_back_edges: true, ..scope }, node)
            .filter(|(_, e)| match e.kind {
                DepKind::RegisterRaw(r) => Some(r) == original_source.as_register(),
                _ => false,
            })
            .map(|(eid, _)| eid)
            .collect();
        for eid in value_in {
            let e = ddg.remove_edge(eid);
            ddg.add_edge(e.tail, first, e.kind, e.latency, e.back_edge);
        }
        let war_out: Vec<_> = ddg
            .out_edges(Scope { include_back_edges: true, ..scope }, node)
            .filter(|(_, e)| match e.kind {
                DepKind::RegisterWar(r) => Some(r) == original_source.as_register(),
                _ => false,
            })
            .map(|(eid, _)| eid)
            .collect();
        for eid in war_out {
            let e = ddg.remove_edge(eid);
            ddg.add_edge(first, e.head, e.kind, e.latency, e.back_edge);
        }
        if let Some(g) = guard {
            self.copy_guard_edges(ddg, scope, node, &chain, g.register);
        }

        let mut prev = first;
        for hop in chain.iter().skip(1).chain(std::iter::once(&node)) {
            let scratch = ddg.node(prev).mv.destination.as_register().expect("hop writes scratch");
            ddg.add_edge(prev, *hop, DepKind::RegisterRaw(scratch), 1, false);
            self.serialize_scratch_use(ddg, scope, prev, *hop, scratch);
            prev = *hop;
        }
        Ok(chain)
    }

    /// Splices `s1 -> ... -> dst` after `node`, which keeps its source and
    /// ends up writing `s1`.
    fn add_copies_after(
        &self,
        ddg: &mut Ddg,
        scope: Scope,
        node: NodeId,
    ) -> Result<Chain, ScheduleError> {
        let rfs = self.chain_rfs(ddg, node)?;
        let block = ddg.node(node).block;
        let guard = ddg.node(node).mv.guard;
        let original_dest = ddg.node(node).mv.destination;

        let mut chain = Vec::with_capacity(rfs.len());
        let mut source = Terminal::Register(self.scratch_by_rf[&rfs[0]]);
        ddg.node_mut(node).mv.destination = source;
        for rf in rfs.iter().skip(1) {
            let scratch = self.scratch_by_rf[rf];
            let mut mv = Move::new(source, Terminal::Register(scratch));
            mv.guard = guard;
            chain.push(ddg.add_temp_node(mv, block));
            source = Terminal::Register(scratch);
        }
        let mut last_mv = Move::new(source, original_dest);
        last_mv.guard = guard;
        let last = ddg.add_temp_node(last_mv, block);
        chain.push(last);

        // The original's destination-side edges belong to the chain's final
        // write now.
        let wide = Scope { include_back_edges: true, ..scope };
        let dest_reg = original_dest.as_register();
        let moved_out: Vec<_> = ddg
            .out_edges(wide, node)
            .filter(|(_, e)| e.kind.register().is_some() && e.kind.register() == dest_reg)
            .map(|(eid, _)| eid)
            .collect();
        for eid in moved_out {
            let e = ddg.remove_edge(eid);
            ddg.add_edge(last, e.head, e.kind, e.latency, e.back_edge);
        }
        let moved_in: Vec<_> = ddg
            .in_edges(wide, node)
            .filter(|(_, e)| e.kind.is_register_anti() && e.kind.register() == dest_reg)
            .map(|(eid, _)| eid)
            .collect();
        for eid in moved_in {
            let e = ddg.remove_edge(eid);
            ddg.add_edge(e.tail, last, e.kind, e.latency, e.back_edge);
        }
        if let Some(g) = guard {
            self.copy_guard_edges(ddg, scope, node, &chain, g.register);
        }

        let mut prev = node;
        for hop in &chain {
            let scratch = ddg.node(prev).mv.destination.as_register().expect("hop writes scratch");
            ddg.add_edge(prev, *hop, DepKind::RegisterRaw(scratch), 1, false);
            self.serialize_scratch_use(ddg, scope, prev, *hop, scratch);
            prev = *hop;
        }
        Ok(chain)
    }

    /// The guard definition must reach every hop, not only the original.
    fn copy_guard_edges(
        &self,
        ddg: &mut Ddg,
        scope: Scope,
        node: NodeId,
        chain: &[NodeId],
        guard_reg: Register,
    ) {
        let wide = Scope { include_back_edges: true, ..scope };
        let guard_in: Vec<_> = ddg
            .in_edges(wide, node)
            .filter(|(_, e)| e.kind == DepKind::GuardRaw)
            .filter(|(_, e)| {
                ddg.node(e.head).mv.guard.map_or(false, |g| g.register == guard_reg)
            })
            .map(|(_, e)| (e.tail, e.latency, e.back_edge))
            .collect();
        for hop in chain {
            for (tail, latency, back) in &guard_in {
                ddg.add_edge(*tail, *hop, DepKind::GuardRaw, *latency, *back);
            }
        }
    }

    /// Scratch registers are shared by every chain in the block.  A new
    /// chain runs (bottom-up) earlier in time than the chains already
    /// spliced, so its uses of the scratch register are ordered before the
    /// existing writes.
    fn serialize_scratch_use(
        &self,
        ddg: &mut Ddg,
        scope: Scope,
        writer: NodeId,
        reader: NodeId,
        scratch: Register,
    ) {
        let others: Vec<NodeId> = ddg
            .nodes_in(scope)
            .filter(|id| *id != writer && *id != reader)
            .filter(|id| {
                let n = ddg.node(*id);
                n.is_temp_copy && n.mv.destination == Terminal::Register(scratch)
            })
            .collect();
        for other in others {
            ddg.add_edge(writer, other, DepKind::RegisterWaw(scratch), 1, false);
            ddg.add_edge(reader, other, DepKind::RegisterWar(scratch), 0, false);
        }
    }
}
