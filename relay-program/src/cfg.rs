use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use relay_machine::Machine;

use crate::{BasicBlock, InstrLoc, InstructionRefManager, Procedure, ProgramError, Terminal};

/// Kind of a control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfgEdge {
    /// Execution falls off the end of the block.
    FallThrough,
    /// An explicit jump move transfers here.
    Jump,
}

/// A basic block inside the graph, with its scheduling state and the stable
/// identity (`origin`) that instruction references and the dependence graph
/// use to name it.
#[derive(Debug)]
pub struct CfgNode {
    pub bb: BasicBlock,
    pub scheduled: bool,
    pub origin: usize,
}

/// The control-flow graph of one procedure.
///
/// Owns (a staging copy of) the blocks while the scheduler works; the
/// procedure itself stays untouched until [`ControlFlowGraph::commit`], so a
/// fatal scheduling error leaves no partial edits behind.
#[derive(Debug)]
pub struct ControlFlowGraph {
    name: String,
    graph: StableDiGraph<CfgNode, CfgEdge>,
    /// Emission order of the blocks; prologs/epilogs splice in here.
    layout: Vec<NodeIndex>,
    next_origin: usize,
}

impl ControlFlowGraph {
    /// Builds the graph from a procedure.  Checks the structural invariants
    /// the scheduler relies on: control-flow moves terminate their block and
    /// every jump target resolves.
    pub fn build(
        procedure: &Procedure,
        machine: &Machine,
        irm: &InstructionRefManager,
    ) -> Result<ControlFlowGraph, ProgramError> {
        if procedure.blocks.is_empty() {
            return Err(ProgramError::EmptyProcedure);
        }

        let mut graph = StableDiGraph::new();
        let mut layout = Vec::with_capacity(procedure.blocks.len());
        for (i, bb) in procedure.blocks.iter().enumerate() {
            let n = graph.add_node(CfgNode {
                bb: bb.clone(),
                scheduled: false,
                origin: i,
            });
            layout.push(n);
        }

        for (i, bb) in procedure.blocks.iter().enumerate() {
            let last = bb.instruction_count().saturating_sub(1);
            let mut falls_through = true;
            for (ii, instr) in bb.instructions.iter().enumerate() {
                for m in &instr.moves {
                    if !m.is_control_flow(machine) {
                        continue;
                    }
                    if ii != last {
                        return Err(ProgramError::ControlFlowNotLast { block: i });
                    }
                    if let Terminal::InstructionRef(r) = m.source {
                        let loc = irm
                            .resolve(r)
                            .ok_or(ProgramError::UnresolvedRef { block: i, reference: r })?;
                        graph.add_edge(layout[i], layout[loc.block], CfgEdge::Jump);
                        if m.guard.is_none() {
                            falls_through = false;
                        }
                    }
                    // A control-flow move reading the return-address register
                    // leaves the procedure; no edge, no fall-through.
                    if m.source == Terminal::ReturnAddress {
                        falls_through = false;
                    }
                }
            }
            if falls_through && i + 1 < procedure.blocks.len() {
                graph.add_edge(layout[i], layout[i + 1], CfgEdge::FallThrough);
            }
        }

        Ok(ControlFlowGraph {
            name: procedure.name.clone(),
            next_origin: procedure.blocks.len(),
            graph,
            layout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_count(&self) -> usize {
        self.layout.len()
    }

    /// Nodes in emission order.  Callers iterate over a snapshot, so block
    /// insertion mid-walk is safe.
    pub fn nodes(&self) -> Vec<NodeIndex> {
        self.layout.clone()
    }

    pub fn block(&self, n: NodeIndex) -> &CfgNode {
        &self.graph[n]
    }

    pub fn block_mut(&mut self, n: NodeIndex) -> &mut CfgNode {
        &mut self.graph[n]
    }

    pub fn node_by_origin(&self, origin: usize) -> Option<NodeIndex> {
        self.layout
            .iter()
            .copied()
            .find(|n| self.graph[*n].origin == origin)
    }

    pub fn is_scheduled(&self, n: NodeIndex) -> bool {
        self.graph[n].scheduled
    }

    pub fn set_scheduled(&mut self, n: NodeIndex) {
        self.graph[n].scheduled = true;
    }

    /// Whether `n` is a loop whose body is exactly itself: a jump edge back
    /// to `n`.
    pub fn is_single_block_loop(&self, n: NodeIndex) -> bool {
        self.graph
            .edges(n)
            .any(|e| e.target() == n && *e.weight() == CfgEdge::Jump)
    }

    /// The block `n` jumps to, if any.
    pub fn jump_successor(&self, n: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .edges(n)
            .find(|e| *e.weight() == CfgEdge::Jump)
            .map(|e| e.target())
    }

    pub fn successors(&self, n: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(n, Direction::Outgoing)
    }

    pub fn predecessors(&self, n: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(n, Direction::Incoming)
    }

    /// Inserts `bb` immediately before `n` in the emission order, moving
    /// every incoming edge of `n` — except the back edge `n -> n` — onto the
    /// new block, and falling through from it into `n`.  This is the loop
    /// prolog shape.
    pub fn insert_before(&mut self, n: NodeIndex, bb: BasicBlock) -> NodeIndex {
        let origin = self.next_origin;
        self.next_origin += 1;
        let new = self.graph.add_node(CfgNode {
            bb,
            scheduled: true,
            origin,
        });

        let incoming: Vec<_> = self
            .graph
            .edges_directed(n, Direction::Incoming)
            .filter(|e| e.source() != n)
            .map(|e| (e.id(), e.source(), *e.weight()))
            .collect();
        for (id, src, w) in incoming {
            self.graph.remove_edge(id);
            self.graph.add_edge(src, new, w);
        }
        self.graph.add_edge(new, n, CfgEdge::FallThrough);

        let pos = self.layout.iter().position(|x| *x == n).expect("n in layout");
        self.layout.insert(pos, new);
        new
    }

    /// Inserts `bb` immediately after `n`, moving `n`'s fall-through edge
    /// onto the new block.  This is the loop epilog shape.
    pub fn insert_after(&mut self, n: NodeIndex, bb: BasicBlock) -> NodeIndex {
        let origin = self.next_origin;
        self.next_origin += 1;
        let new = self.graph.add_node(CfgNode {
            bb,
            scheduled: true,
            origin,
        });

        let out: Vec<_> = self
            .graph
            .edges(n)
            .filter(|e| *e.weight() == CfgEdge::FallThrough)
            .map(|e| (e.id(), e.target()))
            .collect();
        for (id, dst) in out {
            self.graph.remove_edge(id);
            self.graph.add_edge(new, dst, CfgEdge::FallThrough);
        }
        self.graph.add_edge(n, new, CfgEdge::FallThrough);

        let pos = self.layout.iter().position(|x| *x == n).expect("n in layout");
        self.layout.insert(pos + 1, new);
        new
    }

    /// Writes the blocks back into the procedure in emission order and
    /// renumbers instruction references from origins to final indices.
    pub fn commit(self, procedure: &mut Procedure, irm: &mut InstructionRefManager) {
        let mut origin_to_final = vec![usize::MAX; self.next_origin];
        for (final_idx, n) in self.layout.iter().enumerate() {
            origin_to_final[self.graph[*n].origin] = final_idx;
        }
        procedure.blocks = self
            .layout
            .iter()
            .map(|n| self.graph[*n].bb.clone())
            .collect();
        irm.renumber_blocks(|old| {
            origin_to_final
                .get(old)
                .copied()
                .filter(|f| *f != usize::MAX)
                .unwrap_or(old)
        });
    }

    /// Redirects the jump references of every block other than `except` that
    /// currently resolve into `target`, making them resolve into `to`
    /// instead.  Used to route outside entries of a loop through its prolog
    /// while the back edge keeps jumping to the body.
    pub fn redirect_outside_jumps(
        &self,
        irm: &mut InstructionRefManager,
        target: NodeIndex,
        to: NodeIndex,
        except: NodeIndex,
    ) {
        let target_origin = self.graph[target].origin;
        let to_origin = self.graph[to].origin;
        for n in &self.layout {
            if *n == except {
                continue;
            }
            for instr in &self.graph[*n].bb.instructions {
                for m in &instr.moves {
                    if let Terminal::InstructionRef(r) = m.source {
                        if let Some(loc) = irm.resolve(r) {
                            if loc.block == target_origin {
                                irm.redirect(r, InstrLoc { block: to_origin, index: 0 });
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstrLoc, Instruction, Move, OpRef};
    use relay_machine::MachineBuilder;

    fn jump_move(machine: &Machine, r: crate::InstrRef) -> Move {
        let cu = machine.control.fu;
        Move::new(
            Terminal::InstructionRef(r),
            Terminal::FuPort { op: OpRef { fu: cu, op: 0 }, operand: 1 },
        )
    }

    fn loop_fixture() -> (Machine, Procedure, InstructionRefManager) {
        let mut b = MachineBuilder::new("m");
        b.register_file("int", 8, 32, 1, 1);
        b.control_unit(1, 1);
        let bus = b.bus("b0", 8, true);
        b.fully_connect(bus);
        let machine = b.build().unwrap();

        let mut irm = InstructionRefManager::new();
        let to_loop = irm.make_ref(InstrLoc { block: 1, index: 0 });

        let copy = Move::new(Terminal::reg(relay_machine::RfId(0), 0), Terminal::reg(relay_machine::RfId(0), 1));
        let mut back = jump_move(&machine, to_loop);
        back.guard = Some(crate::Guard {
            register: crate::Register { rf: relay_machine::RfId(0), index: 2 },
            inverted: false,
        });

        let blocks = vec![
            BasicBlock::from_moves(vec![copy.clone()]),
            BasicBlock::from_moves(vec![copy.clone(), back]),
            BasicBlock::from_moves(vec![copy]),
        ];
        (machine, Procedure::new("loopy", blocks), irm)
    }

    #[test]
    fn loop_shape_is_detected() {
        let (machine, procedure, irm) = loop_fixture();
        let cfg = ControlFlowGraph::build(&procedure, &machine, &irm).unwrap();
        let nodes = cfg.nodes();
        assert_eq!(nodes.len(), 3);
        assert!(!cfg.is_single_block_loop(nodes[0]));
        assert!(cfg.is_single_block_loop(nodes[1]));
        assert_eq!(cfg.jump_successor(nodes[1]), Some(nodes[1]));
    }

    #[test]
    fn prolog_insertion_rewires_entries() {
        let (machine, mut procedure, mut irm) = loop_fixture();
        let mut cfg = ControlFlowGraph::build(&procedure, &machine, &irm).unwrap();
        let nodes = cfg.nodes();
        let looped = nodes[1];

        let prolog = cfg.insert_before(looped, BasicBlock::default());
        // The fall-through entry comes from block 0 through the prolog now;
        // the back edge still closes on the loop itself.
        assert!(cfg.predecessors(looped).any(|p| p == prolog));
        assert!(cfg.predecessors(looped).any(|p| p == looped));
        assert!(!cfg.predecessors(looped).any(|p| p == nodes[0]));
        assert!(cfg.predecessors(prolog).any(|p| p == nodes[0]));

        cfg.commit(&mut procedure, &mut irm);
        assert_eq!(procedure.blocks.len(), 4);
        // The loop body slid one slot down; its back-edge target follows.
        let back = procedure.blocks[2].moves().last().unwrap().clone();
        match back.source {
            Terminal::InstructionRef(r) => {
                assert_eq!(irm.resolve(r), Some(InstrLoc { block: 2, index: 0 }));
            }
            other => panic!("expected a jump source, got {other}"),
        }
    }

    #[test]
    fn control_flow_must_terminate_block() {
        let (machine, mut procedure, mut irm) = loop_fixture();
        let jump = irm.make_ref(InstrLoc { block: 0, index: 0 });
        procedure.blocks[2]
            .instructions
            .insert(0, Instruction::of(jump_move(&machine, jump)));
        let err = ControlFlowGraph::build(&procedure, &machine, &irm).unwrap_err();
        assert_eq!(err, ProgramError::ControlFlowNotLast { block: 2 });
    }
}
