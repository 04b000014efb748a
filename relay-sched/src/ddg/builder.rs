//! Construction of the dependence graph from the linear move stream.
//!
//! One forward walk per block: per-register last-definition and
//! reads-since-definition tables drive the register edges, a per-block memory
//! chain drives the memory edges, and destination/source function-unit ports
//! group moves into program operations as they appear.

use rustc_hash::{FxHashMap, FxHashSet};

use relay_machine::Machine;
use relay_program::{BasicBlock, ControlFlowGraph, OpRef, Register};

use super::{Cycle, Ddg, DepKind, NodeId, PoId};

/// Latency of a register write to a subsequent read of the same register.
const RAW_LATENCY: Cycle = 1;
/// A write may share a cycle with the reads of the previous value.
const WAR_LATENCY: Cycle = 0;
/// Two writes of one register must sit in distinct cycles.
const WAW_LATENCY: Cycle = 1;

struct BlockState {
    last_write: FxHashMap<Register, NodeId>,
    reads_since_write: FxHashMap<Register, Vec<NodeId>>,
    first_write: FxHashMap<Register, NodeId>,
    /// Reads that happen before any write of the register in this block.
    upward_reads: FxHashMap<Register, Vec<NodeId>>,
    last_mem_write: Option<NodeId>,
    mem_reads_since: Vec<NodeId>,
    first_mem_write: Option<NodeId>,
    upward_mem_reads: Vec<NodeId>,
    open_ops: FxHashMap<OpRef, PoId>,
}

impl BlockState {
    fn new() -> BlockState {
        BlockState {
            last_write: FxHashMap::default(),
            reads_since_write: FxHashMap::default(),
            first_write: FxHashMap::default(),
            upward_reads: FxHashMap::default(),
            last_mem_write: None,
            mem_reads_since: Vec::new(),
            first_mem_write: None,
            upward_mem_reads: Vec::new(),
            open_ops: FxHashMap::default(),
        }
    }
}

/// Builds the whole-procedure graph: intra-block edges for every block, plus
/// loop-carried (back) edges for the blocks in `loop_blocks`.
///
/// `always_live` names registers with meaning beyond the procedure (stack
/// discipline, return values); writes to them are never dead.
pub fn build_ddg(
    cfg: &ControlFlowGraph,
    machine: &Machine,
    loop_blocks: &FxHashSet<usize>,
    always_live: &FxHashSet<Register>,
) -> Ddg {
    let mut ddg = Ddg::new(cfg.name().to_owned());

    // Conservative cross-block liveness: a register read anywhere else in the
    // procedure stays live out of this block.
    let mut reads_by_block: FxHashMap<usize, FxHashSet<Register>> = FxHashMap::default();
    for n in cfg.nodes() {
        let cfg_node = cfg.block(n);
        let entry = reads_by_block.entry(cfg_node.origin).or_default();
        for m in cfg_node.bb.moves() {
            entry.extend(m.read_registers());
        }
    }
    for n in cfg.nodes() {
        let origin = cfg.block(n).origin;
        let mut live: FxHashSet<Register> = always_live.clone();
        for (other, reads) in &reads_by_block {
            if *other != origin {
                live.extend(reads.iter().copied());
            }
        }
        // A loop body reads its own upward-exposed values again next
        // iteration; the back edges carry that, so nothing extra here.
        ddg.set_live_out(origin, live);
    }

    for n in cfg.nodes() {
        let cfg_node = cfg.block(n);
        build_block(
            &mut ddg,
            machine,
            cfg_node.origin,
            &cfg_node.bb,
            loop_blocks.contains(&cfg_node.origin),
        );
    }
    ddg
}

fn build_block(
    ddg: &mut Ddg,
    machine: &Machine,
    block: usize,
    bb: &BasicBlock,
    loop_antideps: bool,
) {
    let mut st = BlockState::new();
    let guard_latency = machine.guard_latency() as Cycle;

    for m in bb.moves() {
        let node = ddg.add_node(m.clone(), block);

        // Program-operation membership first: results need the operand set.
        if let Some((op, operand)) = m.destination.as_fu_port() {
            let hw = op.hw(machine);
            if hw.is_input(operand) {
                let po = match st.open_ops.get(&op) {
                    Some(po)
                        if ddg.operation(*po).results.is_empty()
                            && !operand_index_taken(ddg, *po, machine, operand) =>
                    {
                        *po
                    }
                    _ => {
                        let po = ddg.add_operation(op);
                        st.open_ops.insert(op, po);
                        po
                    }
                };
                ddg.node_mut(node).dest_op = Some(po);
                ddg.operation_mut(po).operands.push(node);
            }
        }
        if let Some((op, operand)) = m.source.as_fu_port() {
            let hw = op.hw(machine);
            if !hw.is_input(operand) {
                if let Some(po) = st.open_ops.get(&op).copied() {
                    ddg.node_mut(node).source_op = Some(po);
                    ddg.operation_mut(po).results.push(node);
                    let latency = hw.latency(operand).unwrap_or(1) as Cycle;
                    let operands: Vec<NodeId> =
                        ddg.operation(po).operands.iter().copied().collect();
                    for o in operands {
                        ddg.add_edge(o, node, DepKind::Operation, latency, false);
                    }
                }
            }
        }

        // Register reads: the source and the guard.
        if let Some(reg) = m.source.as_register() {
            note_read(ddg, &mut st, reg, node, DepKind::RegisterRaw(reg), RAW_LATENCY);
        }
        if let Some(g) = m.guard {
            note_read(ddg, &mut st, g.register, node, DepKind::GuardRaw, guard_latency);
        }

        // Register write.
        if let Some(reg) = m.destination.as_register() {
            if let Some(readers) = st.reads_since_write.get(&reg) {
                for r in readers.clone() {
                    if r != node {
                        ddg.add_edge(r, node, DepKind::RegisterWar(reg), WAR_LATENCY, false);
                    }
                }
            }
            if let Some(w) = st.last_write.get(&reg).copied() {
                ddg.add_edge(w, node, DepKind::RegisterWaw(reg), WAW_LATENCY, false);
            }
            st.last_write.insert(reg, node);
            st.first_write.entry(reg).or_insert(node);
            st.reads_since_write.insert(reg, Vec::new());
        }

        // Memory state changes hang off the trigger write.
        if let Some((op, operand)) = m.destination.as_fu_port() {
            let hw = op.hw(machine);
            if hw.is_input(operand) && operand == hw.trigger {
                let writes = hw.writes_memory || hw.has_side_effects;
                let reads = hw.reads_memory || hw.has_side_effects;
                if reads && !writes {
                    if let Some(w) = st.last_mem_write {
                        ddg.add_edge(w, node, DepKind::MemoryRaw, RAW_LATENCY, false);
                    } else {
                        st.upward_mem_reads.push(node);
                    }
                    st.mem_reads_since.push(node);
                }
                if writes {
                    for r in st.mem_reads_since.drain(..) {
                        ddg.add_edge(r, node, DepKind::MemoryWar, WAR_LATENCY, false);
                    }
                    if let Some(w) = st.last_mem_write {
                        ddg.add_edge(w, node, DepKind::MemoryWaw, WAW_LATENCY, false);
                    } else if reads {
                        st.upward_mem_reads.push(node);
                    }
                    st.last_mem_write = Some(node);
                    st.first_mem_write.get_or_insert(node);
                }
            }
        }
    }

    if loop_antideps {
        add_loop_edges(ddg, &st);
    }
}

fn operand_index_taken(ddg: &Ddg, po: PoId, machine: &Machine, operand: u8) -> bool {
    ddg.operation(po).operands.iter().any(|n| {
        ddg.node(*n)
            .mv
            .destination
            .as_fu_port()
            .map_or(false, |(op, o)| o == operand && op.hw(machine).is_input(o))
    })
}

fn note_read(
    ddg: &mut Ddg,
    st: &mut BlockState,
    reg: Register,
    node: NodeId,
    kind: DepKind,
    latency: Cycle,
) {
    if let Some(w) = st.last_write.get(&reg).copied() {
        ddg.add_edge(w, node, kind, latency, false);
    } else {
        st.upward_reads.entry(reg).or_default().push(node);
    }
    st.reads_since_write.entry(reg).or_default().push(node);
}

/// Loop-carried edges for a single-block loop body: the end-of-block state
/// of each register feeds the upward-exposed uses of the next iteration.
fn add_loop_edges(ddg: &mut Ddg, st: &BlockState) {
    for (reg, last_write) in &st.last_write {
        if let Some(reads) = st.upward_reads.get(reg) {
            for r in reads {
                ddg.add_edge(*last_write, *r, DepKind::RegisterRaw(*reg), RAW_LATENCY, true);
            }
        }
        if let Some(first_write) = st.first_write.get(reg) {
            if let Some(readers) = st.reads_since_write.get(reg) {
                for r in readers {
                    if r != first_write {
                        ddg.add_edge(*r, *first_write, DepKind::RegisterWar(*reg), WAR_LATENCY, true);
                    }
                }
            }
            ddg.add_edge(*last_write, *first_write, DepKind::RegisterWaw(*reg), WAW_LATENCY, true);
        }
    }
    if let Some(last_mem_write) = st.last_mem_write {
        for r in &st.upward_mem_reads {
            ddg.add_edge(last_mem_write, *r, DepKind::MemoryRaw, RAW_LATENCY, true);
        }
        if let Some(first_mem_write) = st.first_mem_write {
            for r in &st.mem_reads_since {
                ddg.add_edge(*r, first_mem_write, DepKind::MemoryWar, WAR_LATENCY, true);
            }
            ddg.add_edge(last_mem_write, first_mem_write, DepKind::MemoryWaw, WAW_LATENCY, true);
        }
    }
}

/// Builds the graph of one block only; the whole-procedure graph above the
/// configured memory threshold costs more than it helps.
pub fn build_block_ddg(
    machine: &Machine,
    block: usize,
    bb: &BasicBlock,
    loop_antideps: bool,
    live_out: FxHashSet<Register>,
) -> Ddg {
    let mut ddg = Ddg::new(format!("bb{block}"));
    ddg.set_live_out(block, live_out);
    build_block(&mut ddg, machine, block, bb, loop_antideps);
    ddg
}
