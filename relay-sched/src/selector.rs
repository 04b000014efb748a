//! The bottom-up ready list.
//!
//! A move-node group — a lone move, or every move of one program operation —
//! becomes ready when everything that must execute *after* it is already
//! placed.  Groups are handed out most-critical first, where criticality is
//! the longest latency-weighted path to a sink of the block; control-flow
//! moves outrank everything so the block's end is fixed before the rest
//! packs in against it.

use std::collections::BinaryHeap;

use either::Either;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::ddg::{Ddg, NodeId, PoId, Scope};

use relay_machine::Machine;

/// What the scheduler works on next: one move, or one whole operation.
#[derive(Debug, Clone)]
pub struct MoveNodeGroup {
    pub nodes: SmallVec<[NodeId; 4]>,
    pub po: Option<PoId>,
}

type GroupKey = Either<NodeId, PoId>;

#[derive(PartialEq, Eq)]
struct Entry {
    /// Control-flow moves pin the block end; schedule them first.
    control: bool,
    height: i64,
    /// Later pushes win ties so freshly unlocked work is revisited first.
    seq: u64,
    key: GroupKey,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.control, self.height, self.seq).cmp(&(other.control, other.height, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct BuSelector<'m> {
    machine: &'m Machine,
    scope: Scope,
    heap: BinaryHeap<Entry>,
    heights: FxHashMap<NodeId, i64>,
    heights_dirty: bool,
    seq: u64,
}

impl<'m> BuSelector<'m> {
    pub fn new(ddg: &Ddg, scope: Scope, machine: &'m Machine) -> Self {
        let mut selector = BuSelector {
            machine,
            scope,
            heap: BinaryHeap::new(),
            heights: ddg.heights(scope),
            heights_dirty: false,
            seq: 0,
        };
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        for id in ddg.nodes_in(scope).collect::<Vec<_>>() {
            if seen.contains(&id) {
                continue;
            }
            let group = selector.group_of(ddg, id);
            seen.extend(group.nodes.iter().copied());
            if selector.is_ready(ddg, &group) {
                selector.push(ddg, &group);
            }
        }
        selector
    }

    /// The group `id` is scheduled with.
    pub fn group_of(&self, ddg: &Ddg, id: NodeId) -> MoveNodeGroup {
        let node = ddg.node(id);
        let po = node.dest_op.or(node.source_op);
        match po {
            Some(po) => {
                let op = ddg.operation(po);
                let nodes: SmallVec<[NodeId; 4]> = op
                    .operands
                    .iter()
                    .chain(op.results.iter())
                    .copied()
                    .filter(|n| ddg.is_alive(*n))
                    .collect();
                MoveNodeGroup { nodes, po: Some(po) }
            }
            None => MoveNodeGroup {
                nodes: SmallVec::from_slice(&[id]),
                po: None,
            },
        }
    }

    /// Bottom-up readiness: every successor outside the group is placed.
    pub fn is_ready(&self, ddg: &Ddg, group: &MoveNodeGroup) -> bool {
        // Back edges point at next iteration's instances; they never gate
        // readiness.
        let scope = Scope { include_back_edges: false, ..self.scope };
        if group.nodes.iter().all(|n| ddg.node(*n).is_scheduled()) {
            return false;
        }
        group.nodes.iter().all(|n| {
            ddg.out_edges(scope, *n).all(|(_, e)| {
                group.nodes.contains(&e.head) || ddg.node(e.head).is_scheduled()
            })
        })
    }

    fn push(&mut self, ddg: &Ddg, group: &MoveNodeGroup) {
        let height = group
            .nodes
            .iter()
            .filter_map(|n| self.heights.get(n))
            .copied()
            .max()
            .unwrap_or(0);
        let control = group
            .nodes
            .iter()
            .any(|n| ddg.node(*n).mv.is_control_flow(self.machine));
        let key = match group.po {
            Some(po) => Either::Right(po),
            None => Either::Left(group.nodes[0]),
        };
        self.seq += 1;
        self.heap.push(Entry { control, height, seq: self.seq, key });
    }

    /// The next ready group, most critical first.  `None` when everything
    /// alive in the scope is placed.
    pub fn candidates(&mut self, ddg: &Ddg) -> Option<MoveNodeGroup> {
        if self.heights_dirty {
            self.heights = ddg.heights(self.scope);
            self.heights_dirty = false;
        }
        while let Some(entry) = self.heap.pop() {
            let seed = match entry.key {
                Either::Left(node) => {
                    if !ddg.is_alive(node) {
                        continue;
                    }
                    node
                }
                Either::Right(po) => match ddg
                    .operation(po)
                    .operands
                    .iter()
                    .chain(ddg.operation(po).results.iter())
                    .copied()
                    .find(|n| ddg.is_alive(*n))
                {
                    Some(n) => n,
                    None => continue,
                },
            };
            let group = self.group_of(ddg, seed);
            if group.nodes.is_empty() || !self.is_ready(ddg, &group) {
                continue;
            }
            return Some(group);
        }
        None
    }

    /// `node` was placed: whatever feeds it may have become ready.
    pub fn notify_scheduled(&mut self, ddg: &Ddg, node: NodeId) {
        let scope = Scope { include_back_edges: false, ..self.scope };
        let preds = ddg.predecessors(scope, node);
        for pred in preds {
            self.might_be_ready(ddg, pred);
        }
    }

    /// A hint after a graph edit: requeue `node`'s group if it looks ready.
    /// Temp copies are placed by the operation that created them, never
    /// through the ready list.
    pub fn might_be_ready(&mut self, ddg: &Ddg, node: NodeId) {
        if !ddg.is_alive(node) || ddg.node(node).is_temp_copy {
            return;
        }
        let group = self.group_of(ddg, node);
        if self.is_ready(ddg, &group) {
            self.push(ddg, &group);
        }
    }

    /// Path lengths changed (a node was dropped or rewired); recompute them
    /// before the next pop.
    pub fn invalidate_priorities(&mut self) {
        self.heights_dirty = true;
    }
}
