//! Static reachability queries over the interconnect.
//!
//! Everything here is answered from the wiring alone; cycle-by-cycle resource
//! availability is the resource manager's problem.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::{BusGuard, BusId, Machine, PortRef, RfId};

/// Connectivity oracle over one machine.
///
/// Holds a cache of register-file-to-register-file reachability, which the
/// temp-copy chain search hits hard; port-to-port queries go straight to the
/// bus tables.
pub struct Connectivity<'m> {
    machine: &'m Machine,
    rf_to_rf: FxHashMap<(RfId, RfId), bool>,
}

impl<'m> Connectivity<'m> {
    pub fn new(machine: &'m Machine) -> Self {
        let mut rf_to_rf = FxHashMap::default();
        for from in machine.rf_ids() {
            for to in machine.rf_ids() {
                let connected = machine.buses.iter().any(|bus| {
                    bus.sources.contains(&PortRef::RfRead(from))
                        && bus.destinations.contains(&PortRef::RfWrite(to))
                });
                rf_to_rf.insert((from, to), connected);
            }
        }
        Connectivity { machine, rf_to_rf }
    }

    pub fn machine(&self) -> &'m Machine {
        self.machine
    }

    /// Buses wired from `src` to `dst` that can evaluate `guard`.
    pub fn buses_connecting(
        &self,
        src: PortRef,
        dst: PortRef,
        guard: Option<BusGuard>,
    ) -> impl Iterator<Item = BusId> + '_ {
        self.machine
            .buses
            .iter()
            .enumerate()
            .filter(move |(_, bus)| {
                bus.sources.contains(&src)
                    && bus.destinations.contains(&dst)
                    && guard.map_or(true, |g| bus.supports_guard(g.rf, g.index, g.inverted))
            })
            .map(|(i, _)| BusId(i))
    }

    pub fn is_connected(&self, src: PortRef, dst: PortRef, guard: Option<BusGuard>) -> bool {
        self.buses_connecting(src, dst, guard).next().is_some()
    }

    /// Whether a value can be copied from `from` to `to` in one move.
    pub fn rf_connected(&self, from: RfId, to: RfId) -> bool {
        *self.rf_to_rf.get(&(from, to)).unwrap_or(&false)
    }

    /// Buses that can deliver `value` to `dst` as a short immediate.
    pub fn buses_carrying_immediate(
        &self,
        value: i64,
        dst: PortRef,
        guard: Option<BusGuard>,
    ) -> impl Iterator<Item = BusId> + '_ {
        self.machine
            .buses
            .iter()
            .enumerate()
            .filter(move |(_, bus)| {
                bus.immediate_fits(value)
                    && bus.destinations.contains(&dst)
                    && guard.map_or(true, |g| bus.supports_guard(g.rf, g.index, g.inverted))
            })
            .map(|(i, _)| BusId(i))
    }

    /// Whether `value` can reach `dst` as a short immediate on any bus.
    pub fn can_transport_immediate(
        &self,
        value: i64,
        dst: PortRef,
        guard: Option<BusGuard>,
    ) -> bool {
        self.buses_carrying_immediate(value, dst, guard).next().is_some()
    }

    /// Whether the machine can produce `value` through a long-immediate unit
    /// wired (via some bus) to `dst`.
    pub fn can_transport_long_immediate(&self, value: i64, _dst: PortRef) -> bool {
        // Long immediates are sign-extended on every target we model.
        match self.machine.max_immediate_width() {
            None => false,
            Some(w) => crate::required_immediate_width(value, true) <= w,
        }
    }

    /// Shortest chain of scratch register files bridging `src` to `dst`.
    ///
    /// Returns the intermediate files in transport order; `None` when no
    /// chain exists at all.  The direct connection case is the caller's to
    /// check first — an empty chain is never returned.
    ///
    /// The search runs breadth-first from both ends of the relation at once,
    /// meeting in the middle; with `k` scratch files and hop count `h` it
    /// touches O(k^(h/2)) states instead of O(k^h).
    pub fn scratch_chain(
        &self,
        src: PortRef,
        dst: PortRef,
        guard: Option<BusGuard>,
        scratch: &[RfId],
    ) -> Option<Vec<RfId>> {
        // Entry points: scratch files the source can write; exit points:
        // scratch files that can write the destination.
        let heads: Vec<RfId> = scratch
            .iter()
            .copied()
            .filter(|rf| self.is_connected(src, PortRef::RfWrite(*rf), guard))
            .collect();
        let tails: Vec<RfId> = scratch
            .iter()
            .copied()
            .filter(|rf| self.is_connected(PortRef::RfRead(*rf), dst, guard))
            .collect();
        if heads.is_empty() || tails.is_empty() {
            return None;
        }

        // parent maps double as visited sets; None parent marks a root.
        let mut fwd_parent: FxHashMap<RfId, Option<RfId>> = FxHashMap::default();
        let mut bwd_parent: FxHashMap<RfId, Option<RfId>> = FxHashMap::default();
        let mut fwd_queue: VecDeque<RfId> = VecDeque::new();
        let mut bwd_queue: VecDeque<RfId> = VecDeque::new();
        for rf in &heads {
            fwd_parent.insert(*rf, None);
            fwd_queue.push_back(*rf);
        }
        for rf in &tails {
            bwd_parent.insert(*rf, None);
            bwd_queue.push_back(*rf);
        }

        let assemble = |meet: RfId,
                        fwd: &FxHashMap<RfId, Option<RfId>>,
                        bwd: &FxHashMap<RfId, Option<RfId>>| {
            let mut chain = Vec::new();
            let mut cur = Some(meet);
            while let Some(rf) = cur {
                chain.push(rf);
                cur = fwd[&rf];
            }
            chain.reverse();
            let mut cur = bwd[&meet];
            while let Some(rf) = cur {
                chain.push(rf);
                cur = bwd[&rf];
            }
            chain
        };

        // A root on one side already visited by the other is an immediate
        // meet (single-file chain).
        for rf in &heads {
            if bwd_parent.contains_key(rf) {
                return Some(assemble(*rf, &fwd_parent, &bwd_parent));
            }
        }

        while !fwd_queue.is_empty() || !bwd_queue.is_empty() {
            // Expand the smaller frontier first.
            if !fwd_queue.is_empty()
                && (bwd_queue.is_empty() || fwd_queue.len() <= bwd_queue.len())
            {
                let layer = fwd_queue.len();
                for _ in 0..layer {
                    let cur = fwd_queue.pop_front().expect("layer counted");
                    for next in scratch.iter().copied() {
                        if fwd_parent.contains_key(&next) || !self.rf_connected(cur, next) {
                            continue;
                        }
                        fwd_parent.insert(next, Some(cur));
                        if bwd_parent.contains_key(&next) {
                            return Some(assemble(next, &fwd_parent, &bwd_parent));
                        }
                        fwd_queue.push_back(next);
                    }
                }
            } else if !bwd_queue.is_empty() {
                let layer = bwd_queue.len();
                for _ in 0..layer {
                    let cur = bwd_queue.pop_front().expect("layer counted");
                    for prev in scratch.iter().copied() {
                        if bwd_parent.contains_key(&prev) || !self.rf_connected(prev, cur) {
                            continue;
                        }
                        bwd_parent.insert(prev, Some(cur));
                        if fwd_parent.contains_key(&prev) {
                            return Some(assemble(prev, &fwd_parent, &bwd_parent));
                        }
                        bwd_queue.push_back(prev);
                    }
                }
            }
        }
        None
    }
}
