//! The reservation table: which bus, port, pipeline slot, and immediate slot
//! is taken in which cycle.
//!
//! The manager never fails loudly.  `earliest_cycle`/`latest_cycle` answer
//! with `None` when nothing fits, `assign` books exactly what a successful
//! probe promised, and `unassign` restores the table to the byte it was
//! before.  When an initiation interval is set, every booking is modulo that
//! interval.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use relay_machine::{BusId, FuId, Machine, RfId};
use relay_program::{Move, Terminal};

use crate::ddg::{Cycle, NodeId};

/// Default ceiling: far enough away that no real block reaches it, small
/// enough that latency arithmetic stays comfortable.
pub const DEFAULT_MAX_CYCLE: Cycle = i64::MAX / 1000;

#[derive(Debug, Default)]
struct CycleUse {
    buses: FxHashMap<BusId, NodeId>,
    fu_initiations: FxHashMap<FuId, NodeId>,
    fu_result_reads: FxHashMap<(FuId, u8), NodeId>,
    fu_operand_holds: FxHashMap<(FuId, u8), NodeId>,
    rf_reads: FxHashMap<RfId, u8>,
    rf_writes: FxHashMap<RfId, u8>,
    iu_uses: u8,
}

impl CycleUse {
    fn is_empty(&self) -> bool {
        self.buses.is_empty()
            && self.fu_initiations.is_empty()
            && self.fu_result_reads.is_empty()
            && self.fu_operand_holds.is_empty()
            && self.rf_reads.is_empty()
            && self.rf_writes.is_empty()
            && self.iu_uses == 0
    }
}

#[derive(Debug, Clone)]
struct Assignment {
    cycle: Cycle,
    bus: BusId,
    rf_read: Option<RfId>,
    rf_write: Option<RfId>,
    fu_result: Option<(FuId, u8)>,
    fu_initiation: Option<FuId>,
    /// Operand port held busy over `[cycle, hold_until]`.
    fu_operand: Option<(FuId, u8, Cycle)>,
    iu: bool,
}

pub struct ResourceManager<'m> {
    machine: &'m Machine,
    ii: u32,
    max_cycle: Cycle,
    cycles: BTreeMap<Cycle, CycleUse>,
    assigned: FxHashMap<NodeId, Assignment>,
}

impl<'m> ResourceManager<'m> {
    pub fn new(machine: &'m Machine, initiation_interval: u32) -> Self {
        ResourceManager {
            machine,
            ii: initiation_interval,
            max_cycle: DEFAULT_MAX_CYCLE,
            cycles: BTreeMap::new(),
            assigned: FxHashMap::default(),
        }
    }

    pub fn machine(&self) -> &'m Machine {
        self.machine
    }

    pub fn initiation_interval(&self) -> u32 {
        self.ii
    }

    /// Hard ceiling; probes and assignments beyond it fail.
    pub fn set_max_cycle(&mut self, c: Cycle) {
        self.max_cycle = c;
    }

    pub fn max_cycle(&self) -> Cycle {
        self.max_cycle
    }

    pub fn largest_cycle(&self) -> Option<Cycle> {
        self.assigned.values().map(|a| a.cycle).max()
    }

    pub fn smallest_cycle(&self) -> Option<Cycle> {
        self.assigned.values().map(|a| a.cycle).min()
    }

    pub fn is_assigned(&self, node: NodeId) -> bool {
        self.assigned.contains_key(&node)
    }

    pub fn cycle_of(&self, node: NodeId) -> Option<Cycle> {
        self.assigned.get(&node).map(|a| a.cycle)
    }

    /// Moves booked at effective cycle `eff`, with their buses.
    pub fn moves_at(&self, eff: Cycle) -> Vec<(NodeId, BusId)> {
        self.cycles
            .get(&eff)
            .map(|u| u.buses.iter().map(|(b, n)| (*n, *b)).collect())
            .unwrap_or_default()
    }

    fn eff(&self, cycle: Cycle) -> Cycle {
        if self.ii > 0 {
            cycle.rem_euclid(self.ii as i64)
        } else {
            cycle
        }
    }

    // ---------------------------------------------------------------------
    // Probes

    /// Whether any bus could ever carry this move, leaving occupancy aside.
    /// Saves a cycle-by-cycle walk over a move that can never fit.
    fn statically_feasible(&self, mv: &Move) -> bool {
        self.machine
            .bus_ids()
            .any(|b| self.bus_accepts(b, mv))
    }

    fn bus_accepts(&self, bus: BusId, mv: &Move) -> bool {
        let bus = self.machine.bus(bus);
        if let Some(g) = &mv.guard {
            let bg = g.bus_guard();
            if !bus.supports_guard(bg.rf, bg.index, bg.inverted) {
                return false;
            }
        }
        match mv.destination.destination_port() {
            Some(port) => {
                if !bus.destinations.contains(&port) {
                    return false;
                }
            }
            None => return false,
        }
        match mv.source {
            Terminal::Immediate(v) => {
                if mv.needs_long_imm {
                    // The wide constant arrives through an immediate unit;
                    // any bus reaching the destination will do.
                    !self.machine.immediate_units.is_empty()
                } else {
                    bus.immediate_fits(v)
                }
            }
            // Jump targets are immediates of address width; buses that carry
            // control-flow operands accept them.
            Terminal::InstructionRef(_) => true,
            _ => match mv.source.source_port() {
                Some(port) => bus.sources.contains(&port),
                None => false,
            },
        }
    }

    /// Whether `value` can reach the move's destination as a short immediate
    /// on any bus, regardless of occupancy.
    pub fn can_transport_immediate(&self, mv: &Move) -> bool {
        let value = match mv.source.as_immediate() {
            Some(v) => v,
            None => return false,
        };
        let dst = match mv.destination.destination_port() {
            Some(p) => p,
            None => return false,
        };
        self.machine.bus_ids().any(|b| {
            let bus = self.machine.bus(b);
            bus.immediate_fits(value)
                && bus.destinations.contains(&dst)
                && mv.guard.map_or(true, |g| {
                    let bg = g.bus_guard();
                    bus.supports_guard(bg.rf, bg.index, bg.inverted)
                })
        })
    }

    fn find_bus(&self, cycle: Cycle, mv: &Move) -> Option<BusId> {
        let eff = self.eff(cycle);
        let in_use = self.cycles.get(&eff);
        self.machine.bus_ids().find(|b| {
            self.bus_accepts(*b, mv)
                && in_use.map_or(true, |u| !u.buses.contains_key(b))
        })
    }

    /// Whether `mv` fits at `cycle` with every resource it needs, and on
    /// which bus.  `hold_until` extends the destination operand port's
    /// reservation up to the operation's trigger cycle.
    pub fn can_assign(&self, cycle: Cycle, mv: &Move, hold_until: Option<Cycle>) -> Option<BusId> {
        if cycle < 0 || cycle > self.max_cycle {
            return None;
        }
        if self.ii > 0 && hold_until.map_or(false, |h| h - cycle >= self.ii as i64) {
            // The port would wrap around and collide with itself.
            return None;
        }
        let bus = self.find_bus(cycle, mv)?;
        let eff = self.eff(cycle);
        let in_use = self.cycles.get(&eff);

        if mv.needs_long_imm {
            let iu_count = self.machine.immediate_units.len() as u8;
            if iu_count == 0 || in_use.map_or(false, |u| u.iu_uses >= iu_count) {
                return None;
            }
            let min_latency = self
                .machine
                .immediate_units
                .iter()
                .map(|iu| iu.latency)
                .min()
                .unwrap_or(0) as i64;
            if self.ii == 0 && cycle < min_latency {
                return None;
            }
        }

        if let Some(reg) = mv.source.as_register() {
            let ports = self.machine.register_file(reg.rf).read_ports;
            if in_use.map_or(false, |u| *u.rf_reads.get(&reg.rf).unwrap_or(&0) >= ports) {
                return None;
            }
        }
        if let Some((op, operand)) = mv.source.as_fu_port() {
            if in_use.map_or(false, |u| u.fu_result_reads.contains_key(&(op.fu, operand))) {
                return None;
            }
        }
        if let Some(reg) = mv.destination.as_register() {
            let ports = self.machine.register_file(reg.rf).write_ports;
            if in_use.map_or(false, |u| *u.rf_writes.get(&reg.rf).unwrap_or(&0) >= ports) {
                return None;
            }
        }
        if let Some((op, operand)) = mv.destination.as_fu_port() {
            let hw = op.hw(self.machine);
            if operand == hw.trigger
                && in_use.map_or(false, |u| u.fu_initiations.contains_key(&op.fu))
            {
                return None;
            }
            let until = hold_until.unwrap_or(cycle).max(cycle);
            for c in cycle..=until {
                let e = self.eff(c);
                if self
                    .cycles
                    .get(&e)
                    .map_or(false, |u| u.fu_operand_holds.contains_key(&(op.fu, operand)))
                {
                    return None;
                }
            }
        }
        Some(bus)
    }

    /// Smallest cycle `>= lower_bound` where `mv` fits.
    pub fn earliest_cycle(
        &self,
        lower_bound: Cycle,
        mv: &Move,
        hold_until: Option<Cycle>,
    ) -> Option<Cycle> {
        if !self.statically_feasible(mv) {
            return None;
        }
        let from = lower_bound.max(0);
        let to = if self.ii > 0 {
            (from + self.ii as i64 - 1).min(self.max_cycle)
        } else {
            self.max_cycle
        };
        (from..=to).find(|c| self.can_assign(*c, mv, hold_until).is_some())
    }

    /// Largest cycle `<= upper_bound` where `mv` fits.
    pub fn latest_cycle(
        &self,
        upper_bound: Cycle,
        mv: &Move,
        hold_until: Option<Cycle>,
    ) -> Option<Cycle> {
        if !self.statically_feasible(mv) {
            return None;
        }
        let from = upper_bound.min(self.max_cycle);
        let to = if self.ii > 0 {
            (from - self.ii as i64 + 1).max(0)
        } else {
            0
        };
        let mut c = from;
        while c >= to {
            if self.can_assign(c, mv, hold_until).is_some() {
                return Some(c);
            }
            c -= 1;
        }
        None
    }

    // ---------------------------------------------------------------------
    // Booking

    /// Books every resource `mv` needs at `cycle` and returns the chosen
    /// bus.  Succeeds exactly when [`ResourceManager::can_assign`] does.
    pub fn assign(
        &mut self,
        cycle: Cycle,
        node: NodeId,
        mv: &Move,
        hold_until: Option<Cycle>,
    ) -> Option<BusId> {
        debug_assert!(!self.assigned.contains_key(&node), "node assigned twice");
        let bus = self.can_assign(cycle, mv, hold_until)?;
        let eff = self.eff(cycle);

        let mut a = Assignment {
            cycle,
            bus,
            rf_read: None,
            rf_write: None,
            fu_result: None,
            fu_initiation: None,
            fu_operand: None,
            iu: mv.needs_long_imm,
        };

        let use_at = self.cycles.entry(eff).or_default();
        use_at.buses.insert(bus, node);
        if mv.needs_long_imm {
            use_at.iu_uses += 1;
        }
        if let Some(reg) = mv.source.as_register() {
            *use_at.rf_reads.entry(reg.rf).or_insert(0) += 1;
            a.rf_read = Some(reg.rf);
        }
        if let Some((op, operand)) = mv.source.as_fu_port() {
            use_at.fu_result_reads.insert((op.fu, operand), node);
            a.fu_result = Some((op.fu, operand));
        }
        if let Some(reg) = mv.destination.as_register() {
            *use_at.rf_writes.entry(reg.rf).or_insert(0) += 1;
            a.rf_write = Some(reg.rf);
        }
        if let Some((op, operand)) = mv.destination.as_fu_port() {
            let trigger = op.hw(self.machine).trigger;
            if operand == trigger {
                use_at.fu_initiations.insert(op.fu, node);
                a.fu_initiation = Some(op.fu);
            }
            let until = hold_until.unwrap_or(cycle).max(cycle);
            for c in cycle..=until {
                let e = self.eff(c);
                self.cycles
                    .entry(e)
                    .or_default()
                    .fu_operand_holds
                    .insert((op.fu, operand), node);
            }
            a.fu_operand = Some((op.fu, operand, until));
        }

        self.assigned.insert(node, a);
        Some(bus)
    }

    /// Exact inverse of [`ResourceManager::assign`].
    pub fn unassign(&mut self, node: NodeId) {
        let a = match self.assigned.remove(&node) {
            Some(a) => a,
            None => return,
        };
        let eff = self.eff(a.cycle);
        {
            let use_at = self.cycles.get_mut(&eff).expect("booked cycle exists");
            use_at.buses.remove(&a.bus);
            if a.iu {
                use_at.iu_uses -= 1;
            }
            if let Some(rf) = a.rf_read {
                decrement(&mut use_at.rf_reads, rf);
            }
            if let Some(rf) = a.rf_write {
                decrement(&mut use_at.rf_writes, rf);
            }
            if let Some(key) = a.fu_result {
                use_at.fu_result_reads.remove(&key);
            }
            if let Some(fu) = a.fu_initiation {
                use_at.fu_initiations.remove(&fu);
            }
        }
        if let Some((fu, operand, until)) = a.fu_operand {
            for c in a.cycle..=until {
                let e = self.eff(c);
                if let Some(use_at) = self.cycles.get_mut(&e) {
                    use_at.fu_operand_holds.remove(&(fu, operand));
                }
            }
        }
        // Drop empty rows so a full assign/unassign round trip compares
        // equal to the untouched table.
        let emptied: Vec<Cycle> = self
            .cycles
            .iter()
            .filter(|(_, u)| u.is_empty())
            .map(|(c, _)| *c)
            .collect();
        for c in emptied {
            self.cycles.remove(&c);
        }
    }

    /// A stable rendering of the whole table, for round-trip checks.
    pub fn snapshot(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (cycle, u) in &self.cycles {
            let mut buses: Vec<_> = u.buses.iter().map(|(b, n)| (b.0, n.0)).collect();
            buses.sort_unstable();
            let mut holds: Vec<_> = u
                .fu_operand_holds
                .keys()
                .map(|(f, o)| (f.0, *o))
                .collect();
            holds.sort_unstable();
            let mut reads: Vec<_> = u.rf_reads.iter().map(|(r, n)| (r.0, *n)).collect();
            reads.sort_unstable();
            let mut writes: Vec<_> = u.rf_writes.iter().map(|(r, n)| (r.0, *n)).collect();
            writes.sort_unstable();
            let _ = writeln!(
                out,
                "{cycle}: buses={buses:?} holds={holds:?} reads={reads:?} writes={writes:?} iu={}",
                u.iu_uses
            );
        }
        out
    }
}

fn decrement(map: &mut FxHashMap<RfId, u8>, key: RfId) {
    if let Some(v) = map.get_mut(&key) {
        *v -= 1;
        if *v == 0 {
            map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_machine::{FuId, HwOperation, MachineBuilder};
    use relay_program::{OpRef, Terminal};

    fn machine(buses: usize) -> Machine {
        let mut b = MachineBuilder::new("t");
        b.register_file("int", 8, 32, 2, 1);
        b.function_unit(
            "alu",
            vec![HwOperation::new("add", 2, 2).with_result(3, 1)],
        );
        b.control_unit(3, 1);
        b.immediate_unit("limm", 32, 1);
        for i in 0..buses {
            let bus = b.bus(format!("b{i}"), 8, true);
            b.fully_connect(bus);
        }
        b.build().unwrap()
    }

    fn copy(from: u16, to: u16) -> Move {
        Move::new(Terminal::reg(RfId(0), from), Terminal::reg(RfId(0), to))
    }

    fn alu_write(operand: u8) -> Move {
        Move::new(
            Terminal::reg(RfId(0), 0),
            Terminal::FuPort { op: OpRef { fu: FuId(0), op: 0 }, operand },
        )
    }

    #[test]
    fn assign_unassign_round_trips() {
        let m = machine(2);
        let mut rm = ResourceManager::new(&m, 0);
        let before = rm.snapshot();

        let mv = copy(1, 2);
        assert!(rm.assign(7, NodeId(0), &mv, None).is_some());
        assert_ne!(rm.snapshot(), before);
        rm.unassign(NodeId(0));
        assert_eq!(rm.snapshot(), before);
        assert_eq!(rm.largest_cycle(), None);
    }

    #[test]
    fn one_move_per_bus_per_cycle() {
        let m = machine(1);
        let mut rm = ResourceManager::new(&m, 0);
        // One read port, so use two different destinations but one source
        // file; the single bus is the bottleneck either way.
        assert!(rm.assign(3, NodeId(0), &copy(1, 2), None).is_some());
        assert_eq!(rm.can_assign(3, &copy(3, 4), None), None);
        assert_eq!(rm.latest_cycle(3, &copy(3, 4), None), Some(2));
        assert_eq!(rm.earliest_cycle(3, &copy(3, 4), None), Some(4));
    }

    #[test]
    fn register_file_ports_are_counted() {
        let m = machine(3);
        let mut rm = ResourceManager::new(&m, 0);
        // 1 write port: two writes of the file cannot share a cycle even
        // with buses to spare.
        assert!(rm.assign(5, NodeId(0), &copy(1, 2), None).is_some());
        assert!(rm.can_assign(5, &copy(1, 3), None).is_none());
        // The next cycle's write port is untouched.
        assert!(rm
            .can_assign(6, &Move::new(Terminal::Immediate(1), Terminal::reg(RfId(0), 4)), None)
            .is_some());
    }

    #[test]
    fn trigger_initiations_are_exclusive() {
        let m = machine(3);
        let mut rm = ResourceManager::new(&m, 0);
        assert!(rm.assign(4, NodeId(0), &alu_write(2), None).is_some());
        // Second initiation of the same unit in the same cycle loses.
        assert!(rm.can_assign(4, &alu_write(2), None).is_none());
        // A plain operand write of the other port is fine.
        assert!(rm.can_assign(4, &alu_write(1), None).is_some());
    }

    #[test]
    fn operand_holds_span_to_the_trigger() {
        let m = machine(3);
        let mut rm = ResourceManager::new(&m, 0);
        assert!(rm.assign(2, NodeId(0), &alu_write(1), Some(5)).is_some());
        for c in 2..=5 {
            assert!(rm.can_assign(c, &alu_write(1), None).is_none(), "cycle {c}");
        }
        assert!(rm.can_assign(6, &alu_write(1), None).is_some());
        rm.unassign(NodeId(0));
        assert!(rm.can_assign(3, &alu_write(1), None).is_some());
    }

    #[test]
    fn modulo_reservations_wrap() {
        let m = machine(1);
        let mut rm = ResourceManager::new(&m, 3);
        assert!(rm.assign(1, NodeId(0), &copy(1, 2), None).is_some());
        // Cycle 4 aliases cycle 1 at II=3.
        assert!(rm.can_assign(4, &copy(3, 4), None).is_none());
        assert!(rm.can_assign(5, &copy(3, 4), None).is_some());
        // A probe only walks one interval's worth of cycles.
        assert_eq!(rm.latest_cycle(4, &copy(3, 4), None), Some(3));
    }

    #[test]
    fn short_immediates_respect_bus_width() {
        let m = machine(1);
        let rm = ResourceManager::new(&m, 0);
        let fits = Move::new(Terminal::Immediate(100), Terminal::reg(RfId(0), 1));
        let wide = Move::new(Terminal::Immediate(1000), Terminal::reg(RfId(0), 1));
        assert!(rm.can_transport_immediate(&fits));
        assert!(!rm.can_transport_immediate(&wide));
    }

    #[test]
    fn long_immediates_book_a_unit_slot() {
        let m = machine(2);
        let mut rm = ResourceManager::new(&m, 0);
        let mut wide = Move::new(Terminal::Immediate(1000), Terminal::reg(RfId(0), 1));
        wide.needs_long_imm = true;
        assert!(rm.assign(4, NodeId(0), &wide, None).is_some());
        // One immediate unit: a second wide constant must take another
        // cycle.
        let mut wide2 = Move::new(Terminal::Immediate(2000), Terminal::reg(RfId(0), 2));
        wide2.needs_long_imm = true;
        assert!(rm.can_assign(4, &wide2, None).is_none());
        assert!(rm.can_assign(5, &wide2, None).is_some());
    }
}
