//! Shared fixtures: small hand-built machines, move constructors, and a
//! schedule checker that every end-to-end test runs over its output.

use rustc_hash::FxHashMap;

use relay_machine::{FuId, HwOperation, Machine, MachineBuilder, RfId};
use relay_program::{Guard, Move, OpRef, Procedure, Register, Terminal};

pub const INT: RfId = RfId(0);
pub const BOOL: RfId = RfId(1);
pub const ALU: FuId = FuId(0);
pub const CMP: FuId = FuId(1);
pub const CU: FuId = FuId(2);

pub const ADD: OpRef = OpRef { fu: ALU, op: 0 };
pub const LT: OpRef = OpRef { fu: CMP, op: 0 };
pub const JUMP: OpRef = OpRef { fu: CU, op: 0 };

/// A fully connected machine: `buses` transport channels, an ALU (1-cycle
/// add, 3-cycle mul), a comparison unit writing the guard file, and a
/// 3-delay-slot control unit.
pub fn machine(buses: usize) -> Machine {
    machine_with_delay(buses, 3)
}

pub fn machine_with_delay(buses: usize, delay_slots: u32) -> Machine {
    let mut b = MachineBuilder::new("fixture");
    b.register_file("int", 16, 32, 4, 3);
    b.guard_register_file("bool", 2, 1, 1);
    b.function_unit(
        "alu",
        vec![
            HwOperation::new("add", 2, 2).with_result(3, 1).commutative(),
            HwOperation::new("mul", 2, 2).with_result(3, 3).commutative(),
        ],
    );
    b.function_unit("cmp", vec![HwOperation::new("lt", 2, 2).with_result(3, 1)]);
    b.control_unit(delay_slots, 1);
    b.immediate_unit("limm", 32, 1);
    for i in 0..buses {
        let bus = b.bus(format!("b{i}"), 8, true);
        b.fully_connect(bus);
        b.all_guards(bus);
    }
    b.build().unwrap()
}

pub fn r(i: u16) -> Terminal {
    Terminal::reg(INT, i)
}

pub fn breg(i: u16) -> Terminal {
    Terminal::reg(BOOL, i)
}

pub fn imm(v: i64) -> Terminal {
    Terminal::Immediate(v)
}

pub fn port(op: OpRef, operand: u8) -> Terminal {
    Terminal::FuPort { op, operand }
}

pub fn mv(src: Terminal, dst: Terminal) -> Move {
    Move::new(src, dst)
}

pub fn guarded(src: Terminal, dst: Terminal, reg: Register) -> Move {
    Move::guarded(src, dst, Guard { register: reg, inverted: false })
}

/// Checks the universal schedule invariants over a written-back procedure:
/// buses exclusive per cycle, operation timing, guard latency, and the
/// delay-slot discipline.
pub fn verify(procedure: &Procedure, machine: &Machine) {
    for (bi, block) in procedure.blocks.iter().enumerate() {
        #[derive(Default)]
        struct OpenOp {
            operands: Vec<i64>,
            trigger: Option<i64>,
            results_seen: bool,
        }
        let mut open: FxHashMap<OpRef, OpenOp> = FxHashMap::default();
        let mut reg_writes: FxHashMap<Register, i64> = FxHashMap::default();
        let mut jump_cycle: Option<i64> = None;

        for (cycle, instr) in block.instructions.iter().enumerate() {
            let cycle = cycle as i64;
            let mut buses_used = Vec::new();
            for m in &instr.moves {
                let bus = m
                    .bus
                    .unwrap_or_else(|| panic!("block {bi}: move '{m}' has no bus"));
                assert!(
                    !buses_used.contains(&bus),
                    "block {bi} cycle {cycle}: bus {bus} carries two moves"
                );
                buses_used.push(bus);

                if let Some(g) = &m.guard {
                    if let Some(w) = reg_writes.get(&g.register) {
                        assert!(
                            cycle - w >= machine.guard_latency() as i64,
                            "block {bi} cycle {cycle}: guard {} written at {w}, too close",
                            g.register
                        );
                    }
                }

                if let Some((opref, operand)) = m.destination.as_fu_port() {
                    let hw = opref.hw(machine);
                    if hw.is_input(operand) {
                        let entry = open.entry(opref).or_default();
                        if entry.results_seen {
                            *entry = OpenOp::default();
                        }
                        if operand == hw.trigger {
                            for oc in &entry.operands {
                                assert!(
                                    cycle >= *oc,
                                    "block {bi}: trigger of {} at {cycle} before operand at {oc}",
                                    hw.name
                                );
                            }
                            entry.trigger = Some(cycle);
                        } else {
                            entry.operands.push(cycle);
                            if let Some(t) = entry.trigger {
                                assert!(
                                    cycle <= t,
                                    "block {bi}: operand of {} at {cycle} after trigger at {t}",
                                    hw.name
                                );
                            }
                        }
                    }
                    if machine.is_control_fu(opref.fu) {
                        jump_cycle = Some(cycle);
                    }
                }
                if let Some((opref, operand)) = m.source.as_fu_port() {
                    let hw = opref.hw(machine);
                    if !hw.is_input(operand) {
                        let latency = hw.latency(operand).unwrap_or(0) as i64;
                        let entry = open
                            .get_mut(&opref)
                            .unwrap_or_else(|| panic!("block {bi}: result read with no operation"));
                        let t = entry
                            .trigger
                            .unwrap_or_else(|| panic!("block {bi}: result read before trigger"));
                        assert!(
                            cycle >= t + latency,
                            "block {bi}: result of {} at {cycle}, trigger {t}, latency {latency}",
                            hw.name
                        );
                        entry.results_seen = true;
                    }
                }

                if let Some(reg) = m.destination.as_register() {
                    reg_writes.insert(reg, cycle);
                }
            }
        }

        if let Some(jc) = jump_cycle {
            let delay = machine.delay_slots() as i64;
            for (cycle, instr) in block.instructions.iter().enumerate() {
                assert!(
                    instr.is_empty() || (cycle as i64) <= jc + delay,
                    "block {bi}: move at cycle {cycle} past the delay slots of the jump at {jc}"
                );
            }
        }
    }
}
