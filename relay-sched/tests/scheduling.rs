//! End-to-end scheduling scenarios over small hand-built machines.

mod common;

use common::*;

use relay_machine::{HwOperation, MachineBuilder, PortRef, RfId};
use relay_program::{
    keys, BasicBlock, Datum, InstrLoc, InstructionRefManager, InterPassData, Procedure, Register,
    Terminal,
};
use relay_sched::{schedule_procedure, SchedulerOptions, SchedulerVariant};

fn run(
    procedure: &mut Procedure,
    machine: &relay_machine::Machine,
    irm: &mut InstructionRefManager,
    ipd: &InterPassData,
    options: &SchedulerOptions,
) {
    schedule_procedure(procedure, machine, irm, ipd, options).expect("schedule");
    verify(procedure, machine);
}

fn single_add_block() -> Procedure {
    Procedure::new(
        "single_add",
        vec![BasicBlock::from_moves(vec![
            mv(imm(3), r(1)),
            mv(imm(4), r(2)),
            mv(r(1), port(ADD, 1)),
            mv(r(2), port(ADD, 2)),
            mv(port(ADD, 3), r(3)),
        ])],
    )
}

#[test]
fn bypass_folds_constants_and_drops_dead_writes() {
    let machine = machine(3);
    let mut procedure = single_add_block();
    let mut irm = InstructionRefManager::new();
    let ipd = InterPassData::new();

    run(&mut procedure, &machine, &mut irm, &ipd, &SchedulerOptions::default());

    // The two register stops disappear: constants feed the ALU directly and
    // the dead writes are eliminated.
    let block = &procedure.blocks[0];
    assert_eq!(block.move_count(), 3, "{block:#?}");
    assert!(block
        .moves()
        .any(|m| m.source == imm(3) && m.destination == port(ADD, 1)));
    assert!(block
        .moves()
        .any(|m| m.source == imm(4) && m.destination == port(ADD, 2)));
    // Operands in one cycle, result the next: latency plus one.
    assert_eq!(block.instruction_count(), 2);
}

#[test]
fn bypass_disabled_keeps_register_stops() {
    let machine = machine(3);
    let mut procedure = single_add_block();
    let mut irm = InstructionRefManager::new();
    let ipd = InterPassData::new();
    let options = SchedulerOptions { bypass_distance: 0, ..Default::default() };

    run(&mut procedure, &machine, &mut irm, &ipd, &options);
    assert_eq!(procedure.blocks[0].move_count(), 5);
}

#[test]
fn top_down_variant_schedules_the_same_block() {
    let machine = machine(3);
    let mut procedure = single_add_block();
    let mut irm = InstructionRefManager::new();
    let ipd = InterPassData::new();
    let options = SchedulerOptions {
        variant: SchedulerVariant::TopDown,
        ..Default::default()
    };

    run(&mut procedure, &machine, &mut irm, &ipd, &options);
    assert_eq!(procedure.blocks[0].move_count(), 5);
}

#[test]
fn per_block_graphs_above_the_memory_threshold() {
    let machine = machine(3);
    let mut procedure = single_add_block();
    let mut irm = InstructionRefManager::new();
    let ipd = InterPassData::new();
    let options = SchedulerOptions {
        low_mem_threshold: Some(0),
        ..Default::default()
    };

    run(&mut procedure, &machine, &mut irm, &ipd, &options);
    assert_eq!(procedure.blocks[0].move_count(), 3);
}

/// A machine where the integer file cannot reach the multiplier directly;
/// only the scratch file bridges the two sides.
fn split_machine() -> (relay_machine::Machine, Register) {
    let mut b = MachineBuilder::new("split");
    let int = b.register_file("int", 8, 32, 2, 2);
    let scratch = b.register_file("scratch", 2, 32, 1, 1);
    let fpu = b.function_unit("fpu", vec![HwOperation::new("mul", 2, 2).with_result(3, 3)]);
    b.control_unit(1, 1);

    let b0 = b.bus("b0", 8, true);
    b.source(b0, PortRef::RfRead(int));
    b.source(b0, PortRef::FuOut { fu: fpu, operand: 3 });
    b.destination(b0, PortRef::RfWrite(int));
    b.destination(b0, PortRef::RfWrite(scratch));
    b.destination(b0, PortRef::FuIn { fu: fpu, operand: 2 });
    let b1 = b.bus("b1", 8, true);
    b.source(b1, PortRef::RfRead(scratch));
    b.destination(b1, PortRef::FuIn { fu: fpu, operand: 1 });

    let machine = b.build().unwrap();
    (machine, Register { rf: scratch, index: 0 })
}

#[test]
fn missing_connectivity_inserts_a_temp_copy() {
    let (machine, scratch) = split_machine();
    let fpu = relay_program::OpRef { fu: relay_machine::FuId(0), op: 0 };
    let mut procedure = Procedure::new(
        "needs_copy",
        vec![BasicBlock::from_moves(vec![
            mv(Terminal::reg(RfId(0), 1), port(fpu, 1)),
            mv(imm(4), port(fpu, 2)),
            mv(port(fpu, 3), Terminal::reg(RfId(0), 2)),
        ])],
    );
    let mut irm = InstructionRefManager::new();
    let mut ipd = InterPassData::new();
    ipd.set(keys::SCRATCH_REGISTERS, Datum::Registers(vec![scratch]));

    run(&mut procedure, &machine, &mut irm, &ipd, &SchedulerOptions::default());

    let block = &procedure.blocks[0];
    let write = block
        .instructions
        .iter()
        .position(|i| {
            i.moves
                .iter()
                .any(|m| m.destination == Terminal::Register(scratch))
        })
        .expect("a copy into the scratch register");
    let read = block
        .instructions
        .iter()
        .position(|i| {
            i.moves.iter().any(|m| {
                m.source == Terminal::Register(scratch) && m.destination == port(fpu, 1)
            })
        })
        .expect("a copy out of the scratch register");
    // The scratch value is written at least one cycle before it is read.
    assert!(write + 1 <= read, "write at {write}, read at {read}");
}

#[test]
fn unbridgeable_moves_are_a_fatal_block_error() {
    let (machine, _) = split_machine();
    let fpu = relay_program::OpRef { fu: relay_machine::FuId(0), op: 0 };
    let mut procedure = Procedure::new(
        "no_bridge",
        vec![BasicBlock::from_moves(vec![
            mv(Terminal::reg(RfId(0), 1), port(fpu, 1)),
            mv(imm(4), port(fpu, 2)),
            mv(port(fpu, 3), Terminal::reg(RfId(0), 2)),
        ])],
    );
    let mut irm = InstructionRefManager::new();
    // No scratch inventory published at all.
    let ipd = InterPassData::new();

    let err = schedule_procedure(
        &mut procedure,
        &machine,
        &mut irm,
        &ipd,
        &SchedulerOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        relay_sched::ScheduleError::ConnectivityUnsatisfiable { .. }
    ));
}

#[test]
fn renaming_shortens_the_schedule() {
    let machine = machine(4);
    let build = || {
        Procedure::new(
            "two_ranges",
            vec![BasicBlock::from_moves(vec![
                mv(imm(1), r(5)),
                mv(r(5), port(ADD, 1)),
                mv(imm(2), port(ADD, 2)),
                mv(port(ADD, 3), r(6)),
                mv(imm(7), r(5)),
                mv(r(5), port(LT, 1)),
                mv(imm(8), port(LT, 2)),
                mv(port(LT, 3), breg(1)),
            ])],
        )
    };
    let mut ipd = InterPassData::new();
    for (k, i) in [
        (keys::STACK_POINTER, 12),
        (keys::FRAME_POINTER, 13),
        (keys::RV_REGISTER, 14),
        (keys::RV_HIGH_REGISTER, 15),
    ] {
        ipd.set(k, Datum::Register(Register { rf: INT, index: i }));
    }

    let mut plain = build();
    let mut irm = InstructionRefManager::new();
    let options = SchedulerOptions { bypass_distance: 0, ..Default::default() };
    run(&mut plain, &machine, &mut irm, &ipd, &options);

    let mut renamed = build();
    let mut irm = InstructionRefManager::new();
    let options = SchedulerOptions {
        bypass_distance: 0,
        rename_registers: true,
        ..Default::default()
    };
    run(&mut renamed, &machine, &mut irm, &ipd, &options);

    assert!(
        renamed.blocks[0].instruction_count() < plain.blocks[0].instruction_count(),
        "renamed: {}, plain: {}",
        renamed.blocks[0].instruction_count(),
        plain.blocks[0].instruction_count()
    );
    // The anti dependence is gone because the renamed range uses a new name:
    // the adder operand no longer reads the contested register.
    let add_read = renamed.blocks[0]
        .moves()
        .find(|m| m.destination == port(ADD, 1))
        .expect("adder operand");
    assert_ne!(add_read.source, r(5));
}

#[test]
fn counted_loop_software_pipelines() {
    let machine = machine_with_delay(3, 1);
    let mut irm = InstructionRefManager::new();
    let back = irm.make_ref(InstrLoc { block: 0, index: 0 });
    let mut body = BasicBlock::from_moves(vec![
        mv(r(1), port(ADD, 1)),
        mv(imm(1), port(ADD, 2)),
        mv(port(ADD, 3), r(1)),
        mv(r(1), port(LT, 1)),
        mv(imm(100), port(LT, 2)),
        mv(port(LT, 3), breg(0)),
        guarded(
            Terminal::InstructionRef(back),
            port(JUMP, 1),
            Register { rf: BOOL, index: 0 },
        ),
    ]);
    body.trip_count = Some(100);
    let exit = BasicBlock::from_moves(vec![mv(r(1), r(2))]);
    let mut procedure = Procedure::new("counted", vec![body, exit]);

    let ipd = InterPassData::new();
    let options = SchedulerOptions {
        loop_scheduling: true,
        bypass_distance: 0,
        ..Default::default()
    };
    schedule_procedure(&mut procedure, &machine, &mut irm, &ipd, &options).expect("schedule");

    // Prolog, kernel, epilog, exit.
    assert_eq!(procedure.blocks.len(), 4, "{procedure:#?}");
    let (prolog, kernel, epilog) = (
        &procedure.blocks[0],
        &procedure.blocks[1],
        &procedure.blocks[2],
    );
    // The recurrence admits II=2 but three buses cannot move seven values
    // in fewer than three cycles.
    assert_eq!(kernel.instruction_count(), 3);
    assert_eq!(kernel.move_count(), 7);
    assert!(kernel.moves().any(|m| m.destination == port(JUMP, 1)));
    assert!(prolog.instruction_count() >= 1);
    assert!(prolog.instruction_count() <= 3);
    assert!(epilog.instruction_count() >= 1);
    assert!(epilog.moves().all(|m| m.destination != port(JUMP, 1)));
    // The back edge still enters the kernel, not the prolog.
    assert_eq!(irm.resolve(back), Some(InstrLoc { block: 1, index: 0 }));
}

#[test]
fn one_bus_machine_schedules_with_and_without_bypass() {
    let machine = machine(1);
    let mut ipd = InterPassData::new();
    ipd.set(keys::SCRATCH_REGISTERS, Datum::Registers(vec![]));

    let mut with_bypass = single_add_block();
    let mut irm = InstructionRefManager::new();
    run(
        &mut with_bypass,
        &machine,
        &mut irm,
        &ipd,
        &SchedulerOptions::default(),
    );

    let mut without = single_add_block();
    let mut irm = InstructionRefManager::new();
    let options = SchedulerOptions { bypass_distance: 0, ..Default::default() };
    run(&mut without, &machine, &mut irm, &ipd, &options);

    // Bypassing can only help when transport is the bottleneck.
    assert!(
        with_bypass.blocks[0].instruction_count() <= without.blocks[0].instruction_count()
    );
}

#[test]
fn control_flow_keeps_its_delay_slots() {
    let machine = machine(3);
    let mut irm = InstructionRefManager::new();
    let back = irm.make_ref(InstrLoc { block: 0, index: 0 });
    let body = BasicBlock::from_moves(vec![
        mv(imm(5), r(1)),
        mv(r(1), port(ADD, 1)),
        mv(imm(2), port(ADD, 2)),
        mv(port(ADD, 3), r(2)),
        guarded(
            Terminal::InstructionRef(back),
            port(JUMP, 1),
            Register { rf: BOOL, index: 0 },
        ),
    ]);
    let exit = BasicBlock::from_moves(vec![mv(r(2), r(3))]);
    let mut procedure = Procedure::new("looping", vec![body, exit]);
    let ipd = InterPassData::new();

    run(&mut procedure, &machine, &mut irm, &ipd, &SchedulerOptions::default());

    let block = &procedure.blocks[0];
    let jump_at = block
        .instructions
        .iter()
        .position(|i| i.moves.iter().any(|m| m.destination == port(JUMP, 1)))
        .expect("jump survived");
    // Nothing outside the delay-slot window (also enforced by verify), and
    // the jump target still resolves to the block's entry.
    for (c, instr) in block.instructions.iter().enumerate() {
        assert!(instr.is_empty() || c <= jump_at + 3);
    }
    assert_eq!(irm.resolve(back), Some(InstrLoc { block: 0, index: 0 }));
}
