//! Conditional branch with flag elision (a compare followed by Jcc selects
//! on the original operands, not on re-derived flag bits).

mod common;

use common::{bus_with, translate};
use opal_cpu_core::{Config, CpuState, GuestMem};
use opal_frontend::interp::{run_function, ExitReason, InterpEnv};
use opal_frontend::ir::{BreakReason, Cond, Instr, Terminator};
use opal_types::{Flag, Gpr, Width};

const ENTRY: u64 = 0x1000;

// mov eax, [rbp-8]
// cmp eax, 0
// je +5 (target 0x100d)
// fallthrough: hlt @ 0x100a
// target: hlt @ 0x100d
const CODE: &[u8] = &[
    0x8b, 0x45, 0xf8, // mov eax, [rbp-8]
    0x83, 0xf8, 0x00, // cmp eax, 0
    0x74, 0x05, // je +5
    0xf4, // hlt
    0x90, 0x90, 0x90, // padding
    0xf4, // hlt @ 0x100d
];

#[test]
fn je_after_cmp_selects_on_the_compared_operands() {
    let mem = bus_with(ENTRY, CODE);
    let func = translate(&mem, &Config::default(), ENTRY);

    let head = func.find_block_by_rip(ENTRY).unwrap();
    let Some(Terminator::CondJump { cond, .. }) = func.block(head).term else {
        panic!("expected CondJump terminator");
    };

    // The branch condition must be a direct equality select against the
    // compared operands — not a load of the ZF slot.
    let Instr::Select {
        cond: Cond::Eq,
        cmp_width: Width::W32,
        a,
        b,
        ..
    } = func.node(cond).instr
    else {
        panic!(
            "expected elided equality select, got {:?}",
            func.node(cond).instr
        );
    };
    assert!(
        matches!(func.node(a).instr, Instr::LoadContext { .. }),
        "lhs should be the EAX value"
    );
    assert!(
        matches!(func.node(b).instr, Instr::Const { value: 0 }),
        "rhs should be the literal zero"
    );
}

#[test]
fn taken_branch_lands_on_the_target() {
    let mut mem = bus_with(ENTRY, CODE);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rbp.as_u8() as usize] = 0x7000;
    // [rbp-8] = 0 => ZF, branch taken.
    mem.write_u64(0x7000 - 8, 0);

    let config = Config::default();
    let func = translate(&mem, &config, ENTRY);
    let exit = run_function(&func, &mut cpu, &mut mem, &mut InterpEnv::default());

    assert_eq!(exit.rip, 0x100d);
    assert_eq!(exit.reason, ExitReason::Trap(BreakReason::Privileged));
    assert!(cpu.flag(Flag::Zf), "CMP against zero must still set ZF");
}

#[test]
fn untaken_branch_falls_through() {
    let mut mem = bus_with(ENTRY, CODE);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rbp.as_u8() as usize] = 0x7000;
    mem.write_u64(0x7000 - 8, 7);

    let config = Config::default();
    let func = translate(&mem, &config, ENTRY);
    let exit = run_function(&func, &mut cpu, &mut mem, &mut InterpEnv::default());

    assert_eq!(exit.rip, 0x100a);
    assert!(!cpu.flag(Flag::Zf));
}
