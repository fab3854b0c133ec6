//! LOCK-prefixed lowering, CMPXCHG, XADD, and the canonical NOP.

mod common;

use common::{bus_with, run, translate};
use opal_cpu_core::{Config, CpuState, GuestMem};
use opal_frontend::ir::Instr;
use opal_types::{Flag, Gpr};

const ENTRY: u64 = 0x1000;

#[test]
fn canonical_nop_leaves_rax_untouched() {
    // 90 with a 64-bit value in RAX: must not zero-extend.
    let code = [0x90, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0xdead_beef_dead_beef;

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0xdead_beef_dead_beef);
}

#[test]
fn canonical_nop_emits_no_register_traffic() {
    let code = [0x90, 0xf4];
    let mem = bus_with(ENTRY, &code);
    let func = translate(&mem, &Config::default(), ENTRY);
    let entry = func.find_block_by_rip(ENTRY).unwrap();
    // The block holds only the HLT trap machinery — no context stores for
    // the NOP itself besides the trap RIP bookkeeping.
    let gpr_stores = func
        .block(entry)
        .code
        .iter()
        .filter(|&&v| {
            matches!(
                func.node(v).instr,
                Instr::StoreContext { offset, .. } if offset < 0x80
            )
        })
        .count();
    assert_eq!(gpr_stores, 0);
}

#[test]
fn xchg_rax_r8_is_not_a_nop() {
    // REX.B 90 = xchg rax, r8.
    let code = [0x49, 0x90, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 1;
    cpu.gpr[Gpr::R8.as_u8() as usize] = 2;

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 2);
    assert_eq!(cpu.gpr[Gpr::R8.as_u8() as usize], 1);
}

#[test]
fn lock_cmpxchg_success_path() {
    // lock cmpxchg [rdi], ecx with [rdi]=5, EAX=5, ECX=9.
    let code = [0xf0, 0x0f, 0xb1, 0x0f, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x2000;
    // EAX is 5; the upper garbage is outside the compared width and must be
    // replaced by the zero-extended writeback.
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0xffff_ffff_0000_0005;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 9;
    mem.write_u32(0x2000, 5);

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u32(0x2000), 9);
    assert_eq!(
        cpu.gpr[Gpr::Rax.as_u8() as usize],
        5,
        "RAX receives the old value, zero-extended"
    );
    assert!(cpu.flag(Flag::Zf));
}

#[test]
fn lock_cmpxchg_failure_path() {
    let code = [0xf0, 0x0f, 0xb1, 0x0f, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x2000;
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 4;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 9;
    mem.write_u32(0x2000, 5);

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u32(0x2000), 5, "store must not happen");
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 5, "RAX observes memory");
    assert!(!cpu.flag(Flag::Zf));
}

#[test]
fn lock_add_lowers_to_a_fetch_op() {
    // lock add dword [rax], 1.
    let code = [0xf0, 0x83, 0x00, 0x01, 0xf4];
    let mem = bus_with(ENTRY, &code);
    let func = translate(&mem, &Config::default(), ENTRY);
    let entry = func.find_block_by_rip(ENTRY).unwrap();

    assert!(func.block(entry).code.iter().any(|&v| matches!(
        func.node(v).instr,
        Instr::AtomicFetchOp {
            kind: opal_frontend::ir::AluKind::Add,
            ..
        }
    )));
    // No separate plain store of the result.
    assert!(!func
        .block(entry)
        .code
        .iter()
        .any(|&v| matches!(func.node(v).instr, Instr::StoreMem { .. })));
}

#[test]
fn lock_add_produces_the_sum_and_flags() {
    let code = [0xf0, 0x83, 0x00, 0x01, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0x2000;
    mem.write_u32(0x2000, 0xffff_ffff);

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u32(0x2000), 0);
    assert!(cpu.flag(Flag::Zf));
    assert!(cpu.flag(Flag::Cf));
}

#[test]
fn xadd_writes_the_old_value_back_to_the_source() {
    // lock xadd [rdx], eax.
    let code = [0xf0, 0x0f, 0xc1, 0x02, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rdx.as_u8() as usize] = 0x2000;
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 3;
    mem.write_u32(0x2000, 10);

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u32(0x2000), 13);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 10);
}

#[test]
fn cmpxchg8b_success_sets_zf_and_stores_the_pair() {
    // lock cmpxchg8b [rsi].
    let code = [0xf0, 0x0f, 0xc7, 0x0e, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rsi.as_u8() as usize] = 0x2000;
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0x1111_1111;
    cpu.gpr[Gpr::Rdx.as_u8() as usize] = 0x2222_2222;
    cpu.gpr[Gpr::Rbx.as_u8() as usize] = 0x3333_3333;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 0x4444_4444;
    mem.write_u32(0x2000, 0x1111_1111);
    mem.write_u32(0x2004, 0x2222_2222);

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u32(0x2000), 0x3333_3333);
    assert_eq!(mem.read_u32(0x2004), 0x4444_4444);
    assert!(cpu.flag(Flag::Zf));
}
