//! String instruction lowering: straight-line forms and REP loop expansion.

mod common;

use common::{bus_with, run, translate};
use opal_cpu_core::{Config, CpuState, GuestMem};
use opal_types::{Flag, Gpr};

const ENTRY: u64 = 0x1000;

#[test]
fn rep_stosb_fills_and_counts_down() {
    // rep stosb ; hlt
    let code = [0xf3, 0xaa, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0xab;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 4;
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x2000;

    run(&mut cpu, &mut mem, ENTRY);

    for i in 0..4 {
        assert_eq!(mem.read_u8(0x2000 + i), 0xab);
    }
    assert_eq!(mem.read_u8(0x2004), 0);
    assert_eq!(cpu.gpr[Gpr::Rcx.as_u8() as usize], 0);
    assert_eq!(cpu.gpr[Gpr::Rdi.as_u8() as usize], 0x2004);
}

#[test]
fn rep_with_zero_count_does_nothing() {
    let code = [0xf3, 0xaa, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0xab;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 0;
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x2000;

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u8(0x2000), 0);
    assert_eq!(cpu.gpr[Gpr::Rdi.as_u8() as usize], 0x2000);
}

#[test]
fn rep_loop_creates_header_body_exit_blocks() {
    let code = [0xf3, 0xaa, 0xf4];
    let mem = bus_with(ENTRY, &code);
    let func = translate(&mem, &Config::default(), ENTRY);
    // Entry plus three synthesized loop blocks.
    assert!(
        func.blocks().len() >= 4,
        "expected loop expansion blocks, got {}",
        func.blocks().len()
    );
}

#[test]
fn movsb_copies_one_byte_and_advances() {
    // movsb ; hlt
    let code = [0xa4, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    mem.write_u8(0x2000, 0x7e);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rsi.as_u8() as usize] = 0x2000;
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x3000;

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u8(0x3000), 0x7e);
    assert_eq!(cpu.gpr[Gpr::Rsi.as_u8() as usize], 0x2001);
    assert_eq!(cpu.gpr[Gpr::Rdi.as_u8() as usize], 0x3001);
}

#[test]
fn movsb_respects_the_direction_flag() {
    let code = [0xa4, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    mem.write_u8(0x2000, 0x7e);
    let mut cpu = CpuState::new();
    cpu.df = 1;
    cpu.gpr[Gpr::Rsi.as_u8() as usize] = 0x2000;
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x3000;

    run(&mut cpu, &mut mem, ENTRY);

    assert_eq!(mem.read_u8(0x3000), 0x7e);
    assert_eq!(cpu.gpr[Gpr::Rsi.as_u8() as usize], 0x1fff);
    assert_eq!(cpu.gpr[Gpr::Rdi.as_u8() as usize], 0x2fff);
}

#[test]
fn repne_scasb_finds_a_byte() {
    // repne scasb ; hlt — search for AL in a buffer.
    let code = [0xf2, 0xae, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    mem.load(0x2000, b"hello\0world");
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0; // searching for NUL
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x2000;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 64;

    run(&mut cpu, &mut mem, ENTRY);

    // RDI stops one past the NUL at offset 5.
    assert_eq!(cpu.gpr[Gpr::Rdi.as_u8() as usize], 0x2006);
    assert!(cpu.flag(Flag::Zf));
    assert_eq!(cpu.gpr[Gpr::Rcx.as_u8() as usize], 64 - 6);
}

#[test]
fn repe_cmpsb_stops_at_the_first_difference() {
    let code = [0xf3, 0xa6, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    mem.load(0x2000, b"abcX");
    mem.load(0x3000, b"abcY");
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rsi.as_u8() as usize] = 0x2000;
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x3000;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 8;

    run(&mut cpu, &mut mem, ENTRY);

    // Four iterations ran; the last compare cleared ZF.
    assert_eq!(cpu.gpr[Gpr::Rcx.as_u8() as usize], 4);
    assert!(!cpu.flag(Flag::Zf));
    assert_eq!(cpu.gpr[Gpr::Rsi.as_u8() as usize], 0x2004);
}
