//! Interpreter-backed checks of arithmetic lowering against the reference
//! x86 behavior.

mod common;

use common::{bus_with, run};
use opal_cpu_core::CpuState;
use opal_types::{Flag, Gpr};

const ENTRY: u64 = 0x1000;

fn fresh(rax: u64, rcx: u64) -> (CpuState, opal_cpu_core::FlatMem) {
    let cpu = {
        let mut cpu = CpuState::new();
        cpu.gpr[Gpr::Rax.as_u8() as usize] = rax;
        cpu.gpr[Gpr::Rcx.as_u8() as usize] = rcx;
        cpu
    };
    (cpu, opal_cpu_core::FlatMem::new(0x1_0000))
}

#[test]
fn add_carry_and_overflow() {
    // add eax, ecx ; hlt
    let code = [0x01, 0xc8, 0xf4];
    let (mut cpu, mut mem) = fresh(0xffff_ffff, 1);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0);
    assert!(cpu.flag(Flag::Cf));
    assert!(cpu.flag(Flag::Zf));
    assert!(!cpu.flag(Flag::Of));

    let (mut cpu, mut mem) = fresh(0x7fff_ffff, 1);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert!(cpu.flag(Flag::Of));
    assert!(cpu.flag(Flag::Sf));
    assert!(!cpu.flag(Flag::Cf));
}

#[test]
fn adc_consumes_the_carry() {
    // adc eax, ecx ; hlt
    let code = [0x11, 0xc8, 0xf4];
    let (mut cpu, mut mem) = fresh(1, 2);
    cpu.set_flag(Flag::Cf, true);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 4);
}

#[test]
fn sbb_borrows() {
    // sbb eax, ecx ; hlt
    let code = [0x19, 0xc8, 0xf4];
    let (mut cpu, mut mem) = fresh(5, 2);
    cpu.set_flag(Flag::Cf, true);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 2);
}

#[test]
fn inc_preserves_carry() {
    // inc eax ; hlt (0xFF /0)
    let code = [0xff, 0xc0, 0xf4];
    let (mut cpu, mut mem) = fresh(0xffff_ffff, 0);
    cpu.set_flag(Flag::Cf, true);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0);
    assert!(cpu.flag(Flag::Cf), "INC never writes CF");
    assert!(cpu.flag(Flag::Zf));
}

#[test]
fn neg_sets_carry_for_nonzero_operands() {
    // neg eax ; hlt
    let code = [0xf7, 0xd8, 0xf4];
    let (mut cpu, mut mem) = fresh(5, 0);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0xffff_fffb);
    assert!(cpu.flag(Flag::Cf));

    let (mut cpu, mut mem) = fresh(0, 0);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert!(!cpu.flag(Flag::Cf));
    assert!(cpu.flag(Flag::Zf));
}

#[test]
fn mul_widens_into_rdx_rax() {
    // mul rcx ; hlt
    let code = [0x48, 0xf7, 0xe1, 0xf4];
    let (mut cpu, mut mem) = fresh(u64::MAX, 2);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], u64::MAX - 1);
    assert_eq!(cpu.gpr[Gpr::Rdx.as_u8() as usize], 1);
    assert!(cpu.flag(Flag::Cf));
    assert!(cpu.flag(Flag::Of));
}

#[test]
fn div_32bit_splits_quotient_and_remainder() {
    // div ecx ; hlt — EDX:EAX / ECX.
    let code = [0xf7, 0xf1, 0xf4];
    let (mut cpu, mut mem) = fresh(7, 3);
    cpu.gpr[Gpr::Rdx.as_u8() as usize] = 0;
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 2);
    assert_eq!(cpu.gpr[Gpr::Rdx.as_u8() as usize], 1);
}

#[test]
fn div_uses_the_full_edx_eax_dividend() {
    // div ecx with EDX:EAX = 0x1_0000_0005, ECX = 2.
    let code = [0xf7, 0xf1, 0xf4];
    let (mut cpu, mut mem) = fresh(5, 2);
    cpu.gpr[Gpr::Rdx.as_u8() as usize] = 1;
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0x8000_0002);
    assert_eq!(cpu.gpr[Gpr::Rdx.as_u8() as usize], 1);
}

#[test]
fn imul_two_operand_form() {
    // imul eax, ecx ; hlt
    let code = [0x0f, 0xaf, 0xc1, 0xf4];
    let (mut cpu, mut mem) = fresh(6, 7);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 42);
    assert!(!cpu.flag(Flag::Of));
}

#[test]
fn bt_sets_carry_from_the_selected_bit() {
    // bt eax, 3 via group 8: 0F BA /4 ib ; hlt
    let code = [0x0f, 0xba, 0xe0, 0x03, 0xf4];
    let (mut cpu, mut mem) = fresh(0b1000, 0);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert!(cpu.flag(Flag::Cf));
}

#[test]
fn bsf_finds_the_lowest_bit_and_flags_zero_input() {
    // bsf eax, ecx ; hlt
    let code = [0x0f, 0xbc, 0xc1, 0xf4];
    let (mut cpu, mut mem) = fresh(0, 0b10100);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 2);
    assert!(!cpu.flag(Flag::Zf));

    let (mut cpu, mut mem) = fresh(0x55, 0);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert!(cpu.flag(Flag::Zf));
    // AMD behavior: the destination is preserved on zero input.
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0x55);
}

#[test]
fn bswap_reverses_bytes() {
    // bswap eax ; hlt
    let code = [0x0f, 0xc8, 0xf4];
    let (mut cpu, mut mem) = fresh(0x1122_3344, 0);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0x4433_2211);
}

#[test]
fn cmov_takes_and_skips() {
    // cmp eax, 0 ; cmove eax, ecx ; hlt
    let code = [0x83, 0xf8, 0x00, 0x0f, 0x44, 0xc1, 0xf4];
    let (mut cpu, mut mem) = fresh(0, 99);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 99);

    let (mut cpu, mut mem) = fresh(1, 99);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 1);
}

#[test]
fn setcc_writes_a_single_byte() {
    // cmp eax, 0 ; setne cl ; hlt
    let code = [0x83, 0xf8, 0x00, 0x0f, 0x95, 0xc1, 0xf4];
    let (mut cpu, mut mem) = fresh(7, 0xffff_ffff_ffff_ff00);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(
        cpu.gpr[Gpr::Rcx.as_u8() as usize],
        0xffff_ffff_ffff_ff01,
        "only CL is written"
    );
}

#[test]
fn pushf_popf_round_trips_the_flag_image() {
    // stc ; pushf ; popf ; hlt — with a scratch stack.
    let code = [0xf9, 0x9c, 0x9d, 0xf4];
    let (mut cpu, mut mem) = fresh(0, 0);
    cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x8000;
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert!(cpu.flag(Flag::Cf));
    assert_eq!(cpu.gpr[Gpr::Rsp.as_u8() as usize], 0x8000);
}

#[test]
fn lahf_sahf_round_trip() {
    // stc ; lahf ; clc ; sahf ; hlt
    let code = [0xf9, 0x9f, 0xf8, 0x9e, 0xf4];
    let (mut cpu, mut mem) = fresh(0, 0);
    mem.load(ENTRY, &code);
    run(&mut cpu, &mut mem, ENTRY);
    assert!(cpu.flag(Flag::Cf), "SAHF restores the saved CF");
}
