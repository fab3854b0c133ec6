//! GPR destination sizing: 32-bit writes zero-extend, 16/8-bit writes
//! preserve the rest, high-byte writes hit bits [15:8].

mod common;

use common::{bus_with, run};
use opal_cpu_core::CpuState;
use opal_types::Gpr;

const ENTRY: u64 = 0x1000;

fn run_with_rax(code: &[u8], rax: u64) -> CpuState {
    let mut mem = bus_with(ENTRY, code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = rax;
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 0x1111_2222_3333_4444;
    run(&mut cpu, &mut mem, ENTRY);
    cpu
}

#[test]
fn mov_to_32bit_destination_zero_extends() {
    // mov eax, ecx ; hlt
    let cpu = run_with_rax(&[0x89, 0xc8, 0xf4], 0xffff_ffff_ffff_ffff);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0x3333_4444);
}

#[test]
fn mov_to_16bit_destination_preserves_upper_bits() {
    // mov ax, cx ; hlt
    let cpu = run_with_rax(&[0x66, 0x89, 0xc8, 0xf4], 0xaaaa_bbbb_cccc_dddd);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0xaaaa_bbbb_cccc_4444);
}

#[test]
fn mov_to_low_byte_preserves_the_rest() {
    // mov al, cl ; hlt
    let cpu = run_with_rax(&[0x88, 0xc8, 0xf4], 0xaaaa_bbbb_cccc_dddd);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0xaaaa_bbbb_cccc_dd44);
}

#[test]
fn mov_to_high_byte_hits_bits_15_to_8() {
    // mov ah, cl ; hlt
    let cpu = run_with_rax(&[0x88, 0xcc, 0xf4], 0xaaaa_bbbb_cccc_dddd);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0xaaaa_bbbb_cccc_44dd);
}

#[test]
fn add_32bit_zero_extends_too() {
    // add eax, ecx ; hlt
    let cpu = run_with_rax(&[0x01, 0xc8, 0xf4], 0xffff_ffff_0000_0001);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0x3333_4445);
}

#[test]
fn movzx_from_high_byte() {
    // movzx edx, ah ; hlt
    let code = [0x0f, 0xb6, 0xd4, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rax.as_u8() as usize] = 0x1234;
    cpu.gpr[Gpr::Rdx.as_u8() as usize] = u64::MAX;
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rdx.as_u8() as usize], 0x12);
}

#[test]
fn movsx_sign_extends_to_the_operand_width() {
    // movsx eax, cl ; hlt with CL=0x80.
    let code = [0x0f, 0xbe, 0xc1, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 0x80;
    cpu.gpr[Gpr::Rax.as_u8() as usize] = u64::MAX;
    run(&mut cpu, &mut mem, ENTRY);
    // Sign-extended to 32 bits, then zero-extended into RAX.
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0xffff_ff80);
}

#[test]
fn movsxd_with_rex_w_extends_to_64() {
    // movsxd rax, ecx ; hlt with ECX negative.
    let code = [0x48, 0x63, 0xc1, 0xf4];
    let mut mem = bus_with(ENTRY, &code);
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rcx.as_u8() as usize] = 0x8000_0000;
    run(&mut cpu, &mut mem, ENTRY);
    assert_eq!(cpu.gpr[Gpr::Rax.as_u8() as usize], 0xffff_ffff_8000_0000);
}
