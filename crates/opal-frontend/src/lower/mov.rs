//! Data movement: MOV and friends, exchanges, conditional moves, sign and
//! zero extension, LEA, XLAT.

use opal_cpu_core::state::CpuState;
use opal_decoder::{DecodedInst, Operand};
use opal_types::{CondCode, Gpr, SegReg, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{Instr, UnaryKind};
use crate::lower::unimplemented_op;

pub(crate) fn mov_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("MOV destination");
    let src = op.src(0).expect("MOV source");
    let value = d.load_source(op, &src);
    d.store_result(op, &dest, value);
}

/// MOV to/from a segment register.
pub(crate) fn mov_seg(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("MOV seg destination");
    let src = op.src(0).expect("MOV seg source");
    let value = d.load_source_with_opsize(op, &src, Width::W16);
    d.store_result_with_opsize(op, &dest, value, Width::W16);
}

pub(crate) fn lea(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("LEA destination");
    let Some(Operand::Mem(ref mem)) = op.src(0) else {
        unimplemented_op(d, op);
        return;
    };
    // LEA specifically ignores segment prefixes.
    let (addr, _stack) = d.mem_address_raw(op, mem);
    d.store_result(op, &dest, addr);
}

pub(crate) fn movzx(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("MOVZX destination");
    let src = op.src(0).expect("MOVZX source");
    let narrow = if op.opcode & 1 == 0 { Width::W8 } else { Width::W16 };
    let value = d.load_source_with_opsize(op, &src, narrow);
    // Values are zero-extended by construction; the store applies the GPR
    // merge rules for the destination width.
    d.store_result(op, &dest, value);
}

pub(crate) fn movsx(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("MOVSX destination");
    let src = op.src(0).expect("MOVSX source");
    let narrow = if op.opcode & 1 == 0 { Width::W8 } else { Width::W16 };
    let value = d.load_source_with_opsize(op, &src, narrow);
    let extended = d.unary(UnaryKind::Sext(narrow), op.op_width, value);
    d.store_result(op, &dest, extended);
}

/// MOVSXD (0x63): only the REX.W form sign-extends; otherwise it is a plain
/// 32-bit move.
pub(crate) fn movsxd(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("MOVSXD destination");
    let src = op.src(0).expect("MOVSXD source");
    let value = d.load_source_with_opsize(op, &src, Width::W32);
    if op.op_width == Width::W64 {
        let extended = d.unary(UnaryKind::Sext(Width::W32), Width::W64, value);
        d.store_result(op, &dest, extended);
    } else {
        d.store_result_with_opsize(op, &dest, value, Width::W32);
    }
}

pub(crate) fn xchg(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("XCHG destination");
    let src = op.src(0).expect("XCHG source");
    let width = op.op_width;

    // XCHG with memory is implicitly locked, prefix or not.
    if let Operand::Mem(ref mem) = dest {
        let value = d.load_source(op, &src);
        let (addr, _stack) = d.mem_address(op, mem, None);
        let old = d.append(Instr::AtomicSwap { addr, value }, width);
        d.store_result(op, &src, old);
        d.lock_handled = true;
        return;
    }

    let a = d.load_source(op, &dest);
    let b = d.load_source(op, &src);
    d.store_result(op, &dest, b);
    d.store_result(op, &src, a);
}

/// XCHG rAX, r (0x90..0x97). `90` without REX.B is the canonical NOP and
/// must not touch RAX (not even the 32-bit zero-extension).
pub(crate) fn xchg_ax(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if op.is_canonical_nop() {
        return;
    }
    // F3 90 is PAUSE.
    if op.opcode == 0x90 && op.prefixes.rep {
        return;
    }
    xchg(d, op);
}

pub(crate) fn cmov(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("CMOV destination");
    let src = op.src(0).expect("CMOV source");
    let cc = CondCode::from_nibble(op.opcode & 0xf);
    let taken = d.load_source(op, &src);
    let not_taken = d.load_source(op, &dest);
    let value = d.select_cc(cc, taken, not_taken);
    // The destination is written either way, so the 32-bit form always
    // zero-extends.
    d.store_result(op, &dest, value);
}

pub(crate) fn setcc(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("SETcc destination");
    let cc = CondCode::from_nibble(op.opcode & 0xf);
    let one = d.const_(Width::W8, 1);
    let zero = d.const_(Width::W8, 0);
    let value = d.select_cc(cc, one, zero);
    d.store_result_with_opsize(op, &dest, value, Width::W8);
}

/// CBW/CWDE/CDQE: widen rAX in place.
pub(crate) fn sign_extend_ax(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let narrow = match width {
        Width::W16 => Width::W8,
        Width::W32 => Width::W16,
        _ => Width::W32,
    };
    let value = d.load_gpr(Gpr::Rax, narrow);
    let extended = d.unary(UnaryKind::Sext(narrow), width, value);
    let rax = Operand::Gpr {
        reg: Gpr::Rax,
        high8: false,
    };
    d.store_result_with_opsize(op, &rax, extended, width);
}

/// CWD/CDQ/CQO: rDX = sign fill of rAX.
pub(crate) fn sign_split_dx(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let value = d.load_gpr(Gpr::Rax, width);
    let msb = d.const_(Width::W8, u64::from(width.msb() as u8));
    let fill = d.alu(crate::ir::AluKind::Sar, width, value, msb);
    let rdx = Operand::Gpr {
        reg: Gpr::Rdx,
        high8: false,
    };
    d.store_result_with_opsize(op, &rdx, fill, width);
}

/// XLAT: AL = [rBX + zext(AL)] with DS default segment.
pub(crate) fn xlat(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let base = d.load_gpr_native(Gpr::Rbx);
    let al = d.load_gpr(Gpr::Rax, Width::W8);
    let gpr_w = d.gpr_width();
    let addr = d.add(gpr_w, base, al);
    let addr = d.append_segment_offset(addr, op, Some(SegReg::Ds), false);
    let value = d.append(Instr::LoadMem { addr, tso: false }, Width::W8);
    d.store_ctx(Width::W8, CpuState::gpr_offset(Gpr::Rax), value);
}

/// MOVBE: byte-swapping load or store.
pub(crate) fn movbe(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("MOVBE destination");
    let src = op.src(0).expect("MOVBE source");
    let value = d.load_source(op, &src);
    let swapped = d.unary(UnaryKind::Bswap, op.op_width, value);
    d.store_result(op, &dest, swapped);
}
