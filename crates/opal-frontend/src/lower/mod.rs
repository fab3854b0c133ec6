//! Per-instruction lowering, split by instruction family.
//!
//! Dispatch is a closed match over `(map, opcode, group_reg)`. Unhandled
//! encodings set the decode-failure status; the driver responds by ending
//! the block with an exit to the faulting PC, which surfaces as `#UD` when
//! the guest re-enters.

mod alu;
mod control;
mod mov;
mod shift;
mod sse;
mod stack;
mod string;
mod x87;

use opal_decoder::{DecodedInst, OpcodeMap};
use tracing::debug;

use crate::dispatch::OpDispatcher;

pub(crate) fn lower(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.map {
        OpcodeMap::Primary => lower_primary(d, op),
        OpcodeMap::Secondary => lower_secondary(d, op),
        OpcodeMap::Escape0F38 => lower_0f38(d, op),
        OpcodeMap::Escape0F3A => unimplemented_op(d, op),
        OpcodeMap::X87(esc) => x87::lower_x87(d, op, esc),
    }
}

pub(crate) fn unimplemented_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    debug!(pc = op.pc, map = ?op.map, opcode = op.opcode, "untranslated opcode");
    d.decode_failure = true;
}

fn lower_primary(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.opcode {
        0x00..=0x3d => alu::alu_block(d, op),
        0x06 | 0x0e | 0x16 | 0x1e => stack::push_seg(d, op),
        0x07 | 0x17 | 0x1f => stack::pop_seg(d, op),
        0x40..=0x47 => alu::inc_reg32(d, op),
        0x48..=0x4f => alu::dec_reg32(d, op),
        0x50..=0x57 => stack::push_op(d, op),
        0x58..=0x5f => stack::pop_op(d, op),
        0x63 => mov::movsxd(d, op),
        0x68 | 0x6a => stack::push_imm(d, op),
        0x69 | 0x6b => alu::imul_2src(d, op),
        0x70..=0x7f => control::cond_jump(d, op),
        0x80..=0x83 => alu::alu_group1(d, op),
        0x84 | 0x85 | 0xa8 | 0xa9 => alu::test_op(d, op),
        0x86 | 0x87 => mov::xchg(d, op),
        0x88..=0x8b => mov::mov_op(d, op),
        0x8c | 0x8e => mov::mov_seg(d, op),
        0x8d => mov::lea(d, op),
        0x8f => stack::pop_rm(d, op),
        0x90..=0x97 => mov::xchg_ax(d, op),
        0x98 => mov::sign_extend_ax(d, op),
        0x99 => mov::sign_split_dx(d, op),
        0x9b => {} // FWAIT
        0x9c => stack::pushf(d, op),
        0x9d => stack::popf(d, op),
        0x9e => stack::sahf(d, op),
        0x9f => stack::lahf(d, op),
        0xa0..=0xa3 => mov::mov_op(d, op),
        0xa4 | 0xa5 => string::movs(d, op),
        0xa6 | 0xa7 => string::cmps(d, op),
        0xaa | 0xab => string::stos(d, op),
        0xac | 0xad => string::lods(d, op),
        0xae | 0xaf => string::scas(d, op),
        0xb0..=0xbf => mov::mov_op(d, op),
        0xc0 | 0xc1 | 0xd0..=0xd3 => shift::shift_group2(d, op),
        0xc2 | 0xc3 => control::ret_op(d, op),
        0xc6 | 0xc7 => mov::mov_op(d, op),
        0xc8 => stack::enter(d, op),
        0xc9 => stack::leave(d, op),
        0xcc | 0xcd | 0xce => control::int_op(d, op),
        0xcf => control::iret(d, op),
        0xd7 => mov::xlat(d, op),
        0xe0..=0xe2 => control::loop_op(d, op),
        0xe3 => control::jrcxz(d, op),
        0xe8 => control::call_rel(d, op),
        0xe9 | 0xeb => control::jmp_rel(d, op),
        0xf4 | 0xfa | 0xfb => control::privileged(d, op),
        0xf5 | 0xf8 | 0xf9 | 0xfc | 0xfd => alu::flag_control(d, op),
        0xf6 | 0xf7 => alu::group3(d, op),
        0xfe => alu::group4(d, op),
        0xff => alu::group5(d, op),
        _ => unimplemented_op(d, op),
    }
}

fn lower_secondary(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.opcode {
        0x05 => control::syscall_op(d, op),
        0x0d | 0x18..=0x1f => {} // hint NOPs
        0x10 | 0x11 | 0x28 | 0x29 => sse::mov_vec(d, op),
        0x2a => sse::cvt_int_to_fp(d, op),
        0x2c | 0x2d => sse::cvt_fp_to_int(d, op),
        0x2e | 0x2f => sse::ucomis(d, op),
        0x31 => control::rdtsc(d, op),
        0x3f => control::thunk(d, op),
        0x40..=0x4f => mov::cmov(d, op),
        0x51 | 0x58..=0x5f => sse::fp_arith(d, op),
        0x54..=0x57 => sse::fp_logical(d, op),
        0x6e => sse::movd_load(d, op),
        0x6f => sse::mov_vec(d, op),
        0x70 => sse::pshufd(d, op),
        0x74 | 0x76 => sse::pcmpeq(d, op),
        0x77 => {} // EMMS (and VZEROUPPER via VEX)
        0xdb | 0xeb | 0xef => sse::packed_logical(d, op),
        0x7e => sse::movd_store(d, op),
        0x7f => sse::mov_vec(d, op),
        0x80..=0x8f => control::cond_jump(d, op),
        0x90..=0x9f => mov::setcc(d, op),
        0xa0 | 0xa8 => stack::push_seg(d, op),
        0xa1 | 0xa9 => stack::pop_seg(d, op),
        0xa2 => control::cpuid(d, op),
        0xa3 | 0xab | 0xb3 | 0xbb => shift::bt_rm(d, op),
        0xa4 | 0xa5 | 0xac | 0xad => shift::shld_shrd(d, op),
        0xae => control::group15(d, op),
        0xaf => alu::imul_2src(d, op),
        0xb0 | 0xb1 => alu::cmpxchg(d, op),
        0xb6 | 0xb7 => mov::movzx(d, op),
        0xb8 => shift::popcnt(d, op),
        0xba => shift::bt_imm(d, op),
        0xbc | 0xbd => shift::bit_scan(d, op),
        0xbe | 0xbf => mov::movsx(d, op),
        0xc0 | 0xc1 => alu::xadd(d, op),
        0xc2 => sse::cmp_scalar(d, op),
        0xc7 => alu::cmpxchg_pair(d, op),
        0xc8..=0xcf => shift::bswap(d, op),
        _ => unimplemented_op(d, op),
    }
}

fn lower_0f38(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.opcode {
        0xf0 | 0xf1 => mov::movbe(d, op),
        _ => unimplemented_op(d, op),
    }
}
