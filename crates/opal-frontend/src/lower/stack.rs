//! Stack operations: PUSH/POP in all their forms, flag image moves, and the
//! frame helpers ENTER/LEAVE.

use opal_decoder::{DecodedInst, Operand};
use opal_types::{Gpr, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{Instr, ValueId};
use crate::lower::unimplemented_op;

/// Push one value of the operation's stack width.
fn push_value(d: &mut OpDispatcher<'_>, width: Width, value: ValueId) {
    let gpr_w = d.gpr_width();
    let size = d.const_(gpr_w, u64::from(width.bytes()));
    let old_sp = d.load_gpr_native(Gpr::Rsp);
    let new_sp = d.sub(gpr_w, old_sp, size);
    d.store_gpr_native(Gpr::Rsp, new_sp);
    d.append(
        Instr::StoreMem {
            addr: new_sp,
            value,
            tso: true,
        },
        width,
    );
}

/// Pop one value; adjusts RSP and returns the value.
fn pop_value(d: &mut OpDispatcher<'_>, width: Width) -> ValueId {
    let gpr_w = d.gpr_width();
    let size = d.const_(gpr_w, u64::from(width.bytes()));
    let old_sp = d.load_gpr_native(Gpr::Rsp);
    let value = d.append(
        Instr::LoadMem {
            addr: old_sp,
            tso: true,
        },
        width,
    );
    let new_sp = d.add(gpr_w, old_sp, size);
    d.store_gpr_native(Gpr::Rsp, new_sp);
    value
}

pub(crate) fn push_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let src = op.src(0).expect("PUSH source");
    let value = d.load_source(op, &src);
    push_value(d, op.op_width, value);
}

pub(crate) fn push_imm(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    push_op(d, op);
}

pub(crate) fn push_rm(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    // Group-5 PUSH carries its operand in the dest slot.
    let src = op.dest.expect("PUSH r/m operand");
    let value = d.load_source(op, &src);
    push_value(d, op.op_width, value);
}

pub(crate) fn pop_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("POP destination");
    let value = pop_value(d, op.op_width);
    d.store_result(op, &dest, value);
}

pub(crate) fn pop_rm(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    pop_op(d, op);
}

pub(crate) fn push_seg(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let src = op.src(0).expect("PUSH Sreg operand");
    let value = d.load_source_with_opsize(op, &src, Width::W16);
    push_value(d, op.op_width, value);
}

pub(crate) fn pop_seg(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("POP Sreg operand");
    let value = pop_value(d, op.op_width);
    d.store_result_with_opsize(op, &dest, value, Width::W16);
}

pub(crate) fn pushf(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let packed = d.get_packed_rflags(false);
    push_value(d, op.op_width, packed);
}

pub(crate) fn popf(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let value = pop_value(d, op.op_width);
    d.set_packed_rflags(value, false);
}

/// LAHF: AH = low byte of the flag image (bit 1 set).
pub(crate) fn lahf(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let packed = d.get_packed_rflags(true);
    let ah = Operand::Gpr {
        reg: Gpr::Rax,
        high8: true,
    };
    d.store_result_with_opsize(op, &ah, packed, Width::W8);
}

/// SAHF: CF/PF/AF/ZF/SF from AH; bits 3 and 5 are discarded.
pub(crate) fn sahf(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let _ = op;
    let ah = d.load_ctx(
        Width::W8,
        opal_cpu_core::state::CpuState::gpr_offset(Gpr::Rax) + 1,
    );
    d.set_packed_rflags(ah, true);
}

/// ENTER frame, nesting level 0 only (deeper nesting never appears in
/// compiled code).
pub(crate) fn enter(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let frame_size = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
    let nesting = op.src(1).and_then(|s| s.imm_value()).unwrap_or(0) & 0x1f;
    if nesting != 0 {
        unimplemented_op(d, op);
        return;
    }

    let gpr_w = d.gpr_width();
    let rbp = d.load_gpr_native(Gpr::Rbp);
    push_value(d, gpr_w, rbp);
    let frame_ptr = d.load_gpr_native(Gpr::Rsp);
    let size = d.const_(gpr_w, frame_size);
    let new_sp = d.sub(gpr_w, frame_ptr, size);
    d.store_gpr_native(Gpr::Rsp, new_sp);
    d.store_gpr_native(Gpr::Rbp, frame_ptr);
}

pub(crate) fn leave(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let gpr_w = d.gpr_width();
    let rbp = d.load_gpr_native(Gpr::Rbp);
    d.store_gpr_native(Gpr::Rsp, rbp);
    let value = pop_value(d, gpr_w);
    let rbp_op = Operand::Gpr {
        reg: Gpr::Rbp,
        high8: false,
    };
    d.store_result_with_opsize(op, &rbp_op, value, gpr_w);
}
