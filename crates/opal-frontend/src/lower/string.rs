//! String instructions.
//!
//! Non-REP forms are straight-line. REP forms expand through a loop-builder
//! helper into header/body/exit blocks; the body reloads its state from
//! context every iteration, because SSA values never cross blocks.

use opal_decoder::DecodedInst;
use opal_types::{Flag, Gpr, SegReg, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{Cond, Instr, Terminator, ValueId};
use crate::lower::unimplemented_op;

/// REP termination mode after the body runs.
#[derive(Clone, Copy, PartialEq, Eq)]
enum RepKind {
    /// Plain REP: only the counter terminates.
    Unconditional,
    /// REPE: continue while ZF=1.
    WhileEqual,
    /// REPNE: continue while ZF=0.
    WhileNotEqual,
}

/// ±element-size depending on DF.
fn direction(d: &mut OpDispatcher<'_>, width: Width) -> ValueId {
    let gpr_w = d.gpr_width();
    let size = d.const_(gpr_w, u64::from(width.bytes()));
    let neg_size = d.const_(gpr_w, (u64::from(width.bytes())).wrapping_neg());
    let df = d.get_df();
    let zero = d.const_(Width::W8, 0);
    d.select(Cond::Eq, Width::W8, df, zero, size, neg_size)
}

fn advance_reg(d: &mut OpDispatcher<'_>, reg: Gpr, delta: ValueId) {
    let gpr_w = d.gpr_width();
    let value = d.load_gpr_native(reg);
    let next = d.add(gpr_w, value, delta);
    d.store_gpr_native(reg, next);
}

/// Expand a REP loop: header tests rCX, the body runs `body` then
/// decrements rCX, and `kind` optionally adds a ZF continuation test.
fn rep_loop(
    d: &mut OpDispatcher<'_>,
    op: &DecodedInst,
    kind: RepKind,
    body: impl FnOnce(&mut OpDispatcher<'_>, &DecodedInst),
) {
    let header = d.create_block();
    let body_bb = d.create_block();
    let exit = d.create_block();

    d.terminate(Terminator::Jump { target: header });

    d.set_current_block(header);
    {
        let counter = d.load_gpr_native(Gpr::Rcx);
        d.terminate(Terminator::CondJump {
            cond: counter,
            then_bb: body_bb,
            else_bb: exit,
        });
    }

    d.set_current_block(body_bb);
    {
        body(d, op);

        let gpr_w = d.gpr_width();
        let counter = d.load_gpr_native(Gpr::Rcx);
        let one = d.const_(gpr_w, 1);
        let next = d.sub(gpr_w, counter, one);
        d.store_gpr_native(Gpr::Rcx, next);

        match kind {
            RepKind::Unconditional => d.terminate(Terminator::Jump { target: header }),
            RepKind::WhileEqual => {
                let zf = d.get_flag(Flag::Zf);
                d.terminate(Terminator::CondJump {
                    cond: zf,
                    then_bb: header,
                    else_bb: exit,
                });
            }
            RepKind::WhileNotEqual => {
                let zf = d.get_flag(Flag::Zf);
                d.terminate(Terminator::CondJump {
                    cond: zf,
                    then_bb: exit,
                    else_bb: header,
                });
            }
        }
    }

    d.set_current_block(exit);
}

fn reject_address_size(d: &mut OpDispatcher<'_>, op: &DecodedInst) -> bool {
    if op.prefixes.address_size_override {
        unimplemented_op(d, op);
        return true;
    }
    false
}

// -- MOVS ---------------------------------------------------------------

fn movs_body(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let src_addr = d.load_gpr_native(Gpr::Rsi);
    let src_addr = d.append_segment_offset(src_addr, op, Some(SegReg::Ds), false);
    let value = d.append(
        Instr::LoadMem {
            addr: src_addr,
            tso: false,
        },
        width,
    );

    let dst_addr = d.load_gpr_native(Gpr::Rdi);
    let dst_addr = d.append_segment_offset(dst_addr, op, Some(SegReg::Es), true);
    d.append(
        Instr::StoreMem {
            addr: dst_addr,
            value,
            tso: false,
        },
        width,
    );

    let delta = direction(d, width);
    advance_reg(d, Gpr::Rsi, delta);
    advance_reg(d, Gpr::Rdi, delta);
}

pub(crate) fn movs(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if op.prefixes.repne {
        unimplemented_op(d, op);
        return;
    }
    if reject_address_size(d, op) {
        return;
    }
    if op.prefixes.rep {
        rep_loop(d, op, RepKind::Unconditional, movs_body);
    } else {
        movs_body(d, op);
    }
}

// -- STOS ---------------------------------------------------------------

fn stos_body(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let value = d.load_gpr(Gpr::Rax, width);
    let dst_addr = d.load_gpr_native(Gpr::Rdi);
    let dst_addr = d.append_segment_offset(dst_addr, op, Some(SegReg::Es), true);
    d.append(
        Instr::StoreMem {
            addr: dst_addr,
            value,
            tso: false,
        },
        width,
    );
    let delta = direction(d, width);
    advance_reg(d, Gpr::Rdi, delta);
}

pub(crate) fn stos(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if op.prefixes.repne {
        unimplemented_op(d, op);
        return;
    }
    if reject_address_size(d, op) {
        return;
    }
    if op.prefixes.rep {
        rep_loop(d, op, RepKind::Unconditional, stos_body);
    } else {
        stos_body(d, op);
    }
}

// -- LODS ---------------------------------------------------------------

fn lods_body(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let src_addr = d.load_gpr_native(Gpr::Rsi);
    let src_addr = d.append_segment_offset(src_addr, op, Some(SegReg::Ds), false);
    let value = d.append(
        Instr::LoadMem {
            addr: src_addr,
            tso: false,
        },
        width,
    );
    let rax = opal_decoder::Operand::Gpr {
        reg: Gpr::Rax,
        high8: false,
    };
    d.store_result_with_opsize(op, &rax, value, width);
    let delta = direction(d, width);
    advance_reg(d, Gpr::Rsi, delta);
}

pub(crate) fn lods(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if op.prefixes.repne {
        unimplemented_op(d, op);
        return;
    }
    if reject_address_size(d, op) {
        return;
    }
    if op.prefixes.rep {
        rep_loop(d, op, RepKind::Unconditional, lods_body);
    } else {
        lods_body(d, op);
    }
}

// -- CMPS / SCAS --------------------------------------------------------

fn cmps_body(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let src_addr = d.load_gpr_native(Gpr::Rsi);
    let src_addr = d.append_segment_offset(src_addr, op, Some(SegReg::Ds), false);
    let lhs = d.append(
        Instr::LoadMem {
            addr: src_addr,
            tso: false,
        },
        width,
    );

    let dst_addr = d.load_gpr_native(Gpr::Rdi);
    let dst_addr = d.append_segment_offset(dst_addr, op, Some(SegReg::Es), true);
    let rhs = d.append(
        Instr::LoadMem {
            addr: dst_addr,
            tso: false,
        },
        width,
    );

    let res = d.sub(width, lhs, rhs);
    d.flags_sub(width, res, lhs, rhs, None);
    d.memo_cmp(width, lhs, rhs);

    let delta = direction(d, width);
    advance_reg(d, Gpr::Rsi, delta);
    advance_reg(d, Gpr::Rdi, delta);
}

pub(crate) fn cmps(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if reject_address_size(d, op) {
        return;
    }
    if op.prefixes.rep {
        rep_loop(d, op, RepKind::WhileEqual, cmps_body);
    } else if op.prefixes.repne {
        rep_loop(d, op, RepKind::WhileNotEqual, cmps_body);
    } else {
        cmps_body(d, op);
    }
}

fn scas_body(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let lhs = d.load_gpr(Gpr::Rax, width);

    let dst_addr = d.load_gpr_native(Gpr::Rdi);
    let dst_addr = d.append_segment_offset(dst_addr, op, Some(SegReg::Es), true);
    let rhs = d.append(
        Instr::LoadMem {
            addr: dst_addr,
            tso: false,
        },
        width,
    );

    let res = d.sub(width, lhs, rhs);
    d.flags_sub(width, res, lhs, rhs, None);
    d.memo_cmp(width, lhs, rhs);

    let delta = direction(d, width);
    advance_reg(d, Gpr::Rdi, delta);
}

pub(crate) fn scas(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if reject_address_size(d, op) {
        return;
    }
    if op.prefixes.rep {
        rep_loop(d, op, RepKind::WhileEqual, scas_body);
    } else if op.prefixes.repne {
        rep_loop(d, op, RepKind::WhileNotEqual, scas_body);
    } else {
        scas_body(d, op);
    }
}
