//! Integer ALU lowering: the eight-row ALU block, immediate groups, INC/DEC,
//! unary group 3, multiply/divide, and the compare-exchange family.

use opal_decoder::{DecodedInst, Operand};
use opal_types::{Flag, Gpr, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{AluKind, Cond, Instr, UnaryKind};
use crate::lower::unimplemented_op;

/// The eight rows of the primary ALU block, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluRow {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

fn row_from_index(index: u8) -> AluRow {
    match index & 0b111 {
        0 => AluRow::Add,
        1 => AluRow::Or,
        2 => AluRow::Adc,
        3 => AluRow::Sbb,
        4 => AluRow::And,
        5 => AluRow::Sub,
        6 => AluRow::Xor,
        _ => AluRow::Cmp,
    }
}

pub(crate) fn alu_block(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let row = row_from_index(op.opcode >> 3);
    do_alu(d, op, row);
}

pub(crate) fn alu_group1(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let row = row_from_index(op.group_reg.unwrap_or(0));
    do_alu(d, op, row);
}

fn do_alu(d: &mut OpDispatcher<'_>, op: &DecodedInst, row: AluRow) {
    let width = op.op_width;
    let dest_op = op.dest.expect("ALU needs a destination");
    let src_op = op.src(0).expect("ALU needs a source");

    let src = d.load_source(op, &src_op);

    // LOCK with a memory destination becomes a fetch-and-op primitive; the
    // old value still feeds the flag computation.
    if op.prefixes.lock {
        if let Operand::Mem(ref mem) = dest_op {
            let kind = match row {
                AluRow::Add => AluKind::Add,
                AluRow::Sub => AluKind::Sub,
                AluRow::And => AluKind::And,
                AluRow::Or => AluKind::Or,
                AluRow::Xor => AluKind::Xor,
                AluRow::Adc => AluKind::Add,
                AluRow::Sbb => AluKind::Sub,
                AluRow::Cmp => unreachable!("LOCK CMP rejected at decode"),
            };
            let adjusted = match row {
                AluRow::Adc | AluRow::Sbb => {
                    let carry = d.get_flag(Flag::Cf);
                    d.add(width, src, carry)
                }
                _ => src,
            };
            let (addr, _stack) = d.mem_address(op, mem, None);
            let old = d.append(
                Instr::AtomicFetchOp {
                    kind,
                    addr,
                    value: adjusted,
                },
                width,
            );
            let res = d.alu(kind, width, old, adjusted);
            match row {
                AluRow::Add | AluRow::Adc => d.flags_add(width, res, old, adjusted, None),
                AluRow::Sub | AluRow::Sbb => d.flags_sub(width, res, old, adjusted, None),
                _ => {
                    d.flags_logical(width, res);
                    d.memo_and(width, res);
                }
            }
            d.lock_handled = true;
            return;
        }
    }

    let dest = d.load_source(op, &dest_op);
    match row {
        AluRow::Add => {
            let res = d.add(width, dest, src);
            d.flags_add(width, res, dest, src, None);
            d.store_result(op, &dest_op, res);
        }
        AluRow::Adc => {
            let carry = d.get_flag(Flag::Cf);
            let partial = d.add(width, dest, src);
            let res = d.add(width, partial, carry);
            d.flags_add(width, res, dest, src, Some(carry));
            d.store_result(op, &dest_op, res);
        }
        AluRow::Sub => {
            let res = d.sub(width, dest, src);
            d.flags_sub(width, res, dest, src, None);
            d.store_result(op, &dest_op, res);
        }
        AluRow::Sbb => {
            let borrow = d.get_flag(Flag::Cf);
            let partial = d.sub(width, dest, src);
            let res = d.sub(width, partial, borrow);
            d.flags_sub(width, res, dest, src, Some(borrow));
            d.store_result(op, &dest_op, res);
        }
        AluRow::And | AluRow::Or | AluRow::Xor => {
            let kind = match row {
                AluRow::And => AluKind::And,
                AluRow::Or => AluKind::Or,
                _ => AluKind::Xor,
            };
            let res = d.alu(kind, width, dest, src);
            d.flags_logical(width, res);
            d.memo_and(width, res);
            d.store_result(op, &dest_op, res);
        }
        AluRow::Cmp => {
            let res = d.sub(width, dest, src);
            d.flags_sub(width, res, dest, src, None);
            d.memo_cmp(width, dest, src);
        }
    }
}

/// TEST: AND that only writes flags.
pub(crate) fn test_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let dest_op = op.dest.expect("TEST needs a destination");
    let src_op = op.src(0).expect("TEST needs a source");
    let dest = d.load_source(op, &dest_op);
    let src = d.load_source(op, &src_op);
    let res = d.and(width, dest, src);
    d.flags_logical(width, res);
    d.memo_and(width, res);
}

// -- INC/DEC ----------------------------------------------------------

/// INC/DEC write every arithmetic flag except CF.
fn flags_incdec(
    d: &mut OpDispatcher<'_>,
    op_is_add: bool,
    width: Width,
    res: crate::ir::ValueId,
    a: crate::ir::ValueId,
    b: crate::ir::ValueId,
) {
    d.clear_flags_memo();
    d.flags_zsp(width, res);

    let axb = d.xor(width, a, b);
    let axbr = d.xor(width, axb, res);
    let af = d.bfe(Width::W8, 1, 4, axbr);
    d.set_flag_value(Flag::Af, af);

    let axr = d.xor(width, a, res);
    let of_bits = if op_is_add {
        let not_axb = d.unary(UnaryKind::Not, width, axb);
        d.and(width, not_axb, axr)
    } else {
        d.and(width, axb, axr)
    };
    let of = d.bfe(Width::W8, 1, width.msb() as u8, of_bits);
    d.set_flag_value(Flag::Of, of);
}

fn inc_dec(d: &mut OpDispatcher<'_>, op: &DecodedInst, dest_op: &Operand, is_inc: bool) {
    let width = op.op_width;

    if op.prefixes.lock {
        if let Operand::Mem(ref mem) = *dest_op {
            let one = d.const_(width, 1);
            let kind = if is_inc { AluKind::Add } else { AluKind::Sub };
            let (addr, _stack) = d.mem_address(op, mem, None);
            let old = d.append(
                Instr::AtomicFetchOp {
                    kind,
                    addr,
                    value: one,
                },
                width,
            );
            let res = d.alu(kind, width, old, one);
            flags_incdec(d, is_inc, width, res, old, one);
            d.lock_handled = true;
            return;
        }
    }

    let dest = d.load_source(op, dest_op);
    let one = d.const_(width, 1);
    let res = if is_inc {
        d.add(width, dest, one)
    } else {
        d.sub(width, dest, one)
    };
    flags_incdec(d, is_inc, width, res, dest, one);
    d.store_result(op, dest_op, res);
}

pub(crate) fn inc_reg32(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("INC r");
    inc_dec(d, op, &dest, true);
}

pub(crate) fn dec_reg32(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("DEC r");
    inc_dec(d, op, &dest, false);
}

// -- group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV ---------------------------

pub(crate) fn group3(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let dest_op = op.dest.expect("group 3 destination");
    match op.group_reg.unwrap_or(0) {
        0 | 1 => {
            // TEST r/m, imm.
            let src_op = op.src(0).expect("TEST imm");
            let dest = d.load_source(op, &dest_op);
            let src = d.load_source(op, &src_op);
            let res = d.and(width, dest, src);
            d.flags_logical(width, res);
            d.memo_and(width, res);
        }
        2 => {
            // NOT: no flags.
            if op.prefixes.lock {
                if let Operand::Mem(ref mem) = dest_op {
                    let ones = d.const_(width, u64::MAX);
                    let (addr, _stack) = d.mem_address(op, mem, None);
                    d.append(
                        Instr::AtomicFetchOp {
                            kind: AluKind::Xor,
                            addr,
                            value: ones,
                        },
                        width,
                    );
                    d.lock_handled = true;
                    return;
                }
            }
            let dest = d.load_source(op, &dest_op);
            let res = d.unary(UnaryKind::Not, width, dest);
            d.store_result(op, &dest_op, res);
        }
        3 => {
            // NEG = 0 - dest; CF is "operand was nonzero".
            let dest = d.load_source(op, &dest_op);
            let zero = d.const_(width, 0);
            let res = d.sub(width, zero, dest);
            d.flags_sub(width, res, zero, dest, None);
            d.store_result(op, &dest_op, res);
        }
        4 => mul_op(d, op, &dest_op, false),
        5 => mul_op(d, op, &dest_op, true),
        6 => div_op(d, op, &dest_op, false),
        7 => div_op(d, op, &dest_op, true),
        _ => unimplemented_op(d, op),
    }
}

/// One-operand MUL/IMUL: widened product into rDX:rAX (AX for byte ops).
fn mul_op(d: &mut OpDispatcher<'_>, op: &DecodedInst, src_op: &Operand, signed: bool) {
    let width = op.op_width;
    let src = d.load_source(op, src_op);
    let rax = d.load_gpr(Gpr::Rax, width);

    let lo = d.alu(AluKind::Mul, width, rax, src);
    let hi_kind = if signed {
        AluKind::IMulHi
    } else {
        AluKind::UMulHi
    };
    let hi = d.alu(hi_kind, width, rax, src);

    let rax_operand = Operand::Gpr {
        reg: Gpr::Rax,
        high8: false,
    };
    if width == Width::W8 {
        // AX receives the 16-bit product.
        let packed = d.bfi(Width::W16, 8, 8, lo, hi);
        d.store_result_with_opsize(op, &rax_operand, packed, Width::W16);
    } else {
        d.store_result_with_opsize(op, &rax_operand, lo, width);
        let rdx_operand = Operand::Gpr {
            reg: Gpr::Rdx,
            high8: false,
        };
        d.store_result_with_opsize(op, &rdx_operand, hi, width);
    }

    // CF=OF=1 when the upper half carries significance.
    d.clear_flags_memo();
    let expected_hi = if signed {
        let msb = d.const_(Width::W8, u64::from(width.msb() as u8));
        d.alu(AluKind::Sar, width, lo, msb)
    } else {
        d.const_(width, 0)
    };
    let one = d.const_(Width::W64, 1);
    let zero = d.const_(Width::W64, 0);
    let overflow = d.select(Cond::Neq, width, hi, expected_hi, one, zero);
    d.set_flag_value(Flag::Cf, overflow);
    d.set_flag_value(Flag::Of, overflow);
}

/// One-operand DIV/IDIV. Dividends up to 64 bits are widened exactly; the
/// 128-bit rDX:rAX form assumes the upper half carries only sign/zero
/// extension (the overwhelmingly common compiler idiom).
fn div_op(d: &mut OpDispatcher<'_>, op: &DecodedInst, src_op: &Operand, signed: bool) {
    let width = op.op_width;
    let src = d.load_source(op, src_op);

    let (dividend_lo, dividend_width) = match width {
        Width::W8 => (d.load_gpr(Gpr::Rax, Width::W16), Width::W16),
        Width::W16 | Width::W32 => {
            let lo = d.load_gpr(Gpr::Rax, width);
            let hi = d.load_gpr(Gpr::Rdx, width);
            let wide = match width {
                Width::W16 => Width::W32,
                _ => Width::W64,
            };
            let packed = d.bfi(wide, width.bits() as u8, width.bits() as u8, lo, hi);
            (packed, wide)
        }
        Width::W64 => (d.load_gpr(Gpr::Rax, Width::W64), Width::W64),
    };

    let src_wide = if signed && dividend_width > width {
        d.unary(UnaryKind::Sext(width), dividend_width, src)
    } else {
        src
    };

    let (div_kind, rem_kind) = if signed {
        (AluKind::IDiv, AluKind::IRem)
    } else {
        (AluKind::UDiv, AluKind::URem)
    };
    let quotient = d.alu(div_kind, dividend_width, dividend_lo, src_wide);
    let remainder = d.alu(rem_kind, dividend_width, dividend_lo, src_wide);

    let rax_operand = Operand::Gpr {
        reg: Gpr::Rax,
        high8: false,
    };
    if width == Width::W8 {
        // AL = quotient, AH = remainder.
        let packed = d.bfi(Width::W16, 8, 8, quotient, remainder);
        d.store_result_with_opsize(op, &rax_operand, packed, Width::W16);
    } else {
        d.store_result_with_opsize(op, &rax_operand, quotient, width);
        let rdx_operand = Operand::Gpr {
            reg: Gpr::Rdx,
            high8: false,
        };
        d.store_result_with_opsize(op, &rdx_operand, remainder, width);
    }
    d.clear_flags_memo();
}

// -- two/three operand IMUL -------------------------------------------

pub(crate) fn imul_2src(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let dest_op = op.dest.expect("IMUL destination");
    let a_op = op.src(0).expect("IMUL source");
    let a = d.load_source(op, &a_op);
    let b = match op.src(1) {
        Some(imm) => d.load_source(op, &imm),
        None => d.load_source(op, &dest_op),
    };
    // Three-operand form multiplies src0 by the immediate; two-operand form
    // multiplies dest by src0.
    let (lhs, rhs) = if op.src(1).is_some() { (a, b) } else { (b, a) };

    let res = d.alu(AluKind::Mul, width, lhs, rhs);
    let hi = d.alu(AluKind::IMulHi, width, lhs, rhs);

    d.clear_flags_memo();
    let msb = d.const_(Width::W8, u64::from(width.msb() as u8));
    let expected_hi = d.alu(AluKind::Sar, width, res, msb);
    let one = d.const_(Width::W64, 1);
    let zero = d.const_(Width::W64, 0);
    let overflow = d.select(Cond::Neq, width, hi, expected_hi, one, zero);
    d.set_flag_value(Flag::Cf, overflow);
    d.set_flag_value(Flag::Of, overflow);

    d.store_result(op, &dest_op, res);
}

// -- XADD / CMPXCHG family ---------------------------------------------

pub(crate) fn xadd(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let dest_op = op.dest.expect("XADD destination");
    let src_op = op.src(0).expect("XADD source");
    let src = d.load_source(op, &src_op);

    if let Operand::Mem(ref mem) = dest_op {
        let (addr, _stack) = d.mem_address(op, mem, None);
        let old = d.append(
            Instr::AtomicFetchOp {
                kind: AluKind::Add,
                addr,
                value: src,
            },
            width,
        );
        let res = d.add(width, old, src);
        d.flags_add(width, res, old, src, None);
        // Write the pre-add value back into the source register.
        d.store_result(op, &src_op, old);
        d.lock_handled = true;
        return;
    }

    let dest = d.load_source(op, &dest_op);
    let res = d.add(width, dest, src);
    d.flags_add(width, res, dest, src, None);
    d.store_result(op, &src_op, dest);
    d.store_result(op, &dest_op, res);
}

pub(crate) fn cmpxchg(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let dest_op = op.dest.expect("CMPXCHG destination");
    let src_op = op.src(0).expect("CMPXCHG source");
    let desired = d.load_source(op, &src_op);
    let expected = d.load_gpr(Gpr::Rax, width);
    let rax_operand = Operand::Gpr {
        reg: Gpr::Rax,
        high8: false,
    };

    let old = if let Operand::Mem(ref mem) = dest_op {
        let (addr, _stack) = d.mem_address(op, mem, None);
        let old = d.append(
            Instr::Cas {
                addr,
                expected,
                desired,
            },
            width,
        );
        d.lock_handled = true;
        old
    } else {
        let dest = d.load_source(op, &dest_op);
        let swapped = d.select(Cond::Eq, width, dest, expected, desired, dest);
        d.store_result(op, &dest_op, swapped);
        dest
    };

    // Flags are those of CMP rAX, dest; ZF doubles as the success bit.
    let res = d.sub(width, expected, old);
    d.flags_sub(width, res, expected, old, None);
    d.memo_cmp(width, expected, old);

    // rAX always receives the observed old value (a no-op on success), with
    // the 32-bit zero-extension rule applied.
    d.store_result_with_opsize(op, &rax_operand, old, width);
}

pub(crate) fn cmpxchg_pair(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if op.group_reg != Some(1) {
        unimplemented_op(d, op);
        return;
    }
    // Element width: 32-bit for CMPXCHG8B, 64-bit with REX.W for 16B.
    let elem = if op.op_width == Width::W64 {
        Width::W64
    } else {
        Width::W32
    };
    let Some(Operand::Mem(ref mem)) = op.dest else {
        unimplemented_op(d, op);
        return;
    };
    let expected_lo = d.load_gpr(Gpr::Rax, elem);
    let expected_hi = d.load_gpr(Gpr::Rdx, elem);
    let desired_lo = d.load_gpr(Gpr::Rbx, elem);
    let desired_hi = d.load_gpr(Gpr::Rcx, elem);
    let (addr, _stack) = d.mem_address(op, mem, None);
    let success = d.append(
        Instr::CasPair {
            addr,
            expected_lo,
            expected_hi,
            desired_lo,
            desired_hi,
        },
        elem,
    );
    d.clear_flags_memo();
    d.set_flag_value(Flag::Zf, success);
    d.lock_handled = true;
}

// -- CLC/STC/CMC/CLD/STD ----------------------------------------------

pub(crate) fn flag_control(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.opcode {
        0xf5 => {
            // CMC
            let cf = d.get_flag(Flag::Cf);
            let one = d.const_(Width::W8, 1);
            let flipped = d.xor(Width::W8, cf, one);
            d.clear_flags_memo();
            d.set_flag_value(Flag::Cf, flipped);
        }
        0xf8 => {
            d.clear_flags_memo();
            d.set_flag_const(Flag::Cf, false);
        }
        0xf9 => {
            d.clear_flags_memo();
            d.set_flag_const(Flag::Cf, true);
        }
        0xfc => {
            let zero = d.const_(Width::W8, 0);
            d.set_df(zero);
        }
        0xfd => {
            let one = d.const_(Width::W8, 1);
            d.set_df(one);
        }
        _ => unimplemented_op(d, op),
    }
}

// -- group 4/5 ----------------------------------------------------------

pub(crate) fn group4(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("group 4 destination");
    match op.group_reg.unwrap_or(0) {
        0 => inc_dec(d, op, &dest, true),
        1 => inc_dec(d, op, &dest, false),
        _ => unimplemented_op(d, op),
    }
}

pub(crate) fn group5(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("group 5 operand");
    match op.group_reg.unwrap_or(0) {
        0 => inc_dec(d, op, &dest, true),
        1 => inc_dec(d, op, &dest, false),
        2 => super::control::call_indirect(d, op),
        4 => super::control::jmp_indirect(d, op),
        6 => super::stack::push_rm(d, op),
        _ => unimplemented_op(d, op),
    }
}
