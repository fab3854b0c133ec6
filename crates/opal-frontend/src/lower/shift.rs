//! Shifts, rotates, double shifts, bit tests and bit scans.
//!
//! x86 masks shift counts by 0x1f (0x3f for 64-bit operands); the mask is
//! emitted explicitly. Flag updates are guarded so a zero count leaves every
//! flag untouched. Narrow rotates replicate the operand into the high half
//! of a 32-bit value first, since narrow rotates are rarely native.

use opal_decoder::{DecodedInst, Operand};
use opal_types::{Flag, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{AluKind, Cond, Instr, Terminator, UnaryKind, ValueId};
use crate::lower::unimplemented_op;

/// Group 2: ROL/ROR/RCL/RCR/SHL/SHR/SAR.
pub(crate) fn shift_group2(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.group_reg.unwrap_or(0) {
        0 => rotate(d, op, true),
        1 => rotate(d, op, false),
        2 => rotate_carry(d, op, true),
        3 => rotate_carry(d, op, false),
        4 | 6 => plain_shift(d, op, AluKind::Shl),
        5 => plain_shift(d, op, AluKind::Shr),
        7 => plain_shift(d, op, AluKind::Sar),
        _ => unimplemented_op(d, op),
    }
}

/// Load and mask the shift count. Returns the masked count plus, when it is
/// a literal, its concrete value.
fn masked_count(d: &mut OpDispatcher<'_>, op: &DecodedInst) -> (ValueId, Option<u64>) {
    let width = op.op_width;
    let src = op.src(0).expect("shift count");
    let literal = src.imm_value().map(|v| v & width.shift_mask());
    let raw = d.load_source_with_opsize(op, &src, Width::W8);
    let mask = d.const_(Width::W8, width.shift_mask());
    let count = d.and(Width::W8, raw, mask);
    (count, literal)
}

/// `count == 0 ? old : new` for flag preservation.
fn keep_if_zero(
    d: &mut OpDispatcher<'_>,
    count: ValueId,
    old: ValueId,
    new: ValueId,
) -> ValueId {
    let zero = d.const_(Width::W8, 0);
    d.select(Cond::Eq, Width::W8, count, zero, old, new)
}

fn plain_shift(d: &mut OpDispatcher<'_>, op: &DecodedInst, kind: AluKind) {
    let width = op.op_width;
    let dest_op = op.dest.expect("shift destination");
    let (count, literal) = masked_count(d, op);
    let dest = d.load_source(op, &dest_op);
    let res = d.alu(kind, width, dest, count);

    if literal == Some(0) {
        // Count statically zero: nothing is written, not even flags.
        return;
    }

    d.clear_flags_memo();

    // CF is the last bit shifted out.
    let bits = d.const_(Width::W8, u64::from(width.bits()));
    let one8 = d.const_(Width::W8, 1);
    let new_cf = match kind {
        AluKind::Shl => {
            let back = d.sub(Width::W8, bits, count);
            let shifted = d.alu(AluKind::Shr, width, dest, back);
            d.and(Width::W8, shifted, one8)
        }
        _ => {
            let back = d.sub(Width::W8, count, one8);
            let shifted = d.alu(
                if kind == AluKind::Sar {
                    AluKind::Sar
                } else {
                    AluKind::Shr
                },
                width,
                dest,
                back,
            );
            d.and(Width::W8, shifted, one8)
        }
    };

    // OF is defined for single-bit shifts: SHL -> msb(res) ^ CF,
    // SHR -> msb of the original, SAR -> 0.
    let new_of = match kind {
        AluKind::Shl => {
            let msb = d.bfe(Width::W8, 1, width.msb() as u8, res);
            d.xor(Width::W8, msb, new_cf)
        }
        AluKind::Shr => d.bfe(Width::W8, 1, width.msb() as u8, dest),
        _ => d.const_(Width::W8, 0),
    };

    if literal.is_some() {
        d.set_flag_value(Flag::Cf, new_cf);
        d.set_flag_value(Flag::Of, new_of);
        d.flags_zsp(width, res);
    } else {
        // Dynamic count: every flag write is gated on count != 0.
        let old_cf = d.get_flag(Flag::Cf);
        let cf = keep_if_zero(d, count, old_cf, new_cf);
        d.set_flag_value(Flag::Cf, cf);

        let old_of = d.get_flag(Flag::Of);
        let of = keep_if_zero(d, count, old_of, new_of);
        d.set_flag_value(Flag::Of, of);

        gated_zsp(d, op, count, res);
    }

    d.store_result(op, &dest_op, res);
}

/// ZF/SF/PF gated on a dynamic count being nonzero.
fn gated_zsp(d: &mut OpDispatcher<'_>, op: &DecodedInst, count: ValueId, res: ValueId) {
    let width = op.op_width;
    let zero = d.const_(width, 0);
    let one = d.const_(Width::W64, 1);
    let zero64 = d.const_(Width::W64, 0);

    let new_zf = d.select(Cond::Eq, width, res, zero, one, zero64);
    let old_zf = d.get_flag(Flag::Zf);
    let zf = keep_if_zero(d, count, old_zf, new_zf);
    d.set_flag_value(Flag::Zf, zf);

    let new_sf = d.bfe(Width::W8, 1, width.msb() as u8, res);
    let old_sf = d.get_flag(Flag::Sf);
    let sf = keep_if_zero(d, count, old_sf, new_sf);
    d.set_flag_value(Flag::Sf, sf);

    let low = d.bfe(Width::W8, 8, 0, res);
    let ones = d.unary(UnaryKind::Popcount, Width::W8, low);
    let bit = d.bfe(Width::W8, 1, 0, ones);
    let one8 = d.const_(Width::W8, 1);
    let new_pf = d.xor(Width::W8, bit, one8);
    let old_pf = d.get_flag(Flag::Pf);
    let pf = keep_if_zero(d, count, old_pf, new_pf);
    d.set_flag_value(Flag::Pf, pf);
}

fn rotate(d: &mut OpDispatcher<'_>, op: &DecodedInst, left: bool) {
    let width = op.op_width;
    let dest_op = op.dest.expect("rotate destination");
    let (count, literal) = masked_count(d, op);
    let dest = d.load_source(op, &dest_op);

    // Narrow rotates replicate the operand so a 32-bit rotate sees a
    // repeating pattern.
    let (rot_width, value, count) = match width {
        Width::W8 => {
            let rep = d.bfi(Width::W32, 8, 8, dest, dest);
            let rep = d.bfi(Width::W32, 16, 16, rep, rep);
            let mask = d.const_(Width::W8, 7);
            let small = d.and(Width::W8, count, mask);
            (Width::W32, rep, small)
        }
        Width::W16 => {
            let rep = d.bfi(Width::W32, 16, 16, dest, dest);
            let mask = d.const_(Width::W8, 15);
            let small = d.and(Width::W8, count, mask);
            (Width::W32, rep, small)
        }
        _ => (width, dest, count),
    };

    let kind = if left { AluKind::Rol } else { AluKind::Ror };
    let rotated = d.alu(kind, rot_width, value, count);
    let res = if rot_width != width {
        d.bfe(width, width.bits() as u8, 0, rotated)
    } else {
        rotated
    };

    if literal == Some(0) {
        return;
    }
    d.clear_flags_memo();

    // ROL: CF = lsb(res); ROR: CF = msb(res).
    let new_cf = if left {
        d.bfe(Width::W8, 1, 0, res)
    } else {
        d.bfe(Width::W8, 1, width.msb() as u8, res)
    };
    // OF (count == 1): ROL -> msb ^ CF; ROR -> msb ^ msb-1.
    let msb = d.bfe(Width::W8, 1, width.msb() as u8, res);
    let new_of = if left {
        d.xor(Width::W8, msb, new_cf)
    } else {
        let next = d.bfe(Width::W8, 1, (width.msb() - 1) as u8, res);
        d.xor(Width::W8, msb, next)
    };

    if literal.is_some() {
        d.set_flag_value(Flag::Cf, new_cf);
        d.set_flag_value(Flag::Of, new_of);
    } else {
        let old_cf = d.get_flag(Flag::Cf);
        let cf = keep_if_zero(d, count, old_cf, new_cf);
        d.set_flag_value(Flag::Cf, cf);
        let old_of = d.get_flag(Flag::Of);
        let of = keep_if_zero(d, count, old_of, new_of);
        d.set_flag_value(Flag::Of, of);
    }

    d.store_result(op, &dest_op, res);
}

/// RCL/RCR rotate through carry. The operand and CF are packed into one
/// wider value (a 64-bit scratch for the narrow widths), rotated, and
/// unpacked.
fn rotate_carry(d: &mut OpDispatcher<'_>, op: &DecodedInst, left: bool) {
    let width = op.op_width;
    if width == Width::W64 {
        // 65-bit rotation does not fit the scratch trick; translate the
        // single-bit forms only (the common case by far).
        rotate_carry_64(d, op, left);
        return;
    }

    let dest_op = op.dest.expect("rotate destination");
    let (count, literal) = masked_count(d, op);
    let dest = d.load_source(op, &dest_op);
    let cf = d.get_flag(Flag::Cf);

    let w = width.bits() as u8;
    // combined = dest | CF << w, a (w+1)-bit quantity in a 64-bit scratch.
    let combined = d.bfi(Width::W64, 1, w, dest, cf);

    // count mod (w+1).
    let modulus = d.const_(Width::W8, u64::from(w) + 1);
    let count = d.alu(AluKind::URem, Width::W8, count, modulus);

    // Rotate the (w+1)-bit field: left -> (c << n) | (c >> (w+1-n)).
    let total = d.const_(Width::W8, u64::from(w) + 1);
    let back = d.sub(Width::W8, total, count);
    let (first, second) = if left { (count, back) } else { (back, count) };
    let hi = d.alu(AluKind::Shl, Width::W64, combined, first);
    let lo = d.alu(AluKind::Shr, Width::W64, combined, second);
    let rotated = d.or(Width::W64, hi, lo);

    let res = d.bfe(width, w, 0, rotated);
    let new_cf = d.bfe(Width::W8, 1, w, rotated);

    if literal == Some(0) {
        return;
    }
    d.clear_flags_memo();

    let msb = d.bfe(Width::W8, 1, width.msb() as u8, res);
    let new_of = if left {
        d.xor(Width::W8, msb, new_cf)
    } else {
        let next = d.bfe(Width::W8, 1, (width.msb() - 1) as u8, res);
        d.xor(Width::W8, msb, next)
    };

    if literal.is_some() {
        d.set_flag_value(Flag::Cf, new_cf);
        d.set_flag_value(Flag::Of, new_of);
        d.store_result(op, &dest_op, res);
    } else {
        let old_cf = d.get_flag(Flag::Cf);
        let cf_out = keep_if_zero(d, count, old_cf, new_cf);
        d.set_flag_value(Flag::Cf, cf_out);
        let old_of = d.get_flag(Flag::Of);
        let of_out = keep_if_zero(d, count, old_of, new_of);
        d.set_flag_value(Flag::Of, of_out);
        let merged = keep_if_zero(d, count, dest, res);
        d.store_result(op, &dest_op, merged);
    }
}

/// 64-bit RCL/RCR, count forced to 1 (wider dynamic counts fall back to the
/// untranslated path).
fn rotate_carry_64(d: &mut OpDispatcher<'_>, op: &DecodedInst, left: bool) {
    let (_count, literal) = masked_count(d, op);
    if literal != Some(1) {
        unimplemented_op(d, op);
        return;
    }
    let dest_op = op.dest.expect("rotate destination");
    let dest = d.load_source(op, &dest_op);
    let cf = d.get_flag(Flag::Cf);
    d.clear_flags_memo();

    let one = d.const_(Width::W8, 1);
    let (res, new_cf) = if left {
        let shifted = d.alu(AluKind::Shl, Width::W64, dest, one);
        let res = d.or(Width::W64, shifted, cf);
        let new_cf = d.bfe(Width::W8, 1, 63, dest);
        (res, new_cf)
    } else {
        let shifted = d.alu(AluKind::Shr, Width::W64, dest, one);
        let res = d.bfi(Width::W64, 1, 63, shifted, cf);
        let new_cf = d.bfe(Width::W8, 1, 0, dest);
        (res, new_cf)
    };

    let msb = d.bfe(Width::W8, 1, 63, res);
    let new_of = if left {
        d.xor(Width::W8, msb, new_cf)
    } else {
        let next = d.bfe(Width::W8, 1, 62, res);
        d.xor(Width::W8, msb, next)
    };
    d.set_flag_value(Flag::Cf, new_cf);
    d.set_flag_value(Flag::Of, new_of);
    d.store_result(op, &dest_op, res);
}

/// SHLD/SHRD. A zero count leaves the destination fully untouched (no
/// implicit 32-bit zero-extension), so the zero case is a real branch: the
/// work happens in a separate block that reloads its inputs from context.
pub(crate) fn shld_shrd(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let left = matches!(op.opcode, 0xa4 | 0xa5);
    let width = op.op_width;
    let (count, literal) = masked_count(d, op);

    if let Some(n) = literal {
        if n == 0 {
            return;
        }
        shld_shrd_body(d, op, left);
        return;
    }

    // Dynamic count: branch over the body when it is zero.
    let work = d.create_block();
    let done = d.create_block();
    let zero = d.const_(Width::W8, 0);
    let one64 = d.const_(Width::W64, 1);
    let zero64 = d.const_(Width::W64, 0);
    let nonzero = d.select(Cond::Neq, Width::W8, count, zero, one64, zero64);
    d.terminate(Terminator::CondJump {
        cond: nonzero,
        then_bb: work,
        else_bb: done,
    });

    d.set_current_block(work);
    shld_shrd_body(d, op, left);
    d.terminate(Terminator::Jump { target: done });

    d.set_current_block(done);
    let _ = width;
}

/// The non-zero-count body. Inputs are (re)loaded here so the block is
/// self-contained.
fn shld_shrd_body(d: &mut OpDispatcher<'_>, op: &DecodedInst, left: bool) {
    let width = op.op_width;
    let dest_op = op.dest.expect("SHLD destination");
    let src_op = op.src(0).expect("SHLD source");
    let (count, _literal) = masked_count(d, op);
    let dest = d.load_source(op, &dest_op);
    let src = d.load_source(op, &src_op);

    let bits = d.const_(Width::W8, u64::from(width.bits()));
    let back = d.sub(Width::W8, bits, count);

    let res = if left {
        let hi = d.alu(AluKind::Shl, width, dest, count);
        let lo = d.alu(AluKind::Shr, width, src, back);
        d.or(width, hi, lo)
    } else {
        let lo = d.alu(AluKind::Shr, width, dest, count);
        let hi = d.alu(AluKind::Shl, width, src, back);
        d.or(width, hi, lo)
    };

    d.clear_flags_memo();
    let one8 = d.const_(Width::W8, 1);
    let new_cf = if left {
        let back1 = d.sub(Width::W8, bits, count);
        let shifted = d.alu(AluKind::Shr, width, dest, back1);
        d.and(Width::W8, shifted, one8)
    } else {
        let back1 = d.sub(Width::W8, count, one8);
        let shifted = d.alu(AluKind::Shr, width, dest, back1);
        d.and(Width::W8, shifted, one8)
    };
    d.set_flag_value(Flag::Cf, new_cf);

    let msb_res = d.bfe(Width::W8, 1, width.msb() as u8, res);
    let msb_dest = d.bfe(Width::W8, 1, width.msb() as u8, dest);
    let of = d.xor(Width::W8, msb_res, msb_dest);
    d.set_flag_value(Flag::Of, of);

    d.flags_zsp(width, res);
    d.store_result(op, &dest_op, res);
}

// -- BT family ----------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum BtAction {
    Test,
    Set,
    Reset,
    Complement,
}

fn bt_action_for(opcode: u8, group_reg: Option<u8>) -> BtAction {
    match (opcode, group_reg) {
        (0xa3, _) | (0xba, Some(4)) => BtAction::Test,
        (0xab, _) | (0xba, Some(5)) => BtAction::Set,
        (0xb3, _) | (0xba, Some(6)) => BtAction::Reset,
        _ => BtAction::Complement,
    }
}

pub(crate) fn bt_rm(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    bt_common(d, op, bt_action_for(op.opcode, None));
}

pub(crate) fn bt_imm(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    bt_common(d, op, bt_action_for(op.opcode, op.group_reg));
}

/// BT/BTS/BTR/BTC. Memory forms use byte-granular bit addressing so the
/// register bit offset can index past the operand.
fn bt_common(d: &mut OpDispatcher<'_>, op: &DecodedInst, action: BtAction) {
    let width = op.op_width;
    let dest_op = op.dest.expect("BT destination");
    let src_op = op.src(0).expect("BT bit offset");
    let offset = d.load_source(op, &src_op);

    match dest_op {
        Operand::Gpr { .. } => {
            let mask_c = d.const_(Width::W8, u64::from(width.msb() as u8));
            let bit = d.and(Width::W8, offset, mask_c);
            let dest = d.load_source(op, &dest_op);
            let shifted = d.alu(AluKind::Shr, width, dest, bit);
            let cf = d.bfe(Width::W8, 1, 0, shifted);
            d.clear_flags_memo();
            d.set_flag_value(Flag::Cf, cf);
            if action == BtAction::Test {
                return;
            }
            let one = d.const_(width, 1);
            let mask = d.alu(AluKind::Shl, width, one, bit);
            let res = match action {
                BtAction::Set => d.or(width, dest, mask),
                BtAction::Reset => {
                    let inv = d.unary(UnaryKind::Not, width, mask);
                    d.and(width, dest, inv)
                }
                _ => d.xor(width, dest, mask),
            };
            d.store_result(op, &dest_op, res);
        }
        Operand::Mem(ref mem) => {
            // addr += offset >> 3 (sign-extended); bit = offset & 7.
            let sext = d.unary(UnaryKind::Sext(width), Width::W64, offset);
            let three = d.const_(Width::W8, 3);
            let byte_off = d.alu(AluKind::Sar, Width::W64, sext, three);
            let (base, _stack) = d.mem_address(op, mem, None);
            let addr = d.add(Width::W64, base, byte_off);
            let seven = d.const_(Width::W8, 7);
            let bit = d.and(Width::W8, offset, seven);

            let one = d.const_(Width::W8, 1);
            let mask = d.alu(AluKind::Shl, Width::W8, one, bit);

            let old = match action {
                BtAction::Test => d.append(Instr::LoadMem { addr, tso: false }, Width::W8),
                BtAction::Set => {
                    let v = d.append(
                        Instr::AtomicFetchOp {
                            kind: AluKind::Or,
                            addr,
                            value: mask,
                        },
                        Width::W8,
                    );
                    d.lock_handled = true;
                    v
                }
                BtAction::Reset => {
                    let inv = d.unary(UnaryKind::Not, Width::W8, mask);
                    let v = d.append(
                        Instr::AtomicFetchOp {
                            kind: AluKind::And,
                            addr,
                            value: inv,
                        },
                        Width::W8,
                    );
                    d.lock_handled = true;
                    v
                }
                BtAction::Complement => {
                    let v = d.append(
                        Instr::AtomicFetchOp {
                            kind: AluKind::Xor,
                            addr,
                            value: mask,
                        },
                        Width::W8,
                    );
                    d.lock_handled = true;
                    v
                }
            };
            let shifted = d.alu(AluKind::Shr, Width::W8, old, bit);
            let cf = d.bfe(Width::W8, 1, 0, shifted);
            d.clear_flags_memo();
            d.set_flag_value(Flag::Cf, cf);
        }
        _ => unimplemented_op(d, op),
    }
}

// -- bit scans, byte swaps, population count ----------------------------

/// BSF/BSR, plus the F3-prefixed TZCNT/LZCNT forms.
pub(crate) fn bit_scan(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let forward = op.opcode == 0xbc;
    let count_form = op.prefixes.rep; // TZCNT/LZCNT
    let dest_op = op.dest.expect("bit scan destination");
    let src_op = op.src(0).expect("bit scan source");
    let src = d.load_source(op, &src_op);

    let zero = d.const_(width, 0);
    let one = d.const_(Width::W64, 1);
    let zero64 = d.const_(Width::W64, 0);

    let found = if forward {
        d.unary(UnaryKind::FindLsb, width, src)
    } else {
        d.unary(UnaryKind::FindMsb, width, src)
    };

    d.clear_flags_memo();
    if count_form {
        let count = if forward {
            found
        } else {
            // LZCNT counts from the top.
            let msb = d.const_(width, u64::from(width.msb()));
            d.sub(width, msb, found)
        };
        let all = d.const_(width, u64::from(width.bits()));
        let res = d.select(Cond::Eq, width, src, zero, all, count);

        let cf = d.select(Cond::Eq, width, src, zero, one, zero64);
        d.set_flag_value(Flag::Cf, cf);
        let res_zero = d.const_(width, 0);
        let zf = d.select(Cond::Eq, width, res, res_zero, one, zero64);
        d.set_flag_value(Flag::Zf, zf);
        d.store_result(op, &dest_op, res);
    } else {
        // BSF/BSR: ZF set and destination preserved when the source is 0.
        let zf = d.select(Cond::Eq, width, src, zero, one, zero64);
        d.set_flag_value(Flag::Zf, zf);
        let dest = d.load_source(op, &dest_op);
        let res = d.select(Cond::Eq, width, src, zero, dest, found);
        d.store_result(op, &dest_op, res);
    }
}

pub(crate) fn popcnt(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let dest_op = op.dest.expect("POPCNT destination");
    let src_op = op.src(0).expect("POPCNT source");
    let src = d.load_source(op, &src_op);
    let res = d.unary(UnaryKind::Popcount, width, src);

    d.clear_flags_memo();
    d.set_flag_const(Flag::Cf, false);
    d.set_flag_const(Flag::Of, false);
    d.set_flag_const(Flag::Sf, false);
    d.set_flag_const(Flag::Af, false);
    d.set_flag_const(Flag::Pf, false);
    let zero = d.const_(width, 0);
    let one = d.const_(Width::W64, 1);
    let zero64 = d.const_(Width::W64, 0);
    let zf = d.select(Cond::Eq, width, src, zero, one, zero64);
    d.set_flag_value(Flag::Zf, zf);

    d.store_result(op, &dest_op, res);
}

/// BSWAP. The 16-bit form is undefined architecturally; the config knob
/// selects between zeroing the destination (matching the validated
/// micro-architecture) and storing the swapped halfword.
pub(crate) fn bswap(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = op.op_width;
    let dest_op = op.dest.expect("BSWAP destination");

    if width == Width::W16 {
        let value = if d.config.bswap16_zeroes_destination {
            d.const_(Width::W16, 0)
        } else {
            let dest = d.load_source(op, &dest_op);
            d.unary(UnaryKind::Bswap, Width::W16, dest)
        };
        d.store_result_with_opsize(op, &dest_op, value, Width::W16);
        return;
    }

    let dest = d.load_source(op, &dest_op);
    let res = d.unary(UnaryKind::Bswap, width, dest);
    d.store_result(op, &dest_op, res);
}
