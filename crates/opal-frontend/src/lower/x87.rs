//! x87 escape lowering.
//!
//! Stack slots are deep fixed pseudo-registers in the context; rotation is
//! an increment/decrement of the in-context TOP pointer. Values compute at
//! double precision (the reduced-precision mode of the original), stored as
//! f64 bit patterns in the low quadword of each 16-byte slot.

use opal_cpu_core::state;
use opal_decoder::{DecodedInst, Operand};
use opal_types::{Flag, Gpr, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{
    AluKind, FcmpCond, FpConvertKind, FpKind, Instr, UnaryKind, ValueId,
};
use crate::lower::unimplemented_op;

/// Current TOP as a value.
fn load_top(d: &mut OpDispatcher<'_>) -> ValueId {
    d.load_ctx(Width::W8, state::OFFSET_X87_TOP)
}

/// Slot index of st(i): `(top + i) & 7`.
fn st_index(d: &mut OpDispatcher<'_>, i: u8) -> ValueId {
    let top = load_top(d);
    if i == 0 {
        return top;
    }
    let offset = d.const_(Width::W8, u64::from(i));
    let sum = d.add(Width::W8, top, offset);
    let seven = d.const_(Width::W8, 7);
    d.and(Width::W8, sum, seven)
}

fn read_st(d: &mut OpDispatcher<'_>, i: u8) -> ValueId {
    let index = st_index(d, i);
    d.append(
        Instr::LoadContextIndexed {
            base_offset: state::OFFSET_MM,
            stride: 16,
            index,
        },
        Width::W64,
    )
}

fn write_st(d: &mut OpDispatcher<'_>, i: u8, value: ValueId) {
    let index = st_index(d, i);
    d.append(
        Instr::StoreContextIndexed {
            base_offset: state::OFFSET_MM,
            stride: 16,
            index,
            value,
        },
        Width::W64,
    );
}

/// Push a value: TOP decrements (mod 8), the new st(0) receives it.
fn fpush(d: &mut OpDispatcher<'_>, value: ValueId) {
    let top = load_top(d);
    let seven = d.const_(Width::W8, 7);
    let dec = d.add(Width::W8, top, seven);
    let new_top = d.and(Width::W8, dec, seven);
    d.store_ctx(Width::W8, state::OFFSET_X87_TOP, new_top);
    write_st(d, 0, value);
}

/// Pop: TOP increments.
fn fpop(d: &mut OpDispatcher<'_>) {
    let top = load_top(d);
    let one = d.const_(Width::W8, 1);
    let inc = d.add(Width::W8, top, one);
    let seven = d.const_(Width::W8, 7);
    let new_top = d.and(Width::W8, inc, seven);
    d.store_ctx(Width::W8, state::OFFSET_X87_TOP, new_top);
}

/// Load a float memory operand as an f64 bit pattern.
fn load_f64_mem(
    d: &mut OpDispatcher<'_>,
    op: &DecodedInst,
    mem_width: Width,
) -> Option<ValueId> {
    let Some(Operand::Mem(ref mem)) = op.src(0) else {
        return None;
    };
    let (addr, _stack) = d.mem_address(op, mem, None);
    let raw = d.append(Instr::LoadMem { addr, tso: false }, mem_width);
    Some(match mem_width {
        Width::W32 => d.append(
            Instr::FpConvert {
                kind: FpConvertKind::F32ToF64,
                a: raw,
            },
            Width::W64,
        ),
        _ => raw,
    })
}

fn store_f64_mem(d: &mut OpDispatcher<'_>, op: &DecodedInst, mem_width: Width, value: ValueId) {
    let Some(Operand::Mem(ref mem)) = op.src(0) else {
        return;
    };
    let narrowed = match mem_width {
        Width::W32 => d.append(
            Instr::FpConvert {
                kind: FpConvertKind::F64ToF32,
                a: value,
            },
            Width::W32,
        ),
        _ => value,
    };
    let (addr, _stack) = d.mem_address(op, mem, None);
    d.append(
        Instr::StoreMem {
            addr,
            value: narrowed,
            tso: false,
        },
        mem_width,
    );
}

fn fp_binop(d: &mut OpDispatcher<'_>, kind: FpKind, a: ValueId, b: ValueId) -> ValueId {
    d.append(Instr::Fp { kind, a, b }, Width::W64)
}

fn arith_kind(reg: u8, reversed_pair: bool) -> Option<(FpKind, bool)> {
    // reg field: 0 add, 1 mul, 4 sub, 5 subr, 6 div, 7 divr.
    // `reversed_pair` swaps the r-variants (DC/DE encode them mirrored).
    let (kind, rev) = match reg {
        0 => (FpKind::Add, false),
        1 => (FpKind::Mul, false),
        4 => (FpKind::Sub, false),
        5 => (FpKind::Sub, true),
        6 => (FpKind::Div, false),
        7 => (FpKind::Div, true),
        _ => return None,
    };
    Some((kind, rev ^ reversed_pair))
}

/// Write the FCOMI-style flag triple from st(0) vs `b`.
fn fcom_flags(d: &mut OpDispatcher<'_>, a: ValueId, b: ValueId) {
    let eq = d.append(Instr::FcmpFlag { cond: FcmpCond::Eq, a, b }, Width::W64);
    let lt = d.append(Instr::FcmpFlag { cond: FcmpCond::Lt, a, b }, Width::W64);
    let uo = d.append(
        Instr::FcmpFlag {
            cond: FcmpCond::Unordered,
            a,
            b,
        },
        Width::W64,
    );
    d.clear_flags_memo();
    let zf = d.or(Width::W8, eq, uo);
    d.set_flag_value(Flag::Zf, zf);
    let cf = d.or(Width::W8, lt, uo);
    d.set_flag_value(Flag::Cf, cf);
    d.set_flag_value(Flag::Pf, uo);
    d.set_flag_const(Flag::Of, false);
    d.set_flag_const(Flag::Sf, false);
    d.set_flag_const(Flag::Af, false);
    d.memo_fcmp(Width::W64, a, b);
}

pub(crate) fn lower_x87(d: &mut OpDispatcher<'_>, op: &DecodedInst, esc: u8) {
    let modrm = op.opcode;
    let reg = op.group_reg.unwrap_or(0);
    let is_mem = op.src(0).is_some();

    if is_mem {
        lower_x87_mem(d, op, esc, reg);
    } else {
        lower_x87_reg(d, op, esc, modrm);
    }
}

fn lower_x87_mem(d: &mut OpDispatcher<'_>, op: &DecodedInst, esc: u8, reg: u8) {
    match (esc, reg) {
        // Arithmetic on a memory operand: D8 (m32), DC (m64).
        (0xd8 | 0xdc, _) if arith_kind(reg, false).is_some() => {
            let mem_width = if esc == 0xd8 { Width::W32 } else { Width::W64 };
            let Some(operand) = load_f64_mem(d, op, mem_width) else {
                unimplemented_op(d, op);
                return;
            };
            let st0 = read_st(d, 0);
            let (kind, rev) = arith_kind(reg, false).expect("checked");
            let (a, b) = if rev { (operand, st0) } else { (st0, operand) };
            let res = fp_binop(d, kind, a, b);
            write_st(d, 0, res);
        }
        // FCOM/FCOMP m32/m64.
        (0xd8 | 0xdc, 2 | 3) => {
            let mem_width = if esc == 0xd8 { Width::W32 } else { Width::W64 };
            let Some(operand) = load_f64_mem(d, op, mem_width) else {
                unimplemented_op(d, op);
                return;
            };
            let st0 = read_st(d, 0);
            fcom_flags(d, st0, operand);
            if reg == 3 {
                fpop(d);
            }
        }
        // FLD m32 / m64.
        (0xd9, 0) | (0xdd, 0) => {
            let mem_width = if esc == 0xd9 { Width::W32 } else { Width::W64 };
            let Some(value) = load_f64_mem(d, op, mem_width) else {
                unimplemented_op(d, op);
                return;
            };
            fpush(d, value);
        }
        // FST/FSTP m32 / m64.
        (0xd9, 2 | 3) | (0xdd, 2 | 3) => {
            let mem_width = if esc == 0xd9 { Width::W32 } else { Width::W64 };
            let st0 = read_st(d, 0);
            store_f64_mem(d, op, mem_width, st0);
            if reg == 3 {
                fpop(d);
            }
        }
        // FLDCW / FNSTCW m16.
        (0xd9, 5) => {
            let Some(Operand::Mem(ref mem)) = op.src(0) else {
                unimplemented_op(d, op);
                return;
            };
            let (addr, _stack) = d.mem_address(op, mem, None);
            let value = d.append(Instr::LoadMem { addr, tso: false }, Width::W16);
            d.store_ctx(Width::W16, state::OFFSET_FCW, value);
        }
        (0xd9, 7) => {
            let Some(Operand::Mem(ref mem)) = op.src(0) else {
                unimplemented_op(d, op);
                return;
            };
            let value = d.load_ctx(Width::W16, state::OFFSET_FCW);
            let (addr, _stack) = d.mem_address(op, mem, None);
            d.append(
                Instr::StoreMem {
                    addr,
                    value,
                    tso: false,
                },
                Width::W16,
            );
        }
        // FILD m32 (DB /0), m64 (DF /5), m16 (DF /0).
        (0xdb, 0) | (0xdf, 0 | 5) => {
            let int_width = match (esc, reg) {
                (0xdb, 0) => Width::W32,
                (0xdf, 0) => Width::W16,
                _ => Width::W64,
            };
            let Some(Operand::Mem(ref mem)) = op.src(0) else {
                unimplemented_op(d, op);
                return;
            };
            let (addr, _stack) = d.mem_address(op, mem, None);
            let raw = d.append(Instr::LoadMem { addr, tso: false }, int_width);
            let extended = if int_width < Width::W64 {
                d.unary(UnaryKind::Sext(int_width), Width::W64, raw)
            } else {
                raw
            };
            let value = d.append(
                Instr::FpConvert {
                    kind: FpConvertKind::IntToF64,
                    a: extended,
                },
                Width::W64,
            );
            fpush(d, value);
        }
        // FIST/FISTP m32 (DB /2, /3), FISTP m64 (DF /7).
        (0xdb, 2 | 3) | (0xdf, 7) => {
            let int_width = if esc == 0xdb { Width::W32 } else { Width::W64 };
            let st0 = read_st(d, 0);
            let value = d.append(
                Instr::FpConvert {
                    kind: FpConvertKind::F64ToIntNearest,
                    a: st0,
                },
                int_width,
            );
            let Some(Operand::Mem(ref mem)) = op.src(0) else {
                unimplemented_op(d, op);
                return;
            };
            let (addr, _stack) = d.mem_address(op, mem, None);
            d.append(
                Instr::StoreMem {
                    addr,
                    value,
                    tso: false,
                },
                int_width,
            );
            if reg == 3 || (esc, reg) == (0xdf, 7) {
                fpop(d);
            }
        }
        _ => unimplemented_op(d, op),
    }
}

fn lower_x87_reg(d: &mut OpDispatcher<'_>, op: &DecodedInst, esc: u8, modrm: u8) {
    let i = modrm & 0b111;
    match (esc, modrm & 0xf8) {
        // FLD st(i).
        (0xd9, 0xc0) => {
            let value = read_st(d, i);
            fpush(d, value);
        }
        // FXCH st(i).
        (0xd9, 0xc8) => {
            let a = read_st(d, 0);
            let b = read_st(d, i);
            write_st(d, 0, b);
            write_st(d, i, a);
        }
        // D8: st(0) = st(0) op st(i).
        (0xd8, 0xc0) | (0xd8, 0xc8) | (0xd8, 0xe0) | (0xd8, 0xe8) | (0xd8, 0xf0)
        | (0xd8, 0xf8) => {
            let (kind, rev) = match modrm & 0xf8 {
                0xc0 => (FpKind::Add, false),
                0xc8 => (FpKind::Mul, false),
                0xe0 => (FpKind::Sub, false),
                0xe8 => (FpKind::Sub, true),
                0xf0 => (FpKind::Div, false),
                _ => (FpKind::Div, true),
            };
            let st0 = read_st(d, 0);
            let sti = read_st(d, i);
            let (a, b) = if rev { (sti, st0) } else { (st0, sti) };
            let res = fp_binop(d, kind, a, b);
            write_st(d, 0, res);
        }
        // FCOM/FCOMP st(i).
        (0xd8, 0xd0) | (0xd8, 0xd8) => {
            let st0 = read_st(d, 0);
            let sti = read_st(d, i);
            fcom_flags(d, st0, sti);
            if modrm & 0xf8 == 0xd8 {
                fpop(d);
            }
        }
        // DC: st(i) = st(i) op st(0), r-variants mirrored.
        (0xdc, 0xc0) | (0xdc, 0xc8) | (0xdc, 0xe0) | (0xdc, 0xe8) | (0xdc, 0xf0)
        | (0xdc, 0xf8) => {
            let (kind, rev) = match modrm & 0xf8 {
                0xc0 => (FpKind::Add, false),
                0xc8 => (FpKind::Mul, false),
                0xe0 => (FpKind::Sub, true),
                0xe8 => (FpKind::Sub, false),
                0xf0 => (FpKind::Div, true),
                _ => (FpKind::Div, false),
            };
            let st0 = read_st(d, 0);
            let sti = read_st(d, i);
            let (a, b) = if rev { (st0, sti) } else { (sti, st0) };
            let res = fp_binop(d, kind, a, b);
            write_st(d, i, res);
        }
        // DE: like DC but popping (FADDP etc.).
        (0xde, 0xc0) | (0xde, 0xc8) | (0xde, 0xe0) | (0xde, 0xe8) | (0xde, 0xf0)
        | (0xde, 0xf8) => {
            let (kind, rev) = match modrm & 0xf8 {
                0xc0 => (FpKind::Add, false),
                0xc8 => (FpKind::Mul, false),
                0xe0 => (FpKind::Sub, true),
                0xe8 => (FpKind::Sub, false),
                0xf0 => (FpKind::Div, true),
                _ => (FpKind::Div, false),
            };
            let st0 = read_st(d, 0);
            let sti = read_st(d, i);
            let (a, b) = if rev { (st0, sti) } else { (sti, st0) };
            let res = fp_binop(d, kind, a, b);
            write_st(d, i, res);
            fpop(d);
        }
        // DD: FST/FSTP st(i).
        (0xdd, 0xd0) | (0xdd, 0xd8) => {
            let st0 = read_st(d, 0);
            write_st(d, i, st0);
            if modrm & 0xf8 == 0xd8 {
                fpop(d);
            }
        }
        // DB/DF: FUCOMI/FCOMI (and popping DF forms).
        (0xdb, 0xe8) | (0xdb, 0xf0) | (0xdf, 0xe8) | (0xdf, 0xf0) => {
            let st0 = read_st(d, 0);
            let sti = read_st(d, i);
            fcom_flags(d, st0, sti);
            if esc == 0xdf {
                fpop(d);
            }
        }
        (0xd9, 0xe0..=0xef) => lower_d9_unary(d, op, modrm),
        // DF E0: FNSTSW AX.
        (0xdf, 0xe0) if modrm == 0xe0 => {
            let fsw = d.load_ctx(Width::W16, state::OFFSET_FSW);
            let top = load_top(d);
            let eleven = d.const_(Width::W8, 11);
            let top_shifted = d.alu(AluKind::Shl, Width::W16, top, eleven);
            let packed = d.or(Width::W16, fsw, top_shifted);
            d.store_ctx(Width::W16, opal_cpu_core::state::CpuState::gpr_offset(Gpr::Rax), packed);
        }
        _ => unimplemented_op(d, op),
    }
}

/// D9 E0..EF: sign/abs/constant loads.
fn lower_d9_unary(d: &mut OpDispatcher<'_>, op: &DecodedInst, modrm: u8) {
    match modrm {
        // FCHS.
        0xe0 => {
            let st0 = read_st(d, 0);
            let res = d.append(
                Instr::Fp {
                    kind: FpKind::Neg,
                    a: st0,
                    b: st0,
                },
                Width::W64,
            );
            write_st(d, 0, res);
        }
        // FABS.
        0xe1 => {
            let st0 = read_st(d, 0);
            let res = d.append(
                Instr::Fp {
                    kind: FpKind::Abs,
                    a: st0,
                    b: st0,
                },
                Width::W64,
            );
            write_st(d, 0, res);
        }
        // FLD1.
        0xe8 => {
            let one = d.const_(Width::W64, 1.0f64.to_bits());
            fpush(d, one);
        }
        // FLDZ.
        0xee => {
            let zero = d.const_(Width::W64, 0);
            fpush(d, zero);
        }
        _ => unimplemented_op(d, op),
    }
}
