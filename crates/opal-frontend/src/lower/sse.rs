//! SSE/SSE2 subset and the MMX logical/compare ops.
//!
//! Packed operations lower to width-parameterized vector ops over the
//! context vector file; scalar operations flow lane values through SSA.
//! Vector state never crosses blocks in SSA form.

use opal_decoder::{DecodedInst, Operand};
use opal_types::{Flag, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{
    Cond, FcmpCond, FpConvertKind, FpKind, Instr, VecOpKind, VecReg, VecSrc, ValueId,
};
use crate::lower::unimplemented_op;

/// Which SSE form the legacy prefixes select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SseForm {
    /// No prefix: packed single.
    PackedSingle,
    /// 66: packed double.
    PackedDouble,
    /// F3: scalar single.
    ScalarSingle,
    /// F2: scalar double.
    ScalarDouble,
}

fn form(op: &DecodedInst) -> SseForm {
    if op.prefixes.rep {
        SseForm::ScalarSingle
    } else if op.prefixes.repne {
        SseForm::ScalarDouble
    } else if op.prefixes.operand_size_override {
        SseForm::PackedDouble
    } else {
        SseForm::PackedSingle
    }
}

fn vec_reg(operand: &Operand) -> Option<VecReg> {
    match *operand {
        Operand::Xmm { reg } => Some(VecReg::Xmm(reg)),
        Operand::Mmx { reg } => Some(VecReg::Mmx(reg)),
        _ => None,
    }
}

/// Resolve an operand to a vector source (register or address value).
fn vec_src(d: &mut OpDispatcher<'_>, op: &DecodedInst, operand: &Operand) -> Option<VecSrc> {
    match *operand {
        Operand::Xmm { reg } => Some(VecSrc::Reg(VecReg::Xmm(reg))),
        Operand::Mmx { reg } => Some(VecSrc::Reg(VecReg::Mmx(reg))),
        Operand::Mem(ref mem) => {
            let (addr, _stack) = d.mem_address(op, mem, None);
            Some(VecSrc::Mem(addr))
        }
        _ => None,
    }
}

/// Load one scalar lane (lane 0) of an operand as an SSA value.
fn scalar_lane(
    d: &mut OpDispatcher<'_>,
    op: &DecodedInst,
    operand: &Operand,
    width: Width,
) -> Option<ValueId> {
    match *operand {
        Operand::Xmm { reg } => Some(d.append(
            Instr::VecExtractLane {
                src: VecReg::Xmm(reg),
                lane: 0,
            },
            width,
        )),
        Operand::Mem(ref mem) => {
            let (addr, _stack) = d.mem_address(op, mem, None);
            Some(d.append(Instr::LoadMem { addr, tso: false }, width))
        }
        _ => None,
    }
}

/// MOVUPS/MOVAPS/MOVDQA/MOVDQU and the scalar MOVSS/MOVSD forms
/// (0F 10/11/28/29/6F/7F).
pub(crate) fn mov_vec(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("vector move destination");
    let src = op.src(0).expect("vector move source");

    let scalar = match (op.opcode, form(op)) {
        (0x10 | 0x11, SseForm::ScalarSingle) => Some(Width::W32),
        (0x10 | 0x11, SseForm::ScalarDouble) => Some(Width::W64),
        _ => None,
    };

    if let Some(width) = scalar {
        // MOVSS/MOVSD: register targets merge the low lane, memory loads
        // zero the rest, memory stores write only the lane.
        match (vec_reg(&dest), &src) {
            (Some(reg), Operand::Mem(ref mem)) => {
                let (addr, _stack) = d.mem_address(op, mem, None);
                let value = d.append(Instr::LoadMem { addr, tso: false }, width);
                d.append(Instr::VecZero { dst: reg }, Width::W64);
                d.append(
                    Instr::VecInsertLane {
                        dst: reg,
                        lane: 0,
                        value,
                    },
                    width,
                );
            }
            (Some(reg), src_op) => {
                let value = scalar_lane(d, op, src_op, width).expect("scalar source");
                d.append(
                    Instr::VecInsertLane {
                        dst: reg,
                        lane: 0,
                        value,
                    },
                    width,
                );
            }
            (None, _) => {
                // Store to memory.
                let Operand::Mem(ref mem) = dest else {
                    unimplemented_op(d, op);
                    return;
                };
                let value = scalar_lane(d, op, &src, width).expect("scalar source");
                let (addr, _stack) = d.mem_address(op, mem, None);
                d.append(
                    Instr::StoreMem {
                        addr,
                        value,
                        tso: false,
                    },
                    width,
                );
            }
        }
        return;
    }

    // Full 128-bit moves.
    match (vec_reg(&dest), &src) {
        (Some(reg), src_op) => {
            let Some(a) = vec_src(d, op, src_op) else {
                unimplemented_op(d, op);
                return;
            };
            d.append(
                Instr::VecOp {
                    kind: VecOpKind::Mov,
                    elem: Width::W64,
                    dst: reg,
                    a,
                    b: None,
                },
                Width::W64,
            );
        }
        (None, src_op) => {
            let Operand::Mem(ref mem) = dest else {
                unimplemented_op(d, op);
                return;
            };
            let Some(src_reg) = vec_reg(src_op) else {
                unimplemented_op(d, op);
                return;
            };
            let (addr, _stack) = d.mem_address(op, mem, None);
            d.append(Instr::VecStore { src: src_reg, addr }, Width::W64);
        }
    }
}

/// Packed/scalar arithmetic: 0F 51, 0F 58..0F 5F.
pub(crate) fn fp_arith(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("SSE arith destination");
    let src = op.src(0).expect("SSE arith source");

    let (vec_kind, fp_kind) = match op.opcode {
        0x51 => (VecOpKind::VFSqrt, FpKind::Sqrt),
        0x58 => (VecOpKind::VFAdd, FpKind::Add),
        0x59 => (VecOpKind::VFMul, FpKind::Mul),
        0x5c => (VecOpKind::VFSub, FpKind::Sub),
        0x5d => (VecOpKind::VFMin, FpKind::Min),
        0x5e => (VecOpKind::VFDiv, FpKind::Div),
        0x5f => (VecOpKind::VFMax, FpKind::Max),
        _ => {
            unimplemented_op(d, op);
            return;
        }
    };

    match form(op) {
        SseForm::PackedSingle | SseForm::PackedDouble => {
            let elem = if form(op) == SseForm::PackedSingle {
                Width::W32
            } else {
                Width::W64
            };
            let Some(dst) = vec_reg(&dest) else {
                unimplemented_op(d, op);
                return;
            };
            let Some(b) = vec_src(d, op, &src) else {
                unimplemented_op(d, op);
                return;
            };
            d.append(
                Instr::VecOp {
                    kind: vec_kind,
                    elem,
                    dst,
                    a: VecSrc::Reg(dst),
                    b: Some(b),
                },
                Width::W64,
            );
        }
        SseForm::ScalarSingle | SseForm::ScalarDouble => {
            let width = if form(op) == SseForm::ScalarSingle {
                Width::W32
            } else {
                Width::W64
            };
            let Some(dst) = vec_reg(&dest) else {
                unimplemented_op(d, op);
                return;
            };
            let a = d.append(Instr::VecExtractLane { src: dst, lane: 0 }, width);
            let Some(b) = scalar_lane(d, op, &src, width) else {
                unimplemented_op(d, op);
                return;
            };
            let res = d.append(Instr::Fp {
                kind: fp_kind,
                a,
                b,
            }, width);
            d.append(
                Instr::VecInsertLane {
                    dst,
                    lane: 0,
                    value: res,
                },
                width,
            );
        }
    }
}

/// ANDPS/ANDNPS/ORPS/XORPS (0F 54..0F 57), any prefix form.
pub(crate) fn fp_logical(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("SSE logical destination");
    let src = op.src(0).expect("SSE logical source");
    let kind = match op.opcode {
        0x54 => VecOpKind::VAnd,
        0x55 => VecOpKind::VAndNot,
        0x56 => VecOpKind::VOr,
        _ => VecOpKind::VXor,
    };
    let Some(dst) = vec_reg(&dest) else {
        unimplemented_op(d, op);
        return;
    };
    let Some(b) = vec_src(d, op, &src) else {
        unimplemented_op(d, op);
        return;
    };
    d.append(
        Instr::VecOp {
            kind,
            elem: Width::W64,
            dst,
            a: VecSrc::Reg(dst),
            b: Some(b),
        },
        Width::W64,
    );
}

/// PCMPEQB/D (0F 74/76), MMX or XMM.
pub(crate) fn pcmpeq(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let elem = if op.opcode == 0x74 { Width::W8 } else { Width::W32 };
    vec_binary(d, op, VecOpKind::VCmpEq, elem);
}

/// PAND/POR/PXOR (0F DB/EB/EF), MMX or XMM.
pub(crate) fn packed_logical(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let kind = match op.opcode {
        0xdb => VecOpKind::VAnd,
        0xeb => VecOpKind::VOr,
        _ => VecOpKind::VXor,
    };
    vec_binary(d, op, kind, Width::W64);
}

fn vec_binary(d: &mut OpDispatcher<'_>, op: &DecodedInst, kind: VecOpKind, elem: Width) {
    let dest = op.dest.expect("vector destination");
    let src = op.src(0).expect("vector source");
    let Some(dst) = vec_reg(&dest) else {
        unimplemented_op(d, op);
        return;
    };
    let Some(b) = vec_src(d, op, &src) else {
        unimplemented_op(d, op);
        return;
    };
    d.append(
        Instr::VecOp {
            kind,
            elem,
            dst,
            a: VecSrc::Reg(dst),
            b: Some(b),
        },
        Width::W64,
    );
}

/// UCOMISS/UCOMISD/COMISS/COMISD: scalar compare straight into the flag
/// slots, feeding the float flag-elision record.
pub(crate) fn ucomis(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = if op.prefixes.operand_size_override {
        Width::W64
    } else {
        Width::W32
    };
    let dest = op.dest.expect("UCOMIS destination");
    let src = op.src(0).expect("UCOMIS source");
    let Some(a) = scalar_lane(d, op, &dest, width) else {
        unimplemented_op(d, op);
        return;
    };
    let Some(b) = scalar_lane(d, op, &src, width) else {
        unimplemented_op(d, op);
        return;
    };

    let eq = d.append(Instr::FcmpFlag { cond: FcmpCond::Eq, a, b }, width);
    let lt = d.append(Instr::FcmpFlag { cond: FcmpCond::Lt, a, b }, width);
    let uo = d.append(
        Instr::FcmpFlag {
            cond: FcmpCond::Unordered,
            a,
            b,
        },
        width,
    );

    d.clear_flags_memo();
    // ZF = eq | unordered, CF = lt | unordered, PF = unordered.
    let zf = d.or(Width::W8, eq, uo);
    d.set_flag_value(Flag::Zf, zf);
    let cf = d.or(Width::W8, lt, uo);
    d.set_flag_value(Flag::Cf, cf);
    d.set_flag_value(Flag::Pf, uo);
    d.set_flag_const(Flag::Of, false);
    d.set_flag_const(Flag::Sf, false);
    d.set_flag_const(Flag::Af, false);
    d.memo_fcmp(width, a, b);
}

/// CVTSI2SS/CVTSI2SD (0F 2A with F3/F2).
pub(crate) fn cvt_int_to_fp(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("CVTSI2Sx destination");
    let src = op.src(0).expect("CVTSI2Sx source");
    let (kind, lane_width) = match form(op) {
        SseForm::ScalarSingle => (FpConvertKind::IntToF32, Width::W32),
        SseForm::ScalarDouble => (FpConvertKind::IntToF64, Width::W64),
        _ => {
            unimplemented_op(d, op);
            return;
        }
    };
    let Some(dst) = vec_reg(&dest) else {
        unimplemented_op(d, op);
        return;
    };
    let int_val = d.load_source(op, &src);
    let int_sx = if op.op_width < Width::W64 {
        d.unary(crate::ir::UnaryKind::Sext(op.op_width), Width::W64, int_val)
    } else {
        int_val
    };
    let converted = d.append(Instr::FpConvert { kind, a: int_sx }, lane_width);
    d.append(
        Instr::VecInsertLane {
            dst,
            lane: 0,
            value: converted,
        },
        lane_width,
    );
}

/// CVTTSx2SI / CVTSx2SI (0F 2C/2D with F3/F2).
pub(crate) fn cvt_fp_to_int(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("CVTSx2SI destination");
    let src = op.src(0).expect("CVTSx2SI source");
    let (lane_width, kind) = match form(op) {
        SseForm::ScalarSingle => (Width::W32, FpConvertKind::F32ToIntTrunc),
        SseForm::ScalarDouble => (Width::W64, FpConvertKind::F64ToIntTrunc),
        _ => {
            unimplemented_op(d, op);
            return;
        }
    };
    let Some(a) = scalar_lane(d, op, &src, lane_width) else {
        unimplemented_op(d, op);
        return;
    };
    let converted = d.append(Instr::FpConvert { kind, a }, op.op_width);
    d.store_result(op, &dest, converted);
}

/// MOVD/MOVQ xmm <- r/m (0F 6E with 66).
pub(crate) fn movd_load(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let dest = op.dest.expect("MOVD destination");
    let src = op.src(0).expect("MOVD source");
    let width = if op.op_width == Width::W64 {
        Width::W64
    } else {
        Width::W32
    };
    let Some(dst) = vec_reg(&dest) else {
        unimplemented_op(d, op);
        return;
    };
    let value = d.load_source_with_opsize(op, &src, width);
    d.append(Instr::VecZero { dst }, Width::W64);
    d.append(
        Instr::VecInsertLane {
            dst,
            lane: 0,
            value,
        },
        width,
    );
}

/// MOVD/MOVQ r/m <- xmm (0F 7E), or MOVQ xmm <- xmm/m (F3 0F 7E).
pub(crate) fn movd_store(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if op.prefixes.rep {
        // MOVQ load form: low quadword, upper zeroed.
        let dest = op.dest.expect("MOVQ destination");
        let src = op.src(0).expect("MOVQ source");
        let Some(dst) = vec_reg(&dest) else {
            unimplemented_op(d, op);
            return;
        };
        let Some(value) = scalar_lane(d, op, &src, Width::W64) else {
            unimplemented_op(d, op);
            return;
        };
        d.append(Instr::VecZero { dst }, Width::W64);
        d.append(
            Instr::VecInsertLane {
                dst,
                lane: 0,
                value,
            },
            Width::W64,
        );
        return;
    }

    let dest = op.dest.expect("MOVD destination");
    let src = op.src(0).expect("MOVD source");
    let width = if op.op_width == Width::W64 {
        Width::W64
    } else {
        Width::W32
    };
    let Some(value) = scalar_lane(d, op, &src, width) else {
        unimplemented_op(d, op);
        return;
    };
    d.store_result_with_opsize(op, &dest, value, width);
}

/// PSHUFD xmm, xmm/m128, imm8 (66 prefix form only).
pub(crate) fn pshufd(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    if form(op) != SseForm::PackedDouble {
        unimplemented_op(d, op);
        return;
    }
    let dest = op.dest.expect("PSHUFD destination");
    let src = op.src(0).expect("PSHUFD source");
    let order = op.src(1).and_then(|s| s.imm_value()).unwrap_or(0) as u8;
    let Some(dst) = vec_reg(&dest) else {
        unimplemented_op(d, op);
        return;
    };

    // Extract the four selected source lanes first so a self-shuffle reads
    // the pre-write values.
    let src_reg = match vec_src(d, op, &src) {
        Some(VecSrc::Reg(reg)) => Some(reg),
        Some(VecSrc::Mem(addr)) => {
            // Pull memory through a scratch read of each lane.
            let mut lanes = [ValueId(0); 4];
            for (i, lane) in lanes.iter_mut().enumerate() {
                let sel = u64::from((order >> (i * 2)) & 0b11);
                let off = d.const_(Width::W64, sel * 4);
                let lane_addr = d.add(Width::W64, addr, off);
                *lane = d.append(
                    Instr::LoadMem {
                        addr: lane_addr,
                        tso: false,
                    },
                    Width::W32,
                );
            }
            for (i, lane) in lanes.into_iter().enumerate() {
                d.append(
                    Instr::VecInsertLane {
                        dst,
                        lane: i as u8,
                        value: lane,
                    },
                    Width::W32,
                );
            }
            return;
        }
        None => None,
    };
    let Some(src_reg) = src_reg else {
        unimplemented_op(d, op);
        return;
    };

    let mut lanes = [ValueId(0); 4];
    for (i, lane) in lanes.iter_mut().enumerate() {
        let sel = (order >> (i * 2)) & 0b11;
        *lane = d.append(
            Instr::VecExtractLane {
                src: src_reg,
                lane: sel,
            },
            Width::W32,
        );
    }
    for (i, lane) in lanes.into_iter().enumerate() {
        d.append(
            Instr::VecInsertLane {
                dst,
                lane: i as u8,
                value: lane,
            },
            Width::W32,
        );
    }
}

/// CMPSS/CMPSD (scalar forms of 0F C2). Packed forms are untranslated.
pub(crate) fn cmp_scalar(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let width = match form(op) {
        SseForm::ScalarSingle => Width::W32,
        SseForm::ScalarDouble => Width::W64,
        _ => {
            unimplemented_op(d, op);
            return;
        }
    };
    let dest = op.dest.expect("CMPSx destination");
    let src = op.src(0).expect("CMPSx source");
    let predicate = op.src(1).and_then(|s| s.imm_value()).unwrap_or(0) & 0b111;

    let Some(dst) = vec_reg(&dest) else {
        unimplemented_op(d, op);
        return;
    };
    let a = d.append(Instr::VecExtractLane { src: dst, lane: 0 }, width);
    let Some(b) = scalar_lane(d, op, &src, width) else {
        unimplemented_op(d, op);
        return;
    };

    let probe = |d: &mut OpDispatcher<'_>, cond| {
        d.append(Instr::FcmpFlag { cond, a, b }, width)
    };
    let one8 = d.const_(Width::W8, 1);
    let truth = match predicate {
        0 => probe(d, FcmpCond::Eq),
        1 => probe(d, FcmpCond::Lt),
        2 => probe(d, FcmpCond::Le),
        3 => probe(d, FcmpCond::Unordered),
        4 => {
            let eq = probe(d, FcmpCond::Eq);
            d.xor(Width::W8, eq, one8)
        }
        5 => {
            // NLT == GE or unordered.
            let lt = probe(d, FcmpCond::Lt);
            d.xor(Width::W8, lt, one8)
        }
        6 => {
            let le = probe(d, FcmpCond::Le);
            d.xor(Width::W8, le, one8)
        }
        _ => {
            let uo = probe(d, FcmpCond::Unordered);
            d.xor(Width::W8, uo, one8)
        }
    };

    // All-ones or all-zero lane.
    let zero = d.const_(width, 0);
    let ones = d.const_(width, width.mask());
    let zero8 = d.const_(Width::W8, 0);
    let lane = d.select(Cond::Neq, Width::W8, truth, zero8, ones, zero);
    d.append(
        Instr::VecInsertLane {
            dst,
            lane: 0,
            value: lane,
        },
        width,
    );
}
