//! Flag materialization and elision.
//!
//! Flags live in six byte-sized context slots, each 0 or 1. Flag-producing
//! lowerings write only the flags they define. A small per-block memo
//! remembers the last CMP/TEST-class operation so a following conditional
//! can compare the original operands directly instead of re-deriving the
//! flags ("last flag op" elision). The memo never survives a block boundary.

use opal_cpu_core::state;
use opal_types::{CondCode, Flag, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{Cond, FcmpCond, Instr, UnaryKind, ValueId};

/// What kind of flag-producing op the memo describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsOpKind {
    /// CMP / SUB comparison semantics.
    Cmp,
    /// AND / TEST / OR / XOR zero-test semantics.
    And,
    /// Scalar float compare (UCOMISx / FCOMI).
    Fcmp,
}

/// The memoized last flag operation.
#[derive(Debug, Clone, Copy)]
pub struct FlagsMemo {
    pub kind: FlagsOpKind,
    pub width: Width,
    pub dest: ValueId,
    pub src: ValueId,
    /// Sign-extended views for signed compares (same as `dest`/`src` when
    /// the width needs no widening).
    pub dest_sx: ValueId,
    pub src_sx: ValueId,
}

impl<'c> OpDispatcher<'c> {
    pub(crate) fn clear_flags_memo(&mut self) {
        self.flags_memo = None;
    }

    /// Record a CMP-class memo (dest - src just had its flags computed).
    pub(crate) fn memo_cmp(&mut self, width: Width, dest: ValueId, src: ValueId) {
        let (dest_sx, src_sx, memo_width) = if width < Width::W32 {
            let d = self.unary(UnaryKind::Sext(width), Width::W32, dest);
            let s = self.unary(UnaryKind::Sext(width), Width::W32, src);
            (d, s, Width::W32)
        } else {
            (dest, src, width)
        };
        self.flags_memo = Some(FlagsMemo {
            kind: FlagsOpKind::Cmp,
            width: memo_width,
            dest,
            src,
            dest_sx,
            src_sx,
        });
    }

    /// Record an AND-class memo (`result` was just zero-tested).
    pub(crate) fn memo_and(&mut self, width: Width, result: ValueId) {
        self.flags_memo = Some(FlagsMemo {
            kind: FlagsOpKind::And,
            width,
            dest: result,
            src: result,
            dest_sx: result,
            src_sx: result,
        });
    }

    /// Record a float-compare memo over the raw operands.
    pub(crate) fn memo_fcmp(&mut self, width: Width, a: ValueId, b: ValueId) {
        self.flags_memo = Some(FlagsMemo {
            kind: FlagsOpKind::Fcmp,
            width,
            dest: a,
            src: b,
            dest_sx: a,
            src_sx: b,
        });
    }

    // -- flag generation --------------------------------------------------

    /// ZF/SF/PF from a result.
    pub(crate) fn flags_zsp(&mut self, width: Width, res: ValueId) {
        let zero = self.const_(width, 0);
        let one = self.const_(Width::W64, 1);
        let zero64 = self.const_(Width::W64, 0);
        let zf = self.select(Cond::Eq, width, res, zero, one, zero64);
        self.set_flag_value(Flag::Zf, zf);

        let sf = self.bfe(Width::W8, 1, width.msb() as u8, res);
        self.set_flag_value(Flag::Sf, sf);

        let low = self.bfe(Width::W8, 8, 0, res);
        let ones = self.unary(UnaryKind::Popcount, Width::W8, low);
        let bit = self.bfe(Width::W8, 1, 0, ones);
        let one8 = self.const_(Width::W8, 1);
        let pf = self.xor(Width::W8, bit, one8);
        self.set_flag_value(Flag::Pf, pf);
    }

    /// Full flag set for ADD/ADC results. `carry_in` is the 0/1 value added
    /// in (None for plain ADD).
    pub(crate) fn flags_add(
        &mut self,
        width: Width,
        res: ValueId,
        a: ValueId,
        b: ValueId,
        carry_in: Option<ValueId>,
    ) {
        self.clear_flags_memo();
        self.flags_zsp(width, res);

        // CF: res < a, or res == a while a carry came in.
        let one = self.const_(Width::W64, 1);
        let zero = self.const_(Width::W64, 0);
        let cf = self.select(Cond::Ult, width, res, a, one, zero);
        let cf = if let Some(carry_in) = carry_in {
            let eq = self.select(Cond::Eq, width, res, a, one, zero);
            let wrap = self.and(Width::W8, eq, carry_in);
            self.or(Width::W8, cf, wrap)
        } else {
            cf
        };
        self.set_flag_value(Flag::Cf, cf);

        // AF: bit 4 of a^b^res.
        let axb = self.xor(width, a, b);
        let axbr = self.xor(width, axb, res);
        let af = self.bfe(Width::W8, 1, 4, axbr);
        self.set_flag_value(Flag::Af, af);

        // OF: operands agreed in sign and the result disagrees.
        let not_axb = self.unary(UnaryKind::Not, width, axb);
        let axr = self.xor(width, a, res);
        let of_bits = self.and(width, not_axb, axr);
        let of = self.bfe(Width::W8, 1, width.msb() as u8, of_bits);
        self.set_flag_value(Flag::Of, of);
    }

    /// Full flag set for SUB/SBB/CMP/NEG results (`res = a - b - borrow`).
    pub(crate) fn flags_sub(
        &mut self,
        width: Width,
        res: ValueId,
        a: ValueId,
        b: ValueId,
        borrow_in: Option<ValueId>,
    ) {
        self.clear_flags_memo();
        self.flags_zsp(width, res);

        let one = self.const_(Width::W64, 1);
        let zero = self.const_(Width::W64, 0);
        // CF: a < b, or a == b while borrowing.
        let cf = self.select(Cond::Ult, width, a, b, one, zero);
        let cf = if let Some(borrow_in) = borrow_in {
            let eq = self.select(Cond::Eq, width, a, b, one, zero);
            let wrap = self.and(Width::W8, eq, borrow_in);
            self.or(Width::W8, cf, wrap)
        } else {
            cf
        };
        self.set_flag_value(Flag::Cf, cf);

        let axb = self.xor(width, a, b);
        let axbr = self.xor(width, axb, res);
        let af = self.bfe(Width::W8, 1, 4, axbr);
        self.set_flag_value(Flag::Af, af);

        // OF: operands disagreed in sign and the result has b's sign side.
        let axr = self.xor(width, a, res);
        let of_bits = self.and(width, axb, axr);
        let of = self.bfe(Width::W8, 1, width.msb() as u8, of_bits);
        self.set_flag_value(Flag::Of, of);
    }

    /// Flags for the logical group: CF/OF/AF cleared, ZF/SF/PF from result.
    pub(crate) fn flags_logical(&mut self, width: Width, res: ValueId) {
        self.clear_flags_memo();
        self.flags_zsp(width, res);
        self.set_flag_const(Flag::Cf, false);
        self.set_flag_const(Flag::Of, false);
        self.set_flag_const(Flag::Af, false);
    }

    // -- conditionals -----------------------------------------------------

    /// Evaluate condition code `cc` as `true_val`/`false_val`, using the
    /// memoized last flag op when it can express the condition directly.
    pub(crate) fn select_cc(
        &mut self,
        cc: CondCode,
        true_val: ValueId,
        false_val: ValueId,
    ) -> ValueId {
        if let Some(memo) = self.flags_memo {
            if let Some(value) = self.select_cc_memo(memo, cc, true_val, false_val) {
                return value;
            }
        }
        self.select_cc_slots(cc, true_val, false_val)
    }

    fn select_cc_memo(
        &mut self,
        memo: FlagsMemo,
        cc: CondCode,
        t: ValueId,
        f: ValueId,
    ) -> Option<ValueId> {
        match memo.kind {
            FlagsOpKind::Cmp => {
                let unsigned = |cond| Some((cond, memo.dest, memo.src));
                let signed = |cond| Some((cond, memo.dest_sx, memo.src_sx));
                let (cond, a, b) = match cc {
                    CondCode::B => unsigned(Cond::Ult),
                    CondCode::Nb => unsigned(Cond::Uge),
                    CondCode::Z => unsigned(Cond::Eq),
                    CondCode::Nz => unsigned(Cond::Neq),
                    CondCode::Be => unsigned(Cond::Ule),
                    CondCode::Nbe => unsigned(Cond::Ugt),
                    CondCode::L => signed(Cond::Slt),
                    CondCode::Nl => signed(Cond::Sge),
                    CondCode::Le => signed(Cond::Sle),
                    CondCode::Nle => signed(Cond::Sgt),
                    _ => None,
                }?;
                Some(self.select(cond, memo.width, a, b, t, f))
            }
            FlagsOpKind::And => {
                let zero = self.const_(memo.width, 0);
                match cc {
                    CondCode::Z => Some(self.select(Cond::Eq, memo.width, memo.dest, zero, t, f)),
                    CondCode::Nz => Some(self.select(Cond::Neq, memo.width, memo.dest, zero, t, f)),
                    _ => None,
                }
            }
            FlagsOpKind::Fcmp => {
                let probe = |disp: &mut Self, cond| {
                    disp.append(
                        Instr::FcmpFlag {
                            cond,
                            a: memo.dest,
                            b: memo.src,
                        },
                        memo.width,
                    )
                };
                let (value, invert) = match cc {
                    // UCOMIS puts unordered into CF, ZF and PF together.
                    CondCode::B | CondCode::Nb => {
                        let lt = probe(self, FcmpCond::Lt);
                        let uo = probe(self, FcmpCond::Unordered);
                        (self.or(Width::W8, lt, uo), cc == CondCode::Nb)
                    }
                    CondCode::Z | CondCode::Nz => {
                        let eq = probe(self, FcmpCond::Eq);
                        let uo = probe(self, FcmpCond::Unordered);
                        (self.or(Width::W8, eq, uo), cc == CondCode::Nz)
                    }
                    CondCode::Be | CondCode::Nbe => {
                        let le = probe(self, FcmpCond::Le);
                        let uo = probe(self, FcmpCond::Unordered);
                        (self.or(Width::W8, le, uo), cc == CondCode::Nbe)
                    }
                    CondCode::P | CondCode::Np => {
                        (probe(self, FcmpCond::Unordered), cc == CondCode::Np)
                    }
                    _ => return None,
                };
                let value = if invert {
                    let one = self.const_(Width::W8, 1);
                    self.xor(Width::W8, value, one)
                } else {
                    value
                };
                let zero = self.const_(Width::W8, 0);
                Some(self.select(Cond::Neq, Width::W8, value, zero, t, f))
            }
        }
    }

    /// The slow path: rebuild the condition from the flag slots.
    fn select_cc_slots(&mut self, cc: CondCode, t: ValueId, f: ValueId) -> ValueId {
        let one = self.const_(Width::W8, 1);
        let zero = self.const_(Width::W8, 0);
        let value = match cc {
            CondCode::O | CondCode::No => self.get_flag(Flag::Of),
            CondCode::B | CondCode::Nb => self.get_flag(Flag::Cf),
            CondCode::Z | CondCode::Nz => self.get_flag(Flag::Zf),
            CondCode::Be | CondCode::Nbe => {
                let zf = self.get_flag(Flag::Zf);
                let cf = self.get_flag(Flag::Cf);
                self.or(Width::W8, zf, cf)
            }
            CondCode::S | CondCode::Ns => self.get_flag(Flag::Sf),
            CondCode::P | CondCode::Np => self.get_flag(Flag::Pf),
            CondCode::L | CondCode::Nl => {
                let sf = self.get_flag(Flag::Sf);
                let of = self.get_flag(Flag::Of);
                self.xor(Width::W8, sf, of)
            }
            CondCode::Le | CondCode::Nle => {
                let sf = self.get_flag(Flag::Sf);
                let of = self.get_flag(Flag::Of);
                let ne = self.xor(Width::W8, sf, of);
                let zf = self.get_flag(Flag::Zf);
                self.or(Width::W8, ne, zf)
            }
        };
        // Odd condition codes are the negations of their even partners.
        let negate = (cc as u8) & 1 != 0;
        let value = if negate {
            self.xor(Width::W8, value, one)
        } else {
            value
        };
        self.select(Cond::Neq, Width::W8, value, zero, t, f)
    }

    // -- packed RFLAGS ----------------------------------------------------

    /// Build architectural RFLAGS from the slots. Bit 1 is forced on, and
    /// IF reads as 1. `lower8_only` serves LAHF.
    pub(crate) fn get_packed_rflags(&mut self, lower8_only: bool) -> ValueId {
        let mut packed = self.const_(Width::W64, state::RFLAGS_RESERVED_ONE);
        let pairs: &[(Flag, u32)] = &[
            (Flag::Cf, 0),
            (Flag::Pf, 2),
            (Flag::Af, 4),
            (Flag::Zf, 6),
            (Flag::Sf, 7),
        ];
        for &(flag, bit) in pairs {
            let value = self.get_flag(flag);
            packed = self.bfi(Width::W64, 1, bit as u8, packed, value);
        }
        if lower8_only {
            return packed;
        }
        let of = self.get_flag(Flag::Of);
        packed = self.bfi(Width::W64, 1, 11, packed, of);
        let df = self.get_df();
        packed = self.bfi(Width::W64, 1, 10, packed, df);
        let if_bit = self.const_(Width::W8, 1);
        packed = self.bfi(Width::W64, 1, 9, packed, if_bit);
        packed
    }

    /// Scatter packed RFLAGS into the slots. `lower8_only` serves SAHF,
    /// which only moves CF/PF/AF/ZF/SF (bits 3 and 5 are masked away by
    /// construction — they are never read).
    pub(crate) fn set_packed_rflags(&mut self, src: ValueId, lower8_only: bool) {
        self.clear_flags_memo();
        let pairs: &[(Flag, u32)] = &[
            (Flag::Cf, 0),
            (Flag::Pf, 2),
            (Flag::Af, 4),
            (Flag::Zf, 6),
            (Flag::Sf, 7),
        ];
        for &(flag, bit) in pairs {
            let value = self.bfe(Width::W8, 1, bit as u8, src);
            self.set_flag_value(flag, value);
        }
        if lower8_only {
            return;
        }
        let of = self.bfe(Width::W8, 1, 11, src);
        self.set_flag_value(Flag::Of, of);
        let df = self.bfe(Width::W8, 1, 10, src);
        self.set_df(df);
    }

    /// Emit the ABI-local flag invalidation hint.
    pub(crate) fn invalidate_all_flags(&mut self) {
        self.clear_flags_memo();
        self.append(
            Instr::InvalidateFlags {
                flags: opal_types::FlagSet::all(),
            },
            Width::W8,
        );
    }
}
