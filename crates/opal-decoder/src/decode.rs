//! Opcode-table walk and operand forms.
//!
//! One `Dec` drives all four phases for a single instruction. The per-opcode
//! dispatch is a closed match over `(map, opcode)` — a dense jump table, not
//! function pointers — with ModRM.reg sub-dispatch for group opcodes.

use opal_types::{Gpr, SegReg, Width};

use crate::cursor::Cursor;
use crate::inst::{DecodedInst, MemRef, OpcodeMap, Operand};
use crate::operands::{self, ModRm};
use crate::prefix::{self, Prefixes};
use crate::{DecodeError, DecodeMode};

pub fn decode_instruction(
    mode: DecodeMode,
    pc: u64,
    bytes: &[u8],
) -> Result<DecodedInst, DecodeError> {
    let mut cur = Cursor::new(bytes);
    let prefixes = prefix::scan(mode, &mut cur)?;

    let mut dec = Dec {
        mode,
        pc,
        cur,
        bytes,
        prefixes,
        op_width: resolve_op_width(mode, &prefixes),
        addr_width: resolve_addr_width(mode, &prefixes)?,
        map: OpcodeMap::Primary,
        opcode: 0,
        group_reg: None,
        modrm: None,
        dest: None,
        srcs: [None; 3],
        thunk_hash: None,
    };

    // AVX-512 encodings are recognized for length accounting but never
    // translated.
    if prefixes.evex.is_some() {
        return Err(DecodeError::Undefined);
    }

    // A VEX prefix embeds the opcode map; the byte after it is the opcode.
    if let Some(vex) = prefixes.vex {
        dec.opcode = dec.cur.fetch_u8()?;
        dec.map = match vex.map {
            1 => OpcodeMap::Secondary,
            2 => OpcodeMap::Escape0F38,
            3 => OpcodeMap::Escape0F3A,
            _ => return Err(DecodeError::Undefined),
        };
        // Only the zeroing idioms are accepted from the VEX space; wide AVX
        // lowering is out of scope and reports as undefined.
        return match (dec.map, dec.opcode) {
            (OpcodeMap::Secondary, 0x77) => {
                dec.check_lock()?;
                Ok(dec.finish())
            }
            _ => Err(DecodeError::Undefined),
        };
    }

    let opcode = dec.cur.fetch_u8()?;
    match opcode {
        0x0f => {
            let second = dec.cur.fetch_u8()?;
            match second {
                0x38 => {
                    dec.map = OpcodeMap::Escape0F38;
                    dec.opcode = dec.cur.fetch_u8()?;
                    dec.decode_0f38()?;
                }
                0x3a => {
                    dec.map = OpcodeMap::Escape0F3A;
                    dec.opcode = dec.cur.fetch_u8()?;
                    return Err(DecodeError::Undefined);
                }
                _ => {
                    dec.map = OpcodeMap::Secondary;
                    dec.opcode = second;
                    dec.decode_secondary()?;
                }
            }
        }
        0xd8..=0xdf => {
            dec.map = OpcodeMap::X87(opcode);
            dec.decode_x87()?;
        }
        _ => {
            dec.map = OpcodeMap::Primary;
            dec.opcode = opcode;
            dec.decode_primary()?;
        }
    }

    dec.check_lock()?;
    Ok(dec.finish())
}

fn resolve_op_width(mode: DecodeMode, prefixes: &Prefixes) -> Width {
    if mode.is_64bit() && prefixes.rex.is_some_and(|r| r.w()) {
        Width::W64
    } else if prefixes.operand_size_override {
        Width::W16
    } else {
        Width::W32
    }
}

fn resolve_addr_width(mode: DecodeMode, prefixes: &Prefixes) -> Result<Width, DecodeError> {
    match mode {
        DecodeMode::Bits64 => Ok(if prefixes.address_size_override {
            Width::W32
        } else {
            Width::W64
        }),
        DecodeMode::Bits32 => {
            if prefixes.address_size_override {
                // 16-bit addressing forms are out of scope.
                Err(DecodeError::UnsupportedPrefixCombination)
            } else {
                Ok(Width::W32)
            }
        }
    }
}

struct Dec<'a> {
    mode: DecodeMode,
    pc: u64,
    cur: Cursor<'a>,
    bytes: &'a [u8],
    prefixes: Prefixes,
    op_width: Width,
    addr_width: Width,
    map: OpcodeMap,
    opcode: u8,
    group_reg: Option<u8>,
    modrm: Option<u8>,
    dest: Option<Operand>,
    srcs: [Option<Operand>; 3],
    thunk_hash: Option<[u8; 16]>,
}

impl<'a> Dec<'a> {
    fn finish(self) -> DecodedInst {
        DecodedInst {
            pc: self.pc,
            len: self.cur.consumed() as u8,
            map: self.map,
            opcode: self.opcode,
            group_reg: self.group_reg,
            prefixes: self.prefixes,
            op_width: self.op_width,
            addr_width: self.addr_width,
            dest: self.dest,
            srcs: self.srcs,
            modrm: self.modrm,
            thunk_hash: self.thunk_hash,
        }
    }

    fn modrm(&mut self) -> Result<ModRm, DecodeError> {
        let m = ModRm::fetch(&mut self.cur)?;
        self.modrm = Some(m.raw);
        Ok(m)
    }

    fn src(&mut self, index: usize, op: Operand) {
        self.srcs[index] = Some(op);
    }

    // -- immediate fetch helpers ----------------------------------------

    /// Byte immediate, zero-extended.
    fn imm8(&mut self) -> Result<Operand, DecodeError> {
        Ok(Operand::Imm {
            value: u64::from(self.cur.fetch_u8()?),
            width: Width::W8,
        })
    }

    /// Byte immediate sign-extended to the operand width.
    fn imm8_sx(&mut self) -> Result<Operand, DecodeError> {
        let raw = self.cur.fetch_u8()?;
        Ok(Operand::Imm {
            value: self.op_width.truncate(Width::W8.sign_extend(u64::from(raw))),
            width: self.op_width,
        })
    }

    /// "Iz": 16-bit when the operand width is 16, else 32-bit; sign-extended
    /// up to the operand width (the 64-bit forms take imm32 sign-extended).
    fn immz(&mut self) -> Result<Operand, DecodeError> {
        let (value, fetched) = match self.op_width {
            Width::W16 => (u64::from(self.cur.fetch_u16()?), Width::W16),
            _ => (u64::from(self.cur.fetch_u32()?), Width::W32),
        };
        Ok(Operand::Imm {
            value: self.op_width.truncate(fetched.sign_extend(value)),
            width: self.op_width,
        })
    }

    /// Full-width immediate ("Iv"): the only consumer of true imm64.
    fn immv(&mut self) -> Result<Operand, DecodeError> {
        let value = match self.op_width {
            Width::W16 => u64::from(self.cur.fetch_u16()?),
            Width::W32 => u64::from(self.cur.fetch_u32()?),
            Width::W64 => self.cur.fetch_u64()?,
            Width::W8 => u64::from(self.cur.fetch_u8()?),
        };
        Ok(Operand::Imm {
            value,
            width: self.op_width,
        })
    }

    /// Relative branch displacement, sign-extended to 64 bits.
    fn rel8(&mut self) -> Result<Operand, DecodeError> {
        let raw = self.cur.fetch_u8()?;
        Ok(Operand::Imm {
            value: Width::W8.sign_extend(u64::from(raw)),
            width: Width::W64,
        })
    }

    fn relz(&mut self) -> Result<Operand, DecodeError> {
        let value = match self.op_width {
            Width::W16 => Width::W16.sign_extend(u64::from(self.cur.fetch_u16()?)),
            _ => Width::W32.sign_extend(u64::from(self.cur.fetch_u32()?)),
        };
        Ok(Operand::Imm {
            value,
            width: Width::W64,
        })
    }

    // -- operand form helpers -------------------------------------------

    fn width_for(&self, byte_op: bool) -> Width {
        if byte_op {
            Width::W8
        } else {
            self.op_width
        }
    }

    /// dest = r/m, src = reg ("MR" form).
    fn form_mr(&mut self, byte_op: bool) -> Result<(), DecodeError> {
        if byte_op {
            self.op_width = Width::W8;
        }
        let w = self.width_for(byte_op);
        let m = self.modrm()?;
        let reg = operands::reg_operand(m, &self.prefixes, w);
        let rm = operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, w)?;
        self.dest = Some(rm);
        self.src(0, reg);
        Ok(())
    }

    /// dest = reg, src = r/m ("RM" form).
    fn form_rm(&mut self, byte_op: bool) -> Result<(), DecodeError> {
        if byte_op {
            self.op_width = Width::W8;
        }
        let w = self.width_for(byte_op);
        let m = self.modrm()?;
        let reg = operands::reg_operand(m, &self.prefixes, w);
        let rm = operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, w)?;
        self.dest = Some(reg);
        self.src(0, rm);
        Ok(())
    }

    /// dest = reg (op width), src = r/m decoded at an explicit width
    /// (MOVZX/MOVSX/MOVSXD).
    fn form_rm_widening(&mut self, src_width: Width) -> Result<(), DecodeError> {
        let m = self.modrm()?;
        let reg = operands::reg_operand(m, &self.prefixes, self.op_width);
        let rm = operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, src_width)?;
        self.dest = Some(reg);
        self.src(0, rm);
        Ok(())
    }

    /// AL/eAX accumulator destination with an immediate source.
    fn form_acc_imm(&mut self, byte_op: bool) -> Result<(), DecodeError> {
        if byte_op {
            self.op_width = Width::W8;
        }
        self.dest = Some(Operand::Gpr {
            reg: Gpr::Rax,
            high8: false,
        });
        let imm = if byte_op { self.imm8()? } else { self.immz()? };
        self.src(0, imm);
        Ok(())
    }

    /// Group form: dest = r/m, sub-opcode in ModRM.reg.
    fn form_group_rm(&mut self, byte_op: bool) -> Result<ModRm, DecodeError> {
        if byte_op {
            self.op_width = Width::W8;
        }
        let w = self.width_for(byte_op);
        let m = self.modrm()?;
        self.group_reg = Some(m.reg);
        let rm = operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, w)?;
        self.dest = Some(rm);
        Ok(m)
    }

    /// Register encoded in the opcode's low three bits, extended by REX.B.
    fn opcode_reg(&self, width: Width) -> Operand {
        let ext = u8::from(self.prefixes.rex.is_some_and(|r| r.b())) << 3;
        operands::gpr_operand((self.opcode & 0b111) | ext, &self.prefixes, width)
    }

    /// Stack operation width: 64-bit default in long mode (no REX.W needed).
    fn stack_width(&self) -> Width {
        match (self.mode, self.prefixes.operand_size_override) {
            (DecodeMode::Bits64, false) => Width::W64,
            (DecodeMode::Bits64, true) => Width::W16,
            (DecodeMode::Bits32, false) => Width::W32,
            (DecodeMode::Bits32, true) => Width::W16,
        }
    }

    fn seg_from_reg_field(reg: u8) -> Result<SegReg, DecodeError> {
        Ok(match reg {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            3 => SegReg::Ds,
            4 => SegReg::Fs,
            5 => SegReg::Gs,
            _ => return Err(DecodeError::Undefined),
        })
    }

    // -- primary map ----------------------------------------------------

    fn decode_primary(&mut self) -> Result<(), DecodeError> {
        let op = self.opcode;
        match op {
            // ALU block: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP share their encoding
            // shape; the low three bits select the form.
            0x00..=0x3d if is_alu_block_opcode(op) => match op & 0b111 {
                0 => self.form_mr(true),
                1 => self.form_mr(false),
                2 => self.form_rm(true),
                3 => self.form_rm(false),
                4 => self.form_acc_imm(true),
                5 => self.form_acc_imm(false),
                _ => unreachable!(),
            },

            // PUSH/POP of segment registers, 32-bit mode only.
            0x06 | 0x07 | 0x0e | 0x16 | 0x17 | 0x1e | 0x1f => {
                if self.mode.is_64bit() {
                    return Err(DecodeError::Undefined);
                }
                let seg = match op {
                    0x06 | 0x07 => SegReg::Es,
                    0x0e => SegReg::Cs,
                    0x16 | 0x17 => SegReg::Ss,
                    _ => SegReg::Ds,
                };
                self.src(0, Operand::Seg { seg });
                Ok(())
            }

            // INC/DEC r in 32-bit mode (REX space in 64-bit).
            0x40..=0x4f => {
                if self.mode.is_64bit() {
                    return Err(DecodeError::Undefined);
                }
                self.dest = Some(self.opcode_reg(self.op_width));
                Ok(())
            }

            0x50..=0x57 => {
                let w = self.stack_width();
                self.op_width = w;
                self.src(0, self.opcode_reg(w));
                Ok(())
            }
            0x58..=0x5f => {
                let w = self.stack_width();
                self.op_width = w;
                self.dest = Some(self.opcode_reg(w));
                Ok(())
            }

            0x63 => {
                if !self.mode.is_64bit() {
                    return Err(DecodeError::Undefined);
                }
                // MOVSXD: source is always 32-bit.
                self.form_rm_widening(Width::W32)
            }

            0x68 => {
                self.op_width = self.stack_width();
                let imm = self.immz()?;
                self.src(0, imm);
                Ok(())
            }
            0x69 => {
                self.form_rm(false)?;
                let imm = self.immz()?;
                self.src(1, imm);
                Ok(())
            }
            0x6a => {
                self.op_width = self.stack_width();
                let imm = self.imm8_sx()?;
                self.src(0, imm);
                Ok(())
            }
            0x6b => {
                self.form_rm(false)?;
                let imm = self.imm8_sx()?;
                self.src(1, imm);
                Ok(())
            }

            // Jcc rel8.
            0x70..=0x7f => {
                let rel = self.rel8()?;
                self.src(0, rel);
                Ok(())
            }

            // Immediate-ALU groups.
            0x80 => {
                self.form_group_rm(true)?;
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }
            0x81 => {
                self.form_group_rm(false)?;
                let imm = self.immz()?;
                self.src(0, imm);
                Ok(())
            }
            0x82 => {
                if self.mode.is_64bit() {
                    return Err(DecodeError::Undefined);
                }
                self.form_group_rm(true)?;
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }
            0x83 => {
                self.form_group_rm(false)?;
                let imm = self.imm8_sx()?;
                self.src(0, imm);
                Ok(())
            }

            0x84 => self.form_mr(true),
            0x85 => self.form_mr(false),
            0x86 => self.form_mr(true),
            0x87 => self.form_mr(false),

            0x88 => self.form_mr(true),
            0x89 => self.form_mr(false),
            0x8a => self.form_rm(true),
            0x8b => self.form_rm(false),

            // MOV r/m16, Sreg and MOV Sreg, r/m16.
            0x8c => {
                let m = self.modrm()?;
                let seg = Self::seg_from_reg_field(m.reg)?;
                let rm =
                    operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, Width::W16)?;
                self.dest = Some(rm);
                self.src(0, Operand::Seg { seg });
                Ok(())
            }
            0x8e => {
                let m = self.modrm()?;
                let seg = Self::seg_from_reg_field(m.reg)?;
                let rm =
                    operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, Width::W16)?;
                self.dest = Some(Operand::Seg { seg });
                self.src(0, rm);
                Ok(())
            }

            // LEA: memory form only.
            0x8d => {
                let m = self.modrm()?;
                if m.is_reg_form() {
                    return Err(DecodeError::Undefined);
                }
                let reg = operands::reg_operand(m, &self.prefixes, self.op_width);
                let mem = operands::mem_operand(self.mode, &mut self.cur, m, &self.prefixes)?;
                self.dest = Some(reg);
                self.src(0, Operand::Mem(mem));
                Ok(())
            }

            // Group 1A: POP r/m.
            0x8f => {
                self.op_width = self.stack_width();
                let m = self.form_group_rm(false)?;
                if m.reg != 0 {
                    return Err(DecodeError::Undefined);
                }
                Ok(())
            }

            // NOP / XCHG eAX, r. 0x90 without REX.B is the canonical NOP.
            0x90..=0x97 => {
                self.dest = Some(Operand::Gpr {
                    reg: Gpr::Rax,
                    high8: false,
                });
                self.src(0, self.opcode_reg(self.op_width));
                Ok(())
            }

            0x98 | 0x99 => Ok(()),
            0x9b => Ok(()), // FWAIT
            0x9c | 0x9d => {
                self.op_width = self.stack_width();
                Ok(())
            }
            0x9e | 0x9f => Ok(()),

            // MOV accumulator <-> absolute offset.
            0xa0 | 0xa1 | 0xa2 | 0xa3 => {
                let byte_op = op & 1 == 0;
                if byte_op {
                    self.op_width = Width::W8;
                }
                let addr = match self.addr_width {
                    Width::W64 => self.cur.fetch_u64()?,
                    _ => u64::from(self.cur.fetch_u32()?),
                };
                let mem = Operand::Mem(MemRef::Absolute { addr });
                let acc = Operand::Gpr {
                    reg: Gpr::Rax,
                    high8: false,
                };
                if op < 0xa2 {
                    self.dest = Some(acc);
                    self.src(0, mem);
                } else {
                    self.dest = Some(mem);
                    self.src(0, acc);
                }
                Ok(())
            }

            // String ops: operands are implicit.
            0xa4 | 0xa6 | 0xaa | 0xac | 0xae => {
                self.op_width = Width::W8;
                Ok(())
            }
            0xa5 | 0xa7 | 0xab | 0xad | 0xaf => Ok(()),

            0xa8 => self.form_acc_imm(true),
            0xa9 => self.form_acc_imm(false),

            // MOV r, imm.
            0xb0..=0xb7 => {
                self.op_width = Width::W8;
                self.dest = Some(self.opcode_reg(Width::W8));
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }
            0xb8..=0xbf => {
                self.dest = Some(self.opcode_reg(self.op_width));
                let imm = self.immv()?;
                self.src(0, imm);
                Ok(())
            }

            // Shift groups.
            0xc0 => {
                self.form_group_rm(true)?;
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }
            0xc1 => {
                self.form_group_rm(false)?;
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }
            0xd0 | 0xd1 => {
                self.form_group_rm(op == 0xd0)?;
                self.src(
                    0,
                    Operand::Imm {
                        value: 1,
                        width: Width::W8,
                    },
                );
                Ok(())
            }
            0xd2 | 0xd3 => {
                self.form_group_rm(op == 0xd2)?;
                self.src(
                    0,
                    Operand::Gpr {
                        reg: Gpr::Rcx,
                        high8: false,
                    },
                );
                Ok(())
            }

            0xc2 => {
                let imm = u64::from(self.cur.fetch_u16()?);
                self.src(
                    0,
                    Operand::Imm {
                        value: imm,
                        width: Width::W16,
                    },
                );
                Ok(())
            }
            0xc3 => Ok(()),

            // Group 11: MOV r/m, imm.
            0xc6 => {
                let m = self.form_group_rm(true)?;
                if m.reg != 0 {
                    return Err(DecodeError::Undefined);
                }
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }
            0xc7 => {
                let m = self.form_group_rm(false)?;
                if m.reg != 0 {
                    return Err(DecodeError::Undefined);
                }
                let imm = self.immz()?;
                self.src(0, imm);
                Ok(())
            }

            0xc8 => {
                let frame = u64::from(self.cur.fetch_u16()?);
                let nesting = u64::from(self.cur.fetch_u8()?);
                self.src(
                    0,
                    Operand::Imm {
                        value: frame,
                        width: Width::W16,
                    },
                );
                self.src(
                    1,
                    Operand::Imm {
                        value: nesting,
                        width: Width::W8,
                    },
                );
                Ok(())
            }
            0xc9 => Ok(()),

            0xcc => Ok(()), // INT3
            0xcd => {
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }
            0xce => {
                if self.mode.is_64bit() {
                    return Err(DecodeError::Undefined);
                }
                Ok(())
            }
            0xcf => {
                if self.prefixes.operand_size_override {
                    return Err(DecodeError::OperandSizeOverrideOnIret);
                }
                Ok(())
            }

            0xd7 => Ok(()), // XLAT

            // LOOP family and JrCXZ.
            0xe0..=0xe3 => {
                let rel = self.rel8()?;
                self.src(0, rel);
                Ok(())
            }

            0xe8 | 0xe9 => {
                let rel = self.relz()?;
                self.src(0, rel);
                Ok(())
            }
            0xeb => {
                let rel = self.rel8()?;
                self.src(0, rel);
                Ok(())
            }

            0xf4 => Ok(()), // HLT: decodes; lowering raises the guest fault.
            0xf5 | 0xf8 | 0xf9 | 0xfa | 0xfb | 0xfc | 0xfd => Ok(()),

            // Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV.
            0xf6 | 0xf7 => {
                let byte_op = op == 0xf6;
                let m = self.form_group_rm(byte_op)?;
                if m.reg == 0 || m.reg == 1 {
                    let imm = if byte_op { self.imm8()? } else { self.immz()? };
                    self.src(0, imm);
                }
                Ok(())
            }

            // Group 4: INC/DEC r/m8.
            0xfe => {
                let m = self.form_group_rm(true)?;
                if m.reg > 1 {
                    return Err(DecodeError::Undefined);
                }
                Ok(())
            }
            // Group 5: INC/DEC/CALL/JMP/PUSH r/m.
            0xff => {
                let m = self.form_group_rm(false)?;
                match m.reg {
                    0 | 1 => Ok(()),
                    2 | 4 => {
                        // Indirect CALL/JMP are 64-bit in long mode; the
                        // width only lives in `op_width`, so patching it
                        // after operand decode is enough.
                        if self.mode.is_64bit() {
                            self.op_width = Width::W64;
                        }
                        Ok(())
                    }
                    6 => {
                        self.op_width = self.stack_width();
                        Ok(())
                    }
                    _ => Err(DecodeError::Undefined),
                }
            }

            _ => Err(DecodeError::Undefined),
        }
    }

    // -- secondary (0F) map ---------------------------------------------

    fn decode_secondary(&mut self) -> Result<(), DecodeError> {
        let op = self.opcode;
        match op {
            0x05 => {
                if !self.mode.is_64bit() {
                    return Err(DecodeError::Undefined);
                }
                Ok(())
            }

            // Hint NOPs (0F 0D, 0F 18..0F 1F): consume ModRM, no semantics.
            0x0d | 0x18..=0x1f => {
                let m = self.modrm()?;
                if !m.is_reg_form() {
                    operands::mem_operand(self.mode, &mut self.cur, m, &self.prefixes)?;
                }
                Ok(())
            }

            // SSE moves and arithmetic (packed/scalar selected by prefix).
            0x10 | 0x28 => self.form_xmm_rm(),
            0x11 | 0x29 => self.form_xmm_mr(),
            0x2a => {
                // CVTSI2Sx: xmm <- r/m (integer, operand width).
                let m = self.modrm()?;
                let dst = operands::xmm_reg(m, &self.prefixes);
                let rm =
                    operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, self.op_width)?;
                self.dest = Some(dst);
                self.src(0, rm);
                Ok(())
            }
            0x2c | 0x2d => {
                // CVT(T)Sx2SI: gpr <- xmm/m.
                let m = self.modrm()?;
                let dst = operands::reg_operand(m, &self.prefixes, self.op_width);
                let rm = self.xmm_or_mem_rm(m)?;
                self.dest = Some(dst);
                self.src(0, rm);
                Ok(())
            }
            0x2e | 0x2f => self.form_xmm_rm(),

            0x31 => Ok(()), // RDTSC

            // Reserved thunk encoding: 0F 3F followed by a 16-byte hash that
            // lives *after* the instruction proper.
            0x3f => {
                let consumed = self.cur.consumed();
                let hash_bytes = self
                    .bytes
                    .get(consumed..consumed + 16)
                    .ok_or(DecodeError::Truncated)?;
                let mut hash = [0u8; 16];
                hash.copy_from_slice(hash_bytes);
                self.thunk_hash = Some(hash);
                Ok(())
            }

            0x40..=0x4f => self.form_rm(false), // CMOVcc

            0x51 | 0x54..=0x5f => self.form_xmm_rm(),

            0x6e => {
                // MOVD/MOVQ xmm <- r/m.
                let m = self.modrm()?;
                let dst = operands::xmm_reg(m, &self.prefixes);
                let rm =
                    operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, self.op_width)?;
                self.dest = Some(dst);
                self.src(0, rm);
                Ok(())
            }
            0x6f => self.form_xmm_rm(),
            0x70 => {
                self.form_xmm_rm()?;
                let imm = self.imm8()?;
                self.src(1, imm);
                Ok(())
            }
            0x74 | 0x76 | 0xdb | 0xeb | 0xef => self.form_xmm_rm(),
            0x77 => Ok(()), // EMMS
            0x7e => {
                // MOVD/MOVQ r/m <- xmm (or MOVQ xmm<-xmm/m with F3).
                let m = self.modrm()?;
                if self.prefixes.rep {
                    let dst = operands::xmm_reg(m, &self.prefixes);
                    let rm = self.xmm_or_mem_rm(m)?;
                    self.dest = Some(dst);
                    self.src(0, rm);
                } else {
                    let src = operands::xmm_reg(m, &self.prefixes);
                    let rm = operands::rm_operand(
                        self.mode,
                        &mut self.cur,
                        m,
                        &self.prefixes,
                        self.op_width,
                    )?;
                    self.dest = Some(rm);
                    self.src(0, src);
                }
                Ok(())
            }
            0x7f => self.form_xmm_mr(),

            0x80..=0x8f => {
                let rel = self.relz()?;
                self.src(0, rel);
                Ok(())
            }

            // SETcc r/m8.
            0x90..=0x9f => {
                let m = self.modrm()?;
                let rm =
                    operands::rm_operand(self.mode, &mut self.cur, m, &self.prefixes, Width::W8)?;
                self.op_width = Width::W8;
                self.dest = Some(rm);
                Ok(())
            }

            0xa0 | 0xa8 => {
                let seg = if op == 0xa0 { SegReg::Fs } else { SegReg::Gs };
                self.src(0, Operand::Seg { seg });
                Ok(())
            }
            0xa1 | 0xa9 => {
                let seg = if op == 0xa1 { SegReg::Fs } else { SegReg::Gs };
                self.dest = Some(Operand::Seg { seg });
                Ok(())
            }

            0xa2 => Ok(()), // CPUID

            0xa3 | 0xab | 0xb3 | 0xbb => self.form_mr(false), // BT/BTS/BTR/BTC

            0xa4 | 0xac => {
                // SHLD/SHRD r/m, reg, imm8.
                self.form_mr(false)?;
                let imm = self.imm8()?;
                self.src(1, imm);
                Ok(())
            }
            0xa5 | 0xad => {
                self.form_mr(false)?;
                self.src(
                    1,
                    Operand::Gpr {
                        reg: Gpr::Rcx,
                        high8: false,
                    },
                );
                Ok(())
            }

            // Group 15: fences and MXCSR.
            0xae => {
                let m = self.modrm()?;
                self.group_reg = Some(m.reg);
                if m.is_reg_form() {
                    match m.reg {
                        5..=7 => Ok(()), // LFENCE/MFENCE/SFENCE
                        _ => Err(DecodeError::Undefined),
                    }
                } else {
                    let mem = operands::mem_operand(self.mode, &mut self.cur, m, &self.prefixes)?;
                    match m.reg {
                        2 | 3 => {
                            // LDMXCSR/STMXCSR m32.
                            self.src(0, Operand::Mem(mem));
                            Ok(())
                        }
                        7 => {
                            // CLFLUSH m8.
                            self.src(0, Operand::Mem(mem));
                            Ok(())
                        }
                        _ => Err(DecodeError::Undefined),
                    }
                }
            }

            0xaf => self.form_rm(false), // IMUL Gv, Ev

            0xb0 => self.form_mr(true), // CMPXCHG
            0xb1 => self.form_mr(false),

            0xb6 => self.form_rm_widening(Width::W8),
            0xb7 => self.form_rm_widening(Width::W16),
            0xbe => self.form_rm_widening(Width::W8),
            0xbf => self.form_rm_widening(Width::W16),

            0xb8 => {
                // POPCNT requires the F3 prefix.
                if !self.prefixes.rep {
                    return Err(DecodeError::Undefined);
                }
                self.form_rm(false)
            }

            // Group 8: BT/BTS/BTR/BTC r/m, imm8.
            0xba => {
                let m = self.form_group_rm(false)?;
                if m.reg < 4 {
                    return Err(DecodeError::Undefined);
                }
                let imm = self.imm8()?;
                self.src(0, imm);
                Ok(())
            }

            0xbc | 0xbd => self.form_rm(false), // BSF/BSR (TZCNT/LZCNT w/ F3)

            0xc0 => self.form_mr(true), // XADD
            0xc1 => self.form_mr(false),

            0xc2 => {
                // CMPPS/CMPSS/CMPSD xmm, xmm/m, imm8.
                self.form_xmm_rm()?;
                let imm = self.imm8()?;
                self.src(1, imm);
                Ok(())
            }

            // Group 9: CMPXCHG8B/16B m64/m128.
            0xc7 => {
                let m = self.modrm()?;
                self.group_reg = Some(m.reg);
                if m.reg != 1 || m.is_reg_form() {
                    return Err(DecodeError::Undefined);
                }
                let mem = operands::mem_operand(self.mode, &mut self.cur, m, &self.prefixes)?;
                self.dest = Some(Operand::Mem(mem));
                Ok(())
            }

            0xc8..=0xcf => {
                self.dest = Some(self.opcode_reg(self.op_width));
                Ok(())
            }

            _ => Err(DecodeError::Undefined),
        }
    }

    // -- 0F 38 map ------------------------------------------------------

    fn decode_0f38(&mut self) -> Result<(), DecodeError> {
        match self.opcode {
            // MOVBE Gv, Ev / Ev, Gv.
            0xf0 => self.form_rm(false),
            0xf1 => self.form_mr(false),
            _ => Err(DecodeError::Undefined),
        }
    }

    // -- x87 escape -----------------------------------------------------

    fn decode_x87(&mut self) -> Result<(), DecodeError> {
        let m = self.modrm()?;
        // For x87 the whole ModRM byte selects the operation; stash it as
        // the opcode and keep reg for mem-form sub-dispatch.
        self.opcode = m.raw;
        self.group_reg = Some(m.reg);
        if !m.is_reg_form() {
            let mem = operands::mem_operand(self.mode, &mut self.cur, m, &self.prefixes)?;
            self.src(0, Operand::Mem(mem));
        }
        Ok(())
    }

    // -- SSE operand helpers --------------------------------------------

    fn xmm_or_mem_rm(&mut self, m: ModRm) -> Result<Operand, DecodeError> {
        if m.is_reg_form() {
            Ok(operands::xmm_rm_reg(m, &self.prefixes))
        } else {
            let mem = operands::mem_operand(self.mode, &mut self.cur, m, &self.prefixes)?;
            Ok(Operand::Mem(mem))
        }
    }

    /// dest = xmm(reg), src = xmm/m.
    fn form_xmm_rm(&mut self) -> Result<(), DecodeError> {
        let m = self.modrm()?;
        let dst = operands::xmm_reg(m, &self.prefixes);
        let rm = self.xmm_or_mem_rm(m)?;
        self.dest = Some(dst);
        self.src(0, rm);
        Ok(())
    }

    /// dest = xmm/m, src = xmm(reg).
    fn form_xmm_mr(&mut self) -> Result<(), DecodeError> {
        let m = self.modrm()?;
        let src = operands::xmm_reg(m, &self.prefixes);
        let rm = self.xmm_or_mem_rm(m)?;
        self.dest = Some(rm);
        self.src(0, src);
        Ok(())
    }

    // -- LOCK validity --------------------------------------------------

    fn check_lock(&self) -> Result<(), DecodeError> {
        if !self.prefixes.lock {
            return Ok(());
        }
        let mem_dest = self.dest.is_some_and(|d| d.is_mem());
        if mem_dest && lockable(self.map, self.opcode, self.group_reg) {
            Ok(())
        } else {
            Err(DecodeError::UnsupportedPrefixCombination)
        }
    }
}

fn is_alu_block_opcode(op: u8) -> bool {
    // Each ALU row occupies 8 encodings but only the first six are the
    // ALU forms (the last two are the segment push/pop or escapes).
    op & 0b111 < 6 && (op >> 3) < 8
}

fn lockable(map: OpcodeMap, opcode: u8, group_reg: Option<u8>) -> bool {
    match map {
        OpcodeMap::Primary => match opcode {
            // ALU row store forms and immediate groups.
            0x00 | 0x01 | 0x08 | 0x09 | 0x10 | 0x11 | 0x18 | 0x19 | 0x20 | 0x21 | 0x28 | 0x29
            | 0x30 | 0x31 => true,
            0x80 | 0x81 | 0x83 => group_reg != Some(7), // CMP is not lockable
            0x86 | 0x87 => true,                        // XCHG (implicitly locked anyway)
            0xf6 | 0xf7 => matches!(group_reg, Some(2 | 3)), // NOT/NEG
            0xfe | 0xff => matches!(group_reg, Some(0 | 1)), // INC/DEC
            _ => false,
        },
        OpcodeMap::Secondary => matches!(
            opcode,
            0xb0 | 0xb1          // CMPXCHG
                | 0xab | 0xb3 | 0xbb // BTS/BTR/BTC
                | 0xc0 | 0xc1        // XADD
                | 0xc7 // CMPXCHG8B/16B
        ) || (opcode == 0xba && matches!(group_reg, Some(5..=7))),
        _ => false,
    }
}
