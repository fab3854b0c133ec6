//! ModRM / SIB / displacement decoding.

use opal_types::{Gpr, Width};

use crate::cursor::Cursor;
use crate::inst::{MemRef, Operand};
use crate::prefix::Prefixes;
use crate::{DecodeError, DecodeMode};

/// Split ModRM byte.
#[derive(Debug, Clone, Copy)]
pub struct ModRm {
    pub raw: u8,
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn fetch(cur: &mut Cursor<'_>) -> Result<ModRm, DecodeError> {
        let raw = cur.fetch_u8()?;
        Ok(ModRm {
            raw,
            mode: raw >> 6,
            reg: (raw >> 3) & 0b111,
            rm: raw & 0b111,
        })
    }

    pub const fn is_reg_form(&self) -> bool {
        self.mode == 0b11
    }
}

/// Register selected by ModRM.reg with REX.R extension.
pub fn reg_operand(modrm: ModRm, prefixes: &Prefixes, width: Width) -> Operand {
    let ext = u8::from(prefixes.rex.is_some_and(|r| r.r())) << 3;
    gpr_operand(modrm.reg | ext, prefixes, width)
}

/// Register selected by ModRM.rm (register form) with REX.B extension.
pub fn rm_reg_operand(modrm: ModRm, prefixes: &Prefixes, width: Width) -> Operand {
    let ext = u8::from(prefixes.rex.is_some_and(|r| r.b())) << 3;
    gpr_operand(modrm.rm | ext, prefixes, width)
}

/// Map a 4-bit register number to an operand, handling the legacy AH/CH/DH/BH
/// encoding: with no REX present, byte registers 4..=7 address bits [15:8] of
/// RAX/RCX/RDX/RBX.
pub fn gpr_operand(num: u8, prefixes: &Prefixes, width: Width) -> Operand {
    if width == Width::W8 && prefixes.rex.is_none() && (4..=7).contains(&num) {
        let reg = Gpr::from_index(num - 4).unwrap_or(Gpr::Rax);
        return Operand::Gpr { reg, high8: true };
    }
    Operand::Gpr {
        reg: Gpr::from_index(num).unwrap_or(Gpr::Rax),
        high8: false,
    }
}

pub fn xmm_reg(modrm: ModRm, prefixes: &Prefixes) -> Operand {
    let ext = u8::from(prefixes.rex.is_some_and(|r| r.r())) << 3;
    Operand::Xmm {
        reg: modrm.reg | ext,
    }
}

pub fn xmm_rm_reg(modrm: ModRm, prefixes: &Prefixes) -> Operand {
    let ext = u8::from(prefixes.rex.is_some_and(|r| r.b())) << 3;
    Operand::Xmm { reg: modrm.rm | ext }
}

/// Decode the r/m side of a ModRM byte: either a register or a memory
/// reference (with SIB and displacement as required).
pub fn rm_operand(
    mode: DecodeMode,
    cur: &mut Cursor<'_>,
    modrm: ModRm,
    prefixes: &Prefixes,
    width: Width,
) -> Result<Operand, DecodeError> {
    if modrm.is_reg_form() {
        return Ok(rm_reg_operand(modrm, prefixes, width));
    }
    mem_operand(mode, cur, modrm, prefixes).map(Operand::Mem)
}

/// Decode the memory form of ModRM (mod != 0b11).
pub fn mem_operand(
    mode: DecodeMode,
    cur: &mut Cursor<'_>,
    modrm: ModRm,
    prefixes: &Prefixes,
) -> Result<MemRef, DecodeError> {
    let rex_b = u8::from(prefixes.rex.is_some_and(|r| r.b())) << 3;

    // rm == 100 always means a SIB byte follows.
    if modrm.rm == 0b100 {
        return sib_operand(cur, modrm, prefixes);
    }

    // mod == 00, rm == 101: RIP-relative in 64-bit mode, absolute disp32
    // otherwise.
    if modrm.mode == 0b00 && modrm.rm == 0b101 {
        let disp = cur.fetch_u32()? as i32;
        return Ok(if mode.is_64bit() {
            MemRef::RipRelative { disp }
        } else {
            MemRef::Absolute {
                addr: u64::from(disp as u32),
            }
        });
    }

    let base = Gpr::from_index(modrm.rm | rex_b).ok_or(DecodeError::Undefined)?;
    match modrm.mode {
        0b00 => Ok(MemRef::Direct { base }),
        0b01 => {
            let disp = cur.fetch_u8()? as i8 as i32;
            Ok(MemRef::Indirect { base, disp })
        }
        0b10 => {
            let disp = cur.fetch_u32()? as i32;
            Ok(MemRef::Indirect { base, disp })
        }
        _ => unreachable!("register form handled by caller"),
    }
}

fn sib_operand(
    cur: &mut Cursor<'_>,
    modrm: ModRm,
    prefixes: &Prefixes,
) -> Result<MemRef, DecodeError> {
    let sib = cur.fetch_u8()?;
    let scale = 1u8 << (sib >> 6);
    let index_num = ((sib >> 3) & 0b111) | (u8::from(prefixes.rex.is_some_and(|r| r.x())) << 3);
    let base_num = (sib & 0b111) | (u8::from(prefixes.rex.is_some_and(|r| r.b())) << 3);

    // index == 100 (no REX.X) encodes "no index".
    let index = if index_num == 0b100 {
        None
    } else {
        Gpr::from_index(index_num)
    };

    // base == *101 with mod == 00 means disp32, no base register.
    let (base, disp) = if modrm.mode == 0b00 && (sib & 0b111) == 0b101 {
        (None, cur.fetch_u32()? as i32)
    } else {
        let base = Gpr::from_index(base_num);
        let disp = match modrm.mode {
            0b00 => 0,
            0b01 => cur.fetch_u8()? as i8 as i32,
            _ => cur.fetch_u32()? as i32,
        };
        (base, disp)
    };

    Ok(MemRef::Sib {
        base,
        index,
        scale,
        disp,
    })
}
