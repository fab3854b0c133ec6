//! Legacy, REX and VEX prefix scanning.

use opal_types::SegReg;

use crate::cursor::Cursor;
use crate::{DecodeError, DecodeMode};

/// Raw REX byte, low nibble = W R X B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rex(pub u8);

impl Rex {
    #[must_use]
    pub const fn w(self) -> bool {
        self.0 & 0b1000 != 0
    }
    #[must_use]
    pub const fn r(self) -> bool {
        self.0 & 0b0100 != 0
    }
    #[must_use]
    pub const fn x(self) -> bool {
        self.0 & 0b0010 != 0
    }
    #[must_use]
    pub const fn b(self) -> bool {
        self.0 & 0b0001 != 0
    }
}

/// Decoded EVEX prefix. Recognized for length accounting; AVX-512 lowering
/// is not translated, so the instruction itself reports as undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evex {
    /// Opcode map (mm field): 1 = 0F, 2 = 0F 38, 3 = 0F 3A.
    pub map: u8,
    /// Embedded mandatory prefix.
    pub pp: u8,
    pub vvvv: u8,
    pub w: bool,
}

/// Decoded VEX prefix (two- or three-byte form).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vex {
    /// Opcode map: 1 = 0F, 2 = 0F 38, 3 = 0F 3A.
    pub map: u8,
    /// Embedded mandatory prefix: 0 = none, 1 = 66, 2 = F3, 3 = F2.
    pub pp: u8,
    /// Inverted second source register (already un-inverted here).
    pub vvvv: u8,
    /// 256-bit operation when set.
    pub l: bool,
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

/// All prefix state gathered ahead of the opcode. "Last one wins" within
/// each legacy prefix group, matching hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: bool,
    pub repne: bool,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub segment: Option<SegReg>,
    pub rex: Option<Rex>,
    pub vex: Option<Vex>,
    pub evex: Option<Evex>,
}

/// Scan legacy prefixes, then a single REX (64-bit mode) or a VEX prefix.
///
/// A REX byte is only honored when it immediately precedes the opcode; a
/// legacy prefix after a REX invalidates it, so we simply keep scanning and
/// drop any earlier REX.
pub fn scan(mode: DecodeMode, cur: &mut Cursor<'_>) -> Result<Prefixes, DecodeError> {
    let mut prefixes = Prefixes::default();

    loop {
        let b = cur.fetch_u8()?;
        match b {
            0xf0 => {
                prefixes.lock = true;
                prefixes.rep = false;
                prefixes.repne = false;
            }
            0xf2 => {
                prefixes.repne = true;
                prefixes.rep = false;
                prefixes.lock = false;
            }
            0xf3 => {
                prefixes.rep = true;
                prefixes.repne = false;
                prefixes.lock = false;
            }
            0x26 => set_segment(mode, &mut prefixes, SegReg::Es),
            0x2e => set_segment(mode, &mut prefixes, SegReg::Cs),
            0x36 => set_segment(mode, &mut prefixes, SegReg::Ss),
            0x3e => set_segment(mode, &mut prefixes, SegReg::Ds),
            0x64 => prefixes.segment = Some(SegReg::Fs),
            0x65 => prefixes.segment = Some(SegReg::Gs),
            0x66 => prefixes.operand_size_override = true,
            0x67 => prefixes.address_size_override = true,
            0x40..=0x4f if mode.is_64bit() => {
                // REX must immediately precede the opcode. If another REX or
                // legacy prefix follows, this one is dead; the loop handles
                // that naturally by overwriting / clearing below.
                prefixes.rex = Some(Rex(b & 0x0f));
                // Check the next byte: if it is another legacy prefix the
                // REX is invalidated.
                match cur.peek() {
                    Some(next) if is_legacy_prefix(next) || (0x40..=0x4f).contains(&next) => {
                        prefixes.rex = None;
                    }
                    _ => return Ok(prefixes),
                }
            }
            0xc5 if vex2_valid(mode, cur) => {
                let b2 = cur.fetch_u8()?;
                prefixes.vex = Some(Vex {
                    map: 1,
                    pp: b2 & 0b11,
                    vvvv: (!(b2 >> 3)) & 0xf,
                    l: b2 & 0b100 != 0,
                    w: false,
                    r: b2 & 0x80 == 0,
                    x: false,
                    b: false,
                });
                return Ok(prefixes);
            }
            0xc4 if vex3_valid(mode, cur) => {
                let b2 = cur.fetch_u8()?;
                let b3 = cur.fetch_u8()?;
                prefixes.vex = Some(Vex {
                    map: b2 & 0x1f,
                    pp: b3 & 0b11,
                    vvvv: (!(b3 >> 3)) & 0xf,
                    l: b3 & 0b100 != 0,
                    w: b3 & 0x80 != 0,
                    r: b2 & 0x80 == 0,
                    x: b2 & 0x40 == 0,
                    b: b2 & 0x20 == 0,
                });
                return Ok(prefixes);
            }
            // 0x62 is BOUND in 32-bit mode unless the would-be payload has
            // mod == 11 (which BOUND's memory-only operand cannot encode).
            0x62 if evex_valid(mode, cur) => {
                let p0 = cur.fetch_u8()?;
                let p1 = cur.fetch_u8()?;
                let _p2 = cur.fetch_u8()?;
                prefixes.evex = Some(Evex {
                    map: p0 & 0b11,
                    pp: p1 & 0b11,
                    vvvv: (!(p1 >> 3)) & 0xf,
                    w: p1 & 0x80 != 0,
                });
                return Ok(prefixes);
            }
            _ => {
                cur.unfetch();
                return Ok(prefixes);
            }
        }
    }
}

fn set_segment(mode: DecodeMode, prefixes: &mut Prefixes, seg: SegReg) {
    // In 64-bit mode CS/DS/ES/SS overrides are architectural no-ops; they
    // must not clobber a meaningful FS/GS override seen earlier.
    if !mode.is_64bit() {
        prefixes.segment = Some(seg);
    }
}

fn is_legacy_prefix(b: u8) -> bool {
    matches!(
        b,
        0xf0 | 0xf2 | 0xf3 | 0x26 | 0x2e | 0x36 | 0x3e | 0x64 | 0x65 | 0x66 | 0x67
    )
}

/// In 32-bit mode `C5` is LDS unless the would-be second byte has its top
/// two ModRM bits set (mod == 0b11), which LDS cannot encode.
fn vex2_valid(mode: DecodeMode, cur: &Cursor<'_>) -> bool {
    match (mode, cur.peek()) {
        (DecodeMode::Bits64, Some(_)) => true,
        (DecodeMode::Bits32, Some(next)) => next >> 6 == 0b11,
        (_, None) => true, // let the fetch report Truncated
    }
}

/// Same ambiguity for `C4` (LES).
fn vex3_valid(mode: DecodeMode, cur: &Cursor<'_>) -> bool {
    match (mode, cur.peek()) {
        (DecodeMode::Bits64, Some(_)) => true,
        (DecodeMode::Bits32, Some(next)) => next >> 6 == 0b11,
        (_, None) => true,
    }
}

/// And for `62` (BOUND).
fn evex_valid(mode: DecodeMode, cur: &Cursor<'_>) -> bool {
    match (mode, cur.peek()) {
        (DecodeMode::Bits64, Some(_)) => true,
        (DecodeMode::Bits32, Some(next)) => next >> 6 == 0b11,
        (_, None) => true,
    }
}
