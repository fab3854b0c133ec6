//! The decoded-instruction record and its operand forms.

use opal_types::{Gpr, SegReg, Width};

use crate::prefix::Prefixes;

/// Which opcode table the opcode byte indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeMap {
    /// One-byte map.
    Primary,
    /// Two-byte map (after 0F).
    Secondary,
    /// Three-byte map after 0F 38.
    Escape0F38,
    /// Three-byte map after 0F 3A.
    Escape0F3A,
    /// x87 escape; the payload is the escape byte (0xD8..=0xDF).
    X87(u8),
}

/// A memory operand, fully resolved except for segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRef {
    /// `[reg]`, no displacement.
    Direct { base: Gpr },
    /// `[reg + disp]`.
    Indirect { base: Gpr, disp: i32 },
    /// Full SIB form `[base + index*scale + disp]`.
    Sib {
        base: Option<Gpr>,
        index: Option<Gpr>,
        scale: u8,
        disp: i32,
    },
    /// `[rip + disp]` (64-bit mode only).
    RipRelative { disp: i32 },
    /// Absolute literal address (moffs, or disp32 outside 64-bit mode).
    Absolute { addr: u64 },
}

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Gpr { reg: Gpr, high8: bool },
    Xmm { reg: u8 },
    Mmx { reg: u8 },
    Seg { seg: SegReg },
    Imm { value: u64, width: Width },
    Mem(MemRef),
}

impl Operand {
    #[must_use]
    pub const fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    #[must_use]
    pub const fn imm_value(&self) -> Option<u64> {
        match self {
            Operand::Imm { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// A fully decoded instruction. Immutable after decode; the dispatcher's
/// lifetime for one of these ends when the block's IR is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInst {
    /// Guest address of the first byte.
    pub pc: u64,
    /// Total encoded length in bytes.
    pub len: u8,
    pub map: OpcodeMap,
    /// Opcode byte within the map. For x87 escapes this is the ModRM byte.
    pub opcode: u8,
    /// ModRM.reg for group opcodes (sub-opcode selector).
    pub group_reg: Option<u8>,
    pub prefixes: Prefixes,
    /// Resolved operand width (66 prefix / REX.W applied).
    pub op_width: Width,
    /// Resolved address width (67 prefix applied).
    pub addr_width: Width,
    pub dest: Option<Operand>,
    pub srcs: [Option<Operand>; 3],
    /// Raw ModRM byte when one was consumed.
    pub modrm: Option<u8>,
    /// Trailing 16-byte literal for the reserved thunk encoding.
    pub thunk_hash: Option<[u8; 16]>,
}

impl DecodedInst {
    /// The guest address of the following instruction.
    #[must_use]
    pub const fn next_pc(&self) -> u64 {
        self.pc + self.len as u64
    }

    #[must_use]
    pub const fn src(&self, index: usize) -> Option<Operand> {
        self.srcs[index]
    }

    /// Whether this is the canonical single-byte NOP (`90` with no REX.B):
    /// `xchg eax, eax` that must not zero-extend RAX.
    #[must_use]
    pub fn is_canonical_nop(&self) -> bool {
        matches!(self.map, OpcodeMap::Primary)
            && self.opcode == 0x90
            && !self.prefixes.rep
            && self.prefixes.rex.map_or(true, |rex| !rex.b())
    }
}
