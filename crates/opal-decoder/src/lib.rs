//! x86 / x86-64 instruction decoder.
//!
//! Transforms raw guest bytes into a structured [`DecodedInst`] — prefixes,
//! opcode map, ModRM/SIB operands, immediates — plus the exact number of
//! bytes consumed. The decoder is stateless and allocation-free; one call
//! decodes one instruction.
//!
//! Decoding runs in four phases:
//!
//! 1. prefix scanning (legacy prefixes, then REX in 64-bit mode),
//! 2. opcode fetch and map selection (primary / 0F / 0F 38 / 0F 3A /
//!    x87 escape / group sub-opcode),
//! 3. operand- and address-size resolution,
//! 4. ModRM/SIB, displacement and immediate decoding.
//!
//! Errors are non-fatal: the dispatcher answers a decode failure by ending
//! the block with an exit to the faulting PC.

mod cursor;
mod decode;
mod inst;
mod operands;
mod prefix;

pub use inst::{DecodedInst, MemRef, OpcodeMap, Operand};
pub use prefix::{Evex, Prefixes, Rex, Vex};

use thiserror::Error;

/// Architectural maximum instruction length in bytes.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Operating mode of the code being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Bits32,
    Bits64,
}

impl DecodeMode {
    #[must_use]
    pub const fn is_64bit(self) -> bool {
        matches!(self, DecodeMode::Bits64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty input")]
    EmptyInput,
    /// Ran out of bytes mid-instruction (or exceeded the 15-byte limit).
    #[error("truncated instruction")]
    Truncated,
    /// The encoding does not name a valid instruction in this mode.
    #[error("undefined opcode")]
    Undefined,
    /// A prefix combination the architecture rejects (e.g. LOCK on a
    /// non-memory destination is handled later; this is for encodings that
    /// can never be valid, like LOCK on a plain jump).
    #[error("unsupported prefix combination")]
    UnsupportedPrefixCombination,
    /// IRET with an operand-size override; kept undecodable on purpose.
    #[error("operand-size override on IRET")]
    OperandSizeOverrideOnIret,
}

/// Decode one instruction starting at `bytes[0]`, which the caller asserts
/// lives at guest address `pc`.
pub fn decode_one(mode: DecodeMode, pc: u64, bytes: &[u8]) -> Result<DecodedInst, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyInput);
    }
    decode::decode_instruction(mode, pc, bytes)
}

/// Scan only the prefix bytes, returning the prefix record and the number of
/// bytes they occupy.
pub fn scan_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<(Prefixes, usize), DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyInput);
    }
    let mut cur = cursor::Cursor::new(bytes);
    let prefixes = prefix::scan(mode, &mut cur)?;
    Ok((prefixes, cur.consumed()))
}

/// Convenience wrapper over [`scan_prefixes`] that discards the length.
pub fn decode_prefixes(mode: DecodeMode, bytes: &[u8]) -> Result<Prefixes, DecodeError> {
    scan_prefixes(mode, bytes).map(|(p, _)| p)
}
