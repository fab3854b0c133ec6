//! Region discovery and the translation driver.
//!
//! A pre-pass walks direct branches from the entry PC to fix the set of
//! block entry PCs for the region; the driver then decodes each block's
//! instruction run and feeds it through the dispatcher.

use std::collections::{BTreeSet, VecDeque};

use opal_cpu_core::{Config, GuestMem};
use opal_decoder::{decode_one, DecodeMode, DecodedInst, OpcodeMap, MAX_INSTRUCTION_LEN};

use crate::dispatch::OpDispatcher;
use crate::ir::Function;

/// Bounds on region formation.
#[derive(Debug, Clone, Copy)]
pub struct BlockLimits {
    /// Maximum number of distinct block entries per region.
    pub max_blocks: usize,
    /// Maximum instructions decoded per block.
    pub max_instructions: usize,
    /// Branch targets further than this from the entry stay out of the
    /// region.
    pub max_region_span: u64,
}

impl Default for BlockLimits {
    fn default() -> Self {
        BlockLimits {
            max_blocks: 64,
            max_instructions: 512,
            max_region_span: 4096,
        }
    }
}

fn decode_mode(config: &Config) -> DecodeMode {
    if config.is_64bit_mode {
        DecodeMode::Bits64
    } else {
        DecodeMode::Bits32
    }
}

fn fetch(bus: &impl GuestMem, pc: u64) -> [u8; MAX_INSTRUCTION_LEN] {
    let mut bytes = [0u8; MAX_INSTRUCTION_LEN];
    bus.read_bytes(pc, &mut bytes);
    bytes
}

/// A decoded direct branch: taken target plus whether it falls through.
fn direct_branch_targets(inst: &DecodedInst) -> Option<(u64, bool)> {
    match inst.map {
        OpcodeMap::Primary => match inst.opcode {
            // Jcc rel8, LOOP family, JrCXZ: conditional.
            0x70..=0x7f | 0xe0..=0xe3 => {
                let disp = inst.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
                Some((inst.next_pc().wrapping_add(disp), true))
            }
            // JMP rel: unconditional.
            0xe9 | 0xeb => {
                let disp = inst.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
                Some((inst.next_pc().wrapping_add(disp), false))
            }
            _ => None,
        },
        OpcodeMap::Secondary => match inst.opcode {
            0x80..=0x8f => {
                let disp = inst.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
                Some((inst.next_pc().wrapping_add(disp), true))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Whether this instruction unconditionally leaves the region.
fn ends_block(inst: &DecodedInst) -> bool {
    match inst.map {
        OpcodeMap::Primary => matches!(
            inst.opcode,
            0xc2 | 0xc3 | 0xcb | 0xcc | 0xcd | 0xce | 0xcf | 0xe8 | 0xf4
        ) || (matches!(inst.opcode, 0xff) && matches!(inst.group_reg, Some(2..=5))),
        OpcodeMap::Secondary => matches!(inst.opcode, 0x05 | 0x3f),
        _ => false,
    }
}

/// Walk direct branches from `entry` and return the region's block entries.
pub fn discover_block_entries(
    bus: &impl GuestMem,
    config: &Config,
    entry: u64,
    limits: &BlockLimits,
) -> Vec<u64> {
    let mode = decode_mode(config);
    let mut entries: BTreeSet<u64> = BTreeSet::new();
    entries.insert(entry);

    if !config.multiblock {
        return entries.into_iter().collect();
    }

    let lo = entry.saturating_sub(limits.max_region_span);
    let hi = entry.saturating_add(limits.max_region_span);
    let in_range = |pc: u64| pc >= lo && pc <= hi;

    let mut queue: VecDeque<u64> = VecDeque::new();
    queue.push_back(entry);
    let mut walked: BTreeSet<u64> = BTreeSet::new();

    while let Some(start) = queue.pop_front() {
        if !walked.insert(start) {
            continue;
        }
        let mut pc = start;
        for _ in 0..limits.max_instructions {
            let bytes = fetch(bus, pc);
            let Ok(inst) = decode_one(mode, pc, &bytes) else {
                break;
            };
            if let Some((target, conditional)) = direct_branch_targets(&inst) {
                let mut add = |pc: u64| {
                    if in_range(pc) && entries.len() < limits.max_blocks && entries.insert(pc) {
                        queue.push_back(pc);
                    }
                };
                add(target);
                if conditional {
                    add(inst.next_pc());
                }
                break;
            }
            if ends_block(&inst) {
                break;
            }
            pc = inst.next_pc();
        }
    }

    entries.into_iter().collect()
}

/// Translate one region rooted at `entry` into an IR function.
pub fn build_function(
    bus: &impl GuestMem,
    config: &Config,
    entry: u64,
    limits: BlockLimits,
) -> Function {
    let mode = decode_mode(config);
    let entries = discover_block_entries(bus, config, entry, &limits);
    let entry_set: BTreeSet<u64> = entries.iter().copied().collect();

    let mut dispatcher = OpDispatcher::new(config);
    dispatcher.begin_function(entry, &entries);

    for &block_pc in &entries {
        if !dispatcher.start_block(block_pc) {
            continue;
        }
        let mut pc = block_pc;
        let mut decoded = 0usize;
        loop {
            let bytes = fetch(bus, pc);
            match decode_one(mode, pc, &bytes) {
                Err(_) => {
                    dispatcher.end_block_with_exit(pc);
                    break;
                }
                Ok(inst) => {
                    dispatcher.dispatch(&inst);
                    if dispatcher.had_decode_failure() {
                        dispatcher.end_block_with_exit(pc);
                        break;
                    }
                    if dispatcher.block_ended() {
                        break;
                    }
                    pc = inst.next_pc();
                    decoded += 1;
                    if entry_set.contains(&pc) {
                        dispatcher.end_block_at(pc);
                        break;
                    }
                    if decoded >= limits.max_instructions {
                        dispatcher.end_block_at(pc);
                        break;
                    }
                }
            }
        }
    }

    dispatcher.finalize()
}
