//! The op dispatcher: DecodedInst in, SSA IR out.
//!
//! `begin_function` / `dispatch` / `finalize` are the stable surface. The
//! per-instruction lowering lives in the `lower` modules; this file owns the
//! block graph, operand plumbing and context addressing.

use std::collections::BTreeMap;

use opal_cpu_core::state::{self, CpuState};
use opal_cpu_core::Config;
use opal_decoder::{DecodedInst, MemRef, Operand};
use opal_types::{Flag, Gpr, SegReg, Width};

use crate::flags::FlagsMemo;
use crate::ir::{
    AluKind, BlockId, Cond, Function, Instr, Terminator, UnaryKind, ValueId,
};

struct JumpTarget {
    block: BlockId,
    emitted: bool,
}

/// Lowers one decoded instruction stream into one IR function.
pub struct OpDispatcher<'c> {
    pub(crate) config: &'c Config,
    pub(crate) func: Function,
    cur: BlockId,
    jump_targets: BTreeMap<u64, JumpTarget>,
    /// Set by control-flow lowering when the block's RIP is already stored.
    pub(crate) block_set_rip: bool,
    /// Set when an instruction could not be translated; the driver ends the
    /// block with an exit to the faulting PC.
    pub(crate) decode_failure: bool,
    pub(crate) flags_memo: Option<FlagsMemo>,
    /// Latched by atomic lowering so no extra fence is synthesized for a
    /// LOCK prefix that was already honored.
    pub(crate) lock_handled: bool,
}

impl<'c> OpDispatcher<'c> {
    #[must_use]
    pub fn new(config: &'c Config) -> Self {
        OpDispatcher {
            config,
            func: Function::new(0),
            cur: BlockId(0),
            jump_targets: BTreeMap::new(),
            block_set_rip: false,
            decode_failure: false,
            flags_memo: None,
            lock_handled: false,
        }
    }

    /// Start a new IR unit with the pre-computed set of intra-region block
    /// entry PCs (which must include `entry_pc`).
    pub fn begin_function(&mut self, entry_pc: u64, block_pcs: &[u64]) {
        self.func = Function::new(entry_pc);
        self.jump_targets.clear();
        for &pc in block_pcs {
            let block = self.func.create_block(Some(pc));
            self.jump_targets.insert(pc, JumpTarget {
                block,
                emitted: false,
            });
        }
        let entry = self
            .jump_targets
            .get(&entry_pc)
            .map(|t| t.block)
            .unwrap_or_else(|| self.func.create_block(Some(entry_pc)));
        self.func.entry = entry;
        self.set_current_block(entry);
    }

    /// Position the dispatcher at the jump-target block for `pc` and mark it
    /// emitted. Returns false if `pc` is not a known block entry.
    pub fn start_block(&mut self, pc: u64) -> bool {
        let Some(target) = self.jump_targets.get_mut(&pc) else {
            return false;
        };
        target.emitted = true;
        let block = target.block;
        self.set_current_block(block);
        self.decode_failure = false;
        true
    }

    /// Close an open block with an exit at `pc` (the decode-failure path:
    /// re-entry surfaces `#UD` if the bytes are still undecodable).
    pub fn end_block_with_exit(&mut self, pc: u64) {
        if self.func.is_terminated(self.cur) {
            return;
        }
        let rip = self.entrypoint_offset(pc);
        self.func
            .set_terminator(self.cur, Terminator::ExitFunction { rip });
    }

    pub(crate) fn set_current_block(&mut self, block: BlockId) {
        self.cur = block;
        // Flag memoization never crosses a block boundary.
        self.flags_memo = None;
        self.block_set_rip = false;
    }

    /// Append IR for one instruction to the current block.
    pub fn dispatch(&mut self, op: &DecodedInst) {
        self.lock_handled = false;
        crate::lower::lower(self, op);
        debug_assert!(
            !op.prefixes.lock || self.lock_handled || self.decode_failure,
            "LOCK prefix reached lowering without an atomic expansion"
        );
    }

    /// Whether the current block has been closed by control flow.
    #[must_use]
    pub fn block_ended(&self) -> bool {
        self.func.is_terminated(self.cur) || self.block_set_rip || self.decode_failure
    }

    #[must_use]
    pub fn had_decode_failure(&self) -> bool {
        self.decode_failure
    }

    /// End an open block that fell through to `next_pc`.
    pub fn end_block_at(&mut self, next_pc: u64) {
        if self.func.is_terminated(self.cur) {
            return;
        }
        if let Some(target) = self.jump_targets.get(&next_pc) {
            let target = target.block;
            self.func
                .set_terminator(self.cur, Terminator::Jump { target });
        } else {
            let rip = self.entrypoint_offset(next_pc);
            self.func
                .set_terminator(self.cur, Terminator::ExitFunction { rip });
        }
    }

    /// Close any block that never got emitted with an exit back to the
    /// dispatcher at its own entry PC.
    pub fn finalize(&mut self) -> Function {
        let pending: Vec<(u64, BlockId)> = self
            .jump_targets
            .iter()
            .filter(|(_, t)| !t.emitted)
            .map(|(pc, t)| (*pc, t.block))
            .collect();
        for (pc, block) in pending {
            self.set_current_block(block);
            let rip = self.entrypoint_offset(pc);
            self.func
                .set_terminator(block, Terminator::ExitFunction { rip });
        }
        std::mem::replace(&mut self.func, Function::new(0))
    }

    // -- low-level emitters ---------------------------------------------

    pub(crate) fn append(&mut self, instr: Instr, width: Width) -> ValueId {
        self.func.append(self.cur, instr, width)
    }

    pub(crate) fn terminate(&mut self, term: Terminator) {
        self.func.set_terminator(self.cur, term);
    }

    pub(crate) fn const_(&mut self, width: Width, value: u64) -> ValueId {
        self.append(
            Instr::Const {
                value: width.truncate(value),
            },
            width,
        )
    }

    /// The effective GPR width of the operating mode (8 bytes in 64-bit).
    pub(crate) fn gpr_width(&self) -> Width {
        if self.config.is_64bit_mode {
            Width::W64
        } else {
            Width::W32
        }
    }

    pub(crate) fn load_ctx(&mut self, width: Width, offset: usize) -> ValueId {
        self.append(Instr::LoadContext { offset }, width)
    }

    pub(crate) fn store_ctx(&mut self, width: Width, offset: usize, value: ValueId) {
        self.append(Instr::StoreContext { offset, value }, width);
    }

    pub(crate) fn load_gpr(&mut self, reg: Gpr, width: Width) -> ValueId {
        self.load_ctx(width, CpuState::gpr_offset(reg))
    }

    /// Full-GPR-width load (address math, stack pointers).
    pub(crate) fn load_gpr_native(&mut self, reg: Gpr) -> ValueId {
        let w = self.gpr_width();
        self.load_gpr(reg, w)
    }

    pub(crate) fn store_gpr_native(&mut self, reg: Gpr, value: ValueId) {
        let w = self.gpr_width();
        self.store_ctx(w, CpuState::gpr_offset(reg), value);
    }

    pub(crate) fn alu(&mut self, kind: AluKind, width: Width, a: ValueId, b: ValueId) -> ValueId {
        self.append(Instr::Alu { kind, a, b }, width)
    }

    pub(crate) fn add(&mut self, width: Width, a: ValueId, b: ValueId) -> ValueId {
        self.alu(AluKind::Add, width, a, b)
    }

    pub(crate) fn sub(&mut self, width: Width, a: ValueId, b: ValueId) -> ValueId {
        self.alu(AluKind::Sub, width, a, b)
    }

    pub(crate) fn and(&mut self, width: Width, a: ValueId, b: ValueId) -> ValueId {
        self.alu(AluKind::And, width, a, b)
    }

    pub(crate) fn or(&mut self, width: Width, a: ValueId, b: ValueId) -> ValueId {
        self.alu(AluKind::Or, width, a, b)
    }

    pub(crate) fn xor(&mut self, width: Width, a: ValueId, b: ValueId) -> ValueId {
        self.alu(AluKind::Xor, width, a, b)
    }

    pub(crate) fn unary(&mut self, kind: UnaryKind, width: Width, a: ValueId) -> ValueId {
        self.append(Instr::Unary { kind, a }, width)
    }

    pub(crate) fn bfe(&mut self, width: Width, bits: u8, shift: u8, src: ValueId) -> ValueId {
        self.append(Instr::Bfe { bits, shift, src }, width)
    }

    pub(crate) fn sbfe(&mut self, width: Width, bits: u8, shift: u8, src: ValueId) -> ValueId {
        self.append(Instr::Sbfe { bits, shift, src }, width)
    }

    pub(crate) fn bfi(
        &mut self,
        width: Width,
        bits: u8,
        shift: u8,
        dst: ValueId,
        src: ValueId,
    ) -> ValueId {
        self.append(Instr::Bfi {
            bits,
            shift,
            dst,
            src,
        }, width)
    }

    pub(crate) fn select(
        &mut self,
        cond: Cond,
        cmp_width: Width,
        a: ValueId,
        b: ValueId,
        true_val: ValueId,
        false_val: ValueId,
    ) -> ValueId {
        self.append(
            Instr::Select {
                cond,
                cmp_width,
                a,
                b,
                true_val,
                false_val,
            },
            Width::W64,
        )
    }

    /// Materialize `entry + (pc - entry)` for a literal guest PC.
    pub(crate) fn entrypoint_offset(&mut self, pc: u64) -> ValueId {
        let offset = pc.wrapping_sub(self.func.entry_rip) as i64;
        self.append(Instr::EntrypointOffset { offset }, self.gpr_width())
    }

    /// The PC of the instruction after `op`, plus an optional displacement.
    pub(crate) fn dynamic_pc(&mut self, op: &DecodedInst, disp: i64) -> ValueId {
        self.entrypoint_offset(op.next_pc().wrapping_add(disp as u64))
    }

    pub(crate) fn jump_target_block(&self, pc: u64) -> Option<BlockId> {
        if !self.config.multiblock {
            return None;
        }
        self.jump_targets.get(&pc).map(|t| t.block)
    }

    /// Create a synthesized block (no guest PC) placed after the current
    /// one, for exit stubs and loop expansion.
    pub(crate) fn create_block(&mut self) -> BlockId {
        self.func.create_block(None)
    }

    // -- segmentation -----------------------------------------------------

    /// Fold the applicable segment base into `addr`.
    ///
    /// In 64-bit mode only FS/GS contribute; everything else is ignored. In
    /// 32-bit mode the selected segment's descriptor base is fetched through
    /// the GDT. `default_seg` applies when no override prefix is present;
    /// `force` pins it regardless of prefixes (string destinations are
    /// always ES).
    pub(crate) fn append_segment_offset(
        &mut self,
        addr: ValueId,
        op: &DecodedInst,
        default_seg: Option<SegReg>,
        force: bool,
    ) -> ValueId {
        if self.config.is_64bit_mode {
            // Forced segments are always ES/DS, whose bases are zero here.
            let base_offset = match op.prefixes.segment {
                Some(SegReg::Fs) if !force => state::OFFSET_FS_BASE,
                Some(SegReg::Gs) if !force => state::OFFSET_GS_BASE,
                _ => return addr,
            };
            let base = self.load_ctx(Width::W64, base_offset);
            return self.add(Width::W64, addr, base);
        }

        let seg = if force {
            default_seg
        } else {
            op.prefixes.segment.or(default_seg)
        };
        let Some(seg) = seg else { return addr };
        let selector = self.load_ctx(Width::W16, CpuState::seg_selector_offset(seg));
        let three = self.const_(Width::W16, 3);
        let index = self.alu(AluKind::Shr, Width::W16, selector, three);
        let base = self.append(
            Instr::LoadContextIndexed {
                base_offset: state::OFFSET_GDT,
                stride: 8,
                index,
            },
            Width::W32,
        );
        self.add(Width::W32, addr, base)
    }

    // -- operand plumbing -------------------------------------------------

    /// Compute the effective address of a memory operand (segment folded
    /// in). The second return is whether the operand is `[rsp]`-anchored.
    pub(crate) fn mem_address(
        &mut self,
        op: &DecodedInst,
        mem: &MemRef,
        default_seg: Option<SegReg>,
    ) -> (ValueId, bool) {
        let (addr, stack) = self.mem_address_raw(op, mem);
        (
            self.append_segment_offset(addr, op, default_seg, false),
            stack,
        )
    }

    /// Effective address without segmentation (LEA ignores segment
    /// prefixes).
    pub(crate) fn mem_address_raw(&mut self, op: &DecodedInst, mem: &MemRef) -> (ValueId, bool) {
        let addr_w = op.addr_width;
        let gpr_w = self.gpr_width();
        let (mut addr, stack) = match *mem {
            MemRef::Direct { base } => (self.load_gpr(base, addr_w), base == Gpr::Rsp),
            MemRef::Indirect { base, disp } => {
                let reg = self.load_gpr(base, addr_w);
                let disp = self.const_(gpr_w, disp as i64 as u64);
                (self.add(gpr_w, reg, disp), base == Gpr::Rsp)
            }
            MemRef::Sib {
                base,
                index,
                scale,
                disp,
            } => {
                let mut stack = false;
                let mut acc: Option<ValueId> = None;
                if let Some(index) = index {
                    let mut value = self.load_gpr(index, addr_w);
                    if scale != 1 {
                        let scale = self.const_(gpr_w, u64::from(scale));
                        value = self.alu(AluKind::Mul, gpr_w, value, scale);
                    }
                    stack |= index == Gpr::Rsp;
                    acc = Some(value);
                }
                if let Some(base) = base {
                    let reg = self.load_gpr(base, addr_w);
                    acc = Some(match acc {
                        Some(prev) => self.add(gpr_w, prev, reg),
                        None => reg,
                    });
                    stack |= base == Gpr::Rsp;
                }
                let addr = match (acc, disp) {
                    (Some(acc), 0) => acc,
                    (Some(acc), disp) => {
                        let disp = self.const_(gpr_w, disp as i64 as u64);
                        self.add(gpr_w, acc, disp)
                    }
                    (None, disp) => self.const_(gpr_w, disp as i64 as u64),
                };
                (addr, stack)
            }
            MemRef::RipRelative { disp } => {
                let pc = op.next_pc().wrapping_add(disp as i64 as u64);
                (self.entrypoint_offset(pc), false)
            }
            MemRef::Absolute { addr } => (self.const_(gpr_w, addr), false),
        };

        if addr_w < gpr_w {
            addr = self.bfe(gpr_w, addr_w.bits() as u8, 0, addr);
        }
        (addr, stack)
    }

    /// Synthesize an exit-stub block that leaves the region at `pc`,
    /// without disturbing the current block.
    pub(crate) fn exit_stub(&mut self, pc: u64) -> BlockId {
        let block = self.func.create_block(None);
        let offset = pc.wrapping_sub(self.func.entry_rip) as i64;
        let width = self.gpr_width();
        let rip = self
            .func
            .append(block, Instr::EntrypointOffset { offset }, width);
        self.func
            .set_terminator(block, Terminator::ExitFunction { rip });
        block
    }

    /// Load an operand as a value of `width`.
    pub(crate) fn load_source_with_opsize(
        &mut self,
        op: &DecodedInst,
        operand: &Operand,
        width: Width,
    ) -> ValueId {
        match *operand {
            Operand::Imm { value, width: iw } => {
                let w = if iw > width { iw } else { width };
                self.const_(w, value)
            }
            Operand::Gpr { reg, high8 } => {
                let offset = CpuState::gpr_offset(reg) + usize::from(high8);
                self.load_ctx(width, offset)
            }
            Operand::Seg { seg } => {
                // 64-bit guests read FS/GS selectors as zero; the bases are
                // what matter and live separately.
                if self.config.is_64bit_mode && matches!(seg, SegReg::Fs | SegReg::Gs) {
                    self.const_(Width::W16, 0)
                } else {
                    self.load_ctx(Width::W16, CpuState::seg_selector_offset(seg))
                }
            }
            Operand::Mem(ref mem) => {
                let (addr, stack) = self.mem_address(op, mem, None);
                self.append(Instr::LoadMem { addr, tso: stack }, width)
            }
            Operand::Xmm { .. } | Operand::Mmx { .. } => {
                unreachable!("vector operands load through the vector path")
            }
        }
    }

    pub(crate) fn load_source(&mut self, op: &DecodedInst, operand: &Operand) -> ValueId {
        self.load_source_with_opsize(op, operand, op.op_width)
    }

    /// Store `value` to an operand destination with the architectural GPR
    /// merge rules (32-bit zero-extends, 8/16-bit preserve).
    pub(crate) fn store_result_with_opsize(
        &mut self,
        op: &DecodedInst,
        operand: &Operand,
        value: ValueId,
        width: Width,
    ) {
        match *operand {
            Operand::Gpr { reg, high8 } => {
                if self.config.is_64bit_mode && width == Width::W32 {
                    debug_assert!(!high8);
                    let extended = self.bfe(Width::W64, 32, 0, value);
                    self.store_ctx(Width::W64, CpuState::gpr_offset(reg), extended);
                } else {
                    let offset = CpuState::gpr_offset(reg) + usize::from(high8);
                    self.store_ctx(width, offset, value);
                }
            }
            Operand::Seg { seg } => {
                // Writes to FS/GS selectors in 64-bit mode are rejected as
                // unsupported (the bases are managed via syscalls).
                if self.config.is_64bit_mode && matches!(seg, SegReg::Fs | SegReg::Gs) {
                    self.decode_failure = true;
                    return;
                }
                self.store_ctx(Width::W16, CpuState::seg_selector_offset(seg), value);
            }
            Operand::Mem(ref mem) => {
                let (addr, stack) = self.mem_address(op, mem, None);
                self.append(
                    Instr::StoreMem {
                        addr,
                        value,
                        tso: stack,
                    },
                    width,
                );
            }
            Operand::Imm { .. } => unreachable!("immediate destination"),
            Operand::Xmm { .. } | Operand::Mmx { .. } => {
                unreachable!("vector operands store through the vector path")
            }
        }
    }

    pub(crate) fn store_result(&mut self, op: &DecodedInst, operand: &Operand, value: ValueId) {
        self.store_result_with_opsize(op, operand, value, op.op_width);
    }

    // -- flag slot access -------------------------------------------------

    pub(crate) fn get_flag(&mut self, flag: Flag) -> ValueId {
        self.load_ctx(Width::W8, CpuState::flag_offset(flag))
    }

    pub(crate) fn set_flag_value(&mut self, flag: Flag, value: ValueId) {
        self.store_ctx(Width::W8, CpuState::flag_offset(flag), value);
    }

    pub(crate) fn set_flag_const(&mut self, flag: Flag, value: bool) {
        let c = self.const_(Width::W8, u64::from(value));
        self.set_flag_value(flag, c);
    }

    pub(crate) fn get_df(&mut self) -> ValueId {
        self.load_ctx(Width::W8, state::OFFSET_DF)
    }

    pub(crate) fn set_df(&mut self, value: ValueId) {
        self.store_ctx(Width::W8, state::OFFSET_DF, value);
    }
}
