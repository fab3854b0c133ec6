//! Control flow: branches, calls, returns, software interrupts, syscalls,
//! thunks, and the odd system instructions that end a block.

use opal_cpu_core::state::{self, CpuState};
use opal_decoder::DecodedInst;
use opal_types::{CondCode, Flag, Gpr, OsAbi, SegReg, Width};

use crate::dispatch::OpDispatcher;
use crate::ir::{
    BreakReason, Cond, FenceKind, Instr, Terminator,
};
use crate::lower::unimplemented_op;

/// Relative Jcc: both edges resolved against the pre-computed block set;
/// unknown edges get synthesized exit stubs.
pub(crate) fn cond_jump(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;

    let one = d.const_(Width::W64, 1);
    let zero = d.const_(Width::W64, 0);
    let cc = CondCode::from_nibble(op.opcode & 0xf);
    let cond = d.select_cc(cc, one, zero);

    let disp = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
    let target = op.next_pc().wrapping_add(disp);
    let fallthrough = op.next_pc();

    let then_bb = match d.jump_target_block(target) {
        Some(block) => block,
        None => d.exit_stub(target),
    };
    let else_bb = match d.jump_target_block(fallthrough) {
        Some(block) => block,
        None => d.exit_stub(fallthrough),
    };

    d.terminate(Terminator::CondJump {
        cond,
        then_bb,
        else_bb,
    });
}

/// JCXZ/JECXZ/JRCXZ.
pub(crate) fn jrcxz(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;

    let counter_width = if op.prefixes.address_size_override {
        Width::W32
    } else {
        d.gpr_width()
    };
    let counter = d.load_gpr(Gpr::Rcx, counter_width);
    let zero = d.const_(counter_width, 0);
    let one64 = d.const_(Width::W64, 1);
    let zero64 = d.const_(Width::W64, 0);
    let cond = d.select(Cond::Eq, counter_width, counter, zero, one64, zero64);

    let disp = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
    branch_to(d, op, cond, op.next_pc().wrapping_add(disp));
}

/// LOOP / LOOPE / LOOPNE.
pub(crate) fn loop_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;

    let counter_width = if op.prefixes.address_size_override {
        Width::W32
    } else {
        d.gpr_width()
    };
    let counter = d.load_gpr(Gpr::Rcx, counter_width);
    let one = d.const_(counter_width, 1);
    let next = d.sub(counter_width, counter, one);
    // The count register write ignores the operand-size rules on purpose:
    // LOOP with a 32-bit address size writes ECX (zero-extending).
    if counter_width == Width::W32 && d.config.is_64bit_mode {
        let extended = d.bfe(Width::W64, 32, 0, next);
        d.store_ctx(Width::W64, CpuState::gpr_offset(Gpr::Rcx), extended);
    } else {
        d.store_ctx(counter_width, CpuState::gpr_offset(Gpr::Rcx), next);
    }

    let zero = d.const_(counter_width, 0);
    let one64 = d.const_(Width::W64, 1);
    let zero64 = d.const_(Width::W64, 0);
    let mut cond = d.select(Cond::Neq, counter_width, next, zero, one64, zero64);

    // LOOPE continues while ZF=1, LOOPNE while ZF=0.
    let check_zf = op.opcode != 0xe2;
    if check_zf {
        let mut zf = d.get_flag(Flag::Zf);
        if op.opcode == 0xe0 {
            let one8 = d.const_(Width::W8, 1);
            zf = d.xor(Width::W8, zf, one8);
        }
        cond = d.and(Width::W8, cond, zf);
    }

    let disp = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
    branch_to(d, op, cond, op.next_pc().wrapping_add(disp));
}

fn branch_to(d: &mut OpDispatcher<'_>, op: &DecodedInst, cond: crate::ir::ValueId, target: u64) {
    let then_bb = match d.jump_target_block(target) {
        Some(block) => block,
        None => d.exit_stub(target),
    };
    let else_bb = match d.jump_target_block(op.next_pc()) {
        Some(block) => block,
        None => d.exit_stub(op.next_pc()),
    };
    d.terminate(Terminator::CondJump {
        cond,
        then_bb,
        else_bb,
    });
}

/// Unconditional relative JMP.
pub(crate) fn jmp_rel(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;
    let disp = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
    let target = op.next_pc().wrapping_add(disp);

    if let Some(block) = d.jump_target_block(target) {
        d.terminate(Terminator::Jump { target: block });
    } else {
        let rip = d.entrypoint_offset(target);
        d.terminate(Terminator::ExitFunction { rip });
    }
}

pub(crate) fn jmp_indirect(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;
    let dest = op.dest.expect("indirect JMP operand");
    let rip = d.load_source(op, &dest);
    d.terminate(Terminator::ExitFunction { rip });
}

/// CALL rel32: push the return PC, record the shadow-stack hint, exit.
pub(crate) fn call_rel(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;
    if d.config.abi_local_flags {
        d.invalidate_all_flags();
    }

    let disp = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
    let target = op.next_pc().wrapping_add(disp);
    let return_pc = push_return_address(d, op);
    d.append(Instr::CallRetPush {
        expected: return_pc,
    }, d.gpr_width());

    let rip = d.entrypoint_offset(target);
    d.terminate(Terminator::ExitFunction { rip });
}

pub(crate) fn call_indirect(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;
    if d.config.abi_local_flags {
        d.invalidate_all_flags();
    }

    let dest = op.dest.expect("indirect CALL operand");
    let rip = d.load_source(op, &dest);
    let return_pc = push_return_address(d, op);
    d.append(Instr::CallRetPush {
        expected: return_pc,
    }, d.gpr_width());

    d.terminate(Terminator::ExitFunction { rip });
}

/// Stack push of the return address; yields the pushed PC value.
fn push_return_address(
    d: &mut OpDispatcher<'_>,
    op: &DecodedInst,
) -> crate::ir::ValueId {
    let gpr_w = d.gpr_width();
    let size = d.const_(gpr_w, u64::from(gpr_w.bytes()));
    let old_sp = d.load_gpr_native(Gpr::Rsp);
    let new_sp = d.sub(gpr_w, old_sp, size);
    d.store_gpr_native(Gpr::Rsp, new_sp);

    let return_pc = d.dynamic_pc(op, 0);
    d.append(
        Instr::StoreMem {
            addr: new_sp,
            value: return_pc,
            tso: true,
        },
        gpr_w,
    );
    return_pc
}

/// RET / RET imm16.
pub(crate) fn ret_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;
    if d.config.abi_local_flags {
        d.invalidate_all_flags();
    }

    let gpr_w = d.gpr_width();
    let size = d.const_(gpr_w, u64::from(gpr_w.bytes()));
    let old_sp = d.load_gpr_native(Gpr::Rsp);
    let new_rip = d.append(
        Instr::LoadMem {
            addr: old_sp,
            tso: true,
        },
        gpr_w,
    );

    let mut new_sp = d.add(gpr_w, old_sp, size);
    if op.opcode == 0xc2 {
        let extra = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0);
        let extra = d.const_(gpr_w, extra);
        new_sp = d.add(gpr_w, new_sp, extra);
    }
    d.store_gpr_native(Gpr::Rsp, new_sp);

    d.append(Instr::CallRetPop { expected: new_rip }, gpr_w);
    d.terminate(Terminator::ExitFunction { rip: new_rip });
}

/// IRET: pop RIP, CS, EFLAGS (and RSP/SS in 64-bit mode).
pub(crate) fn iret(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let _ = op;
    d.block_set_rip = true;
    let gpr_w = d.gpr_width();
    let size = d.const_(gpr_w, u64::from(gpr_w.bytes()));

    let mut sp = d.load_gpr_native(Gpr::Rsp);
    let new_rip = d.append(Instr::LoadMem { addr: sp, tso: true }, gpr_w);
    sp = d.add(gpr_w, sp, size);

    let cs = d.append(Instr::LoadMem { addr: sp, tso: true }, gpr_w);
    d.store_ctx(Width::W16, CpuState::seg_selector_offset(SegReg::Cs), cs);
    sp = d.add(gpr_w, sp, size);

    let rflags = d.append(Instr::LoadMem { addr: sp, tso: true }, gpr_w);
    d.set_packed_rflags(rflags, false);
    sp = d.add(gpr_w, sp, size);

    if d.config.is_64bit_mode {
        let new_sp = d.append(Instr::LoadMem { addr: sp, tso: true }, gpr_w);
        sp = d.add(gpr_w, sp, size);
        let ss = d.append(Instr::LoadMem { addr: sp, tso: true }, gpr_w);
        d.store_ctx(Width::W16, CpuState::seg_selector_offset(SegReg::Ss), ss);
        d.store_gpr_native(Gpr::Rsp, new_sp);
    } else {
        d.store_gpr_native(Gpr::Rsp, sp);
    }

    d.terminate(Terminator::ExitFunction { rip: new_rip });
}

/// INT3 / INT imm8 / INTO. `INT 0x80` in 32-bit mode is the legacy Linux
/// syscall gate.
pub(crate) fn int_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.opcode {
        0xcc => trap(d, op, BreakReason::Int3, true),
        0xce => {
            if d.config.is_64bit_mode {
                unimplemented_op(d, op);
            } else {
                trap(d, op, BreakReason::Overflow, false)
            }
        }
        _ => {
            let vector = op.src(0).and_then(|s| s.imm_value()).unwrap_or(0) as u8;
            if vector == 0x80 && !d.config.is_64bit_mode {
                syscall_op(d, op);
            } else {
                trap(d, op, BreakReason::Int(vector), true)
            }
        }
    }
}

pub(crate) fn privileged(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    trap(d, op, BreakReason::Privileged, false);
}

/// Emit a synchronous trap. Traps report the following PC, faults the
/// faulting PC.
fn trap(d: &mut OpDispatcher<'_>, op: &DecodedInst, reason: BreakReason, is_trap: bool) {
    d.block_set_rip = true;
    let report_pc = if is_trap { op.next_pc() } else { op.pc };
    let rip = d.entrypoint_offset(report_pc);
    d.store_ctx(d.gpr_width(), state::OFFSET_RIP, rip);
    d.append(Instr::Break { reason }, Width::W8);
    d.terminate(Terminator::ExitFunction { rip });
}

/// SYSCALL (and INT 0x80 in 32-bit mode): RIP is advanced *before* the
/// syscall node so a signal-driven re-entry observes the correct PC.
pub(crate) fn syscall_op(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let gpr_w = d.gpr_width();
    let abi = match (d.config.osabi, d.config.is_64bit_mode) {
        (abi, true) => abi,
        // 32-bit INT 0x80 always takes the 32-bit convention.
        (OsAbi::Linux64, false) => OsAbi::Linux32,
        (abi, false) => abi,
    };
    let regs = abi.syscall_regs();

    let next_rip = d.dynamic_pc(op, 0);
    d.store_ctx(gpr_w, state::OFFSET_RIP, next_rip);

    let mut args = [crate::ir::ValueId(0); 7];
    for (slot, reg) in args.iter_mut().zip(regs) {
        *slot = d.load_gpr(reg, gpr_w);
    }
    let result = d.append(Instr::Syscall { args }, gpr_w);
    d.store_ctx(gpr_w, CpuState::gpr_offset(Gpr::Rax), result);
    d.clear_flags_memo();
}

/// Reserved `0F 3F` thunk encoding: hand control to the thunk dispatcher
/// with the 16-byte hash, then return like a RET.
pub(crate) fn thunk(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    d.block_set_rip = true;
    let Some(hash) = op.thunk_hash else {
        unimplemented_op(d, op);
        return;
    };
    let gpr_w = d.gpr_width();
    let arg = d.load_gpr(Gpr::Rdi, gpr_w);
    d.append(Instr::Thunk { hash, arg }, gpr_w);

    let size = d.const_(gpr_w, u64::from(gpr_w.bytes()));
    let old_sp = d.load_gpr_native(Gpr::Rsp);
    let new_rip = d.append(
        Instr::LoadMem {
            addr: old_sp,
            tso: true,
        },
        gpr_w,
    );
    let new_sp = d.add(gpr_w, old_sp, size);
    d.store_gpr_native(Gpr::Rsp, new_sp);
    d.terminate(Terminator::ExitFunction { rip: new_rip });
}

/// CPUID: leaf in EAX, subleaf in ECX; results written straight to context.
pub(crate) fn cpuid(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let _ = op;
    let leaf = d.load_gpr(Gpr::Rax, Width::W32);
    let subleaf = d.load_gpr(Gpr::Rcx, Width::W32);
    d.append(Instr::Cpuid { leaf, subleaf }, Width::W32);
    d.clear_flags_memo();
}

pub(crate) fn rdtsc(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    let _ = op;
    let counter = d.append(Instr::Rdtsc, Width::W64);
    let lo = d.bfe(Width::W64, 32, 0, counter);
    let hi = d.bfe(Width::W64, 32, 32, counter);
    d.store_ctx(Width::W64, CpuState::gpr_offset(Gpr::Rax), lo);
    d.store_ctx(Width::W64, CpuState::gpr_offset(Gpr::Rdx), hi);
}

/// Group 15: fences and MXCSR save/restore.
pub(crate) fn group15(d: &mut OpDispatcher<'_>, op: &DecodedInst) {
    match op.group_reg.unwrap_or(0) {
        5 if op.src(0).is_none() => {
            d.append(Instr::Fence { kind: FenceKind::Load }, Width::W8);
        }
        6 if op.src(0).is_none() => {
            d.append(Instr::Fence { kind: FenceKind::Full }, Width::W8);
        }
        7 => {
            // SFENCE in register form; CLFLUSH decodes with a memory
            // operand and needs only store ordering here.
            d.append(Instr::Fence { kind: FenceKind::Store }, Width::W8);
        }
        2 => {
            // LDMXCSR m32.
            let Some(src) = op.src(0) else {
                unimplemented_op(d, op);
                return;
            };
            let value = d.load_source_with_opsize(op, &src, Width::W32);
            d.store_ctx(Width::W32, state::OFFSET_MXCSR, value);
        }
        3 => {
            // STMXCSR m32.
            let Some(dst) = op.src(0) else {
                unimplemented_op(d, op);
                return;
            };
            let value = d.load_ctx(Width::W32, state::OFFSET_MXCSR);
            d.store_result_with_opsize(op, &dst, value, Width::W32);
        }
        _ => unimplemented_op(d, op),
    }
}
