//! The fault-routing state machine.
//!
//! Order matters: the call-ret shadow stack guard is checked first (cheap,
//! thread-local), then the VMA tracker consumes SMC faults, and only then is
//! the fault mapped to a guest exception — or passed through untouched when
//! it is neither ours nor the guest's.

use tracing::debug;

use opal_cpu_core::{GuestMem, GuestThread};
use opal_types::Gpr;
use opal_vma::{CodeInvalidator, CurrentBlockQuery, HostMem, SegfaultOutcome, VmaTracker};

use crate::classify::{classify_fault, FaultInfo, GuestException, HostSignal};
use crate::frame::build_signal_frame;

/// Host register file at the fault, as captured by the signal handler.
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    pub host_pc: u64,
    /// Statically-reserved-allocation GPR view (guest register order).
    pub sra_gprs: [u64; 16],
}

/// Contracts the JIT backend provides to the reconstructor.
pub trait JitBackend {
    /// Map a host PC inside translated code back to the guest RIP of the
    /// instruction boundary being executed.
    fn restore_rip_from_host_pc(&self, host_pc: u64) -> Option<u64>;
    /// Produce guest EFLAGS from the host register file at the fault.
    fn reconstruct_compacted_eflags(&self, ctx: &HostContext) -> u32;
    /// Whether the host PC lies inside the translated-code buffer or the
    /// dispatcher.
    fn host_pc_in_code_buffer(&self, host_pc: u64) -> bool;
}

/// What the signal handler should do with the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Not ours: deliver to the default handler unchanged.
    Passthrough,
    /// Consumed (SMC or shadow-stack guard): patch the host context and
    /// resume at the faulting instruction.
    ResumeGuest,
    /// Consumed, but the next re-execution must run the faulting
    /// instruction as a single-instruction block.
    ReenterDispatcherSingleStep,
    /// Mapped to a guest exception; guest state has been redirected to its
    /// exception dispatcher.
    GuestException(GuestException),
}

/// Everything the reconstructor needs from the runtime.
pub struct Reconstructor<'a> {
    pub backend: &'a dyn JitBackend,
    pub tracker: &'a VmaTracker,
    pub invalidator: &'a dyn CodeInvalidator,
    pub host_mem: &'a dyn HostMem,
    pub block_query: Option<&'a dyn CurrentBlockQuery>,
    /// Guest-side exception dispatcher entry (signal trampoline or
    /// `KiUserExceptionDispatcher` equivalent).
    pub dispatcher_rip: u64,
}

/// Route one host fault to one of the three outcomes: consumed-and-resume,
/// guest exception, or passthrough.
pub fn handle_host_fault(
    recon: &Reconstructor<'_>,
    thread: &mut GuestThread,
    mem: &mut impl GuestMem,
    info: &FaultInfo,
    host_ctx: &HostContext,
) -> FaultOutcome {
    // 1. Call-ret shadow stack guard faults reset the shadow SP in place.
    if matches!(info.signal, HostSignal::Segv | HostSignal::Bus) {
        let mut shadow_sp = thread.cpu.callret_sp;
        if thread
            .callret
            .handle_access_violation(info.fault_addr, &mut shadow_sp)
        {
            thread.cpu.callret_sp = shadow_sp;
            return FaultOutcome::ResumeGuest;
        }
    }

    // 2. SMC writes into tracked code.
    if matches!(info.signal, HostSignal::Segv | HostSignal::Bus) {
        match recon.tracker.handle_segfault(
            info.fault_addr,
            recon.invalidator,
            recon.host_mem,
            recon.block_query,
            host_ctx.host_pc,
        ) {
            SegfaultOutcome::Handled { single_step: false } => {
                return FaultOutcome::ResumeGuest;
            }
            SegfaultOutcome::Handled { single_step: true } => {
                return FaultOutcome::ReenterDispatcherSingleStep;
            }
            SegfaultOutcome::NotHandled => {}
        }
    }

    // 3. Guest exception, if the fault happened inside translated code.
    if !recon.backend.host_pc_in_code_buffer(host_ctx.host_pc) {
        return FaultOutcome::Passthrough;
    }
    let Some(guest_rip) = recon.backend.restore_rip_from_host_pc(host_ctx.host_pc) else {
        return FaultOutcome::Passthrough;
    };

    // Copy the statically-reserved register allocation back into the
    // context, then overwrite RIP and the flag image.
    for reg in Gpr::ALL {
        thread.cpu.gpr[reg.as_u8() as usize] = host_ctx.sra_gprs[reg.as_u8() as usize];
    }
    thread.cpu.rip = guest_rip;
    let eflags = recon.backend.reconstruct_compacted_eflags(host_ctx);
    thread.cpu.set_rflags(u64::from(eflags));

    let (exception, report_rip) = classify_fault(info, guest_rip);
    debug!(?exception, report_rip, "reconstructed guest exception");

    build_signal_frame(
        &mut thread.cpu,
        mem,
        &exception,
        report_rip,
        recon.dispatcher_rip,
    );
    FaultOutcome::GuestException(exception)
}
