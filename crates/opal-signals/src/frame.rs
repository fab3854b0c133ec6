//! Guest exception frame construction.
//!
//! The reconstructor pushes a synthetic frame onto the guest stack and
//! redirects the guest RIP to its installed exception dispatcher. The frame
//! carries the interrupted RIP, the packed flag image, and the exception
//! identity, in the layout the dispatcher shim expects.

use opal_cpu_core::{CpuState, GuestMem};
use opal_types::Gpr;

use crate::classify::GuestException;

/// Where the synthetic frame landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrameLayout {
    /// New guest stack pointer (frame base).
    pub frame_base: u64,
    /// The stack pointer value before the frame was pushed.
    pub old_sp: u64,
}

/// Frame slots, from the frame base upward.
const SLOT_RIP: u64 = 0;
const SLOT_RFLAGS: u64 = 8;
const SLOT_OLD_SP: u64 = 16;
const SLOT_VECTOR: u64 = 24;
const SLOT_ERR_CODE: u64 = 32;
const SLOT_FAULT_ADDR: u64 = 40;
pub const FRAME_SIZE: u64 = 48;

/// Red zone skipped below the interrupted stack pointer.
const RED_ZONE: u64 = 128;

fn exception_vector(exception: &GuestException) -> u64 {
    match exception {
        GuestException::DivideError => 0,
        GuestException::Debug => 1,
        GuestException::Breakpoint => 3,
        GuestException::Overflow => 4,
        GuestException::InvalidOpcode => 6,
        GuestException::GeneralProtection { .. } => 13,
        GuestException::PageFault { .. } => 14,
        GuestException::EmulatedInterrupt { vector } => *vector,
    }
}

/// Push the exception frame and redirect the guest to `dispatcher_rip`.
/// `fault_rip` is the classified RIP (post-adjustment).
pub fn build_signal_frame(
    cpu: &mut CpuState,
    mem: &mut impl GuestMem,
    exception: &GuestException,
    fault_rip: u64,
    dispatcher_rip: u64,
) -> SignalFrameLayout {
    let old_sp = cpu.gpr[Gpr::Rsp.as_u8() as usize];
    let frame_base = (old_sp - RED_ZONE - FRAME_SIZE) & !0xf;

    let (err_code, fault_addr) = match *exception {
        GuestException::GeneralProtection { err_code } => (err_code, 0),
        GuestException::PageFault {
            fault_addr,
            err_code,
        } => (err_code, fault_addr),
        _ => (0, 0),
    };

    mem.write_u64(frame_base + SLOT_RIP, fault_rip);
    mem.write_u64(frame_base + SLOT_RFLAGS, cpu.rflags_snapshot());
    mem.write_u64(frame_base + SLOT_OLD_SP, old_sp);
    mem.write_u64(frame_base + SLOT_VECTOR, exception_vector(exception));
    mem.write_u64(frame_base + SLOT_ERR_CODE, err_code);
    mem.write_u64(frame_base + SLOT_FAULT_ADDR, fault_addr);

    cpu.gpr[Gpr::Rsp.as_u8() as usize] = frame_base;
    // The dispatcher shim receives the frame pointer in RDI.
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = frame_base;
    cpu.rip = dispatcher_rip;

    SignalFrameLayout {
        frame_base,
        old_sp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_cpu_core::FlatMem;
    use opal_types::Flag;

    #[test]
    fn frame_records_the_interrupted_state() {
        let mut cpu = CpuState::new();
        let mut mem = FlatMem::new(0x1_0000);
        cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x8000;
        cpu.set_flag(Flag::Cf, true);

        let exception = GuestException::PageFault {
            fault_addr: 0x1234,
            err_code: 0x6,
        };
        let layout = build_signal_frame(&mut cpu, &mut mem, &exception, 0x3000, 0x9000);

        assert_eq!(cpu.rip, 0x9000);
        assert_eq!(cpu.gpr[Gpr::Rsp.as_u8() as usize], layout.frame_base);
        assert_eq!(layout.frame_base % 16, 0);
        assert!(layout.frame_base + FRAME_SIZE + 128 <= 0x8000);

        assert_eq!(mem.read_u64(layout.frame_base + SLOT_RIP), 0x3000);
        assert_eq!(mem.read_u64(layout.frame_base + SLOT_OLD_SP), 0x8000);
        assert_eq!(mem.read_u64(layout.frame_base + SLOT_VECTOR), 14);
        assert_eq!(mem.read_u64(layout.frame_base + SLOT_ERR_CODE), 0x6);
        assert_eq!(mem.read_u64(layout.frame_base + SLOT_FAULT_ADDR), 0x1234);
        let rflags = mem.read_u64(layout.frame_base + SLOT_RFLAGS);
        assert_ne!(rflags & 1, 0, "CF was set at fault time");
    }
}
