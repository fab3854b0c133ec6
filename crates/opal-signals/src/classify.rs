//! Fault classification: host signal + trap metadata to guest exception.

/// Host signal kinds the reconstructor consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Segv,
    Bus,
    Ill,
    Trap,
    Fpe,
}

/// x86 trap numbers as reported in the host context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TrapNo {
    DivideError = 0,
    Debug = 1,
    Breakpoint = 3,
    Overflow = 4,
    InvalidOpcode = 6,
    GeneralProtection = 13,
    PageFault = 14,
}

/// Everything classification needs from the host fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub signal: HostSignal,
    pub trapno: Option<TrapNo>,
    /// Hardware error code (page-fault/GP encoding).
    pub err_code: u64,
    /// Faulting data address (`si_addr`).
    pub fault_addr: u64,
}

/// Guest-visible exception, plus any RIP adjustment the guest expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestException {
    /// #UD.
    InvalidOpcode,
    /// #GP with its error code.
    GeneralProtection { err_code: u64 },
    /// #PF with the faulting address and error code.
    PageFault { fault_addr: u64, err_code: u64 },
    /// #BP; the reported RIP is one before the trap return address.
    Breakpoint,
    /// An emulated software interrupt (`int 0x2d` style); carries the
    /// vector. The reported exception address intentionally differs from
    /// the context RIP.
    EmulatedInterrupt { vector: u64 },
    /// #DB.
    Debug,
    /// #OF.
    Overflow,
    /// #DE.
    DivideError,
}

/// Map a host fault to the guest exception it reconstructs to. `guest_rip`
/// is the already-recovered guest PC; the returned value is the RIP the
/// guest's handler should observe.
#[must_use]
pub fn classify_fault(info: &FaultInfo, guest_rip: u64) -> (GuestException, u64) {
    match info.signal {
        HostSignal::Ill => (GuestException::InvalidOpcode, guest_rip),
        HostSignal::Fpe => (GuestException::DivideError, guest_rip),
        HostSignal::Trap => match info.trapno {
            Some(TrapNo::Breakpoint) => {
                // INT3 traps report the following address; the guest wants
                // the breakpoint byte itself.
                (GuestException::Breakpoint, guest_rip.wrapping_sub(1))
            }
            _ => (GuestException::Debug, guest_rip),
        },
        HostSignal::Segv | HostSignal::Bus => match info.trapno {
            Some(TrapNo::Overflow) => (GuestException::Overflow, guest_rip),
            Some(TrapNo::GeneralProtection) => {
                // err_code low bits 0b010 with a vector in the upper bits
                // marks a software-interrupt-style GP (int 0x80 / 0x2d).
                if info.err_code & 0b111 == 0b010 {
                    let vector = info.err_code >> 3;
                    (GuestException::EmulatedInterrupt { vector }, guest_rip)
                } else {
                    (
                        GuestException::GeneralProtection {
                            err_code: info.err_code,
                        },
                        guest_rip,
                    )
                }
            }
            _ => (
                GuestException::PageFault {
                    fault_addr: info.fault_addr,
                    err_code: info.err_code,
                },
                guest_rip,
            ),
        },
    }
}
