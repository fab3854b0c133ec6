//! Host-fault to guest-exception reconstruction.
//!
//! When the host delivers a synchronous fault while a host PC is inside
//! translated code, this module copies the statically-reserved register
//! allocation back into the guest context, rewinds the guest RIP through
//! the backend's PC map, classifies the fault into a guest exception, and
//! builds the guest exception frame. The fault path never takes the VMA
//! writer lock; SMC queries go through the tracker's shared-reader surface.

pub mod classify;
pub mod frame;
pub mod reconstruct;

pub use classify::{classify_fault, FaultInfo, GuestException, HostSignal, TrapNo};
pub use frame::{build_signal_frame, SignalFrameLayout};
pub use reconstruct::{
    handle_host_fault, FaultOutcome, HostContext, JitBackend, Reconstructor,
};
