//! End-to-end fault routing: shadow-stack guards, SMC consumption, guest
//! exception reconstruction, and passthrough.

use std::sync::Mutex;

use opal_cpu_core::{FlatMem, GuestMem, GuestThread};
use opal_signals::{
    handle_host_fault, FaultInfo, FaultOutcome, GuestException, HostContext, HostSignal,
    JitBackend, Reconstructor, TrapNo,
};
use opal_types::Gpr;
use opal_vma::{
    Backing, CodeInvalidator, MapFlags, Prot, RecordingHost, VmaTracker, PAGE_SIZE,
};

const DISPATCHER_RIP: u64 = 0xdddd_0000;
const CODE_BUF_BASE: u64 = 0x7f00_0000;
const CODE_BUF_END: u64 = 0x7f10_0000;

struct TestBackend {
    /// host pc -> guest rip entries.
    rip_map: Vec<(u64, u64)>,
    eflags: u32,
}

impl JitBackend for TestBackend {
    fn restore_rip_from_host_pc(&self, host_pc: u64) -> Option<u64> {
        self.rip_map
            .iter()
            .find(|(hpc, _)| *hpc == host_pc)
            .map(|&(_, grip)| grip)
    }
    fn reconstruct_compacted_eflags(&self, _ctx: &HostContext) -> u32 {
        self.eflags
    }
    fn host_pc_in_code_buffer(&self, host_pc: u64) -> bool {
        (CODE_BUF_BASE..CODE_BUF_END).contains(&host_pc)
    }
}

#[derive(Default)]
struct NullInvalidator {
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl CodeInvalidator for NullInvalidator {
    fn invalidate_code_range(&self, start: u64, len: u64) {
        self.ranges.lock().unwrap().push((start, len));
    }
}

fn fixture<'a>(
    backend: &'a TestBackend,
    tracker: &'a VmaTracker,
    invalidator: &'a NullInvalidator,
    host: &'a RecordingHost,
) -> Reconstructor<'a> {
    Reconstructor {
        backend,
        tracker,
        invalidator,
        host_mem: host,
        block_query: None,
        dispatcher_rip: DISPATCHER_RIP,
    }
}

fn ctx(host_pc: u64) -> HostContext {
    let mut sra_gprs = [0u64; 16];
    for (i, slot) in sra_gprs.iter_mut().enumerate() {
        *slot = 0x100 + i as u64;
    }
    HostContext { host_pc, sra_gprs }
}

#[test]
fn null_deref_reconstructs_a_page_fault_with_the_guest_rip() {
    let backend = TestBackend {
        rip_map: vec![(CODE_BUF_BASE + 0x40, 0x3000)],
        eflags: 0x202,
    };
    let tracker = VmaTracker::new();
    let invalidator = NullInvalidator::default();
    let host = RecordingHost::new();
    let recon = fixture(&backend, &tracker, &invalidator, &host);

    let mut thread = GuestThread::new(0x10_0000);
    thread.cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x8000;
    let mut mem = FlatMem::new(0x1_0000);

    let info = FaultInfo {
        signal: HostSignal::Segv,
        trapno: Some(TrapNo::PageFault),
        err_code: 0x4,
        fault_addr: 0,
    };
    let outcome = handle_host_fault(&recon, &mut thread, &mut mem, &info, &ctx(CODE_BUF_BASE + 0x40));

    let FaultOutcome::GuestException(GuestException::PageFault {
        fault_addr,
        err_code,
    }) = outcome
    else {
        panic!("expected a page fault, got {outcome:?}");
    };
    assert_eq!(fault_addr, 0);
    assert_eq!(err_code, 0x4);

    // The SRA file was copied back and RIP redirected to the dispatcher.
    assert_eq!(thread.cpu.gpr[Gpr::Rax.as_u8() as usize], 0x100);
    assert_eq!(thread.cpu.rip, DISPATCHER_RIP);

    // The frame records the faulting guest RIP, not the host PC.
    let frame_base = thread.cpu.gpr[Gpr::Rsp.as_u8() as usize];
    assert_eq!(mem.read_u64(frame_base), 0x3000);
}

#[test]
fn faults_outside_translated_code_pass_through() {
    let backend = TestBackend {
        rip_map: vec![],
        eflags: 0,
    };
    let tracker = VmaTracker::new();
    let invalidator = NullInvalidator::default();
    let host = RecordingHost::new();
    let recon = fixture(&backend, &tracker, &invalidator, &host);

    let mut thread = GuestThread::new(0x10_0000);
    let mut mem = FlatMem::new(0x1000);

    let info = FaultInfo {
        signal: HostSignal::Segv,
        trapno: Some(TrapNo::PageFault),
        err_code: 0,
        fault_addr: 0x4444,
    };
    let outcome = handle_host_fault(&recon, &mut thread, &mut mem, &info, &ctx(0x1234));
    assert_eq!(outcome, FaultOutcome::Passthrough);
}

#[test]
fn smc_write_is_consumed_before_classification() {
    let backend = TestBackend {
        rip_map: vec![],
        eflags: 0,
    };
    let tracker = VmaTracker::new();
    tracker.track_mmap(
        0x2000,
        PAGE_SIZE,
        Prot::READ | Prot::WRITE | Prot::EXEC,
        MapFlags::ANONYMOUS,
        Backing::Anonymous { shared: false },
        0,
    );
    let invalidator = NullInvalidator::default();
    let host = RecordingHost::new();
    let recon = fixture(&backend, &tracker, &invalidator, &host);

    let mut thread = GuestThread::new(0x10_0000);
    let mut mem = FlatMem::new(0x1000);

    let info = FaultInfo {
        signal: HostSignal::Segv,
        trapno: Some(TrapNo::PageFault),
        err_code: 0x6,
        fault_addr: 0x2001,
    };
    let outcome = handle_host_fault(&recon, &mut thread, &mut mem, &info, &ctx(0x999));
    assert_eq!(outcome, FaultOutcome::ResumeGuest);
    assert_eq!(
        invalidator.ranges.lock().unwrap().as_slice(),
        &[(0x2000, PAGE_SIZE)]
    );
}

#[test]
fn callret_guard_fault_resets_the_shadow_sp() {
    let backend = TestBackend {
        rip_map: vec![],
        eflags: 0,
    };
    let tracker = VmaTracker::new();
    let invalidator = NullInvalidator::default();
    let host = RecordingHost::new();
    let recon = fixture(&backend, &tracker, &invalidator, &host);

    let mut thread = GuestThread::new(0x10_0000);
    let guard_addr = thread.callret.info().allocation_base + 8;
    thread.cpu.callret_sp = 0x1; // wildly out of range
    let mut mem = FlatMem::new(0x1000);

    let info = FaultInfo {
        signal: HostSignal::Segv,
        trapno: Some(TrapNo::PageFault),
        err_code: 0x6,
        fault_addr: guard_addr,
    };
    let outcome = handle_host_fault(&recon, &mut thread, &mut mem, &info, &ctx(0x999));
    assert_eq!(outcome, FaultOutcome::ResumeGuest);
    assert_eq!(
        thread.cpu.callret_sp,
        thread.callret.info().default_location
    );
}

#[test]
fn sigill_inside_translated_code_becomes_ud() {
    let backend = TestBackend {
        rip_map: vec![(CODE_BUF_BASE + 0x10, 0x5000)],
        eflags: 0x2,
    };
    let tracker = VmaTracker::new();
    let invalidator = NullInvalidator::default();
    let host = RecordingHost::new();
    let recon = fixture(&backend, &tracker, &invalidator, &host);

    let mut thread = GuestThread::new(0x10_0000);
    thread.cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x8000;
    let mut mem = FlatMem::new(0x1_0000);

    let info = FaultInfo {
        signal: HostSignal::Ill,
        trapno: None,
        err_code: 0,
        fault_addr: 0,
    };
    let outcome = handle_host_fault(&recon, &mut thread, &mut mem, &info, &ctx(CODE_BUF_BASE + 0x10));
    assert_eq!(
        outcome,
        FaultOutcome::GuestException(GuestException::InvalidOpcode)
    );
    let frame_base = thread.cpu.gpr[Gpr::Rsp.as_u8() as usize];
    assert_eq!(mem.read_u64(frame_base), 0x5000);
    assert_eq!(mem.read_u64(frame_base + 24), 6, "#UD vector");
}

#[test]
fn int3_reports_the_breakpoint_byte() {
    let backend = TestBackend {
        rip_map: vec![(CODE_BUF_BASE + 0x20, 0x6001)],
        eflags: 0x2,
    };
    let tracker = VmaTracker::new();
    let invalidator = NullInvalidator::default();
    let host = RecordingHost::new();
    let recon = fixture(&backend, &tracker, &invalidator, &host);

    let mut thread = GuestThread::new(0x10_0000);
    thread.cpu.gpr[Gpr::Rsp.as_u8() as usize] = 0x8000;
    let mut mem = FlatMem::new(0x1_0000);

    let info = FaultInfo {
        signal: HostSignal::Trap,
        trapno: Some(TrapNo::Breakpoint),
        err_code: 0,
        fault_addr: 0,
    };
    let outcome = handle_host_fault(&recon, &mut thread, &mut mem, &info, &ctx(CODE_BUF_BASE + 0x20));
    assert_eq!(
        outcome,
        FaultOutcome::GuestException(GuestException::Breakpoint)
    );
    let frame_base = thread.cpu.gpr[Gpr::Rsp.as_u8() as usize];
    assert_eq!(mem.read_u64(frame_base), 0x6000, "RIP rewound by one");
}
