//! Pins the `repr(C)` layout of `CpuState` to the exported offset constants.
//! The IR and the downstream code generator address the context by these
//! byte offsets, so any drift here is an ABI break.

use memoffset::offset_of;
use opal_cpu_core::state::{
    CpuState, CPU_STATE_SIZE, OFFSET_CALLRET_SP, OFFSET_DF, OFFSET_FCW, OFFSET_FLAGS, OFFSET_FSW,
    OFFSET_FS_BASE, OFFSET_GDT, OFFSET_GPR, OFFSET_GS_BASE, OFFSET_MM, OFFSET_MXCSR, OFFSET_RIP,
    OFFSET_SEG_ES, OFFSET_X87_FTW, OFFSET_X87_TOP, OFFSET_XMM,
};
use opal_types::{Flag, Gpr};

#[test]
fn offsets_match_struct_layout() {
    assert_eq!(offset_of!(CpuState, gpr), OFFSET_GPR);
    assert_eq!(offset_of!(CpuState, rip), OFFSET_RIP);
    assert_eq!(offset_of!(CpuState, flags), OFFSET_FLAGS);
    assert_eq!(offset_of!(CpuState, df), OFFSET_DF);
    assert_eq!(offset_of!(CpuState, es), OFFSET_SEG_ES);
    assert_eq!(offset_of!(CpuState, fs_base), OFFSET_FS_BASE);
    assert_eq!(offset_of!(CpuState, gs_base), OFFSET_GS_BASE);
    assert_eq!(offset_of!(CpuState, xmm), OFFSET_XMM);
    assert_eq!(offset_of!(CpuState, mm), OFFSET_MM);
    assert_eq!(offset_of!(CpuState, fcw), OFFSET_FCW);
    assert_eq!(offset_of!(CpuState, fsw), OFFSET_FSW);
    assert_eq!(offset_of!(CpuState, x87_top), OFFSET_X87_TOP);
    assert_eq!(offset_of!(CpuState, x87_ftw), OFFSET_X87_FTW);
    assert_eq!(offset_of!(CpuState, mxcsr), OFFSET_MXCSR);
    assert_eq!(offset_of!(CpuState, gdt), OFFSET_GDT);
    assert_eq!(offset_of!(CpuState, callret_sp), OFFSET_CALLRET_SP);
    assert_eq!(std::mem::size_of::<CpuState>(), CPU_STATE_SIZE);
}

#[test]
fn gpr_offsets_are_dense_u64_slots() {
    for reg in Gpr::ALL {
        assert_eq!(
            CpuState::gpr_offset(reg),
            OFFSET_GPR + reg.as_u8() as usize * 8
        );
    }
}

#[test]
fn context_bytes_reflect_field_writes() {
    let mut cpu = CpuState::new();
    cpu.gpr[Gpr::Rdi.as_u8() as usize] = 0x1122_3344_5566_7788;
    cpu.set_flag(Flag::Zf, true);

    let bytes = cpu.as_bytes();
    let off = CpuState::gpr_offset(Gpr::Rdi);
    assert_eq!(
        u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()),
        0x1122_3344_5566_7788
    );
    assert_eq!(bytes[CpuState::flag_offset(Flag::Zf)], 1);
    assert_eq!(bytes[CpuState::flag_offset(Flag::Cf)], 0);
}
