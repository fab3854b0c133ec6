mod common;

use common::{bus_with, translate};
use opal_cpu_core::Config;
use opal_frontend::ir::{Instr, Terminator};

fn exit_rip(func: &opal_frontend::ir::Function, block: opal_frontend::ir::BlockId) -> u64 {
    match func.block(block).term {
        Some(Terminator::ExitFunction { rip }) => match func.node(rip).instr {
            Instr::EntrypointOffset { offset } => func.entry_rip.wrapping_add(offset as u64),
            other => panic!("exit rip should be an entrypoint offset, got {other:?}"),
        },
        other => panic!("expected ExitFunction, got {other:?}"),
    }
}

#[test]
fn cfg_builder_linear_blocks() {
    // jmp +0
    // hlt
    let code = [
        0xeb, 0x00, // jmp 0x1002
        0xf4, // hlt
    ];
    let entry = 0x1000u64;
    let mem = bus_with(entry, &code);
    let func = translate(&mem, &Config::default(), entry);

    let b0 = func.find_block_by_rip(entry).unwrap();
    let b1 = func.find_block_by_rip(entry + 2).unwrap();

    match func.block(b0).term {
        Some(Terminator::Jump { target }) => assert_eq!(target, b1),
        other => panic!("expected Jump, got {other:?}"),
    }

    // The HLT block traps out at its own PC.
    assert_eq!(exit_rip(&func, b1), entry + 2);
}

#[test]
fn cfg_builder_conditional_branch() {
    // mov eax, 0
    // cmp eax, 0
    // jne target
    // fallthrough: hlt
    // target: hlt
    let code = [
        0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, 0
        0x83, 0xf8, 0x00, // cmp eax, 0
        0x75, 0x05, // jne +5 (target = 0x200f)
        0xf4, // hlt (fallthrough @ 0x200a)
        0x90, 0x90, 0x90, 0x90, // padding
        0xf4, // hlt (target @ 0x200f)
    ];
    let entry = 0x2000u64;
    let mem = bus_with(entry, &code);
    let func = translate(&mem, &Config::default(), entry);

    let head = func.find_block_by_rip(entry).unwrap();
    let fallthrough = func.find_block_by_rip(entry + 0x0a).unwrap();
    let target = func.find_block_by_rip(entry + 0x0f).unwrap();

    match func.block(head).term {
        Some(Terminator::CondJump {
            then_bb, else_bb, ..
        }) => {
            assert_eq!(then_bb, target);
            assert_eq!(else_bb, fallthrough);
        }
        other => panic!("expected CondJump, got {other:?}"),
    }
}

#[test]
fn cfg_builder_loop_backedge() {
    // add eax, 1
    // cmp eax, 3
    // jne loop
    // exit: hlt
    let code = [
        0x83, 0xc0, 0x01, // add eax, 1
        0x83, 0xf8, 0x03, // cmp eax, 3
        0x75, 0xf8, // jne -8 (target = 0x3000)
        0xf4, // hlt (exit @ 0x3008)
    ];
    let entry = 0x3000u64;
    let mem = bus_with(entry, &code);
    let func = translate(&mem, &Config::default(), entry);

    let loop_bb = func.find_block_by_rip(entry).unwrap();
    let exit_bb = func.find_block_by_rip(entry + 0x8).unwrap();

    match func.block(loop_bb).term {
        Some(Terminator::CondJump {
            then_bb, else_bb, ..
        }) => {
            assert_eq!(then_bb, loop_bb);
            assert_eq!(else_bb, exit_bb);
        }
        other => panic!("expected CondJump, got {other:?}"),
    }
}

#[test]
fn multiblock_disabled_exits_at_every_branch() {
    let code = [
        0xeb, 0x00, // jmp 0x1002
        0xf4, // hlt
    ];
    let entry = 0x1000u64;
    let mem = bus_with(entry, &code);
    let mut config = Config::default();
    config.multiblock = false;
    let func = translate(&mem, &config, entry);

    let b0 = func.find_block_by_rip(entry).unwrap();
    assert_eq!(exit_rip(&func, b0), entry + 2);
    assert!(func.find_block_by_rip(entry + 2).is_none());
}

#[test]
fn undecodable_bytes_end_the_block_at_the_faulting_pc() {
    // ud2 is deliberately undecodable; the block must exit at its own PC so
    // re-entry raises #UD.
    let code = [
        0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0x0f, 0x0b, // ud2
    ];
    let entry = 0x4000u64;
    let mem = bus_with(entry, &code);
    let func = translate(&mem, &Config::default(), entry);

    let b0 = func.find_block_by_rip(entry).unwrap();
    assert_eq!(exit_rip(&func, b0), entry + 5);
}
