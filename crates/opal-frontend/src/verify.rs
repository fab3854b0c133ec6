//! Structural IR verification.
//!
//! Checks the SSA topological-order rule, the no-cross-block-reference rule,
//! and that every block carries a terminator with valid targets.

use std::collections::HashMap;

use thiserror::Error;

use crate::ir::{BlockId, Function, Instr, Terminator, ValueId, VecSrc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("block {0:?} has no terminator")]
    MissingTerminator(BlockId),
    #[error("value {value:?} used in {block:?} before its definition")]
    UseBeforeDef { block: BlockId, value: ValueId },
    #[error("value {value:?} crosses from {def_block:?} into {use_block:?}")]
    CrossBlockUse {
        value: ValueId,
        def_block: BlockId,
        use_block: BlockId,
    },
    #[error("terminator of {0:?} targets an unknown block")]
    BadTarget(BlockId),
}

/// Visit every value operand of an instruction.
fn for_each_operand(instr: &Instr, mut visit: impl FnMut(ValueId)) {
    let mut vec_src = |src: &VecSrc, visit: &mut dyn FnMut(ValueId)| {
        if let VecSrc::Mem(addr) = src {
            visit(*addr);
        }
    };
    match instr {
        Instr::Const { .. }
        | Instr::LoadContext { .. }
        | Instr::Rdtsc
        | Instr::Fence { .. }
        | Instr::InvalidateFlags { .. }
        | Instr::EntrypointOffset { .. }
        | Instr::Break { .. }
        | Instr::VecZero { .. }
        | Instr::VecExtractLane { .. } => {}
        Instr::StoreContext { value, .. } => visit(*value),
        Instr::LoadContextIndexed { index, .. } => visit(*index),
        Instr::StoreContextIndexed { index, value, .. } => {
            visit(*index);
            visit(*value);
        }
        Instr::LoadMem { addr, .. } => visit(*addr),
        Instr::StoreMem { addr, value, .. } => {
            visit(*addr);
            visit(*value);
        }
        Instr::Alu { a, b, .. } | Instr::Fp { a, b, .. } | Instr::FcmpFlag { a, b, .. } => {
            visit(*a);
            visit(*b);
        }
        Instr::Unary { a, .. } | Instr::FpConvert { a, .. } => visit(*a),
        Instr::Select {
            a,
            b,
            true_val,
            false_val,
            ..
        } => {
            visit(*a);
            visit(*b);
            visit(*true_val);
            visit(*false_val);
        }
        Instr::Bfe { src, .. } | Instr::Sbfe { src, .. } => visit(*src),
        Instr::Bfi { dst, src, .. } => {
            visit(*dst);
            visit(*src);
        }
        Instr::AtomicFetchOp { addr, value, .. } | Instr::AtomicSwap { addr, value } => {
            visit(*addr);
            visit(*value);
        }
        Instr::Cas {
            addr,
            expected,
            desired,
        } => {
            visit(*addr);
            visit(*expected);
            visit(*desired);
        }
        Instr::CasPair {
            addr,
            expected_lo,
            expected_hi,
            desired_lo,
            desired_hi,
        } => {
            visit(*addr);
            visit(*expected_lo);
            visit(*expected_hi);
            visit(*desired_lo);
            visit(*desired_hi);
        }
        Instr::Syscall { args } => {
            for arg in args {
                visit(*arg);
            }
        }
        Instr::Cpuid { leaf, subleaf } => {
            visit(*leaf);
            visit(*subleaf);
        }
        Instr::Thunk { arg, .. } => visit(*arg),
        Instr::CallRetPush { expected } | Instr::CallRetPop { expected } => visit(*expected),
        Instr::VecOp { a, b, .. } => {
            vec_src(a, &mut visit);
            if let Some(b) = b {
                vec_src(b, &mut visit);
            }
        }
        Instr::VecStore { addr, .. } => visit(*addr),
        Instr::VecInsertLane { value, .. } => visit(*value),
    }
}

pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    let block_count = func.blocks().len() as u32;
    let valid_block = |id: BlockId| id.0 < block_count;

    for block in func.blocks() {
        // Position of each value defined in this block.
        let mut defined: HashMap<ValueId, usize> = HashMap::with_capacity(block.code.len());
        for (pos, &value) in block.code.iter().enumerate() {
            let mut err = None;
            for_each_operand(&func.node(value).instr, |operand| {
                if err.is_some() {
                    return;
                }
                let owner = func.owner_block(operand);
                if owner != block.id {
                    err = Some(VerifyError::CrossBlockUse {
                        value: operand,
                        def_block: owner,
                        use_block: block.id,
                    });
                } else if !defined.get(&operand).is_some_and(|&def_pos| def_pos < pos) {
                    err = Some(VerifyError::UseBeforeDef {
                        block: block.id,
                        value: operand,
                    });
                }
            });
            if let Some(err) = err {
                return Err(err);
            }
            defined.insert(value, pos);
        }

        match block.term {
            None => return Err(VerifyError::MissingTerminator(block.id)),
            Some(Terminator::ExitFunction { rip }) => {
                if func.owner_block(rip) != block.id {
                    return Err(VerifyError::CrossBlockUse {
                        value: rip,
                        def_block: func.owner_block(rip),
                        use_block: block.id,
                    });
                }
            }
            Some(Terminator::Jump { target }) => {
                if !valid_block(target) {
                    return Err(VerifyError::BadTarget(block.id));
                }
            }
            Some(Terminator::CondJump {
                cond,
                then_bb,
                else_bb,
            }) => {
                if func.owner_block(cond) != block.id {
                    return Err(VerifyError::CrossBlockUse {
                        value: cond,
                        def_block: func.owner_block(cond),
                        use_block: block.id,
                    });
                }
                if !valid_block(then_bb) || !valid_block(else_bb) {
                    return Err(VerifyError::BadTarget(block.id));
                }
            }
        }
    }
    Ok(())
}
