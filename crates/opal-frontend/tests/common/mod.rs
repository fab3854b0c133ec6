#![allow(dead_code)]

use opal_cpu_core::{Config, CpuState, FlatMem};
use opal_frontend::interp::{run_function, InterpEnv, RunExit};
use opal_frontend::ir::Function;
use opal_frontend::{build_function, verify_function, BlockLimits};

/// Translate the region at `entry` and check it verifies.
pub fn translate(mem: &FlatMem, config: &Config, entry: u64) -> Function {
    let func = build_function(mem, config, entry, BlockLimits::default());
    verify_function(&func).expect("built IR must verify");
    func
}

/// Translate and run one region with default config and environment.
pub fn run(cpu: &mut CpuState, mem: &mut FlatMem, entry: u64) -> RunExit {
    let config = Config::default();
    let func = translate(mem, &config, entry);
    run_function(&func, cpu, mem, &mut InterpEnv::default())
}

pub fn run_with_config(
    cpu: &mut CpuState,
    mem: &mut FlatMem,
    config: &Config,
    entry: u64,
) -> RunExit {
    let func = translate(mem, config, entry);
    run_function(&func, cpu, mem, &mut InterpEnv::default())
}

/// A memory image with `code` loaded at `entry`.
pub fn bus_with(entry: u64, code: &[u8]) -> FlatMem {
    let mut mem = FlatMem::new(0x1_0000);
    mem.load(entry, code);
    mem
}
