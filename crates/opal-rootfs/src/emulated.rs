//! Synthesized proc/sys file contents.
//!
//! Contents are generated once at startup from the CPUID backend and the
//! guest loader, then served from sealed in-memory files. The guest sees a
//! machine that matches what CPUID already told it.

use opal_types::CpuidBackend;

/// The synthesized file set.
#[derive(Debug, Clone)]
pub struct EmulatedFiles {
    pub cpuinfo: String,
    pub osrelease: String,
    pub version: String,
    pub cpus_online: String,
    pub cpus_present: String,
    pub cmdline: Vec<u8>,
    pub auxv: Vec<u8>,
    pid: u32,
}

/// Guest kernel version reported through osrelease/version.
#[derive(Debug, Clone, Copy)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EmulatedFiles {
    pub fn generate(
        cpuid: &dyn CpuidBackend,
        cores: u32,
        kernel: KernelVersion,
        cmdline_args: &[&str],
        auxv: Vec<u8>,
        pid: u32,
    ) -> Self {
        let cpus = if cores > 1 {
            format!("0-{}", cores - 1)
        } else {
            "0".to_owned()
        };
        // cmdline is NUL-terminated argument bytes, back to back.
        let mut cmdline = Vec::new();
        for arg in cmdline_args {
            cmdline.extend_from_slice(arg.as_bytes());
            cmdline.push(0);
        }

        EmulatedFiles {
            cpuinfo: generate_cpuinfo(cpuid, cores),
            osrelease: format!("{}.{}.{}\n", kernel.major, kernel.minor, kernel.patch),
            version: format!(
                "Linux version {}.{}.{} (opal@opal) #1 SMP\n",
                kernel.major, kernel.minor, kernel.patch
            ),
            cpus_online: cpus.clone(),
            cpus_present: cpus,
            cmdline,
            auxv,
            pid,
        }
    }

    /// Content served for a guest path, if this path is emulated.
    #[must_use]
    pub fn content_for(&self, path: &str) -> Option<&[u8]> {
        let pid_cmdline = format!("/proc/{}/cmdline", self.pid);
        let pid_auxv = format!("/proc/{}/auxv", self.pid);
        match path {
            "/proc/cpuinfo" => Some(self.cpuinfo.as_bytes()),
            "/proc/sys/kernel/osrelease" => Some(self.osrelease.as_bytes()),
            "/proc/version" => Some(self.version.as_bytes()),
            "/sys/devices/system/cpu/online" => Some(self.cpus_online.as_bytes()),
            "/sys/devices/system/cpu/present" => Some(self.cpus_present.as_bytes()),
            "/proc/self/cmdline" => Some(&self.cmdline),
            "/proc/self/auxv" => Some(&self.auxv),
            other if other == pid_cmdline => Some(&self.cmdline),
            other if other == pid_auxv => Some(&self.auxv),
            _ => None,
        }
    }
}

/// Read a CPUID string register quartet into bytes.
fn push_regs(out: &mut Vec<u8>, regs: [u32; 4]) {
    for reg in regs {
        out.extend_from_slice(&reg.to_le_bytes());
    }
}

fn brand_string(cpuid: &dyn CpuidBackend) -> String {
    let mut bytes = Vec::with_capacity(48);
    for leaf in 0x8000_0002u32..=0x8000_0004 {
        let r = cpuid.run_cpuid(leaf, 0);
        push_regs(&mut bytes, [r.eax, r.ebx, r.ecx, r.edx]);
    }
    String::from_utf8_lossy(&bytes)
        .trim_matches(char::from(0))
        .trim()
        .to_owned()
}

fn vendor_string(cpuid: &dyn CpuidBackend) -> String {
    let r = cpuid.run_cpuid(0, 0);
    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(&r.ebx.to_le_bytes());
    bytes.extend_from_slice(&r.edx.to_le_bytes());
    bytes.extend_from_slice(&r.ecx.to_le_bytes());
    String::from_utf8_lossy(&bytes).to_string()
}

fn generate_cpuinfo(cpuid: &dyn CpuidBackend, cores: u32) -> String {
    let vendor = vendor_string(cpuid);
    let brand = brand_string(cpuid);
    let leaf1 = cpuid.run_cpuid(1, 0);
    let family = (leaf1.eax >> 8) & 0xf;
    let model = ((leaf1.eax >> 4) & 0xf) | ((leaf1.eax >> 12) & 0xf0);
    let stepping = leaf1.eax & 0xf;

    let mut flags = Vec::new();
    for (bit, name) in [
        (0u32, "fpu"),
        (4, "tsc"),
        (5, "msr"),
        (8, "cx8"),
        (15, "cmov"),
        (19, "clflush"),
        (23, "mmx"),
        (25, "sse"),
        (26, "sse2"),
    ] {
        if leaf1.edx & (1 << bit) != 0 {
            flags.push(name);
        }
    }
    for (bit, name) in [(0u32, "sse3"), (9, "ssse3"), (19, "sse4_1"), (20, "sse4_2"), (23, "popcnt")]
    {
        if leaf1.ecx & (1 << bit) != 0 {
            flags.push(name);
        }
    }

    let mut out = String::new();
    for core in 0..cores {
        out.push_str(&format!(
            "processor\t: {core}\n\
             vendor_id\t: {vendor}\n\
             cpu family\t: {family}\n\
             model\t\t: {model}\n\
             model name\t: {brand}\n\
             stepping\t: {stepping}\n\
             flags\t\t: {}\n\n",
            flags.join(" ")
        ));
    }
    out
}
