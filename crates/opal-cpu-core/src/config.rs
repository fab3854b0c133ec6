//! Static core configuration, read once at init.

use std::path::{Path, PathBuf};

use opal_types::OsAbi;

/// How unaligned atomics are handled when hardware TSO is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnalignedHandlerPolicy {
    /// Plain loads/stores, no extra ordering.
    NonAtomic,
    /// Half barriers around the access.
    HalfBarrier,
    /// Full atomics everywhere.
    Paranoid,
}

/// Core options. The loader that populates this lives outside the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Request hardware TSO; fall back to explicit barriers if unavailable.
    pub tso_enabled: bool,
    pub paranoid_tso: bool,
    pub half_barrier_tso_enabled: bool,
    /// Allow discarding flag state across CALL/RET (SysV ABI permits it).
    pub abi_local_flags: bool,
    pub is_64bit_mode: bool,
    /// Allow multi-block IR units; otherwise every block exits.
    pub multiblock: bool,
    /// Whether a 16-bit-operand BSWAP zeroes its destination. Matches the
    /// micro-architecture the original was validated against; other parts
    /// zero differently, so this is a knob rather than a constant.
    pub bswap16_zeroes_destination: bool,
    pub osabi: OsAbi,
    /// RootFS overlay root for the file redirector.
    pub rootfs: PathBuf,
    /// Data directory holding the AOT cache.
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tso_enabled: true,
            paranoid_tso: false,
            half_barrier_tso_enabled: false,
            abi_local_flags: false,
            is_64bit_mode: true,
            multiblock: true,
            bswap16_zeroes_destination: true,
            osabi: OsAbi::Linux64,
            rootfs: PathBuf::new(),
            data_dir: PathBuf::new(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn unaligned_policy(&self) -> UnalignedHandlerPolicy {
        if self.paranoid_tso {
            UnalignedHandlerPolicy::Paranoid
        } else if self.half_barrier_tso_enabled {
            UnalignedHandlerPolicy::HalfBarrier
        } else {
            UnalignedHandlerPolicy::NonAtomic
        }
    }

    /// Stable hash of the options that affect generated code. AOT cache
    /// files are keyed by this so a config change never revives stale code.
    #[must_use]
    pub fn code_config_id(&self) -> u64 {
        // FNV-1a over the codegen-relevant booleans, one byte per option.
        let bits = [
            u8::from(self.tso_enabled),
            u8::from(self.paranoid_tso),
            u8::from(self.half_barrier_tso_enabled),
            u8::from(self.abi_local_flags),
            u8::from(self.is_64bit_mode),
            u8::from(self.multiblock),
            u8::from(self.bswap16_zeroes_destination),
        ];
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in bits {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        hash
    }

    /// Path of the AOT cache file for a given content id.
    #[must_use]
    pub fn cache_file_path(&self, file_id: &str) -> PathBuf {
        self.data_dir
            .join("cache")
            .join(format!("{file_id}-{:016x}.aotir", self.code_config_id()))
    }

    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_id_tracks_codegen_options() {
        let base = Config::default();
        let mut other = Config::default();
        assert_eq!(base.code_config_id(), other.code_config_id());

        other.abi_local_flags = !other.abi_local_flags;
        assert_ne!(base.code_config_id(), other.code_config_id());

        // Non-codegen options do not perturb the id.
        let mut path_only = Config::default();
        path_only.rootfs = PathBuf::from("/rootfs");
        assert_eq!(base.code_config_id(), path_only.code_config_id());
    }

    #[test]
    fn cache_path_embeds_file_and_config_ids() {
        let mut cfg = Config::default();
        cfg.data_dir = PathBuf::from("/data");
        let path = cfg.cache_file_path("deadbeef");
        let s = path.to_string_lossy();
        assert!(s.starts_with("/data/cache/deadbeef-"));
        assert!(s.ends_with(".aotir"));
    }

    #[test]
    fn unaligned_policy_priority() {
        let mut cfg = Config::default();
        assert_eq!(cfg.unaligned_policy(), UnalignedHandlerPolicy::NonAtomic);
        cfg.half_barrier_tso_enabled = true;
        assert_eq!(cfg.unaligned_policy(), UnalignedHandlerPolicy::HalfBarrier);
        cfg.paranoid_tso = true;
        assert_eq!(cfg.unaligned_policy(), UnalignedHandlerPolicy::Paranoid);
    }
}
