//! Target architectures a policy can be compiled for
//!
//! The compiled program starts by checking `seccomp_data.arch` against the
//! audit value of the target, so a filter built for one ABI never
//! interprets syscall numbers of another.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::syscalls;
use crate::error::PolicyError;

// `#define AUDIT_ARCH_X86_64 (EM_X86_64|__AUDIT_ARCH_64BIT|__AUDIT_ARCH_LE)`
const AUDIT_ARCH_X86_64: u32 = 62 | 0x8000_0000 | 0x4000_0000;
// `#define AUDIT_ARCH_AARCH64 (EM_AARCH64|__AUDIT_ARCH_64BIT|__AUDIT_ARCH_LE)`
const AUDIT_ARCH_AARCH64: u32 = 183 | 0x8000_0000 | 0x4000_0000;
// `#define AUDIT_ARCH_RISCV64 (EM_RISCV|__AUDIT_ARCH_64BIT|__AUDIT_ARCH_LE)`
const AUDIT_ARCH_RISCV64: u32 = 243 | 0x8000_0000 | 0x4000_0000;

/// CPU architecture (and therefore syscall ABI) a filter targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetArch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl TargetArch {
    /// Architecture of the running process.
    pub fn host() -> Option<Self> {
        std::env::consts::ARCH.parse().ok()
    }

    pub fn audit_value(self) -> u32 {
        match self {
            TargetArch::X86_64 => AUDIT_ARCH_X86_64,
            TargetArch::Aarch64 => AUDIT_ARCH_AARCH64,
            TargetArch::Riscv64 => AUDIT_ARCH_RISCV64,
        }
    }

    /// Width of a syscall argument register in bits.
    pub fn word_bits(self) -> u32 {
        match self {
            TargetArch::X86_64 | TargetArch::Aarch64 | TargetArch::Riscv64 => 64,
        }
    }

    /// Largest value an argument can hold on this architecture.
    pub fn word_mask(self) -> u64 {
        match self.word_bits() {
            64 => u64::MAX,
            bits => (1u64 << bits) - 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetArch::X86_64 => "x86_64",
            TargetArch::Aarch64 => "aarch64",
            TargetArch::Riscv64 => "riscv64",
        }
    }

    /// Look up a syscall number by name in this architecture's table.
    pub fn syscall_number(self, name: &str) -> Option<i64> {
        syscalls::table(self)
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, nr)| nr)
    }

    /// Reverse lookup, mostly for diagnostics.
    pub fn syscall_name(self, nr: i64) -> Option<&'static str> {
        syscalls::table(self)
            .iter()
            .find(|(_, n)| *n == nr)
            .map(|&(name, _)| name)
    }
}

impl fmt::Display for TargetArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TargetArch {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86_64" | "x86-64" | "amd64" => Ok(TargetArch::X86_64),
            "aarch64" | "arm64" => Ok(TargetArch::Aarch64),
            "riscv64" => Ok(TargetArch::Riscv64),
            other => Err(PolicyError::Config(format!(
                "unsupported target architecture '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for TargetArch {
    type Error = PolicyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetArch> for String {
    fn from(arch: TargetArch) -> Self {
        arch.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("x86_64".parse::<TargetArch>().unwrap(), TargetArch::X86_64);
        assert_eq!("ARM64".parse::<TargetArch>().unwrap(), TargetArch::Aarch64);
        assert!("mips".parse::<TargetArch>().is_err());
    }

    #[test]
    fn test_audit_values() {
        assert_eq!(TargetArch::X86_64.audit_value(), 0xC000_003E);
        assert_eq!(TargetArch::Aarch64.audit_value(), 0xC000_00B7);
        assert_eq!(TargetArch::Riscv64.audit_value(), 0xC000_00F3);
    }

    #[test]
    fn test_syscall_numbers_differ_per_abi() {
        assert_eq!(TargetArch::X86_64.syscall_number("read"), Some(0));
        assert_eq!(TargetArch::Aarch64.syscall_number("read"), Some(63));
        assert_eq!(TargetArch::X86_64.syscall_number("open"), Some(2));
        // asm-generic has no plain open(2)
        assert_eq!(TargetArch::Aarch64.syscall_number("open"), None);
        assert_eq!(TargetArch::Riscv64.syscall_number("riscv_flush_icache"), Some(259));
        assert_eq!(TargetArch::Aarch64.syscall_number("riscv_flush_icache"), None);
    }

    #[test]
    fn test_reverse_lookup() {
        assert_eq!(TargetArch::X86_64.syscall_name(231), Some("exit_group"));
        assert_eq!(TargetArch::Aarch64.syscall_name(94), Some("exit_group"));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_host_matches_libc() {
        let host = TargetArch::host().unwrap();
        assert_eq!(host, TargetArch::X86_64);
        assert_eq!(host.syscall_number("openat"), Some(libc::SYS_openat));
        assert_eq!(host.syscall_number("ioctl"), Some(libc::SYS_ioctl));
    }

    #[test]
    fn test_serde_string_form() {
        let json = serde_json::to_string(&TargetArch::Aarch64).unwrap();
        assert_eq!(json, "\"aarch64\"");
        let arch: TargetArch = serde_json::from_str("\"riscv64\"").unwrap();
        assert_eq!(arch, TargetArch::Riscv64);
    }
}
