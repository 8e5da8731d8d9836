//! Target CPU architecture tags.

use std::fmt;

use serde::{Deserialize, Serialize};

/// x86 `INT3` trap instruction.
pub const X86_INT3_INSTRUCTION: [u8; 1] = [0xCC];

/// ARM64 `BRK #0` trap instruction (little-endian encoding of `0xd4200000`).
pub const ARM64_BRK_INSTRUCTION: [u8; 4] = [0x00, 0x00, 0x20, 0xD4];

/// CPU architecture of a debuggee entity
///
/// Every entity carries one of these. Processes get theirs from the backend
/// when they are created; threads and modules inherit their parent's.
///
/// ## Example
///
/// ```rust
/// use tether_core::types::Architecture;
///
/// assert_eq!(Architecture::X86_64.trap_instruction(), &[0xCC]);
/// assert_eq!(Architecture::Arm64.pointer_size(), 8);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture
{
    /// Not known (yet)
    ///
    /// The root entity always has this; a process may have it if the backend
    /// could not determine the image type.
    #[default]
    Unknown,
    /// 32-bit x86
    X86,
    /// 64-bit x86 (Intel/AMD)
    X86_64,
    /// 64-bit ARM
    Arm64,
}

impl Architecture
{
    /// Architecture of the debugger binary itself
    #[must_use]
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "x86_64")]
        {
            Architecture::X86_64
        }
        #[cfg(target_arch = "x86")]
        {
            Architecture::X86
        }
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        {
            Architecture::Unknown
        }
    }

    /// Bytes of the software trap instruction used for transient traps
    ///
    /// Empty for [`Architecture::Unknown`]; traps cannot be planted there.
    #[must_use]
    pub const fn trap_instruction(self) -> &'static [u8]
    {
        match self {
            Architecture::X86 | Architecture::X86_64 => &X86_INT3_INSTRUCTION,
            Architecture::Arm64 => &ARM64_BRK_INSTRUCTION,
            Architecture::Unknown => &[],
        }
    }

    /// Size of a pointer in bytes (0 if unknown)
    #[must_use]
    pub const fn pointer_size(self) -> usize
    {
        match self {
            Architecture::X86 => 4,
            Architecture::X86_64 | Architecture::Arm64 => 8,
            Architecture::Unknown => 0,
        }
    }

    /// Short lowercase name
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self {
            Architecture::Unknown => "unknown",
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.name())
    }
}
