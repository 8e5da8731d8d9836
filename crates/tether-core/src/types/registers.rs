//! CPU register blocks.
//!
//! A register block is the full general-purpose state of one thread as the
//! backend captured it. The layout is fixed per architecture, so the block is
//! a closed enum keyed by [`Architecture`] rather than a name→value map.

use serde::{Deserialize, Serialize};

use super::{Address, Architecture};

/// Trap flag bit in `EFLAGS` / `RFLAGS`
///
/// Setting it makes the CPU raise a debug exception after the next
/// instruction retires.
pub const X86_TRAP_FLAG: u64 = 0x100;

/// 32-bit x86 general-purpose registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RegsX86
{
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
}

/// x86-64 general-purpose registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RegsX64
{
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub fs_base: u64,
    pub gs_base: u64,
}

/// ARM64 general-purpose registers
///
/// - `x[0..=28]`: general purpose
/// - `x[29]`: frame pointer
/// - `x[30]`: link register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegsArm64
{
    /// X0-X30
    pub x: [u64; 31],
    /// Stack pointer
    pub sp: u64,
    /// Program counter
    pub pc: u64,
    /// Current program status register
    pub cpsr: u64,
}

/// Register state of one thread
///
/// ## Example
///
/// ```rust
/// use tether_core::types::{Address, Architecture, RegisterBlock};
///
/// let mut regs = RegisterBlock::zeroed(Architecture::X86_64).unwrap();
/// regs.set_instruction_pointer(Address::new(0x401000));
/// assert_eq!(regs.instruction_pointer(), Address::new(0x401000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "arch", rename_all = "snake_case")]
pub enum RegisterBlock
{
    /// 32-bit x86
    X86(RegsX86),
    /// x86-64
    X64(RegsX64),
    /// ARM64
    Arm64(RegsArm64),
}

impl RegisterBlock
{
    /// All-zero block for `arch`, or `None` for [`Architecture::Unknown`]
    pub fn zeroed(arch: Architecture) -> Option<Self>
    {
        match arch {
            Architecture::X86 => Some(RegisterBlock::X86(RegsX86::default())),
            Architecture::X86_64 => Some(RegisterBlock::X64(RegsX64::default())),
            Architecture::Arm64 => Some(RegisterBlock::Arm64(RegsArm64::default())),
            Architecture::Unknown => None,
        }
    }

    /// Architecture this block belongs to
    pub const fn arch(&self) -> Architecture
    {
        match self {
            RegisterBlock::X86(_) => Architecture::X86,
            RegisterBlock::X64(_) => Architecture::X86_64,
            RegisterBlock::Arm64(_) => Architecture::Arm64,
        }
    }

    /// Current instruction pointer (EIP / RIP / PC)
    pub fn instruction_pointer(&self) -> Address
    {
        match self {
            RegisterBlock::X86(r) => Address::new(u64::from(r.eip)),
            RegisterBlock::X64(r) => Address::new(r.rip),
            RegisterBlock::Arm64(r) => Address::new(r.pc),
        }
    }

    /// Current stack pointer (ESP / RSP / SP)
    pub fn stack_pointer(&self) -> Address
    {
        match self {
            RegisterBlock::X86(r) => Address::new(u64::from(r.esp)),
            RegisterBlock::X64(r) => Address::new(r.rsp),
            RegisterBlock::Arm64(r) => Address::new(r.sp),
        }
    }

    /// Overwrite the instruction pointer
    ///
    /// On 32-bit x86 the address is truncated to its low 32 bits.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_instruction_pointer(&mut self, address: Address)
    {
        match self {
            RegisterBlock::X86(r) => r.eip = address.value() as u32,
            RegisterBlock::X64(r) => r.rip = address.value(),
            RegisterBlock::Arm64(r) => r.pc = address.value(),
        }
    }

    /// Set or clear the hardware single-step flag
    ///
    /// Returns `false` on ARM64, where single-stepping is a debug-register
    /// setting owned by the backend rather than a bit in this block.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_single_step_flag(&mut self, enabled: bool) -> bool
    {
        match self {
            RegisterBlock::X86(r) => {
                let tf = X86_TRAP_FLAG as u32;
                r.eflags = if enabled { r.eflags | tf } else { r.eflags & !tf };
                true
            }
            RegisterBlock::X64(r) => {
                r.rflags = if enabled { r.rflags | X86_TRAP_FLAG } else { r.rflags & !X86_TRAP_FLAG };
                true
            }
            RegisterBlock::Arm64(_) => false,
        }
    }
}
