//! Target memory helpers.
//!
//! - [`MemoryProtect`]: page protection flags passed to the backend
//! - [`read_amap`]: best-effort read that returns the longest readable prefix
//!   of a range, probing page-aligned blocks by bisection

use std::fmt;
use std::ops::BitOr;

use crate::types::Address;

/// Granularity of the bisecting read (one page on every supported target)
pub const READ_BLOCK_SIZE: u64 = 4096;

/// Page protection flags
///
/// ## Example
///
/// ```rust
/// use tether_core::memory::MemoryProtect;
///
/// let rw = MemoryProtect::READ | MemoryProtect::WRITE;
/// assert!(rw.contains(MemoryProtect::WRITE));
/// assert!(!rw.contains(MemoryProtect::EXECUTE));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemoryProtect(u32);

impl MemoryProtect
{
    /// No access
    pub const NONE: Self = MemoryProtect(0);
    /// Readable
    pub const READ: Self = MemoryProtect(1 << 0);
    /// Writable
    pub const WRITE: Self = MemoryProtect(1 << 1);
    /// Executable
    pub const EXECUTE: Self = MemoryProtect(1 << 2);

    /// Raw bits
    pub const fn bits(self) -> u32
    {
        self.0
    }

    /// Whether every flag in `other` is set in `self`
    pub const fn contains(self, other: Self) -> bool
    {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MemoryProtect
{
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output
    {
        MemoryProtect(self.0 | rhs.0)
    }
}

impl fmt::Display for MemoryProtect
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let r = if self.contains(Self::READ) { 'r' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// Read as much of `[src, src + dst.len())` as possible
///
/// `read` must fill its whole buffer and return `true`, or return `false`
/// if any byte of the range is unreadable. The range is split into three
/// parts:
///
/// 1. the unaligned head up to the first block boundary, read directly
/// 2. the block-aligned middle, probed by bisection on block boundaries
/// 3. the unaligned tail, read directly
///
/// Reading stops at the first failure. Returns the number of bytes at the
/// start of `dst` that hold target memory.
#[allow(clippy::cast_possible_truncation)]
pub fn read_amap<F>(src: Address, dst: &mut [u8], mut read: F) -> usize
where
    F: FnMut(Address, &mut [u8]) -> bool,
{
    let start = src.value();
    let Some(end) = start.checked_add(dst.len() as u64) else {
        return 0;
    };
    let mut read_size = 0u64;

    // Head: [start, head_end)
    let head_end = Address::new(start).align_up(READ_BLOCK_SIZE).value().min(end);
    if start < head_end {
        let len = (head_end - start) as usize;
        if !read(src, &mut dst[..len]) {
            return 0;
        }
        read_size += head_end - start;
    }

    // Middle: [head_end, tail_start)
    let tail_start = Address::new(end).align_down(READ_BLOCK_SIZE).value().max(head_end);
    if head_end < tail_start {
        let off = (head_end - start) as usize;
        let len = (tail_start - head_end) as usize;
        let got = read_aligned(Address::new(head_end), &mut dst[off..off + len], &mut read);
        read_size += got;
        if got < tail_start - head_end {
            return read_size as usize;
        }
    }

    // Tail: [tail_start, end)
    if tail_start < end {
        let off = (tail_start - start) as usize;
        if read(Address::new(tail_start), &mut dst[off..]) {
            read_size += end - tail_start;
        }
    }

    read_size as usize
}

// [min, max) is the range being attempted, [max, ceiling) is not yet proven
// unreadable.
#[allow(clippy::cast_possible_truncation)]
fn read_aligned<F>(src: Address, dst: &mut [u8], read: &mut F) -> u64
where
    F: FnMut(Address, &mut [u8]) -> bool,
{
    debug_assert!(src.is_aligned(READ_BLOCK_SIZE));
    let size = dst.len() as u64;
    let mut read_size = 0;
    let mut min = 0u64;
    let mut max = size;
    let mut ceiling = size;

    while min < max {
        let ok = read(src + min, &mut dst[min as usize..max as usize]);
        if ok {
            read_size += max - min;
            min = max;
            max = ceiling;
        } else {
            ceiling = max - READ_BLOCK_SIZE;
            max = Address::new((min + max) / 2).align_down(READ_BLOCK_SIZE).value();
        }
    }
    read_size
}
