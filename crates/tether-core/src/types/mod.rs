//! # Types
//!
//! Plain value types shared by every layer: addresses, architecture tags, and
//! register blocks.
//!
//! None of these know anything about entities or handles. Backends build and
//! consume them directly.

pub mod address;
pub mod arch;
pub mod registers;

// Re-export all public types
pub use address::Address;
pub use arch::Architecture;
pub use registers::{RegisterBlock, RegsArm64, RegsX64, RegsX86};
