//! # Error Types
//!
//! Error handling for the process-control core.
//!
//! We use `thiserror` to generate `Error` trait implementations and readable
//! messages. There are two layers:
//!
//! - [`BackendError`]: something an OS primitive reported (target died,
//!   permission denied, unreadable memory). Backends return these.
//! - [`CoreError`]: what callers of the core see. Backend failures are wrapped
//!   in [`CoreError::BackendFailure`] outside of a run; inside a run they are
//!   folded into the event stream instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::EntityKind;
use crate::handle::Handle;

/// Failure reported by an OS debug backend.
///
/// These are recoverable by design: a run that hits one still completes and
/// reports it as an [`Event::Error`](crate::events::Event::Error).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendError
{
    /// The target process (or thread) disappeared while we were using it
    #[error("Target vanished: {0}")]
    TargetVanished(String),

    /// Insufficient permissions to debug or touch the target
    ///
    /// On Linux this is typically `EPERM` from `ptrace(PTRACE_ATTACH)` with
    /// `kernel.yama.ptrace_scope` set; on Windows, `ERROR_ACCESS_DENIED`.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The process with the given PID doesn't exist
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Memory at the given address could not be read or written
    #[error("Memory access failed at 0x{address:016x}")]
    MemoryAccess
    {
        /// First address of the failed access
        address: u64,
    },

    /// The backend does not implement this primitive
    #[error("Not supported by this backend: {0}")]
    Unsupported(String),

    /// Raw OS error code with a description
    #[error("OS error {code}: {message}")]
    Os
    {
        /// errno / `GetLastError()` value
        code: i32,
        /// Human-readable description
        message: String,
    },

    /// Anything else
    #[error("{0}")]
    Other(String),
}

/// Main error type for core operations
///
/// ## Error Categories
///
/// 1. **Handle errors**: StaleHandle, WrongKind, HasChildren
/// 2. **Capacity errors**: CapacityExceeded, DuplicateEntity
/// 3. **Backend errors**: BackendFailure
/// 4. **Usage errors**: ConcurrentAccessViolation, RunInProgress, InvalidConfig, NotSupported
#[derive(Error, Debug)]
pub enum CoreError
{
    /// The handle refers to a released or reused entity slot
    ///
    /// The caller held on to a handle past the lifetime of the object it
    /// named. The handle will never validate again.
    #[error("Stale handle {0}")]
    StaleHandle(Handle),

    /// The handle is live but names an entity of a different kind
    #[error("Handle {handle} is a {found}, expected a {expected}")]
    WrongKind
    {
        /// Handle that was passed in
        handle: Handle,
        /// Kind the operation needs
        expected: EntityKind,
        /// Kind the handle actually names
        found: EntityKind,
    },

    /// `release_single` was asked to release an entity that still has children
    #[error("Entity {0} still has children")]
    HasChildren(Handle),

    /// The fixed entity capacity has been reached
    ///
    /// This is a hard ceiling chosen when the session was created. It is not
    /// grown at runtime.
    #[error("Entity capacity exceeded ({capacity} live entities)")]
    CapacityExceeded
    {
        /// Configured capacity, root included
        capacity: usize,
    },

    /// A live entity of the same kind already owns this OS id
    #[error("A live {kind} with id {id:#x} already exists")]
    DuplicateEntity
    {
        /// Kind of the colliding entity
        kind: EntityKind,
        /// OS id that collided
        id: u64,
    },

    /// An OS primitive failed outside of a run
    #[error("Backend failure: {0}")]
    BackendFailure(#[from] BackendError),

    /// Entity state was touched while a mutation of it was in progress
    ///
    /// This is a programming error: an operation re-entered the store while
    /// the same thread held it mutably borrowed.
    #[error("Concurrent access violation: {0}")]
    ConcurrentAccessViolation(&'static str),

    /// A run is outstanding, so the call would race it (a second run, or a
    /// change to the tree or the target)
    #[error("A run is already in progress on this session")]
    RunInProgress,

    /// The session configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation has no meaning for this entity (e.g. registers of an
    /// entity whose architecture is unknown)
    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// Convenience type alias for `Result<T, CoreError>`
///
/// ```rust
/// use tether_core::error::CoreResult;
/// fn foo() -> CoreResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Convenience type alias for backend hook results
pub type BackendResult<T> = std::result::Result<T, BackendError>;
