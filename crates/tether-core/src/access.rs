//! # Access gate
//!
//! All entity state of a session sits behind one reentrant lock. Holding an
//! [`AccessScope`] keeps the run dispatcher from restructuring the tree while
//! the holder looks at it; the same thread may take the scope again (nested
//! calls), other threads wait.
//!
//! Inside the lock the state is a `RefCell`. A nested scope on the same
//! thread that tries to borrow the state while an outer frame holds it
//! mutably gets [`CoreError::ConcurrentAccessViolation`] instead of a panic.

use std::cell::{Ref, RefCell, RefMut};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::config::SessionConfig;
use crate::entity::EntityStore;
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;

/// Exception left pending by the last run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingExceptionRecord
{
    pub thread: Handle,
    pub code: u32,
    pub signo: u32,
    pub address: u64,
}

/// Everything the access gate protects
#[derive(Debug)]
pub struct CoreState
{
    /// The entity tree, identity map, and acceleration records
    pub entities: EntityStore,
    pub(crate) step: u64,
    pub(crate) pending_exception: Option<PendingExceptionRecord>,
    pub(crate) pending_attaches: u32,
}

impl CoreState
{
    pub(crate) fn new(config: &SessionConfig) -> Self
    {
        Self {
            entities: EntityStore::new(config),
            step: 1,
            pending_exception: None,
            pending_attaches: 0,
        }
    }

    /// Current value of the step counter
    ///
    /// Starts at 1; bumped once per run and once per drained native event.
    pub fn step(&self) -> u64
    {
        self.step
    }

    pub(crate) fn bump_step(&mut self)
    {
        self.step += 1;
    }
}

pub(crate) struct AccessGate
{
    inner: ReentrantMutex<RefCell<CoreState>>,
}

impl AccessGate
{
    pub(crate) fn new(state: CoreState) -> Self
    {
        Self {
            inner: ReentrantMutex::new(RefCell::new(state)),
        }
    }

    pub(crate) fn enter(&self) -> AccessScope<'_>
    {
        AccessScope {
            guard: self.inner.lock(),
        }
    }
}

/// Held access to a session's entity state
///
/// Dropping the scope ends the access.
pub struct AccessScope<'a>
{
    guard: ReentrantMutexGuard<'a, RefCell<CoreState>>,
}

impl AccessScope<'_>
{
    /// Shared view of the state
    ///
    /// ## Errors
    ///
    /// [`CoreError::ConcurrentAccessViolation`] if this thread is already
    /// mutating the state further up the stack.
    pub fn state(&self) -> CoreResult<Ref<'_, CoreState>>
    {
        self.guard
            .try_borrow()
            .map_err(|_| CoreError::ConcurrentAccessViolation("entity state is being mutated"))
    }

    /// Exclusive view of the state
    ///
    /// ## Errors
    ///
    /// [`CoreError::ConcurrentAccessViolation`] if this thread already holds
    /// any view of the state further up the stack.
    pub fn state_mut(&self) -> CoreResult<RefMut<'_, CoreState>>
    {
        self.guard
            .try_borrow_mut()
            .map_err(|_| CoreError::ConcurrentAccessViolation("entity state is already borrowed"))
    }
}
