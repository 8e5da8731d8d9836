//! # Run control
//!
//! Input types for [`Session::run`](crate::session::Session::run) and the
//! dispatcher that carries a run through its phases:
//!
//! ```text
//! Idle → Dispatching → Waiting → Draining → Idle
//! ```
//!
//! - **Dispatching**: validate handles, plant traps, decide who is frozen
//! - **Waiting**: the backend blocks; the access gate is released
//! - **Draining**: remove traps, translate native events, update the tree

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::handle::Handle;
use crate::types::Address;

pub(crate) mod dispatch;
pub mod halt;

pub use halt::{HaltRequest, HaltSignal};

/// Transient trap planted for the duration of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trap
{
    /// Process to plant it in
    pub process: Handle,
    /// Instruction address
    pub address: Address,
    /// Caller-chosen id, echoed back in [`Event::Breakpoint`](crate::events::Event::Breakpoint)
    #[serde(default)]
    pub id: Option<u64>,
}

/// What one run should do
///
/// The default value resumes every thread of every process with no traps.
///
/// ## Freezing
///
/// - With a single-step thread set, every other thread is frozen
/// - Otherwise, with `run_entities_are_unfrozen` set, exactly the listed
///   entities run and everything else is frozen
/// - Otherwise the listed entities are frozen and everything else runs
///
/// `run_entities_are_processes` makes the list name processes (covering all
/// their threads) instead of threads.
///
/// ## Example
///
/// ```rust
/// use tether_core::{Handle, RunCtrls};
/// use tether_core::types::Address;
///
/// let process = Handle::from_parts(1, 1);
/// let ctrls = RunCtrls::default()
///     .resume_processes([process])
///     .with_trap(process, Address::new(0x401000), Some(1));
/// assert!(ctrls.run_entities_are_unfrozen);
/// assert_eq!(ctrls.traps.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCtrls
{
    /// Entities listed for freezing or resuming
    pub run_entities: SmallVec<[Handle; 4]>,
    /// Thread to single-step
    pub single_step_thread: Option<Handle>,
    /// Traps to plant for this run only
    pub traps: SmallVec<[Trap; 8]>,
    /// Drop the exception left pending by the previous run instead of
    /// redelivering it
    pub ignore_previous_exception: bool,
    /// `run_entities` are processes rather than threads
    pub run_entities_are_processes: bool,
    /// `run_entities` are the ones that run (rather than the ones frozen)
    pub run_entities_are_unfrozen: bool,
}

impl RunCtrls
{
    /// Run only the threads of these processes
    #[must_use]
    pub fn resume_processes(mut self, processes: impl IntoIterator<Item = Handle>) -> Self
    {
        self.run_entities = processes.into_iter().collect();
        self.run_entities_are_processes = true;
        self.run_entities_are_unfrozen = true;
        self
    }

    /// Run only these threads
    #[must_use]
    pub fn resume_threads(mut self, threads: impl IntoIterator<Item = Handle>) -> Self
    {
        self.run_entities = threads.into_iter().collect();
        self.run_entities_are_processes = false;
        self.run_entities_are_unfrozen = true;
        self
    }

    /// Run everything except these threads
    #[must_use]
    pub fn freeze_threads(mut self, threads: impl IntoIterator<Item = Handle>) -> Self
    {
        self.run_entities = threads.into_iter().collect();
        self.run_entities_are_processes = false;
        self.run_entities_are_unfrozen = false;
        self
    }

    /// Single-step `thread`; all other threads stay frozen
    #[must_use]
    pub fn single_step(mut self, thread: Handle) -> Self
    {
        self.single_step_thread = Some(thread);
        self
    }

    /// Add a transient trap
    #[must_use]
    pub fn with_trap(mut self, process: Handle, address: Address, id: Option<u64>) -> Self
    {
        self.traps.push(Trap { process, address, id });
        self
    }

    /// Drop the previous run's pending exception
    #[must_use]
    pub fn ignoring_previous_exception(mut self) -> Self
    {
        self.ignore_previous_exception = true;
        self
    }
}

/// Phase of the session's run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunPhase
{
    /// No run outstanding
    Idle = 0,
    /// Validating controls and planting traps
    Dispatching = 1,
    /// Blocked in the backend
    Waiting = 2,
    /// Translating native events
    Draining = 3,
}

impl RunPhase
{
    pub(crate) fn from_u8(value: u8) -> Self
    {
        match value {
            1 => RunPhase::Dispatching,
            2 => RunPhase::Waiting,
            3 => RunPhase::Draining,
            _ => RunPhase::Idle,
        }
    }
}
