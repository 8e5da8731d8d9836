//! # Backend hook contract
//!
//! Everything that actually talks to the operating system lives behind the
//! [`Backend`] trait. One implementation exists per OS debug API (ptrace,
//! the Windows Debug API, Mach); this crate ships only [`replay::ReplayBackend`],
//! which plays back scripted native events.
//!
//! Backends never see handles. The core validates a handle, then passes the
//! backend a [`Target`]: a copy of the fields a backend needs to find the
//! object again on its side.
//!
//! ## Native events
//!
//! [`Backend::run`] reports what happened as [`NativeEvent`]s keyed by OS ids.
//! The dispatcher turns them into entities and [`Event`](crate::events::Event)s.
//! For trap hits a backend reports the address of the trap instruction itself
//! and leaves the instruction pointer alone; the dispatcher rewinds it when the
//! trap was one it installed.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityExt, EntityKind};
use crate::error::{BackendError, BackendResult};
use crate::events::{ExceptionKind, MemoryEventKind};
use crate::memory::MemoryProtect;
use crate::run::HaltSignal;
use crate::types::{Address, Architecture, RegisterBlock};

pub mod replay;

/// Backend view of a live entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target
{
    /// Entity kind
    pub kind: EntityKind,
    /// OS id (PID, TID, or module base)
    pub id: u64,
    /// Architecture
    pub arch: Architecture,
    /// OS id of the parent (PID for threads and modules, 0 for processes)
    pub parent_id: u64,
    /// Backend extension words
    pub ext: EntityExt,
}

impl Target
{
    /// The id as a PID / TID
    #[allow(clippy::cast_possible_truncation)]
    pub fn os_id(&self) -> u32
    {
        self.id as u32
    }
}

/// Transient trap the core planted for this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTrap
{
    /// Process the trap lives in
    pub process: Target,
    /// Trap address
    pub address: Address,
}

/// Exception reported by the previous run, handed back for redelivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingException
{
    /// Thread that raised it
    pub thread: Target,
    /// OS exception code
    pub code: u32,
    /// Signal number (POSIX)
    pub signo: u32,
    /// Faulting address
    pub address: Address,
}

/// What the backend should do in one run
///
/// Computed by the dispatcher from [`RunCtrls`](crate::run::RunCtrls): the
/// freeze logic has already been applied, so the backend only resumes
/// `resume` and keeps `frozen` stopped.
#[derive(Debug, Clone, Default)]
pub struct NativeRunCtrls
{
    /// Threads to let run
    pub resume: Vec<Target>,
    /// Threads to keep stopped
    pub frozen: Vec<Target>,
    /// Thread to single-step, if any (always in `resume`)
    pub single_step: Option<Target>,
    /// Traps planted by the core for this run
    pub traps: Vec<NativeTrap>,
    /// Exception to pass back to the target instead of swallowing it
    pub redeliver_exception: Option<PendingException>,
}

/// Debug event as the OS reports it
///
/// Ids are OS ids. The serde form is what replay scripts are written in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum NativeEvent
{
    HandshakeComplete
    {
        pid: u32,
    },
    CreateProcess
    {
        pid: u32,
        #[serde(default)]
        arch: Architecture,
        #[serde(default)]
        ext: EntityExt,
    },
    ExitProcess
    {
        pid: u32,
        #[serde(default)]
        code: u32,
    },
    CreateThread
    {
        pid: u32,
        tid: u32,
        #[serde(default)]
        ext: EntityExt,
    },
    ExitThread
    {
        pid: u32,
        tid: u32,
        #[serde(default)]
        code: u32,
    },
    LoadModule
    {
        pid: u32,
        base: Address,
        size: u64,
        #[serde(default)]
        name: String,
        #[serde(default)]
        ext: EntityExt,
    },
    UnloadModule
    {
        pid: u32,
        base: Address,
    },
    /// A thread executed a trap instruction at `address`
    Trap
    {
        pid: u32,
        tid: u32,
        address: Address,
    },
    /// A hardware single step completed; `address` is the new instruction pointer
    SingleStep
    {
        pid: u32,
        tid: u32,
        address: Address,
    },
    Exception
    {
        pid: u32,
        tid: u32,
        address: Address,
        #[serde(default)]
        code: u32,
        #[serde(default)]
        signo: u32,
        #[serde(default)]
        kind: ExceptionKind,
    },
    /// The backend stopped the target in response to a halt
    Halt
    {
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        tid: Option<u32>,
    },
    Memory
    {
        pid: u32,
        kind: MemoryEventKind,
        address: Address,
        size: u64,
    },
    DebugString
    {
        pid: u32,
        tid: u32,
        text: String,
    },
    SetThreadName
    {
        pid: u32,
        tid: u32,
        name: String,
    },
}

/// Outcome of one blocking [`Backend::run`]
///
/// `events` are everything the backend drained; `failure`, if set, is the
/// primitive failure that ended the run early. Both may be present.
#[derive(Debug, Clone, Default)]
pub struct NativeRun
{
    /// Events in the order the OS reported them
    pub events: Vec<NativeEvent>,
    /// Failure that cut the run short
    pub failure: Option<BackendError>,
}

impl NativeRun
{
    /// Run that produced only `events`
    pub fn events(events: Vec<NativeEvent>) -> Self
    {
        Self { events, failure: None }
    }

    /// Run that failed before producing anything
    pub fn failed(failure: BackendError) -> Self
    {
        Self {
            events: Vec::new(),
            failure: Some(failure),
        }
    }
}

/// Opaque id of an execution snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

/// Process listed by [`Backend::host_processes`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostProcess
{
    /// OS process id
    pub pid: u32,
    /// Executable name
    pub name: String,
}

/// OS primitives the core is built on
///
/// Every method is called with the session's access gate held, except
/// [`run`](Self::run) (called with the gate released so other threads can
/// inspect the tree) and [`halt`](Self::halt) (called from any thread).
pub trait Backend: Send + Sync
{
    /// What [`launch_process`](Self::launch_process) needs (command line,
    /// environment, ...). Opaque to the core.
    type LaunchOptions;

    /// One-time setup, called from [`Session::new`](crate::session::Session::new)
    fn init(&self) -> BackendResult<()>
    {
        Ok(())
    }

    /// Resume the target as described by `ctrls` and block until it reports
    /// events, or until `halt` is raised
    ///
    /// Failures are reported inside the returned [`NativeRun`], after any
    /// events drained before them.
    fn run(&self, ctrls: &NativeRunCtrls, halt: &HaltSignal) -> NativeRun;

    /// Wake hook for [`Session::halt`](crate::session::Session::halt)
    ///
    /// Called after the [`HaltSignal`] is raised. Backends that block in the
    /// kernel rather than on the signal stop the target here (e.g. `SIGSTOP`).
    fn halt(&self, _code: u64, _user_data: u64) {}

    /// Start a new process; its creation events arrive through later runs
    fn launch_process(&self, options: &Self::LaunchOptions) -> BackendResult<u32>;

    /// Attach to a running process; its creation events arrive through later runs
    fn attach_process(&self, pid: u32) -> BackendResult<()>;

    /// Terminate a process; its exit events arrive through later runs
    fn kill_process(&self, process: &Target, exit_code: u32) -> BackendResult<()>;

    /// Stop debugging a process and let it continue
    fn detach_process(&self, process: &Target) -> BackendResult<()>;

    /// Capture a thread's execution state
    fn create_snapshot(&self, _thread: &Target) -> BackendResult<SnapshotId>
    {
        Err(BackendError::Unsupported("snapshots".into()))
    }

    /// Discard a snapshot
    fn release_snapshot(&self, _thread: &Target, _snapshot: SnapshotId) -> BackendResult<()>
    {
        Err(BackendError::Unsupported("snapshots".into()))
    }

    /// Release backend resources tied to an entity that was just released
    fn entity_cleanup(&self, _entity: &Target) {}

    /// Full path of a module's image file
    fn full_path_from_module(&self, module: &Target) -> BackendResult<String>;

    /// Base (highest) address of a thread's stack
    fn stack_base_vaddr_from_thread(&self, thread: &Target) -> BackendResult<Address>;

    /// Address of a thread's TLS root
    fn tls_root_vaddr_from_thread(&self, thread: &Target) -> BackendResult<Address>;

    /// Reserve `size` bytes of address space in a process
    fn reserve_memory(&self, process: &Target, size: u64) -> BackendResult<Address>;

    /// Change protection of `[address, address + size)`
    fn set_memory_protect_flags(
        &self,
        process: &Target,
        address: Address,
        size: u64,
        flags: MemoryProtect,
    ) -> BackendResult<()>;

    /// Give back memory obtained from [`reserve_memory`](Self::reserve_memory)
    fn release_memory(&self, process: &Target, address: Address, size: u64) -> BackendResult<()>;

    /// Read target memory into `dst`; returns the number of bytes read
    fn read_memory(&self, process: &Target, address: Address, dst: &mut [u8]) -> BackendResult<usize>;

    /// Write all of `src` to target memory
    fn write_memory(&self, process: &Target, address: Address, src: &[u8]) -> BackendResult<()>;

    /// Read a thread's registers
    fn read_registers(&self, thread: &Target) -> BackendResult<RegisterBlock>;

    /// Write a thread's registers
    fn write_registers(&self, thread: &Target, block: &RegisterBlock) -> BackendResult<()>;

    /// Processes running on the host
    fn host_processes(&self) -> BackendResult<Vec<HostProcess>>;
}
