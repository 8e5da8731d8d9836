//! Debug events produced by a run.
//!
//! Every [`Session::run`](crate::session::Session::run) returns one
//! [`EventList`]: the backend's native events translated into handles, in the
//! order the backend reported them. Errors that happen during a run are
//! events too ([`Event::Error`]), so a run that hit a backend failure still
//! returns everything it drained before the failure.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handle::Handle;
use crate::types::Address;

/// Why a run reported an [`Event::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind
{
    /// The session's backend was never initialised
    NotInitialized,
    /// Nothing to run: no processes and no pending launch or attach
    NotAttached,
    /// A handle in the run controls was stale or of the wrong kind
    InvalidHandle,
    /// A backend primitive failed during the run
    BackendFailure,
    /// Anything the dispatcher could not classify
    UnexpectedFailure,
}

/// Classification of an [`Event::Exception`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind
{
    /// Faulting read
    MemoryRead,
    /// Faulting write
    MemoryWrite,
    /// Faulting instruction fetch
    MemoryExecute,
    /// C++ `throw`
    CppThrow,
    /// Anything else (signals, illegal instructions, ...)
    #[default]
    Other,
}

/// What happened in an [`Event::Memory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventKind
{
    /// Pages committed
    Commit,
    /// Address space reserved
    Reserve,
    /// Pages decommitted
    Decommit,
    /// Address space released
    Release,
}

/// Discriminant of an [`Event`], for filtering and counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EventKind
{
    Error,
    HandshakeComplete,
    CreateProcess,
    ExitProcess,
    CreateThread,
    ExitThread,
    LoadModule,
    UnloadModule,
    Breakpoint,
    Trap,
    SingleStep,
    Exception,
    Halt,
    Memory,
    DebugString,
    SetThreadName,
}

/// One translated debug event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event
{
    /// The run failed, fully or partly
    Error
    {
        /// Classification
        kind: ErrorKind,
        /// Process concerned, if any
        process: Option<Handle>,
        /// Details
        message: String,
    },
    /// The backend finished its initial handshake with a process
    HandshakeComplete
    {
        /// Process
        process: Handle,
    },
    /// A process appeared
    CreateProcess
    {
        /// New process
        process: Handle,
        /// OS process id
        pid: u32,
    },
    /// A process exited; its entity is gone when the run returns
    ExitProcess
    {
        /// Process (already stale when the caller sees it)
        process: Handle,
        /// Exit code
        code: u32,
    },
    /// A thread appeared
    CreateThread
    {
        /// Owning process
        process: Handle,
        /// New thread
        thread: Handle,
        /// OS thread id
        tid: u32,
    },
    /// A thread exited
    ExitThread
    {
        /// Owning process
        process: Handle,
        /// Thread (already stale when the caller sees it)
        thread: Handle,
        /// Exit code
        code: u32,
    },
    /// An image was mapped
    LoadModule
    {
        /// Owning process
        process: Handle,
        /// New module
        module: Handle,
        /// Base address
        base: Address,
        /// Mapped size
        size: u64,
        /// Name as reported by the backend (may be empty)
        name: String,
    },
    /// An image was unmapped
    UnloadModule
    {
        /// Owning process
        process: Handle,
        /// Module (already stale when the caller sees it)
        module: Handle,
    },
    /// A thread hit a trap requested in the run controls
    Breakpoint
    {
        /// Process
        process: Handle,
        /// Thread that hit the trap
        thread: Handle,
        /// Trap address
        address: Address,
        /// Caller-chosen id of the matching trap
        trap_id: Option<u64>,
    },
    /// A thread hit a trap instruction nobody asked for
    Trap
    {
        /// Process
        process: Handle,
        /// Thread
        thread: Handle,
        /// Trap address
        address: Address,
    },
    /// The single-step thread completed its step
    SingleStep
    {
        /// Process
        process: Handle,
        /// Stepped thread
        thread: Handle,
        /// New instruction pointer
        address: Address,
    },
    /// A thread raised an exception or received a signal
    Exception
    {
        /// Process
        process: Handle,
        /// Faulting thread
        thread: Handle,
        /// Faulting address
        address: Address,
        /// OS exception code
        code: u32,
        /// Signal number (POSIX), 0 elsewhere
        signo: u32,
        /// Classification
        kind: ExceptionKind,
        /// Same exception as the one redelivered at the start of this run
        repeated: bool,
    },
    /// The run was interrupted by [`Session::halt`](crate::session::Session::halt)
    Halt
    {
        /// Process that reported the stop, if any
        process: Option<Handle>,
        /// Thread that reported the stop, if any
        thread: Option<Handle>,
        /// Code passed to `halt`
        code: u64,
        /// User data passed to `halt`
        user_data: u64,
    },
    /// Address space change in a process
    Memory
    {
        /// Process
        process: Handle,
        /// What changed
        kind: MemoryEventKind,
        /// Start of the range
        address: Address,
        /// Size of the range
        size: u64,
    },
    /// Debug output from the target
    DebugString
    {
        /// Process
        process: Handle,
        /// Thread that wrote it
        thread: Handle,
        /// Text
        text: String,
    },
    /// The target named one of its threads
    SetThreadName
    {
        /// Process
        process: Handle,
        /// Thread being named
        thread: Handle,
        /// New name
        name: String,
    },
}

impl Event
{
    /// Discriminant of this event
    pub fn kind(&self) -> EventKind
    {
        match self {
            Self::Error { .. } => EventKind::Error,
            Self::HandshakeComplete { .. } => EventKind::HandshakeComplete,
            Self::CreateProcess { .. } => EventKind::CreateProcess,
            Self::ExitProcess { .. } => EventKind::ExitProcess,
            Self::CreateThread { .. } => EventKind::CreateThread,
            Self::ExitThread { .. } => EventKind::ExitThread,
            Self::LoadModule { .. } => EventKind::LoadModule,
            Self::UnloadModule { .. } => EventKind::UnloadModule,
            Self::Breakpoint { .. } => EventKind::Breakpoint,
            Self::Trap { .. } => EventKind::Trap,
            Self::SingleStep { .. } => EventKind::SingleStep,
            Self::Exception { .. } => EventKind::Exception,
            Self::Halt { .. } => EventKind::Halt,
            Self::Memory { .. } => EventKind::Memory,
            Self::DebugString { .. } => EventKind::DebugString,
            Self::SetThreadName { .. } => EventKind::SetThreadName,
        }
    }

    /// Process this event concerns, if any
    pub fn process(&self) -> Option<Handle>
    {
        match self {
            Self::Error { process, .. } | Self::Halt { process, .. } => *process,
            Self::DebugString { process, .. } | Self::SetThreadName { process, .. } => Some(*process),
            Self::HandshakeComplete { process }
            | Self::CreateProcess { process, .. }
            | Self::ExitProcess { process, .. }
            | Self::CreateThread { process, .. }
            | Self::ExitThread { process, .. }
            | Self::LoadModule { process, .. }
            | Self::UnloadModule { process, .. }
            | Self::Breakpoint { process, .. }
            | Self::Trap { process, .. }
            | Self::SingleStep { process, .. }
            | Self::Exception { process, .. }
            | Self::Memory { process, .. } => Some(*process),
        }
    }

    /// Thread this event concerns, if any
    pub fn thread(&self) -> Option<Handle>
    {
        match self {
            Self::Halt { thread, .. } => *thread,
            Self::CreateThread { thread, .. }
            | Self::ExitThread { thread, .. }
            | Self::Breakpoint { thread, .. }
            | Self::Trap { thread, .. }
            | Self::SingleStep { thread, .. }
            | Self::Exception { thread, .. }
            | Self::DebugString { thread, .. }
            | Self::SetThreadName { thread, .. } => Some(*thread),
            _ => None,
        }
    }

    /// Human-readable description of the event
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Error { kind, message, .. } => format!("Error ({kind:?}): {message}"),
            Self::HandshakeComplete { process } => format!("Handshake complete for process {process}"),
            Self::CreateProcess { process, pid } => format!("Process {pid} created ({process})"),
            Self::ExitProcess { process, code } => format!("Process {process} exited with code {code}"),
            Self::CreateThread { thread, tid, .. } => format!("Thread {tid} created ({thread})"),
            Self::ExitThread { thread, code, .. } => format!("Thread {thread} exited with code {code}"),
            Self::LoadModule { base, size, name, .. } => {
                let name = if name.is_empty() { "<unnamed>" } else { name.as_str() };
                format!("Loaded {name} at {base} (0x{size:x} bytes)")
            }
            Self::UnloadModule { module, .. } => format!("Unloaded module {module}"),
            Self::Breakpoint { thread, address, trap_id, .. } => match trap_id {
                Some(id) => format!("Thread {thread} hit breakpoint #{id} at {address}"),
                None => format!("Thread {thread} hit breakpoint at {address}"),
            },
            Self::Trap { thread, address, .. } => format!("Thread {thread} hit trap at {address}"),
            Self::SingleStep { thread, address, .. } => format!("Thread {thread} stepped to {address}"),
            Self::Exception {
                thread,
                address,
                code,
                kind,
                repeated,
                ..
            } => {
                let again = if *repeated { " (repeated)" } else { "" };
                format!("Thread {thread} raised {kind:?} exception 0x{code:x} at {address}{again}")
            }
            Self::Halt { code, user_data, .. } => format!("Halted (code {code}, user data 0x{user_data:x})"),
            Self::Memory { kind, address, size, .. } => format!("Memory {kind:?} at {address} (0x{size:x} bytes)"),
            Self::DebugString { text, .. } => format!("Debug output: {}", text.trim_end()),
            Self::SetThreadName { thread, name, .. } => format!("Thread {thread} named {name:?}"),
        }
    }
}

impl fmt::Display for Event
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(&self.describe())
    }
}

/// Ordered events of one run
///
/// Append-only while the run drains; owned by the caller afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventList
{
    events: Vec<Event>,
}

impl EventList
{
    /// Empty list
    pub fn new() -> Self
    {
        Self::default()
    }

    /// List holding one event
    pub fn single(event: Event) -> Self
    {
        Self { events: vec![event] }
    }

    /// Append an event
    pub fn push(&mut self, event: Event)
    {
        self.events.push(event);
    }

    /// Number of events
    pub fn len(&self) -> usize
    {
        self.events.len()
    }

    /// Whether no events were produced
    pub fn is_empty(&self) -> bool
    {
        self.events.is_empty()
    }

    /// Iterate in order
    pub fn iter(&self) -> std::slice::Iter<'_, Event>
    {
        self.events.iter()
    }

    /// Events of one kind, in order
    pub fn of_kind(&self, kind: EventKind) -> impl Iterator<Item = &Event>
    {
        self.events.iter().filter(move |e| e.kind() == kind)
    }

    /// The events as a slice
    pub fn as_slice(&self) -> &[Event]
    {
        &self.events
    }
}

impl IntoIterator for EventList
{
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter
    {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventList
{
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter
    {
        self.events.iter()
    }
}
