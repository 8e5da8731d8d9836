//! Common module for library exports

pub use crate::backend::replay::ReplayBackend;
pub use crate::backend::{Backend, NativeEvent, NativeRun, NativeRunCtrls, Target};
pub use crate::config::SessionConfig;
pub use crate::entity::EntityKind;
pub use crate::error::{BackendError, BackendResult, CoreError, CoreResult};
pub use crate::events::{ErrorKind, Event, EventKind, EventList, ExceptionKind};
pub use crate::handle::Handle;
pub use crate::memory::MemoryProtect;
pub use crate::run::{HaltSignal, RunCtrls, RunPhase, Trap};
pub use crate::session::Session;
pub use crate::types::{Address, Architecture, RegisterBlock};
