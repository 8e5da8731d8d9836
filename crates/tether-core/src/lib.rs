//! # tether-core
//!
//! Process-control core for the Tether debugger.
//!
//! This crate owns everything between a debugger frontend and the operating
//! system's debug API:
//! - The entity tree (root, processes, threads, modules) and its identity map
//! - Generation-stamped handles that are revalidated on every use
//! - An acceleration cache for expensive introspection (module paths, stack
//!   and TLS bases, register blocks)
//! - The run-control dispatcher that resumes the target, blocks for debug
//!   events, and turns them into a uniform [`EventList`]
//!
//! ## Backends
//!
//! The actual OS primitives (ptrace, the Windows Debug API, Mach) live behind
//! the [`Backend`] trait. The core never talks to the kernel itself; it hands
//! backends validated [`Target`] views and receives [`NativeEvent`]s back.
//! A scripted [`backend::replay::ReplayBackend`] is included for tests and
//! offline replay.
//!
//! ## Threading
//!
//! A [`Session`] is `Sync` when its backend is. One thread at a time may be
//! inside [`Session::run`]; any other thread may call [`Session::halt`] to
//! interrupt it, or inspect entities through [`Session::access_begin`].

pub mod accel;
pub mod access;
pub mod backend;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod handle;
pub mod memory;
pub mod prelude;
pub mod run;
pub mod session;
pub mod types;

pub use backend::{Backend, NativeEvent, Target};
pub use config::SessionConfig;
pub use entity::{EntityKind, EntityStore};
// Re-export commonly used types
pub use error::{BackendError, CoreError, CoreResult};
pub use events::{Event, EventKind, EventList};
pub use handle::Handle;
pub use run::{RunCtrls, RunPhase, Trap};
pub use session::Session;
pub use types::{Address, Architecture, RegisterBlock};
