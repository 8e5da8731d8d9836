//! # Session
//!
//! One debugging context: a backend, the entity state behind its access gate,
//! the halt signal, and the run-state flag.
//!
//! Every public operation takes [`Handle`]s, revalidates them under the gate,
//! and hands the backend a [`Target`]. Backend failures outside a run come
//! back as [`CoreError::BackendFailure`].
//!
//! ## Threading
//!
//! `Session<B>` is `Sync` when `B` is. Typical use is one thread calling
//! [`run`](Session::run) in a loop while a UI thread inspects entities and
//! calls [`halt`](Session::halt) to interrupt:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::thread;
//!
//! use tether_core::backend::replay::ReplayBackend;
//! use tether_core::{RunCtrls, Session, SessionConfig};
//!
//! let session = Arc::new(Session::new(ReplayBackend::new(), SessionConfig::default()).unwrap());
//! session.attach_process(1234).unwrap();
//!
//! let runner = {
//!     let session = Arc::clone(&session);
//!     thread::spawn(move || session.run(&RunCtrls::default()))
//! };
//! session.halt(1, 0);
//! let events = runner.join().unwrap().unwrap();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::{debug, info};

use crate::access::{AccessGate, AccessScope, CoreState};
use crate::accel;
use crate::backend::{Backend, HostProcess, NativeRun, SnapshotId, Target};
use crate::config::SessionConfig;
use crate::entity::{EntityIndex, EntityKind, EntityStore};
use crate::error::{CoreError, CoreResult};
use crate::events::EventList;
use crate::handle::Handle;
use crate::memory::{self, MemoryProtect};
use crate::run::dispatch::{self, Prepared};
use crate::run::{HaltSignal, RunCtrls, RunPhase};
use crate::types::{Address, Architecture, RegisterBlock};

/// A debugging session over backend `B`
pub struct Session<B: Backend>
{
    backend: B,
    gate: AccessGate,
    halt: HaltSignal,
    running: AtomicBool,
    phase: AtomicU8,
    config: SessionConfig,
}

/// Clears the run flag when a run ends, however it ends
struct RunGuard<'a>
{
    running: &'a AtomicBool,
    phase: &'a AtomicU8,
}

impl<'a> RunGuard<'a>
{
    fn acquire(running: &'a AtomicBool, phase: &'a AtomicU8) -> CoreResult<Self>
    {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CoreError::RunInProgress)?;
        let guard = Self { running, phase };
        guard.enter(RunPhase::Dispatching);
        Ok(guard)
    }

    fn enter(&self, phase: RunPhase)
    {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

impl Drop for RunGuard<'_>
{
    fn drop(&mut self)
    {
        self.phase.store(RunPhase::Idle as u8, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}

impl<B: Backend> Session<B>
{
    /// Create a session and initialise the backend
    ///
    /// ## Errors
    ///
    /// - [`CoreError::InvalidConfig`] if `config` fails validation
    /// - [`CoreError::BackendFailure`] if the backend's `init` fails
    pub fn new(backend: B, config: SessionConfig) -> CoreResult<Self>
    {
        config.validate()?;
        backend.init()?;
        info!(
            "session ready (capacity {}, {} map buckets)",
            config.entity_capacity, config.map_buckets
        );
        Ok(Self {
            backend,
            gate: AccessGate::new(CoreState::new(&config)),
            halt: HaltSignal::new(),
            running: AtomicBool::new(false),
            phase: AtomicU8::new(RunPhase::Idle as u8),
            config,
        })
    }

    /// The backend
    pub fn backend(&self) -> &B
    {
        &self.backend
    }

    /// The configuration the session was built with
    pub fn config(&self) -> &SessionConfig
    {
        &self.config
    }

    /// Enter the access gate
    ///
    /// While the returned scope lives, no run can restructure the entity
    /// tree. Scopes nest on the same thread.
    pub fn access_begin(&self) -> AccessScope<'_>
    {
        self.gate.enter()
    }

    fn with_state<T>(&self, f: impl FnOnce(&CoreState) -> CoreResult<T>) -> CoreResult<T>
    {
        let scope = self.access_begin();
        let state = scope.state()?;
        f(&state)
    }

    fn with_state_mut<T>(&self, f: impl FnOnce(&mut CoreState) -> CoreResult<T>) -> CoreResult<T>
    {
        let scope = self.access_begin();
        let mut state = scope.state_mut()?;
        f(&mut state)
    }

    /// Like [`with_state`](Self::with_state), for calls that change the
    /// target or the tree; refused while a run is in flight
    fn with_idle_state<T>(&self, f: impl FnOnce(&CoreState) -> CoreResult<T>) -> CoreResult<T>
    {
        let scope = self.access_begin();
        self.ensure_idle()?;
        let state = scope.state()?;
        f(&state)
    }

    fn with_idle_state_mut<T>(&self, f: impl FnOnce(&mut CoreState) -> CoreResult<T>) -> CoreResult<T>
    {
        let scope = self.access_begin();
        self.ensure_idle()?;
        let mut state = scope.state_mut()?;
        f(&mut state)
    }

    // Checked under the gate: a run that starts afterwards blocks in its
    // dispatch phase until the caller leaves.
    fn ensure_idle(&self) -> CoreResult<()>
    {
        if self.running.load(Ordering::Acquire) {
            return Err(CoreError::RunInProgress);
        }
        Ok(())
    }

    fn target_of(store: &EntityStore, handle: Handle, kind: EntityKind) -> CoreResult<(EntityIndex, Target)>
    {
        let index = store.entity_from_handle_of_kind(handle, kind)?;
        let target = store.target(index).ok_or(CoreError::StaleHandle(handle))?;
        Ok((index, target))
    }

    // ----- introspection -----

    /// Whether `handle` names a live entity
    pub fn object_exists(&self, handle: Handle) -> bool
    {
        self.with_state(|s| Ok(s.entities.entity_from_handle(handle).is_ok()))
            .unwrap_or(false)
    }

    /// Kind of the entity `handle` names
    pub fn kind_from_object(&self, handle: Handle) -> CoreResult<EntityKind>
    {
        self.with_state(|s| {
            let index = s.entities.entity_from_handle(handle)?;
            Ok(s.entities.get(index).map_or(EntityKind::Root, |e| e.kind()))
        })
    }

    /// Architecture of the entity `handle` names
    pub fn arch_from_object(&self, handle: Handle) -> CoreResult<Architecture>
    {
        self.with_state(|s| {
            let index = s.entities.entity_from_handle(handle)?;
            Ok(s.entities.get(index).map_or(Architecture::Unknown, |e| e.arch()))
        })
    }

    /// OS id of the entity `handle` names (PID, TID, or module base)
    pub fn id_from_object(&self, handle: Handle) -> CoreResult<u64>
    {
        self.with_state(|s| {
            let index = s.entities.entity_from_handle(handle)?;
            Ok(s.entities.get(index).map_or(0, |e| e.id()))
        })
    }

    /// Parent of the entity `handle` names ([`Handle::NULL`] for processes)
    pub fn parent_from_object(&self, handle: Handle) -> CoreResult<Handle>
    {
        self.with_state(|s| {
            let index = s.entities.entity_from_handle(handle)?;
            let parent = s.entities.get(index).and_then(|e| e.parent());
            Ok(parent.map_or(Handle::NULL, |p| s.entities.handle_from_entity(p)))
        })
    }

    /// Live entity of `kind` with OS id `id`
    pub fn find(&self, kind: EntityKind, id: u64) -> Option<Handle>
    {
        self.with_state(|s| Ok(s.entities.find(kind, id).map(|i| s.entities.handle_from_entity(i))))
            .ok()
            .flatten()
    }

    /// Base address of a module
    pub fn base_vaddr_from_module(&self, module: Handle) -> CoreResult<Address>
    {
        self.with_state(|s| {
            let (_, target) = Self::target_of(&s.entities, module, EntityKind::Module)?;
            Ok(Address::new(target.id))
        })
    }

    /// `[base, base + size)` of a module
    pub fn vaddr_range_from_module(&self, module: Handle) -> CoreResult<(Address, Address)>
    {
        self.with_state(|s| {
            let (index, target) = Self::target_of(&s.entities, module, EntityKind::Module)?;
            let size = s.entities.get(index).map_or(0, |e| e.size());
            let base = Address::new(target.id);
            Ok((base, base + size))
        })
    }

    /// Full path of a module's image (cached after the first lookup)
    pub fn full_path_from_module(&self, module: Handle) -> CoreResult<String>
    {
        self.with_state_mut(|s| {
            let index = s.entities.entity_from_handle_of_kind(module, EntityKind::Module)?;
            accel::full_path_from_module(&mut s.entities, &self.backend, index)
        })
    }

    /// Stack base of a thread (cached after the first lookup)
    pub fn stack_base_vaddr_from_thread(&self, thread: Handle) -> CoreResult<Address>
    {
        self.with_state_mut(|s| {
            let index = s.entities.entity_from_handle_of_kind(thread, EntityKind::Thread)?;
            accel::stack_base_from_thread(&mut s.entities, &self.backend, index)
        })
    }

    /// TLS root of a thread (cached after the first lookup)
    pub fn tls_root_vaddr_from_thread(&self, thread: Handle) -> CoreResult<Address>
    {
        self.with_state_mut(|s| {
            let index = s.entities.entity_from_handle_of_kind(thread, EntityKind::Thread)?;
            accel::tls_root_from_thread(&mut s.entities, &self.backend, index)
        })
    }

    /// Every live process, in creation order
    pub fn all_processes(&self) -> Vec<Handle>
    {
        self.with_state(|s| {
            let store = &s.entities;
            Ok(store
                .children(store.root())
                .filter(|i| store.get(*i).is_some_and(|e| e.kind() == EntityKind::Process))
                .map(|i| store.handle_from_entity(i))
                .collect())
        })
        .unwrap_or_default()
    }

    fn children_of_kind(&self, process: Handle, kind: EntityKind) -> CoreResult<Vec<Handle>>
    {
        self.with_state(|s| {
            let store = &s.entities;
            let index = store.entity_from_handle_of_kind(process, EntityKind::Process)?;
            Ok(store
                .children(index)
                .filter(|i| store.get(*i).is_some_and(|e| e.kind() == kind))
                .map(|i| store.handle_from_entity(i))
                .collect())
        })
    }

    /// Threads of a process, in creation order
    pub fn threads_from_process(&self, process: Handle) -> CoreResult<Vec<Handle>>
    {
        self.children_of_kind(process, EntityKind::Thread)
    }

    /// Modules of a process, in load order
    pub fn modules_from_process(&self, process: Handle) -> CoreResult<Vec<Handle>>
    {
        self.children_of_kind(process, EntityKind::Module)
    }

    /// Whether the last run held this thread or process frozen
    pub fn is_frozen(&self, handle: Handle) -> CoreResult<bool>
    {
        self.with_state(|s| {
            let index = s.entities.entity_from_handle(handle)?;
            Ok(s.entities.get(index).is_some_and(|e| e.is_frozen()))
        })
    }

    /// Current value of the step counter
    pub fn step_counter(&self) -> u64
    {
        self.with_state(|s| Ok(s.step())).unwrap_or(0)
    }

    // ----- memory -----

    /// Reserve `size` bytes in a process
    pub fn reserve_memory(&self, process: Handle, size: u64) -> CoreResult<Address>
    {
        self.with_idle_state(|s| {
            let (_, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            Ok(self.backend.reserve_memory(&target, size)?)
        })
    }

    /// Change the protection of a range in a process
    pub fn set_memory_protect_flags(
        &self,
        process: Handle,
        address: Address,
        size: u64,
        flags: MemoryProtect,
    ) -> CoreResult<()>
    {
        self.with_idle_state(|s| {
            let (_, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            Ok(self.backend.set_memory_protect_flags(&target, address, size, flags)?)
        })
    }

    /// Release memory obtained from [`reserve_memory`](Self::reserve_memory)
    pub fn release_memory(&self, process: Handle, address: Address, size: u64) -> CoreResult<()>
    {
        self.with_idle_state(|s| {
            let (_, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            Ok(self.backend.release_memory(&target, address, size)?)
        })
    }

    /// Read process memory; returns the number of bytes read
    pub fn read_memory(&self, process: Handle, address: Address, dst: &mut [u8]) -> CoreResult<usize>
    {
        self.with_state(|s| {
            let (_, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            Ok(self.backend.read_memory(&target, address, dst)?)
        })
    }

    /// Write process memory
    pub fn write_memory(&self, process: Handle, address: Address, src: &[u8]) -> CoreResult<()>
    {
        self.with_idle_state(|s| {
            let (_, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            Ok(self.backend.write_memory(&target, address, src)?)
        })
    }

    /// Read as much of `[address, address + dst.len())` as is readable
    ///
    /// Returns the length of the readable prefix. See [`memory::read_amap`].
    pub fn read_memory_amap(&self, process: Handle, address: Address, dst: &mut [u8]) -> CoreResult<usize>
    {
        self.with_state(|s| {
            let (_, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            Ok(memory::read_amap(address, dst, |addr, buf| {
                matches!(self.backend.read_memory(&target, addr, buf), Ok(n) if n == buf.len())
            }))
        })
    }

    // ----- registers -----

    /// Registers of a thread, served from cache within one step
    pub fn read_registers(&self, thread: Handle) -> CoreResult<RegisterBlock>
    {
        self.with_state_mut(|s| {
            let index = s.entities.entity_from_handle_of_kind(thread, EntityKind::Thread)?;
            let step = s.step;
            accel::read_registers(&mut s.entities, &self.backend, index, step)
        })
    }

    /// Write a thread's registers
    ///
    /// ## Errors
    ///
    /// [`CoreError::NotSupported`] if the block's architecture does not match
    /// the thread's.
    pub fn write_registers(&self, thread: Handle, block: &RegisterBlock) -> CoreResult<()>
    {
        self.with_idle_state_mut(|s| {
            let index = s.entities.entity_from_handle_of_kind(thread, EntityKind::Thread)?;
            let arch = s.entities.get(index).map_or(Architecture::Unknown, |e| e.arch());
            if block.arch() != arch {
                return Err(CoreError::NotSupported(format!(
                    "{} register block for a {} thread",
                    block.arch(),
                    arch
                )));
            }
            let step = s.step;
            accel::write_registers(&mut s.entities, &self.backend, index, step, block)
        })
    }

    /// Instruction pointer of a thread
    pub fn read_ip(&self, thread: Handle) -> CoreResult<Address>
    {
        Ok(self.read_registers(thread)?.instruction_pointer())
    }

    /// Stack pointer of a thread
    pub fn read_sp(&self, thread: Handle) -> CoreResult<Address>
    {
        Ok(self.read_registers(thread)?.stack_pointer())
    }

    /// Move a thread's instruction pointer
    pub fn write_ip(&self, thread: Handle, address: Address) -> CoreResult<()>
    {
        let scope = self.access_begin();
        self.ensure_idle()?;
        let mut regs = self.read_registers(thread)?;
        regs.set_instruction_pointer(address);
        let result = self.write_registers(thread, &regs);
        drop(scope);
        result
    }

    // ----- process lifecycle -----

    /// Launch a process; its entities appear during the next run
    pub fn launch_process(&self, options: &B::LaunchOptions) -> CoreResult<u32>
    {
        self.with_idle_state_mut(|s| {
            let pid = self.backend.launch_process(options)?;
            s.pending_attaches += 1;
            debug!("launched process {}", pid);
            Ok(pid)
        })
    }

    /// Attach to a process; its entities appear during the next run
    pub fn attach_process(&self, pid: u32) -> CoreResult<()>
    {
        self.with_idle_state_mut(|s| {
            self.backend.attach_process(pid)?;
            s.pending_attaches += 1;
            debug!("attaching to process {}", pid);
            Ok(())
        })
    }

    /// Kill a process; its exit is reported by the next run
    pub fn kill_process(&self, process: Handle, exit_code: u32) -> CoreResult<()>
    {
        self.with_idle_state(|s| {
            let (_, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            self.backend.kill_process(&target, exit_code)?;
            Ok(())
        })
    }

    /// Detach from a process and forget its subtree immediately
    pub fn detach_process(&self, process: Handle) -> CoreResult<()>
    {
        self.with_idle_state_mut(|s| {
            let (index, target) = Self::target_of(&s.entities, process, EntityKind::Process)?;
            self.backend.detach_process(&target)?;
            let released = s.entities.release_root_and_children(index)?;
            debug!("detached from process {}, released {} entities", target.id, released.len());
            for entity in &released {
                self.backend.entity_cleanup(entity);
            }
            Ok(())
        })
    }

    /// Capture a thread's execution state
    pub fn snapshot_thread(&self, thread: Handle) -> CoreResult<SnapshotId>
    {
        self.with_state(|s| {
            let (_, target) = Self::target_of(&s.entities, thread, EntityKind::Thread)?;
            Ok(self.backend.create_snapshot(&target)?)
        })
    }

    /// Discard a snapshot taken with [`snapshot_thread`](Self::snapshot_thread)
    pub fn release_snapshot(&self, thread: Handle, snapshot: SnapshotId) -> CoreResult<()>
    {
        self.with_state(|s| {
            let (_, target) = Self::target_of(&s.entities, thread, EntityKind::Thread)?;
            Ok(self.backend.release_snapshot(&target, snapshot)?)
        })
    }

    /// Processes on the host
    pub fn host_processes(&self) -> CoreResult<Vec<HostProcess>>
    {
        Ok(self.backend.host_processes()?)
    }

    // ----- run control -----

    /// Resume the target as described by `ctrls` and block for events
    ///
    /// Problems with the controls or the backend are reported inside the
    /// returned list as [`Event::Error`](crate::events::Event::Error).
    ///
    /// ## Errors
    ///
    /// - [`CoreError::RunInProgress`] if another thread is inside `run`
    /// - [`CoreError::ConcurrentAccessViolation`] if called while this thread
    ///   holds a borrow of the entity state
    pub fn run(&self, ctrls: &RunCtrls) -> CoreResult<EventList>
    {
        let guard = RunGuard::acquire(&self.running, &self.phase)?;

        let prepared = {
            let scope = self.access_begin();
            let mut state = scope.state_mut()?;
            match dispatch::prepare(&mut state, &self.backend, ctrls) {
                Prepared::Ready(run) => run,
                Prepared::Done(events) => return Ok(events),
            }
        };

        guard.enter(RunPhase::Waiting);
        let native = if self.halt.is_raised() {
            debug!("halt already pending, skipping backend run");
            NativeRun::default()
        } else {
            self.backend.run(&prepared.native, &self.halt)
        };

        guard.enter(RunPhase::Draining);
        let scope = self.access_begin();
        let mut state = scope.state_mut()?;
        let events = dispatch::drain(&mut state, &self.backend, prepared, native, &self.halt);
        debug!("run finished with {} events", events.len());
        Ok(events)
    }

    /// Interrupt the current run (or the next one, if none is in flight)
    ///
    /// `code` and `user_data` come back in the run's
    /// [`Event::Halt`](crate::events::Event::Halt). Callable from any thread.
    pub fn halt(&self, code: u64, user_data: u64)
    {
        self.halt.raise(code, user_data);
        self.backend.halt(code, user_data);
    }

    /// Whether a run is in flight
    pub fn is_running(&self) -> bool
    {
        self.running.load(Ordering::Acquire)
    }

    /// Phase of the run in flight ([`RunPhase::Idle`] if none)
    pub fn run_phase(&self) -> RunPhase
    {
        RunPhase::from_u8(self.phase.load(Ordering::Acquire))
    }
}
