//! Dispatching and draining of one run.
//!
//! [`prepare`] and [`drain`] both run with the access gate held and the state
//! mutably borrowed; the session releases the gate between them while the
//! backend blocks.

use std::collections::HashSet;

use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace, warn};

use super::{HaltSignal, RunCtrls};
use crate::access::{CoreState, PendingExceptionRecord};
use crate::accel;
use crate::backend::{Backend, NativeEvent, NativeRun, NativeRunCtrls, NativeTrap, PendingException, Target};
use crate::entity::{EntityIndex, EntityKind, EntityStore};
use crate::error::CoreResult;
use crate::events::{ErrorKind, Event, EventList};
use crate::handle::Handle;
use crate::types::{Address, Architecture};

/// Trap this run wrote into the target, with the bytes it replaced
#[derive(Debug, Clone)]
struct InstalledTrap
{
    target: Target,
    address: Address,
    original: SmallVec<[u8; 4]>,
}

/// Trap requested by the caller, installed or pre-existing
#[derive(Debug, Clone, Copy)]
struct RequestedTrap
{
    pid: u64,
    address: Address,
    id: Option<u64>,
    installed: bool,
}

/// A run that passed validation and is ready for the backend
#[derive(Debug)]
pub(crate) struct PreparedRun
{
    pub native: NativeRunCtrls,
    installed: Vec<InstalledTrap>,
    requested: Vec<RequestedTrap>,
    single_step_tid: Option<u64>,
    redelivered: Option<PendingExceptionRecord>,
}

pub(crate) enum Prepared
{
    /// Hand this to the backend
    Ready(PreparedRun),
    /// The run ended during dispatch; return these events
    Done(EventList),
}

struct Resolved
{
    listed: Vec<EntityIndex>,
    single_step: Option<EntityIndex>,
    traps: Vec<(EntityIndex, Address, Option<u64>)>,
}

fn resolve(store: &EntityStore, ctrls: &RunCtrls) -> CoreResult<Resolved>
{
    let listed_kind = if ctrls.run_entities_are_processes {
        EntityKind::Process
    } else {
        EntityKind::Thread
    };
    let listed = ctrls
        .run_entities
        .iter()
        .map(|h| store.entity_from_handle_of_kind(*h, listed_kind))
        .collect::<CoreResult<Vec<_>>>()?;
    let single_step = ctrls
        .single_step_thread
        .map(|h| store.entity_from_handle_of_kind(h, EntityKind::Thread))
        .transpose()?;
    let traps = ctrls
        .traps
        .iter()
        .map(|t| Ok((store.entity_from_handle_of_kind(t.process, EntityKind::Process)?, t.address, t.id)))
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(Resolved {
        listed,
        single_step,
        traps,
    })
}

/// Dispatching phase
///
/// Validates the controls, consumes the pending exception, computes freeze
/// marks, and plants traps. Returns [`Prepared::Done`] when the run cannot
/// start; the backend is not called in that case.
pub(crate) fn prepare<B: Backend>(state: &mut CoreState, backend: &B, ctrls: &RunCtrls) -> Prepared
{
    let resolved = match resolve(&state.entities, ctrls) {
        Ok(resolved) => resolved,
        Err(e) => {
            debug!("rejecting run controls: {}", e);
            return Prepared::Done(EventList::single(Event::Error {
                kind: ErrorKind::InvalidHandle,
                process: None,
                message: e.to_string(),
            }));
        }
    };

    if state.entities.count(EntityKind::Process) == 0 && state.pending_attaches == 0 {
        return Prepared::Done(EventList::single(Event::Error {
            kind: ErrorKind::NotAttached,
            process: None,
            message: "no process is attached or being launched".into(),
        }));
    }

    // The previous exception is consumed whether or not it is redelivered.
    let previous = state.pending_exception.take();
    let mut redelivered = None;
    let mut redeliver_exception = None;
    if let Some(record) = previous {
        if ctrls.ignore_previous_exception {
            debug!("dropping pending exception {:#x} on thread {}", record.code, record.thread);
        } else if let Some(thread) = state
            .entities
            .entity_from_handle_of_kind(record.thread, EntityKind::Thread)
            .ok()
            .and_then(|t| state.entities.target(t))
        {
            redelivered = Some(record);
            redeliver_exception = Some(PendingException {
                thread,
                code: record.code,
                signo: record.signo,
                address: Address::new(record.address),
            });
        }
    }

    let mut native = NativeRunCtrls {
        redeliver_exception,
        ..NativeRunCtrls::default()
    };
    mark_frozen(&mut state.entities, ctrls, &resolved, &mut native);

    let single_step_tid = resolved.single_step.and_then(|t| state.entities.get(t)).map(|e| e.id());
    native.single_step = resolved.single_step.and_then(|t| state.entities.target(t));

    let (installed, requested) = install_traps(&state.entities, backend, &resolved.traps);
    native.traps = installed
        .iter()
        .map(|t| NativeTrap {
            process: t.target,
            address: t.address,
        })
        .collect();

    debug!(
        "dispatching run: {} resumed, {} frozen, {} traps planted",
        native.resume.len(),
        native.frozen.len(),
        installed.len()
    );

    Prepared::Ready(PreparedRun {
        native,
        installed,
        requested,
        single_step_tid,
        redelivered,
    })
}

fn mark_frozen(store: &mut EntityStore, ctrls: &RunCtrls, resolved: &Resolved, native: &mut NativeRunCtrls)
{
    let processes: Vec<EntityIndex> = store
        .children(store.root())
        .filter(|p| store.get(*p).is_some_and(|e| e.kind() == EntityKind::Process))
        .collect();

    for process in processes {
        let process_listed = ctrls.run_entities_are_processes && resolved.listed.contains(&process);
        let threads: Vec<EntityIndex> = store
            .children(process)
            .filter(|t| store.get(*t).is_some_and(|e| e.kind() == EntityKind::Thread))
            .collect();

        let mut all_frozen = !threads.is_empty();
        for thread in threads {
            let frozen = match resolved.single_step {
                Some(stepper) => thread != stepper,
                None => {
                    let listed = if ctrls.run_entities_are_processes {
                        process_listed
                    } else {
                        resolved.listed.contains(&thread)
                    };
                    listed != ctrls.run_entities_are_unfrozen
                }
            };
            all_frozen &= frozen;
            if let Some(entity) = store.get_mut(thread) {
                entity.frozen = frozen;
            }
            if let Some(target) = store.target(thread) {
                if frozen {
                    native.frozen.push(target);
                } else {
                    native.resume.push(target);
                }
            }
        }
        if let Some(entity) = store.get_mut(process) {
            entity.frozen = all_frozen;
        }
    }
}

fn install_traps<B: Backend>(
    store: &EntityStore,
    backend: &B,
    traps: &[(EntityIndex, Address, Option<u64>)],
) -> (Vec<InstalledTrap>, Vec<RequestedTrap>)
{
    let mut seen = HashSet::new();
    let mut installed = Vec::new();
    let mut requested = Vec::new();

    for &(process, address, id) in traps {
        if !seen.insert((process, address)) {
            continue;
        }
        let Some(target) = store.target(process) else {
            continue;
        };
        let mut request = RequestedTrap {
            pid: target.id,
            address,
            id,
            installed: false,
        };

        let trap = target.arch.trap_instruction();
        if trap.is_empty() {
            warn!("cannot plant trap at {} in process {}: unknown architecture", address, target.id);
            requested.push(request);
            continue;
        }

        let mut original: SmallVec<[u8; 4]> = smallvec![0; trap.len()];
        match backend.read_memory(&target, address, &mut original) {
            Ok(n) if n == trap.len() => {}
            Ok(_) | Err(_) => {
                warn!("cannot read original bytes at {} in process {}", address, target.id);
                requested.push(request);
                continue;
            }
        }
        if original.as_slice() == trap {
            trace!("trap at {} already present in process {}", address, target.id);
            requested.push(request);
            continue;
        }
        match backend.write_memory(&target, address, trap) {
            Ok(()) => {
                request.installed = true;
                installed.push(InstalledTrap {
                    target,
                    address,
                    original,
                });
            }
            Err(e) => warn!("cannot plant trap at {} in process {}: {}", address, target.id, e),
        }
        requested.push(request);
    }
    (installed, requested)
}

fn remove_traps<B: Backend>(backend: &B, installed: &[InstalledTrap])
{
    for trap in installed.iter().rev() {
        if let Err(e) = backend.write_memory(&trap.target, trap.address, &trap.original) {
            warn!("cannot restore bytes at {} in process {}: {}", trap.address, trap.target.id, e);
        }
    }
}

/// Draining phase
///
/// Removes the traps this run planted, then translates the backend's events
/// in order. The step counter is bumped once for the run and once per native
/// event.
pub(crate) fn drain<B: Backend>(
    state: &mut CoreState,
    backend: &B,
    run: PreparedRun,
    native: NativeRun,
    halt: &HaltSignal,
) -> EventList
{
    state.bump_step();
    remove_traps(backend, &run.installed);

    let mut events = EventList::new();
    for event in native.events {
        state.bump_step();
        trace!("draining {:?}", event);
        translate(state, backend, &run, event, halt, &mut events);
    }

    if let Some(failure) = native.failure {
        warn!("backend failure during run: {}", failure);
        events.push(Event::Error {
            kind: ErrorKind::BackendFailure,
            process: None,
            message: failure.to_string(),
        });
    }

    if let Some(request) = halt.take() {
        events.push(Event::Halt {
            process: None,
            thread: None,
            code: request.code,
            user_data: request.user_data,
        });
    }
    events
}

fn unexpected(events: &mut EventList, process: Option<Handle>, error: &crate::error::CoreError)
{
    warn!("{}", error);
    events.push(Event::Error {
        kind: ErrorKind::UnexpectedFailure,
        process,
        message: error.to_string(),
    });
}

fn process_of(store: &EntityStore, pid: u32) -> Option<EntityIndex>
{
    store.find(EntityKind::Process, u64::from(pid))
}

fn thread_of(store: &EntityStore, tid: u32) -> Option<EntityIndex>
{
    store.find(EntityKind::Thread, u64::from(tid))
}

/// Process `pid`, if it is the parent of `child`
fn owner_of(store: &EntityStore, child: EntityIndex, pid: u32) -> Option<EntityIndex>
{
    let process = process_of(store, pid)?;
    (store.get(child)?.parent() == Some(process)).then_some(process)
}

fn translate<B: Backend>(
    state: &mut CoreState,
    backend: &B,
    run: &PreparedRun,
    event: NativeEvent,
    halt: &HaltSignal,
    events: &mut EventList,
)
{
    let store = &mut state.entities;

    match event {
        NativeEvent::CreateProcess { pid, arch, ext } => {
            match store.new_entity(store.root(), EntityKind::Process, u64::from(pid)) {
                Ok(process) => {
                    if let Some(entity) = store.get_mut(process) {
                        entity.arch = arch;
                        entity.ext = ext;
                    }
                    state.pending_attaches = state.pending_attaches.saturating_sub(1);
                    events.push(Event::CreateProcess {
                        process: store.handle_from_entity(process),
                        pid,
                    });
                }
                Err(e) => unexpected(events, None, &e),
            }
        }
        NativeEvent::CreateThread { pid, tid, ext } => {
            let Some(process) = process_of(store, pid) else {
                warn!("thread {} created in unknown process {}", tid, pid);
                return;
            };
            let process_handle = store.handle_from_entity(process);
            match store.new_entity(process, EntityKind::Thread, u64::from(tid)) {
                Ok(thread) => {
                    if let Some(entity) = store.get_mut(thread) {
                        entity.ext = ext;
                    }
                    events.push(Event::CreateThread {
                        process: process_handle,
                        thread: store.handle_from_entity(thread),
                        tid,
                    });
                }
                Err(e) => unexpected(events, Some(process_handle), &e),
            }
        }
        NativeEvent::LoadModule {
            pid,
            base,
            size,
            name,
            ext,
        } => {
            let Some(process) = process_of(store, pid) else {
                warn!("module at {} loaded in unknown process {}", base, pid);
                return;
            };
            let process_handle = store.handle_from_entity(process);
            match store.new_entity(process, EntityKind::Module, base.value()) {
                Ok(module) => {
                    if let Some(entity) = store.get_mut(module) {
                        entity.addr_range_dim = size;
                        entity.ext = ext;
                    }
                    events.push(Event::LoadModule {
                        process: process_handle,
                        module: store.handle_from_entity(module),
                        base,
                        size,
                        name,
                    });
                }
                Err(e) => unexpected(events, Some(process_handle), &e),
            }
        }
        NativeEvent::ExitThread { pid, tid, code } => {
            let Some(thread) = thread_of(store, tid) else {
                warn!("unknown thread {} exited", tid);
                return;
            };
            let Some(process) = owner_of(store, thread, pid) else {
                warn!("thread {} exit reported for process {}, which does not own it", tid, pid);
                return;
            };
            let process_handle = store.handle_from_entity(process);
            let thread_handle = store.handle_from_entity(thread);
            events.push(Event::ExitThread {
                process: process_handle,
                thread: thread_handle,
                code,
            });
            match store.release_root_and_children(thread) {
                Ok(released) => released.iter().for_each(|t| backend.entity_cleanup(t)),
                Err(e) => warn!("releasing thread {}: {}", tid, e),
            }
        }
        NativeEvent::UnloadModule { pid, base } => {
            let Some(module) = store.find(EntityKind::Module, base.value()) else {
                warn!("unknown module at {} unloaded", base);
                return;
            };
            let Some(process) = owner_of(store, module, pid) else {
                warn!("module at {} unload reported for process {}, which does not own it", base, pid);
                return;
            };
            let process_handle = store.handle_from_entity(process);
            events.push(Event::UnloadModule {
                process: process_handle,
                module: store.handle_from_entity(module),
            });
            match store.release_root_and_children(module) {
                Ok(released) => released.iter().for_each(|t| backend.entity_cleanup(t)),
                Err(e) => warn!("releasing module at {}: {}", base, e),
            }
        }
        NativeEvent::ExitProcess { pid, code } => {
            let Some(process) = process_of(store, pid) else {
                warn!("unknown process {} exited", pid);
                return;
            };
            let process_handle = store.handle_from_entity(process);
            let children: Vec<EntityIndex> = store.children(process).collect();
            for child in children {
                let handle = store.handle_from_entity(child);
                match store.get(child).map(|e| e.kind()) {
                    Some(EntityKind::Thread) => events.push(Event::ExitThread {
                        process: process_handle,
                        thread: handle,
                        code,
                    }),
                    Some(EntityKind::Module) => events.push(Event::UnloadModule {
                        process: process_handle,
                        module: handle,
                    }),
                    _ => {}
                }
            }
            events.push(Event::ExitProcess {
                process: process_handle,
                code,
            });
            match store.release_root_and_children(process) {
                Ok(released) => {
                    debug!("process {} exited, released {} entities", pid, released.len());
                    released.iter().for_each(|t| backend.entity_cleanup(t));
                }
                Err(e) => warn!("releasing process {}: {}", pid, e),
            }
        }
        NativeEvent::HandshakeComplete { pid } => {
            let Some(process) = process_of(store, pid) else {
                warn!("handshake from unknown process {}", pid);
                return;
            };
            events.push(Event::HandshakeComplete {
                process: store.handle_from_entity(process),
            });
        }
        NativeEvent::Trap { pid, tid, address } => {
            let (Some(process), Some(thread)) = (process_of(store, pid), thread_of(store, tid)) else {
                warn!("trap at {} on unknown thread {}:{}", address, pid, tid);
                return;
            };
            let process_handle = store.handle_from_entity(process);
            let thread_handle = store.handle_from_entity(thread);
            let hit = run
                .requested
                .iter()
                .find(|t| t.pid == u64::from(pid) && t.address == address);
            match hit {
                Some(trap) => {
                    if trap.installed {
                        rewind_past_trap(state, backend, thread, address);
                    }
                    events.push(Event::Breakpoint {
                        process: process_handle,
                        thread: thread_handle,
                        address,
                        trap_id: trap.id,
                    });
                }
                None if run.single_step_tid == Some(u64::from(tid)) => events.push(Event::SingleStep {
                    process: process_handle,
                    thread: thread_handle,
                    address,
                }),
                None => events.push(Event::Trap {
                    process: process_handle,
                    thread: thread_handle,
                    address,
                }),
            }
        }
        NativeEvent::SingleStep { pid, tid, address } => {
            let (Some(process), Some(thread)) = (process_of(store, pid), thread_of(store, tid)) else {
                warn!("single step on unknown thread {}:{}", pid, tid);
                return;
            };
            events.push(Event::SingleStep {
                process: store.handle_from_entity(process),
                thread: store.handle_from_entity(thread),
                address,
            });
        }
        NativeEvent::Exception {
            pid,
            tid,
            address,
            code,
            signo,
            kind,
        } => {
            let (Some(process), Some(thread)) = (process_of(store, pid), thread_of(store, tid)) else {
                warn!("exception 0x{:x} on unknown thread {}:{}", code, pid, tid);
                return;
            };
            let thread_handle = store.handle_from_entity(thread);
            let record = PendingExceptionRecord {
                thread: thread_handle,
                code,
                signo,
                address: address.value(),
            };
            let repeated = run.redelivered == Some(record);
            events.push(Event::Exception {
                process: store.handle_from_entity(process),
                thread: thread_handle,
                address,
                code,
                signo,
                kind,
                repeated,
            });
            state.pending_exception = Some(record);
        }
        NativeEvent::Halt { pid, tid } => {
            let process = pid.and_then(|p| process_of(store, p)).map(|p| store.handle_from_entity(p));
            let thread = tid.and_then(|t| thread_of(store, t)).map(|t| store.handle_from_entity(t));
            let request = halt.take();
            events.push(Event::Halt {
                process,
                thread,
                code: request.map_or(0, |r| r.code),
                user_data: request.map_or(0, |r| r.user_data),
            });
        }
        NativeEvent::Memory {
            pid,
            kind,
            address,
            size,
        } => {
            let Some(process) = process_of(store, pid) else {
                warn!("memory event in unknown process {}", pid);
                return;
            };
            events.push(Event::Memory {
                process: store.handle_from_entity(process),
                kind,
                address,
                size,
            });
        }
        NativeEvent::DebugString { pid, tid, text } => {
            let (Some(process), Some(thread)) = (process_of(store, pid), thread_of(store, tid)) else {
                warn!("debug string from unknown thread {}:{}", pid, tid);
                return;
            };
            events.push(Event::DebugString {
                process: store.handle_from_entity(process),
                thread: store.handle_from_entity(thread),
                text,
            });
        }
        NativeEvent::SetThreadName { pid, tid, name } => {
            let (Some(process), Some(thread)) = (process_of(store, pid), thread_of(store, tid)) else {
                warn!("thread name for unknown thread {}:{}", pid, tid);
                return;
            };
            events.push(Event::SetThreadName {
                process: store.handle_from_entity(process),
                thread: store.handle_from_entity(thread),
                name,
            });
        }
    }
}

/// Move the instruction pointer back onto a trap we planted
///
/// x86 reports the trap with the IP just past the `INT3`. The original bytes
/// are back in place by now, so the thread must re-execute from `address`.
fn rewind_past_trap<B: Backend>(state: &mut CoreState, backend: &B, thread: EntityIndex, address: Address)
{
    let arch = state.entities.get(thread).map_or(Architecture::Unknown, |e| e.arch());
    if !matches!(arch, Architecture::X86 | Architecture::X86_64) {
        return;
    }
    let step = state.step;
    let mut regs = match accel::read_registers(&mut state.entities, backend, thread, step) {
        Ok(regs) => regs,
        Err(e) => {
            warn!("cannot read registers to rewind trap at {}: {}", address, e);
            return;
        }
    };
    let trap_len = arch.trap_instruction().len() as u64;
    if regs.instruction_pointer() != address + trap_len {
        return;
    }
    regs.set_instruction_pointer(address);
    if let Err(e) = accel::write_registers(&mut state.entities, backend, thread, step, &regs) {
        warn!("cannot rewind instruction pointer to {}: {}", address, e);
    }
}
