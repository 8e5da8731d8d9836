//! Scripted backend.
//!
//! [`ReplayBackend`] answers [`Backend::run`] from a queue of recorded native
//! runs and simulates the rest of the contract in memory: per-process byte
//! memory, per-thread registers, module paths, stack and TLS bases. It records
//! what the core asked of it (run controls, kills, cleanups, register traffic)
//! so tests can check the core's side of the conversation.
//!
//! Scripts are plain serde data; the `tether replay` command loads them from
//! JSON.
//!
//! ## Example
//!
//! ```rust
//! use tether_core::backend::replay::ReplayBackend;
//! use tether_core::backend::NativeEvent;
//! use tether_core::types::Architecture;
//! use tether_core::{Session, SessionConfig, RunCtrls};
//!
//! let backend = ReplayBackend::new();
//! backend.push_run(vec![
//!     NativeEvent::CreateProcess { pid: 7, arch: Architecture::X86_64, ext: Default::default() },
//!     NativeEvent::CreateThread { pid: 7, tid: 7, ext: Default::default() },
//! ]);
//! let session = Session::new(backend, SessionConfig::default()).unwrap();
//! session.attach_process(7).unwrap();
//! let events = session.run(&RunCtrls::default()).unwrap();
//! assert_eq!(events.len(), 2);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Backend, HostProcess, NativeEvent, NativeRun, NativeRunCtrls, SnapshotId, Target};
use crate::error::{BackendError, BackendResult};
use crate::memory::MemoryProtect;
use crate::run::HaltSignal;
use crate::types::{Address, RegisterBlock};

/// First address handed out by [`Backend::reserve_memory`]
const RESERVE_BASE: u64 = 0x7f00_0000_0000;

/// What `run` does once the scripted runs are used up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhausted
{
    /// Block until halted, then report a halt
    #[default]
    Block,
    /// Report that the target vanished
    Vanish,
}

/// One scripted run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRun
{
    /// Events the run reports
    #[serde(default)]
    pub events: Vec<NativeEvent>,
    /// Failure reported after the events
    #[serde(default)]
    pub failure: Option<BackendError>,
}

/// Initial contents of a memory region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRegion
{
    /// Owning process
    pub pid: u32,
    /// Start of the region
    pub address: Address,
    /// Contents
    pub bytes: Vec<u8>,
}

/// Per-thread simulated state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayThread
{
    /// OS thread id
    pub tid: u32,
    /// Registers returned by reads
    #[serde(default)]
    pub registers: Option<RegisterBlock>,
    /// Stack base
    #[serde(default)]
    pub stack_base: Option<Address>,
    /// TLS root
    #[serde(default)]
    pub tls_root: Option<Address>,
}

/// Module path known to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayModule
{
    /// Module base address
    pub base: Address,
    /// Full path of the image
    pub path: String,
}

/// Everything a replay starts from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayScript
{
    /// Processes to attach to before the first run
    #[serde(default)]
    pub attach: Vec<u32>,
    /// Runs in order
    #[serde(default)]
    pub runs: Vec<ReplayRun>,
    /// Initial memory
    #[serde(default)]
    pub memory: Vec<ReplayRegion>,
    /// Thread state
    #[serde(default)]
    pub threads: Vec<ReplayThread>,
    /// Module paths
    #[serde(default)]
    pub modules: Vec<ReplayModule>,
    /// Host process list
    #[serde(default)]
    pub host: Vec<HostProcess>,
    /// Behaviour once `runs` is used up
    #[serde(default)]
    pub on_exhausted: Exhausted,
}

/// Launch options understood by the replay backend
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplayLaunch
{
    /// Program name (recorded only)
    pub program: String,
    /// PID the "launched" process gets
    pub pid: u32,
}

#[derive(Debug, Default)]
struct ReplayState
{
    runs: VecDeque<ReplayRun>,
    on_exhausted: Exhausted,
    memory: HashMap<u32, BTreeMap<u64, Vec<u8>>>,
    protections: HashMap<(u32, u64), MemoryProtect>,
    next_reserve: u64,
    threads: HashMap<u32, ReplayThread>,
    modules: HashMap<u64, String>,
    host: Vec<HostProcess>,
    next_snapshot: u64,
    snapshots: Vec<(u32, SnapshotId)>,
    fail_register_writes: bool,

    controls: Vec<NativeRunCtrls>,
    attached: Vec<u32>,
    launched: Vec<ReplayLaunch>,
    killed: Vec<(u32, u32)>,
    detached: Vec<u32>,
    cleaned_up: Vec<Target>,
    halts: Vec<(u64, u64)>,
    register_reads: usize,
    register_writes: usize,
    path_queries: usize,
}

impl ReplayState
{
    fn byte(&self, pid: u32, address: u64) -> Option<u8>
    {
        let regions = self.memory.get(&pid)?;
        let (base, bytes) = regions.range(..=address).next_back()?;
        let offset = usize::try_from(address - base).ok()?;
        bytes.get(offset).copied()
    }

    fn byte_mut(&mut self, pid: u32, address: u64) -> Option<&mut u8>
    {
        let regions = self.memory.get_mut(&pid)?;
        let (base, bytes) = regions.range_mut(..=address).next_back()?;
        let offset = usize::try_from(address - *base).ok()?;
        bytes.get_mut(offset)
    }
}

/// Backend that replays a script
#[derive(Debug)]
pub struct ReplayBackend
{
    state: Mutex<ReplayState>,
}

impl Default for ReplayBackend
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl ReplayBackend
{
    /// Empty backend: no runs, no memory, blocks when run
    pub fn new() -> Self
    {
        Self {
            state: Mutex::new(ReplayState {
                next_reserve: RESERVE_BASE,
                next_snapshot: 1,
                ..ReplayState::default()
            }),
        }
    }

    /// Backend loaded from a script
    pub fn from_script(script: ReplayScript) -> Self
    {
        let backend = Self::new();
        {
            let mut state = backend.state.lock();
            state.runs = script.runs.into();
            state.on_exhausted = script.on_exhausted;
            state.host = script.host;
            for region in script.memory {
                state
                    .memory
                    .entry(region.pid)
                    .or_default()
                    .insert(region.address.value(), region.bytes);
            }
            for thread in script.threads {
                state.threads.insert(thread.tid, thread);
            }
            for module in script.modules {
                state.modules.insert(module.base.value(), module.path);
            }
        }
        backend
    }

    /// Queue a run that reports `events`
    pub fn push_run(&self, events: Vec<NativeEvent>)
    {
        self.state.lock().runs.push_back(ReplayRun { events, failure: None });
    }

    /// Queue a run that reports `events` and then fails
    pub fn push_failure(&self, events: Vec<NativeEvent>, failure: BackendError)
    {
        self.state.lock().runs.push_back(ReplayRun {
            events,
            failure: Some(failure),
        });
    }

    /// Choose what happens once the queue is empty
    pub fn set_on_exhausted(&self, behaviour: Exhausted)
    {
        self.state.lock().on_exhausted = behaviour;
    }

    /// Map a region of process memory
    pub fn map_memory(&self, pid: u32, address: Address, bytes: Vec<u8>)
    {
        self.state
            .lock()
            .memory
            .entry(pid)
            .or_default()
            .insert(address.value(), bytes);
    }

    /// Current contents of `[address, address + len)`, if fully mapped
    pub fn memory(&self, pid: u32, address: Address, len: usize) -> Option<Vec<u8>>
    {
        let state = self.state.lock();
        (0..len as u64).map(|i| state.byte(pid, address.value() + i)).collect()
    }

    /// Set the registers a thread reports
    pub fn set_registers(&self, tid: u32, block: RegisterBlock)
    {
        self.thread_entry(tid, |t| t.registers = Some(block));
    }

    /// Set a thread's stack base
    pub fn set_stack_base(&self, tid: u32, base: Address)
    {
        self.thread_entry(tid, |t| t.stack_base = Some(base));
    }

    /// Set a thread's TLS root
    pub fn set_tls_root(&self, tid: u32, root: Address)
    {
        self.thread_entry(tid, |t| t.tls_root = Some(root));
    }

    fn thread_entry(&self, tid: u32, f: impl FnOnce(&mut ReplayThread))
    {
        let mut state = self.state.lock();
        let thread = state.threads.entry(tid).or_insert(ReplayThread {
            tid,
            registers: None,
            stack_base: None,
            tls_root: None,
        });
        f(thread);
    }

    /// Set the path reported for the module at `base`
    pub fn set_module_path(&self, base: Address, path: impl Into<String>)
    {
        self.state.lock().modules.insert(base.value(), path.into());
    }

    /// Add a host process to the listing
    pub fn add_host_process(&self, pid: u32, name: impl Into<String>)
    {
        self.state.lock().host.push(HostProcess { pid, name: name.into() });
    }

    /// Make register writes fail (or succeed again)
    pub fn fail_register_writes(&self, fail: bool)
    {
        self.state.lock().fail_register_writes = fail;
    }

    /// Run controls received so far, oldest first
    pub fn run_controls(&self) -> Vec<NativeRunCtrls>
    {
        self.state.lock().controls.clone()
    }

    /// Number of backend register reads
    pub fn register_reads(&self) -> usize
    {
        self.state.lock().register_reads
    }

    /// Number of successful backend register writes
    pub fn register_writes(&self) -> usize
    {
        self.state.lock().register_writes
    }

    /// Number of module path lookups
    pub fn path_queries(&self) -> usize
    {
        self.state.lock().path_queries
    }

    /// Entities the core released and asked to clean up
    pub fn cleaned_up(&self) -> Vec<Target>
    {
        self.state.lock().cleaned_up.clone()
    }

    /// PIDs attached to
    pub fn attached(&self) -> Vec<u32>
    {
        self.state.lock().attached.clone()
    }

    /// Launch requests received
    pub fn launched(&self) -> Vec<ReplayLaunch>
    {
        self.state.lock().launched.clone()
    }

    /// (pid, exit code) of kill requests
    pub fn killed(&self) -> Vec<(u32, u32)>
    {
        self.state.lock().killed.clone()
    }

    /// PIDs detached from
    pub fn detached(&self) -> Vec<u32>
    {
        self.state.lock().detached.clone()
    }

    /// (code, user data) of halt wake-ups received
    pub fn halts(&self) -> Vec<(u64, u64)>
    {
        self.state.lock().halts.clone()
    }

    /// Protection last set on the region starting at `address`
    pub fn protection(&self, pid: u32, address: Address) -> Option<MemoryProtect>
    {
        self.state.lock().protections.get(&(pid, address.value())).copied()
    }

    fn pid_of(process: &Target) -> u32
    {
        process.os_id()
    }
}

impl Backend for ReplayBackend
{
    type LaunchOptions = ReplayLaunch;

    fn init(&self) -> BackendResult<()>
    {
        debug!("replay backend ready ({} scripted runs)", self.state.lock().runs.len());
        Ok(())
    }

    fn run(&self, ctrls: &NativeRunCtrls, halt: &HaltSignal) -> NativeRun
    {
        let behaviour = {
            let mut state = self.state.lock();
            state.controls.push(ctrls.clone());
            if halt.is_raised() {
                return NativeRun::events(vec![NativeEvent::Halt { pid: None, tid: None }]);
            }
            if let Some(run) = state.runs.pop_front() {
                trace!("replaying run with {} events", run.events.len());
                return NativeRun {
                    events: run.events,
                    failure: run.failure,
                };
            }
            state.on_exhausted
        };

        match behaviour {
            Exhausted::Block => {
                debug!("replay exhausted, waiting for halt");
                halt.wait();
                NativeRun::events(vec![NativeEvent::Halt { pid: None, tid: None }])
            }
            Exhausted::Vanish => NativeRun::failed(BackendError::TargetVanished("replay script exhausted".into())),
        }
    }

    fn halt(&self, code: u64, user_data: u64)
    {
        self.state.lock().halts.push((code, user_data));
    }

    fn launch_process(&self, options: &ReplayLaunch) -> BackendResult<u32>
    {
        let mut state = self.state.lock();
        state.launched.push(options.clone());
        Ok(options.pid)
    }

    fn attach_process(&self, pid: u32) -> BackendResult<()>
    {
        let mut state = self.state.lock();
        if state.attached.contains(&pid) {
            return Err(BackendError::Other(format!("already attached to {pid}")));
        }
        state.attached.push(pid);
        Ok(())
    }

    fn kill_process(&self, process: &Target, exit_code: u32) -> BackendResult<()>
    {
        let pid = Self::pid_of(process);
        let mut state = self.state.lock();
        state.killed.push((pid, exit_code));
        state.runs.push_front(ReplayRun {
            events: vec![NativeEvent::ExitProcess { pid, code: exit_code }],
            failure: None,
        });
        Ok(())
    }

    fn detach_process(&self, process: &Target) -> BackendResult<()>
    {
        self.state.lock().detached.push(Self::pid_of(process));
        Ok(())
    }

    fn create_snapshot(&self, thread: &Target) -> BackendResult<SnapshotId>
    {
        let mut state = self.state.lock();
        let id = SnapshotId(state.next_snapshot);
        state.next_snapshot += 1;
        state.snapshots.push((thread.os_id(), id));
        Ok(id)
    }

    fn release_snapshot(&self, thread: &Target, snapshot: SnapshotId) -> BackendResult<()>
    {
        let mut state = self.state.lock();
        let before = state.snapshots.len();
        state.snapshots.retain(|s| *s != (thread.os_id(), snapshot));
        if state.snapshots.len() == before {
            return Err(BackendError::Other(format!("unknown snapshot {}", snapshot.0)));
        }
        Ok(())
    }

    fn entity_cleanup(&self, entity: &Target)
    {
        self.state.lock().cleaned_up.push(*entity);
    }

    fn full_path_from_module(&self, module: &Target) -> BackendResult<String>
    {
        let mut state = self.state.lock();
        state.path_queries += 1;
        state
            .modules
            .get(&module.id)
            .cloned()
            .ok_or_else(|| BackendError::Other(format!("no path for module at {:#x}", module.id)))
    }

    fn stack_base_vaddr_from_thread(&self, thread: &Target) -> BackendResult<Address>
    {
        self.state
            .lock()
            .threads
            .get(&thread.os_id())
            .and_then(|t| t.stack_base)
            .ok_or_else(|| BackendError::TargetVanished(format!("no stack for thread {}", thread.id)))
    }

    fn tls_root_vaddr_from_thread(&self, thread: &Target) -> BackendResult<Address>
    {
        self.state
            .lock()
            .threads
            .get(&thread.os_id())
            .and_then(|t| t.tls_root)
            .ok_or_else(|| BackendError::TargetVanished(format!("no TLS for thread {}", thread.id)))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn reserve_memory(&self, process: &Target, size: u64) -> BackendResult<Address>
    {
        let pid = Self::pid_of(process);
        let mut state = self.state.lock();
        let address = state.next_reserve;
        state.next_reserve = Address::new(address + size.max(1)).align_up(0x1000).value();
        state
            .memory
            .entry(pid)
            .or_default()
            .insert(address, vec![0; size as usize]);
        state.protections.insert((pid, address), MemoryProtect::NONE);
        Ok(Address::new(address))
    }

    fn set_memory_protect_flags(
        &self,
        process: &Target,
        address: Address,
        _size: u64,
        flags: MemoryProtect,
    ) -> BackendResult<()>
    {
        let pid = Self::pid_of(process);
        let mut state = self.state.lock();
        if state.byte(pid, address.value()).is_none() {
            return Err(BackendError::MemoryAccess {
                address: address.value(),
            });
        }
        state.protections.insert((pid, address.value()), flags);
        Ok(())
    }

    fn release_memory(&self, process: &Target, address: Address, _size: u64) -> BackendResult<()>
    {
        let pid = Self::pid_of(process);
        let mut state = self.state.lock();
        state.protections.remove(&(pid, address.value()));
        state
            .memory
            .get_mut(&pid)
            .and_then(|regions| regions.remove(&address.value()))
            .map(|_| ())
            .ok_or(BackendError::MemoryAccess {
                address: address.value(),
            })
    }

    fn read_memory(&self, process: &Target, address: Address, dst: &mut [u8]) -> BackendResult<usize>
    {
        let pid = Self::pid_of(process);
        let state = self.state.lock();
        let mut read = 0;
        for (i, slot) in dst.iter_mut().enumerate() {
            match state.byte(pid, address.value() + i as u64) {
                Some(b) => {
                    *slot = b;
                    read += 1;
                }
                None => break,
            }
        }
        if read == 0 && !dst.is_empty() {
            return Err(BackendError::MemoryAccess {
                address: address.value(),
            });
        }
        Ok(read)
    }

    fn write_memory(&self, process: &Target, address: Address, src: &[u8]) -> BackendResult<()>
    {
        let pid = Self::pid_of(process);
        let mut state = self.state.lock();
        let all_mapped = (0..src.len() as u64).all(|i| state.byte(pid, address.value() + i).is_some());
        if !all_mapped {
            return Err(BackendError::MemoryAccess {
                address: address.value(),
            });
        }
        for (i, b) in src.iter().enumerate() {
            if let Some(slot) = state.byte_mut(pid, address.value() + i as u64) {
                *slot = *b;
            }
        }
        Ok(())
    }

    fn read_registers(&self, thread: &Target) -> BackendResult<RegisterBlock>
    {
        let mut state = self.state.lock();
        state.register_reads += 1;
        let stored = state.threads.get(&thread.os_id()).and_then(|t| t.registers);
        match stored {
            Some(block) => Ok(block),
            None => RegisterBlock::zeroed(thread.arch)
                .ok_or_else(|| BackendError::Unsupported(format!("registers for {} threads", thread.arch))),
        }
    }

    fn write_registers(&self, thread: &Target, block: &RegisterBlock) -> BackendResult<()>
    {
        let mut state = self.state.lock();
        if state.fail_register_writes {
            return Err(BackendError::Os {
                code: 3,
                message: "no such thread".into(),
            });
        }
        state.register_writes += 1;
        let tid = thread.os_id();
        state
            .threads
            .entry(tid)
            .or_insert(ReplayThread {
                tid,
                registers: None,
                stack_base: None,
                tls_root: None,
            })
            .registers = Some(*block);
        Ok(())
    }

    fn host_processes(&self) -> BackendResult<Vec<HostProcess>>
    {
        Ok(self.state.lock().host.clone())
    }
}
