//! # Acceleration Cache
//!
//! Side-car records that remember the results of expensive backend queries.
//!
//! - Threads remember their stack base, TLS root, and the last register block
//!   read, tagged with the step counter at capture time
//! - Modules remember their resolved full path, stored as a chain of
//!   fixed-size blobs
//!
//! Records come from per-kind free lists and are only ever returned to the
//! list of their own kind: [`AccelRef`] is tagged with the kind, so a thread
//! record cannot be handed to a module.

use tracing::trace;

use crate::backend::Backend;
use crate::entity::{EntityIndex, EntityKind, EntityStore};
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::types::{Address, RegisterBlock};

/// Bytes of path stored per module record
pub const MODULE_BLOB_SIZE: usize = 256;

/// Kind-tagged reference to an acceleration record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelRef
{
    /// Index into the thread record pool
    Thread(u32),
    /// Index of the first record of a module chain
    Module(u32),
}

/// Register block plus the step counter value it was captured at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRegisters
{
    /// Captured registers
    pub block: RegisterBlock,
    /// Step counter at capture time
    pub step: u64,
}

/// Per-thread cache
#[derive(Debug, Clone, Default)]
pub struct ThreadAccel
{
    /// Stack base, once resolved
    pub stack_base: Option<Address>,
    /// TLS root, once resolved
    pub tls_root: Option<Address>,
    /// Last register block read or written
    pub regs: Option<CachedRegisters>,
}

#[derive(Debug, Clone)]
struct ModuleAccel
{
    blob: [u8; MODULE_BLOB_SIZE],
    len: usize,
    total_size: usize,
    next: Option<u32>,
}

impl Default for ModuleAccel
{
    fn default() -> Self
    {
        Self {
            blob: [0; MODULE_BLOB_SIZE],
            len: 0,
            total_size: 0,
            next: None,
        }
    }
}

/// Pools and free lists for acceleration records
#[derive(Debug, Default)]
pub struct AccelStore
{
    threads: Vec<ThreadAccel>,
    free_threads: Vec<u32>,
    modules: Vec<ModuleAccel>,
    free_modules: Vec<u32>,
}

impl AccelStore
{
    #[allow(clippy::cast_possible_truncation)]
    fn alloc_thread(&mut self) -> u32
    {
        match self.free_threads.pop() {
            Some(index) => {
                self.threads[index as usize] = ThreadAccel::default();
                index
            }
            None => {
                self.threads.push(ThreadAccel::default());
                (self.threads.len() - 1) as u32
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn alloc_module(&mut self) -> u32
    {
        match self.free_modules.pop() {
            Some(index) => {
                self.modules[index as usize] = ModuleAccel::default();
                index
            }
            None => {
                self.modules.push(ModuleAccel::default());
                (self.modules.len() - 1) as u32
            }
        }
    }

    /// Return a record (and for modules, its whole chain) to its free list
    pub(crate) fn free(&mut self, record: AccelRef)
    {
        match record {
            AccelRef::Thread(index) => self.free_threads.push(index),
            AccelRef::Module(first) => {
                let mut cursor = Some(first);
                while let Some(index) = cursor {
                    cursor = self.modules[index as usize].next;
                    self.free_modules.push(index);
                }
            }
        }
    }

    /// Records currently attached to entities, as (threads, module blobs)
    pub fn records_in_use(&self) -> (usize, usize)
    {
        (
            self.threads.len() - self.free_threads.len(),
            self.modules.len() - self.free_modules.len(),
        )
    }

    fn store_path(&mut self, path: &str) -> u32
    {
        let bytes = path.as_bytes();
        let first = self.alloc_module();
        let mut current = first;
        let mut chunks = bytes.chunks(MODULE_BLOB_SIZE).peekable();
        if chunks.peek().is_none() {
            self.modules[first as usize].total_size = 0;
            return first;
        }
        while let Some(chunk) = chunks.next() {
            {
                let node = &mut self.modules[current as usize];
                node.blob[..chunk.len()].copy_from_slice(chunk);
                node.len = chunk.len();
                node.total_size = bytes.len();
            }
            if chunks.peek().is_some() {
                let next = self.alloc_module();
                self.modules[current as usize].next = Some(next);
                current = next;
            }
        }
        first
    }

    fn load_path(&self, first: u32) -> String
    {
        let mut bytes = Vec::with_capacity(self.modules[first as usize].total_size);
        let mut cursor = Some(first);
        while let Some(index) = cursor {
            let node = &self.modules[index as usize];
            bytes.extend_from_slice(&node.blob[..node.len]);
            cursor = node.next;
        }
        String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }
}

impl EntityStore
{
    /// Thread cache of a live thread, attaching an empty one on first use
    ///
    /// Idempotent: an already attached record is returned as is.
    fn thread_accel_mut(&mut self, thread: EntityIndex) -> CoreResult<&mut ThreadAccel>
    {
        let existing = self.get(thread).map(|e| (e.kind(), e.accel));
        let index = match existing {
            Some((_, Some(AccelRef::Thread(index)))) => index,
            Some((EntityKind::Thread, None)) => {
                let index = self.accel.alloc_thread();
                if let Some(entity) = self.get_mut(thread) {
                    entity.accel = Some(AccelRef::Thread(index));
                }
                index
            }
            _ => return Err(self.not_a(thread, EntityKind::Thread)),
        };
        Ok(&mut self.accel.threads[index as usize])
    }

    /// Thread cache of a live thread, if one is attached
    pub fn thread_accel(&self, thread: EntityIndex) -> Option<&ThreadAccel>
    {
        match self.get(thread)?.accel? {
            AccelRef::Thread(index) => self.accel.threads.get(index as usize),
            AccelRef::Module(_) => None,
        }
    }

    fn not_a(&self, index: EntityIndex, expected: EntityKind) -> CoreError
    {
        let handle = self.handle_from_entity(index);
        match self.get(index) {
            Some(entity) => CoreError::WrongKind {
                handle,
                expected,
                found: entity.kind(),
            },
            None => CoreError::StaleHandle(Handle::from_parts(index, 0)),
        }
    }
}

/// Full path of a module, resolved once then served from the cache
pub(crate) fn full_path_from_module<B: Backend>(
    store: &mut EntityStore,
    backend: &B,
    module: EntityIndex,
) -> CoreResult<String>
{
    let entity = store.get(module).ok_or_else(|| store.not_a(module, EntityKind::Module))?;
    match entity.accel {
        Some(AccelRef::Module(first)) => return Ok(store.accel.load_path(first)),
        Some(AccelRef::Thread(_)) => return Err(store.not_a(module, EntityKind::Module)),
        None => {}
    }
    if entity.kind() != EntityKind::Module {
        return Err(store.not_a(module, EntityKind::Module));
    }

    let target = store.target(module).ok_or_else(|| store.not_a(module, EntityKind::Module))?;
    let path = backend.full_path_from_module(&target)?;
    let first = store.accel.store_path(&path);
    if let Some(entity) = store.get_mut(module) {
        entity.accel = Some(AccelRef::Module(first));
    }
    trace!("cached module path {:?}", path);
    Ok(path)
}

/// Stack base of a thread, resolved once
pub(crate) fn stack_base_from_thread<B: Backend>(
    store: &mut EntityStore,
    backend: &B,
    thread: EntityIndex,
) -> CoreResult<Address>
{
    if let Some(base) = store.thread_accel_mut(thread)?.stack_base {
        return Ok(base);
    }
    let target = store.target(thread).ok_or_else(|| store.not_a(thread, EntityKind::Thread))?;
    let base = backend.stack_base_vaddr_from_thread(&target)?;
    store.thread_accel_mut(thread)?.stack_base = Some(base);
    Ok(base)
}

/// TLS root of a thread, resolved once
pub(crate) fn tls_root_from_thread<B: Backend>(
    store: &mut EntityStore,
    backend: &B,
    thread: EntityIndex,
) -> CoreResult<Address>
{
    if let Some(root) = store.thread_accel_mut(thread)?.tls_root {
        return Ok(root);
    }
    let target = store.target(thread).ok_or_else(|| store.not_a(thread, EntityKind::Thread))?;
    let root = backend.tls_root_vaddr_from_thread(&target)?;
    store.thread_accel_mut(thread)?.tls_root = Some(root);
    Ok(root)
}

/// Registers of a thread
///
/// Served from the cache when it was captured at `step`; otherwise read from
/// the backend and re-tagged. A failed read leaves the cache as it was.
pub(crate) fn read_registers<B: Backend>(
    store: &mut EntityStore,
    backend: &B,
    thread: EntityIndex,
    step: u64,
) -> CoreResult<RegisterBlock>
{
    if let Some(cached) = store.thread_accel_mut(thread)?.regs {
        if cached.step == step {
            return Ok(cached.block);
        }
    }
    let target = store.target(thread).ok_or_else(|| store.not_a(thread, EntityKind::Thread))?;
    let block = backend.read_registers(&target)?;
    store.thread_accel_mut(thread)?.regs = Some(CachedRegisters { block, step });
    Ok(block)
}

/// Write a thread's registers
///
/// On success the written block becomes the cached one, tagged with `step`.
/// On failure the cache is untouched.
pub(crate) fn write_registers<B: Backend>(
    store: &mut EntityStore,
    backend: &B,
    thread: EntityIndex,
    step: u64,
    block: &RegisterBlock,
) -> CoreResult<()>
{
    // Attach first so a wrong-kind entity is rejected before touching the target.
    store.thread_accel_mut(thread)?;
    let target = store.target(thread).ok_or_else(|| store.not_a(thread, EntityKind::Thread))?;
    backend.write_registers(&target, block)?;
    store.thread_accel_mut(thread)?.regs = Some(CachedRegisters { block: *block, step });
    Ok(())
}
