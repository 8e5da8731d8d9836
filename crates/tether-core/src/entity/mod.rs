//! # Entities
//!
//! The debuggee as a tree: one root, processes under it, threads and modules
//! under each process.
//!
//! Entities live in a fixed-capacity arena owned by [`EntityStore`]. Slots are
//! reused, and every reuse bumps the slot's generation so a
//! [`Handle`](crate::handle::Handle) issued for the previous occupant can
//! never validate again. The [`IdentityMap`] answers "which entity has this OS
//! id" in constant time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::accel::AccelRef;
use crate::types::Architecture;

pub mod map;
pub mod store;

pub use map::{IdentityMap, MapRef};
pub use store::{Children, EntityStore};

/// Arena index of an entity slot
pub type EntityIndex = u32;

/// Index of the root entity (always slot 0, never released)
pub const ROOT_INDEX: EntityIndex = 0;

/// What kind of debuggee object an entity stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind
{
    /// The single root of the tree
    Root,
    /// A debugged process (id = PID)
    Process,
    /// A thread of a process (id = TID)
    Thread,
    /// A loaded image in a process (id = base address)
    Module,
}

impl EntityKind
{
    /// Small integer tag used when hashing (kind, id) keys
    pub const fn tag(self) -> u64
    {
        match self {
            EntityKind::Root => 0,
            EntityKind::Process => 1,
            EntityKind::Thread => 2,
            EntityKind::Module => 3,
        }
    }

    pub(crate) const fn slot(self) -> usize
    {
        self.tag() as usize
    }
}

impl fmt::Display for EntityKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            EntityKind::Root => "root",
            EntityKind::Process => "process",
            EntityKind::Thread => "thread",
            EntityKind::Module => "module",
        };
        f.write_str(name)
    }
}

/// Backend-owned extension words attached to an entity
///
/// The core never interprets these. A backend fills them in through the
/// native creation events and reads them back from the [`Target`](crate::backend::Target)
/// views it is handed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityExt
{
    /// Nothing attached
    #[default]
    None,
    /// Process extension
    Process
    {
        /// OS handle / fd for the process (e.g. a `/proc/<pid>/mem` fd)
        os_handle: u64,
    },
    /// Thread extension
    Thread
    {
        /// OS handle for the thread
        os_handle: u64,
        /// The thread is new and the backend still expects its first stop
        expecting_initial_stop: bool,
    },
    /// Module extension
    Module
    {
        /// OS handle for the image file
        os_handle: u64,
        /// Address of the image's name string in the target
        name_vaddr: u64,
    },
}

/// One slot of the entity arena
///
/// Link fields are arena indices. A slot with `live == false` is on the free
/// list (or retired) and only its `generation` is meaningful.
#[derive(Debug, Clone)]
pub struct Entity
{
    pub(crate) kind: EntityKind,
    pub(crate) arch: Architecture,
    pub(crate) generation: u32,
    pub(crate) id: u64,
    pub(crate) addr_range_dim: u64,
    pub(crate) parent: Option<EntityIndex>,
    pub(crate) first: Option<EntityIndex>,
    pub(crate) last: Option<EntityIndex>,
    pub(crate) next: Option<EntityIndex>,
    pub(crate) prev: Option<EntityIndex>,
    pub(crate) ext: EntityExt,
    pub(crate) accel: Option<AccelRef>,
    pub(crate) frozen: bool,
    pub(crate) live: bool,
}

impl Entity
{
    pub(crate) fn vacant() -> Self
    {
        Self {
            kind: EntityKind::Root,
            arch: Architecture::Unknown,
            generation: 0,
            id: 0,
            addr_range_dim: 0,
            parent: None,
            first: None,
            last: None,
            next: None,
            prev: None,
            ext: EntityExt::None,
            accel: None,
            frozen: false,
            live: false,
        }
    }

    /// Kind of this entity
    pub fn kind(&self) -> EntityKind
    {
        self.kind
    }

    /// Architecture tag
    pub fn arch(&self) -> Architecture
    {
        self.arch
    }

    /// Current generation of the slot
    pub fn generation(&self) -> u32
    {
        self.generation
    }

    /// OS-assigned id (PID, TID or module base)
    pub fn id(&self) -> u64
    {
        self.id
    }

    /// Size of the mapped range (modules only, 0 otherwise)
    pub fn size(&self) -> u64
    {
        self.addr_range_dim
    }

    /// Parent slot index (`None` only for the root)
    pub fn parent(&self) -> Option<EntityIndex>
    {
        self.parent
    }

    /// Backend extension words
    pub fn ext(&self) -> EntityExt
    {
        self.ext
    }

    /// Whether the last run held this entity frozen
    pub fn is_frozen(&self) -> bool
    {
        self.frozen
    }

    /// Whether the slot currently holds a live entity
    pub fn is_live(&self) -> bool
    {
        self.live
    }
}
