//! # Handles
//!
//! The only way code outside the core names an entity.
//!
//! A [`Handle`] is the entity's slot index plus the slot generation it was
//! issued for. Every use revalidates it against the store: if the slot has
//! since been released (and possibly reused), the generation no longer matches
//! and the lookup fails with [`CoreError::StaleHandle`]. Nothing about the
//! entity is ever cached inside the handle.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityIndex, EntityKind, EntityStore, ROOT_INDEX};
use crate::error::{CoreError, CoreResult};

/// Opaque (index, generation) reference to an entity
///
/// ## Example
///
/// ```rust
/// use tether_core::Handle;
///
/// let handle = Handle::from_parts(3, 7);
/// assert_eq!(Handle::from_u64(handle.to_u64()), handle);
/// assert!(Handle::NULL.is_null());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle
{
    index: u32,
    generation: u32,
}

impl Handle
{
    /// The handle that never validates
    pub const NULL: Self = Handle { index: 0, generation: 0 };

    /// Build a handle from its two words
    pub const fn from_parts(index: u32, generation: u32) -> Self
    {
        Handle { index, generation }
    }

    /// Slot index
    pub const fn index(self) -> u32
    {
        self.index
    }

    /// Generation the handle was issued for
    pub const fn generation(self) -> u32
    {
        self.generation
    }

    /// Whether this is [`Handle::NULL`]
    pub const fn is_null(self) -> bool
    {
        self.index == 0 && self.generation == 0
    }

    /// Pack into one word: `generation << 32 | index`
    pub const fn to_u64(self) -> u64
    {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack a word produced by [`to_u64`](Self::to_u64)
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_u64(packed: u64) -> Self
    {
        Handle {
            index: packed as u32,
            generation: (packed >> 32) as u32,
        }
    }
}

impl fmt::Display for Handle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

impl EntityStore
{
    /// Issue a handle for a live entity
    ///
    /// Returns [`Handle::NULL`] for the root or a dead slot.
    pub fn handle_from_entity(&self, index: EntityIndex) -> Handle
    {
        if index == ROOT_INDEX {
            return Handle::NULL;
        }
        self.get(index)
            .map_or(Handle::NULL, |e| Handle::from_parts(index, e.generation()))
    }

    /// Resolve a handle back to its entity
    ///
    /// ## Errors
    ///
    /// [`CoreError::StaleHandle`] if the slot is dead, has been reused, or is
    /// the root.
    pub fn entity_from_handle(&self, handle: Handle) -> CoreResult<EntityIndex>
    {
        if handle.index == ROOT_INDEX {
            return Err(CoreError::StaleHandle(handle));
        }
        match self.get(handle.index) {
            Some(entity) if entity.generation() == handle.generation => Ok(handle.index),
            _ => Err(CoreError::StaleHandle(handle)),
        }
    }

    /// Resolve a handle and check the entity's kind
    ///
    /// ## Errors
    ///
    /// [`CoreError::StaleHandle`] as for [`entity_from_handle`](Self::entity_from_handle),
    /// [`CoreError::WrongKind`] if the entity is live but of another kind.
    pub fn entity_from_handle_of_kind(&self, handle: Handle, expected: EntityKind) -> CoreResult<EntityIndex>
    {
        let index = self.entity_from_handle(handle)?;
        let found = self.get(index).map_or(EntityKind::Root, |e| e.kind());
        if found == expected {
            Ok(index)
        } else {
            Err(CoreError::WrongKind { handle, expected, found })
        }
    }
}
