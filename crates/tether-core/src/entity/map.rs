//! Identity map: (kind, OS id) → entity slot.
//!
//! Fixed power-of-two bucket array with singly linked chains threaded through
//! a slot pool. New entries are pushed at the head of their chain. Erased
//! slots go on a free list and are reused before the pool grows.

use super::{EntityIndex, EntityKind};

#[derive(Debug, Clone, Copy)]
struct MapSlot
{
    kind: EntityKind,
    id: u64,
    entity: EntityIndex,
    next: Option<u32>,
}

/// The link that points at a chain slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link
{
    /// Head pointer of a bucket
    Bucket(usize),
    /// `next` field of another slot
    Slot(u32),
}

/// Result of [`IdentityMap::find`]
///
/// Carries the slot together with the link that points to it, so
/// [`IdentityMap::erase`] can unlink without searching the chain again.
/// Only valid until the map is next mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRef
{
    /// Entity the entry maps to
    pub entity: EntityIndex,
    slot: u32,
    link: Link,
}

/// Hash map from (kind, id) to entity index
#[derive(Debug)]
pub struct IdentityMap
{
    buckets: Vec<Option<u32>>,
    slots: Vec<MapSlot>,
    free_slots: Vec<u32>,
    len: usize,
}

impl IdentityMap
{
    /// Create a map with `bucket_count` buckets
    ///
    /// `bucket_count` must be a non-zero power of two; [`SessionConfig::validate`](crate::config::SessionConfig::validate)
    /// guarantees this for session-owned maps.
    pub fn new(bucket_count: usize) -> Self
    {
        debug_assert!(bucket_count.is_power_of_two());
        Self {
            buckets: vec![None; bucket_count],
            slots: Vec::new(),
            free_slots: Vec::new(),
            len: 0,
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize
    {
        self.len
    }

    /// Whether the map holds no entries
    pub fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    /// Number of chain slots ever allocated (live + free)
    pub fn pooled_slots(&self) -> usize
    {
        self.slots.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn bucket_of(&self, kind: EntityKind, id: u64) -> usize
    {
        let key = (kind.tag() << 32) ^ id;
        let mixed = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let folded = mixed ^ (mixed >> 32);
        (folded as usize) & (self.buckets.len() - 1)
    }

    /// Insert a new entry at the head of its chain
    ///
    /// Does not check for an existing entry with the same key; the store does
    /// that before calling.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert(&mut self, kind: EntityKind, id: u64, entity: EntityIndex)
    {
        let bucket = self.bucket_of(kind, id);
        let slot = MapSlot {
            kind,
            id,
            entity,
            next: self.buckets[bucket],
        };
        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        };
        self.buckets[bucket] = Some(index);
        self.len += 1;
    }

    /// Look up (kind, id)
    pub fn find(&self, kind: EntityKind, id: u64) -> Option<MapRef>
    {
        let bucket = self.bucket_of(kind, id);
        let mut link = Link::Bucket(bucket);
        let mut cursor = self.buckets[bucket];
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            if slot.kind == kind && slot.id == id {
                return Some(MapRef {
                    entity: slot.entity,
                    slot: index,
                    link,
                });
            }
            link = Link::Slot(index);
            cursor = slot.next;
        }
        None
    }

    /// Look up (kind, id) and return just the entity index
    pub fn entity_from_id(&self, kind: EntityKind, id: u64) -> Option<EntityIndex>
    {
        self.find(kind, id).map(|r| r.entity)
    }

    /// Unlink the entry found by a preceding [`find`](Self::find)
    pub fn erase(&mut self, found: MapRef)
    {
        let next = self.slots[found.slot as usize].next;
        match found.link {
            Link::Bucket(bucket) => self.buckets[bucket] = next,
            Link::Slot(prev) => self.slots[prev as usize].next = next,
        }
        self.free_slots.push(found.slot);
        self.len -= 1;
    }
}
