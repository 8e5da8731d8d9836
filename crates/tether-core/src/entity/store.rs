//! Entity arena with slot reuse and generation stamping.

use tracing::debug;

use super::map::IdentityMap;
use super::{Entity, EntityIndex, EntityKind, ROOT_INDEX};
use crate::accel::AccelStore;
use crate::backend::Target;
use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::handle::Handle;
use crate::types::Architecture;

/// The entity tree
///
/// ## Lifecycle of a slot
///
/// 1. [`new_entity`](Self::new_entity) takes a slot from the free list (or
///    grows the arena while under capacity) and bumps its generation
/// 2. The entity is linked as the last child of its parent and inserted into
///    the identity map
/// 3. A release unlinks it, erases it from the map, frees its acceleration
///    record, and bumps the generation again
///
/// A slot whose generation would overflow is retired instead of returned to
/// the free list, so a generation value is never handed out twice.
#[derive(Debug)]
pub struct EntityStore
{
    entities: Vec<Entity>,
    free: Vec<EntityIndex>,
    capacity: usize,
    live: usize,
    map: IdentityMap,
    pub(crate) accel: AccelStore,
    counts: [usize; 4],
}

impl EntityStore
{
    /// Create a store holding only the root
    ///
    /// The configuration is assumed valid (see [`SessionConfig::validate`]).
    pub fn new(config: &SessionConfig) -> Self
    {
        let mut root = Entity::vacant();
        root.generation = 1;
        root.live = true;
        let mut counts = [0; 4];
        counts[EntityKind::Root.slot()] = 1;
        Self {
            entities: vec![root],
            free: Vec::new(),
            capacity: config.entity_capacity,
            live: 1,
            map: IdentityMap::new(config.map_buckets),
            accel: AccelStore::default(),
            counts,
        }
    }

    /// Index of the root entity
    pub fn root(&self) -> EntityIndex
    {
        ROOT_INDEX
    }

    /// Configured capacity (root included)
    pub fn capacity(&self) -> usize
    {
        self.capacity
    }

    /// Number of live entities (root included)
    pub fn live_count(&self) -> usize
    {
        self.live
    }

    /// Number of live entities of `kind`
    pub fn count(&self, kind: EntityKind) -> usize
    {
        self.counts[kind.slot()]
    }

    /// The identity map
    pub fn map(&self) -> &IdentityMap
    {
        &self.map
    }

    /// Live entity at `index`
    pub fn get(&self, index: EntityIndex) -> Option<&Entity>
    {
        self.entities.get(index as usize).filter(|e| e.live)
    }

    pub(crate) fn get_mut(&mut self, index: EntityIndex) -> Option<&mut Entity>
    {
        self.entities.get_mut(index as usize).filter(|e| e.live)
    }

    /// Slot at `index` whether live or not
    pub(crate) fn slot(&self, index: EntityIndex) -> Option<&Entity>
    {
        self.entities.get(index as usize)
    }

    /// Live entity of `kind` with OS id `id`
    pub fn find(&self, kind: EntityKind, id: u64) -> Option<EntityIndex>
    {
        self.map.entity_from_id(kind, id)
    }

    /// Iterate the direct children of `index` in creation order
    pub fn children(&self, index: EntityIndex) -> Children<'_>
    {
        Children {
            store: self,
            cursor: self.get(index).and_then(|e| e.first),
        }
    }

    /// Backend view of a live entity
    pub fn target(&self, index: EntityIndex) -> Option<Target>
    {
        let entity = self.get(index)?;
        let parent_id = entity.parent.and_then(|p| self.get(p)).map_or(0, |p| p.id);
        Some(Target {
            kind: entity.kind,
            id: entity.id,
            arch: entity.arch,
            parent_id,
            ext: entity.ext,
        })
    }

    /// Create a new entity as the last child of `parent`
    ///
    /// The new entity inherits the parent's architecture.
    ///
    /// ## Errors
    ///
    /// - [`CoreError::CapacityExceeded`] when the arena is full
    /// - [`CoreError::DuplicateEntity`] when a live entity of `kind` already has `id`
    /// - [`CoreError::StaleHandle`] when `parent` is not live
    /// - [`CoreError::NotSupported`] for `kind == Root`
    pub fn new_entity(&mut self, parent: EntityIndex, kind: EntityKind, id: u64) -> CoreResult<EntityIndex>
    {
        if kind == EntityKind::Root {
            return Err(CoreError::NotSupported("a store has exactly one root".into()));
        }
        let arch = match self.get(parent) {
            Some(p) => p.arch,
            None => return Err(CoreError::StaleHandle(self.stale_handle(parent))),
        };
        if self.map.find(kind, id).is_some() {
            return Err(CoreError::DuplicateEntity { kind, id });
        }
        if self.live >= self.capacity {
            return Err(CoreError::CapacityExceeded { capacity: self.capacity });
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.entities.push(Entity::vacant());
                EntityIndex::try_from(self.entities.len() - 1)
                    .map_err(|_| CoreError::CapacityExceeded { capacity: self.capacity })?
            }
        };

        let prev = self.entities[parent as usize].last;
        {
            let entity = &mut self.entities[index as usize];
            entity.generation += 1;
            entity.kind = kind;
            entity.arch = arch;
            entity.id = id;
            entity.addr_range_dim = 0;
            entity.parent = Some(parent);
            entity.first = None;
            entity.last = None;
            entity.next = None;
            entity.prev = prev;
            entity.ext = super::EntityExt::None;
            entity.accel = None;
            entity.frozen = false;
            entity.live = true;
        }
        match prev {
            Some(prev) => self.entities[prev as usize].next = Some(index),
            None => self.entities[parent as usize].first = Some(index),
        }
        self.entities[parent as usize].last = Some(index);

        self.map.insert(kind, id, index);
        self.counts[kind.slot()] += 1;
        self.live += 1;
        debug!("new {} {:#x} in slot {} (gen {})", kind, id, index, self.entities[index as usize].generation);
        Ok(index)
    }

    /// Set the architecture of a live entity
    pub fn set_arch(&mut self, index: EntityIndex, arch: Architecture)
    {
        if let Some(entity) = self.get_mut(index) {
            entity.arch = arch;
        }
    }

    /// Release one leaf entity
    ///
    /// Returns the backend view of the released entity so the caller can run
    /// backend cleanup for it.
    ///
    /// ## Errors
    ///
    /// - [`CoreError::HasChildren`] if the entity still has children
    /// - [`CoreError::NotSupported`] for the root
    /// - [`CoreError::StaleHandle`] if `index` is not live
    pub fn release_single(&mut self, index: EntityIndex) -> CoreResult<Target>
    {
        if index == ROOT_INDEX {
            return Err(CoreError::NotSupported("the root entity cannot be released".into()));
        }
        let Some(entity) = self.get(index) else {
            return Err(CoreError::StaleHandle(self.stale_handle(index)));
        };
        if entity.first.is_some() {
            return Err(CoreError::HasChildren(Handle::from_parts(index, entity.generation)));
        }
        let target = self.target(index).ok_or_else(|| CoreError::StaleHandle(self.stale_handle(index)))?;
        self.release_leaf(index);
        Ok(target)
    }

    /// Release every descendant of `index`, leaving `index` itself live
    ///
    /// Descendants are released deepest first.
    pub fn release_children(&mut self, index: EntityIndex) -> Vec<Target>
    {
        let mut order = Vec::new();
        let mut stack: Vec<EntityIndex> = self.children(index).collect();
        while let Some(next) = stack.pop() {
            order.push(next);
            stack.extend(self.children(next));
        }

        let mut released = Vec::with_capacity(order.len());
        for victim in order.into_iter().rev() {
            if let Some(target) = self.target(victim) {
                self.release_leaf(victim);
                released.push(target);
            }
        }
        released
    }

    /// Release `index` and its whole subtree
    ///
    /// ## Errors
    ///
    /// Same as [`release_single`](Self::release_single), minus `HasChildren`.
    pub fn release_root_and_children(&mut self, index: EntityIndex) -> CoreResult<Vec<Target>>
    {
        if index == ROOT_INDEX {
            return Err(CoreError::NotSupported("the root entity cannot be released".into()));
        }
        if self.get(index).is_none() {
            return Err(CoreError::StaleHandle(self.stale_handle(index)));
        }
        let mut released = self.release_children(index);
        released.push(self.release_single(index)?);
        Ok(released)
    }

    fn release_leaf(&mut self, index: EntityIndex)
    {
        let (kind, id, parent, prev, next, accel) = {
            let e = &self.entities[index as usize];
            (e.kind, e.id, e.parent, e.prev, e.next, e.accel)
        };

        match prev {
            Some(prev) => self.entities[prev as usize].next = next,
            None => {
                if let Some(parent) = parent {
                    self.entities[parent as usize].first = next;
                }
            }
        }
        match next {
            Some(next) => self.entities[next as usize].prev = prev,
            None => {
                if let Some(parent) = parent {
                    self.entities[parent as usize].last = prev;
                }
            }
        }

        if let Some(found) = self.map.find(kind, id) {
            self.map.erase(found);
        }
        if let Some(record) = accel {
            self.accel.free(record);
        }

        let entity = &mut self.entities[index as usize];
        entity.live = false;
        entity.accel = None;
        entity.parent = None;
        entity.prev = None;
        entity.next = None;
        entity.generation = entity.generation.saturating_add(1);
        let retire = entity.generation >= u32::MAX - 1;

        if retire {
            debug!("retiring slot {} after generation wrap", index);
        } else {
            self.free.push(index);
        }
        self.counts[kind.slot()] -= 1;
        self.live -= 1;
        debug!("released {} {:#x} from slot {}", kind, id, index);
    }

    fn stale_handle(&self, index: EntityIndex) -> Handle
    {
        Handle::from_parts(index, self.slot(index).map_or(0, |e| e.generation))
    }
}

/// Iterator over the direct children of an entity
pub struct Children<'a>
{
    store: &'a EntityStore,
    cursor: Option<EntityIndex>,
}

impl Iterator for Children<'_>
{
    type Item = EntityIndex;

    fn next(&mut self) -> Option<Self::Item>
    {
        let current = self.cursor?;
        self.cursor = self.store.slot(current).and_then(|e| e.next);
        Some(current)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn store(capacity: usize) -> EntityStore
    {
        EntityStore::new(&SessionConfig {
            entity_capacity: capacity,
            map_buckets: 8,
        })
    }

    #[test]
    fn test_children_keep_creation_order()
    {
        let mut store = store(16);
        let process = store.new_entity(ROOT_INDEX, EntityKind::Process, 10).unwrap();
        let a = store.new_entity(process, EntityKind::Thread, 11).unwrap();
        let b = store.new_entity(process, EntityKind::Thread, 12).unwrap();
        let c = store.new_entity(process, EntityKind::Module, 0x400000).unwrap();
        assert_eq!(store.children(process).collect::<Vec<_>>(), vec![a, b, c]);

        store.release_single(b).unwrap();
        assert_eq!(store.children(process).collect::<Vec<_>>(), vec![a, c]);
        store.release_single(c).unwrap();
        store.release_single(a).unwrap();
        assert_eq!(store.children(process).count(), 0);
    }

    #[test]
    fn test_capacity_is_a_hard_ceiling()
    {
        let mut store = store(3);
        let process = store.new_entity(ROOT_INDEX, EntityKind::Process, 1).unwrap();
        store.new_entity(process, EntityKind::Thread, 2).unwrap();
        let err = store.new_entity(process, EntityKind::Thread, 3).unwrap_err();
        assert!(matches!(err, CoreError::CapacityExceeded { capacity: 3 }));
    }

    #[test]
    fn test_slot_reuse_bumps_generation()
    {
        let mut store = store(8);
        let first = store.new_entity(ROOT_INDEX, EntityKind::Process, 1).unwrap();
        let first_gen = store.get(first).unwrap().generation();
        store.release_single(first).unwrap();

        let second = store.new_entity(ROOT_INDEX, EntityKind::Process, 2).unwrap();
        assert_eq!(first, second);
        assert!(store.get(second).unwrap().generation() > first_gen);
    }

    #[test]
    fn test_release_rejects_root_and_parents()
    {
        let mut store = store(8);
        let process = store.new_entity(ROOT_INDEX, EntityKind::Process, 1).unwrap();
        store.new_entity(process, EntityKind::Thread, 1).unwrap();

        assert!(matches!(store.release_single(process), Err(CoreError::HasChildren(_))));
        assert!(matches!(store.release_single(ROOT_INDEX), Err(CoreError::NotSupported(_))));

        let released = store.release_root_and_children(process).unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].kind, EntityKind::Thread);
        assert_eq!(released[1].kind, EntityKind::Process);
        assert_eq!(store.live_count(), 1);
        assert!(store.map().is_empty());
    }

    #[test]
    fn test_release_children_keeps_parent()
    {
        let mut store = store(8);
        let process = store.new_entity(ROOT_INDEX, EntityKind::Process, 100).unwrap();
        let thread = store.new_entity(process, EntityKind::Thread, 100).unwrap();
        store.new_entity(thread, EntityKind::Module, 0x1000).unwrap();

        let released = store.release_children(process);
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].kind, EntityKind::Module);
        assert_eq!(store.find(EntityKind::Thread, 100), None);
        assert_eq!(store.find(EntityKind::Process, 100), Some(process));
        assert_eq!(store.count(EntityKind::Thread), 0);
        assert_eq!(store.count(EntityKind::Process), 1);
    }

    #[test]
    fn test_duplicate_ids_are_rejected_per_kind()
    {
        let mut store = store(8);
        let process = store.new_entity(ROOT_INDEX, EntityKind::Process, 7).unwrap();
        let err = store.new_entity(ROOT_INDEX, EntityKind::Process, 7).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateEntity { id: 7, .. }));
        assert!(store.new_entity(process, EntityKind::Thread, 7).is_ok());
    }

    #[test]
    fn test_children_inherit_arch()
    {
        let mut store = store(8);
        let process = store.new_entity(ROOT_INDEX, EntityKind::Process, 1).unwrap();
        store.set_arch(process, Architecture::Arm64);
        let thread = store.new_entity(process, EntityKind::Thread, 2).unwrap();
        assert_eq!(store.get(thread).unwrap().arch(), Architecture::Arm64);
        assert_eq!(store.target(thread).unwrap().parent_id, 1);
    }
}
