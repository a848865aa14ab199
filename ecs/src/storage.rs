//! Per-type component tables and the per-entity reverse index.

use std::rc::Rc;

use crate::component::{ComponentHandle, ComponentLifeStage};
use crate::registry::{ComponentIndex, RegistryEvent};
use crate::sparse_set::SparseSet;

/// Position of a component type in the safe initialization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SafeRank {
    Transform,
    MetaData,
    Other,
}

/// Owns every component instance in a world.
///
/// Each registered index (component or reference type) has a
/// [`SparseSet`] of [`ComponentHandle`]s keyed by entity slot; a component
/// that satisfies several reference types sits in each of their tables.
/// Per entity, a reverse list keeps every owned component in attach order.
///
/// Removal is two-phase: [`queue_cull`](Self::queue_cull) parks a handle that
/// has already been marked removed, and [`take_cull_queue`](Self::take_cull_queue)
/// hands the batch back at the tick boundary for physical removal.
pub(crate) struct ComponentStorage {
    tables: Vec<SparseSet<ComponentHandle>>,
    ranks: Vec<SafeRank>,
    /// Components owned by each entity slot, in attach order.
    owned: Vec<Vec<ComponentHandle>>,
    cull_queue: Vec<ComponentHandle>,
    transform: Option<ComponentIndex>,
    metadata: Option<ComponentIndex>,
}

impl ComponentStorage {
    pub fn new(entity_capacity: usize) -> Self {
        Self {
            tables: Vec::new(),
            ranks: Vec::new(),
            owned: Vec::with_capacity(entity_capacity + 1),
            cull_queue: Vec::new(),
            transform: None,
            metadata: None,
        }
    }

    /// Declares which indices are the mandatory transform and metadata types.
    pub fn set_protected(&mut self, transform: ComponentIndex, metadata: ComponentIndex) {
        self.transform = Some(transform);
        self.metadata = Some(metadata);
        self.ensure_index(transform);
        self.ensure_index(metadata);
        self.ranks[transform.index()] = SafeRank::Transform;
        self.ranks[metadata.index()] = SafeRank::MetaData;
    }

    pub fn is_protected(&self, index: ComponentIndex) -> bool {
        Some(index) == self.transform || Some(index) == self.metadata
    }

    fn ensure_index(&mut self, index: ComponentIndex) {
        if index.index() >= self.tables.len() {
            let rows = self.owned.len();
            self.tables.resize_with(index.index() + 1, || {
                let mut table = SparseSet::new();
                table.reserve_entities(rows);
                table
            });
            self.ranks.resize(index.index() + 1, SafeRank::Other);
        }
    }

    /// Applies a registry notification.
    pub fn on_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::ComponentAdded(index) => self.ensure_index(index),
            RegistryEvent::ComponentReferenceAdded {
                component,
                reference,
            } => {
                self.ensure_index(component);
                self.ensure_index(reference);
                // Anything satisfying the transform capability is transform-like
                if Some(reference) == self.transform {
                    self.ranks[component.index()] = SafeRank::Transform;
                }
            }
        }
    }

    /// Prepares the reverse-index row for a newly allocated entity slot.
    pub fn on_entity_allocated(&mut self, entity_index: u32) {
        let idx = entity_index as usize;
        if idx >= self.owned.len() {
            self.owned.resize_with(idx + 1, Vec::new);
        }
    }

    /// Registers `handle` under each of `references`.
    pub fn insert(&mut self, handle: ComponentHandle, references: &[ComponentIndex]) {
        let entity_index = handle.owner().index();
        for &reference in references {
            self.ensure_index(reference);
            self.tables[reference.index()].insert(entity_index, Rc::clone(&handle));
        }
        self.on_entity_allocated(entity_index);
        self.owned[entity_index as usize].push(handle);
    }

    /// Returns the slot occupying `index` for an entity, removed or not.
    pub fn get(&self, entity_index: u32, index: ComponentIndex) -> Option<&ComponentHandle> {
        self.tables.get(index.index())?.get(entity_index)
    }

    /// Returns the slot occupying `index` for an entity if it is not removed.
    pub fn get_live(&self, entity_index: u32, index: ComponentIndex) -> Option<&ComponentHandle> {
        self.get(entity_index, index).filter(|slot| !slot.is_removed())
    }

    pub fn table(&self, index: ComponentIndex) -> Option<&SparseSet<ComponentHandle>> {
        self.tables.get(index.index())
    }

    /// Every component owned by an entity, in attach order.
    pub fn owned(&self, entity_index: u32) -> &[ComponentHandle] {
        self.owned
            .get(entity_index as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Owned components sorted into safe order: transform-like first,
    /// metadata second, the rest in attach order.
    pub fn safe_order(&self, entity_index: u32) -> Vec<ComponentHandle> {
        let mut handles = self.owned(entity_index).to_vec();
        handles.sort_by_key(|handle| self.ranks[handle.index().index()]);
        handles
    }

    /// Removes `handle` from each of `references` and from its owner's list.
    /// Tables where another component has since taken the slot are left alone.
    pub fn remove(&mut self, handle: &ComponentHandle, references: &[ComponentIndex]) {
        let entity_index = handle.owner().index();
        for &reference in references {
            let Some(table) = self.tables.get_mut(reference.index()) else {
                continue;
            };
            if table
                .get(entity_index)
                .is_some_and(|occupant| Rc::ptr_eq(occupant, handle))
            {
                table.remove(entity_index);
            }
        }
        if let Some(owned) = self.owned.get_mut(entity_index as usize) {
            owned.retain(|other| !Rc::ptr_eq(other, handle));
        }
    }

    /// Parks a removed component until the next cull.
    pub fn queue_cull(&mut self, handle: ComponentHandle) {
        debug_assert!(handle.stage() >= ComponentLifeStage::Removing);
        self.cull_queue.push(handle);
    }

    pub fn take_cull_queue(&mut self) -> Vec<ComponentHandle> {
        std::mem::take(&mut self.cull_queue)
    }

    pub fn has_pending_culls(&self) -> bool {
        !self.cull_queue.is_empty()
    }

    /// Drops every component of an entity from all tables.
    pub fn dispose_entity(&mut self, entity_index: u32) -> Vec<ComponentHandle> {
        let Some(owned) = self.owned.get_mut(entity_index as usize) else {
            return Vec::new();
        };
        let handles = std::mem::take(owned);
        for table in &mut self.tables {
            table.remove(entity_index);
        }
        handles
    }

    /// Number of live entries for a type. Used to pick the query driver.
    pub fn table_len(&self, index: ComponentIndex) -> usize {
        self.tables.get(index.index()).map_or(0, SparseSet::len)
    }
}
