use serde::{Deserialize, Serialize};

/// A generational entity handle.
///
/// Layout: `u32 index` + `u32 generation`.
///
/// - **index**: slot index in the entity allocator
/// - **generation**: bumped every time the slot is freed, so a handle kept
///   past its entity's deletion never aliases the slot's next occupant
///
/// Slot 0 is reserved: [`Entity::INVALID`] never refers to a live entity and
/// the first allocation in a fresh world always returns [`Entity::FIRST`].
///
/// # Example
///
/// ```
/// use orrery_ecs::Entity;
///
/// assert!(!Entity::INVALID.is_valid());
/// assert!(Entity::FIRST.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    /// Sentinel that never refers to a live entity.
    pub const INVALID: Entity = Entity {
        index: 0,
        generation: 0,
    };

    /// The first handle handed out by a fresh allocator.
    pub const FIRST: Entity = Entity {
        index: 1,
        generation: 0,
    };

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slot index of this entity.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation of this entity's slot at allocation time.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns `false` for [`Entity::INVALID`].
    pub fn is_valid(&self) -> bool {
        self.index != Self::INVALID.index
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entity({}@{})", self.index, self.generation)
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entity({}@{})", self.index, self.generation)
    }
}

/// Lifecycle stage of an entity.
///
/// Stages only ever move forward. `Terminating` and `Deleted` are reachable
/// from any earlier stage through deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityLifeStage {
    PreInit,
    Initializing,
    Initialized,
    MapInitialized,
    Terminating,
    Deleted,
}

/// Allocates and recycles entity slots with generation tracking.
///
/// Besides liveness the allocator keeps the per-slot state the lifecycle
/// manager needs on hot paths: the entity life stage and flag bits.
pub(crate) struct EntityAllocator {
    /// Current generation of each slot. Index = entity index.
    generations: Vec<u32>,
    /// Life stage per slot. Meaningful only while the slot is alive.
    stages: Vec<EntityLifeStage>,
    /// Per-slot flag bits (see [`EntityAllocator::PAUSED`]).
    flags: Vec<u32>,
    alive: Vec<bool>,
    /// Free list of recyclable indices (LIFO stack).
    free_list: Vec<u32>,
    count: u32,
}

impl EntityAllocator {
    /// Entity is paused and skipped by queries that exclude paused entities.
    pub const PAUSED: u32 = 1 << 0;

    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an allocator with room for `capacity` entities. Slot 0 is
    /// reserved for [`Entity::INVALID`].
    pub fn with_capacity(capacity: usize) -> Self {
        let mut generations = Vec::with_capacity(capacity + 1);
        let mut stages = Vec::with_capacity(capacity + 1);
        let mut flags = Vec::with_capacity(capacity + 1);
        let mut alive = Vec::with_capacity(capacity + 1);
        generations.push(0);
        stages.push(EntityLifeStage::Deleted);
        flags.push(0);
        alive.push(false);
        Self {
            generations,
            stages,
            flags,
            alive,
            free_list: Vec::new(),
            count: 0,
        }
    }

    /// Allocates a new entity, reusing a recycled slot if available.
    pub fn allocate(&mut self) -> Entity {
        self.count += 1;

        if let Some(index) = self.free_list.pop() {
            let idx = index as usize;
            self.alive[idx] = true;
            self.stages[idx] = EntityLifeStage::PreInit;
            self.flags[idx] = 0;
            Entity::new(index, self.generations[idx])
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.stages.push(EntityLifeStage::PreInit);
            self.flags.push(0);
            self.alive.push(true);
            Entity::new(index, 0)
        }
    }

    /// Deallocates an entity. Returns false if already dead or the generation
    /// does not match.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let idx = entity.index() as usize;
        self.alive[idx] = false;
        // Bump so old handles never match the slot's next occupant
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.stages[idx] = EntityLifeStage::Deleted;
        self.flags[idx] = 0;
        self.free_list.push(entity.index());
        self.count -= 1;
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        let idx = entity.index() as usize;
        entity.is_valid()
            && idx < self.alive.len()
            && self.alive[idx]
            && self.generations[idx] == entity.generation()
    }

    /// Returns the number of alive entities.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of slots ever created, including the reserved one.
    pub fn slot_count(&self) -> usize {
        self.generations.len()
    }

    pub fn stage(&self, entity: Entity) -> Option<EntityLifeStage> {
        self.is_alive(entity)
            .then(|| self.stages[entity.index() as usize])
    }

    /// Moves an entity forward to `stage`.
    ///
    /// # Panics
    ///
    /// Panics if the entity is dead or `stage` is not after the current one.
    pub fn advance_stage(&mut self, entity: Entity, stage: EntityLifeStage) {
        assert!(
            self.is_alive(entity),
            "Cannot change life stage of dead entity {entity}"
        );
        let current = &mut self.stages[entity.index() as usize];
        assert!(
            stage > *current,
            "Entity {entity} life stage cannot go from {current:?} to {stage:?}"
        );
        *current = stage;
    }

    /// Sets flag bits on an entity slot (OR operation).
    pub fn set_flags(&mut self, index: u32, bits: u32) {
        self.flags[index as usize] |= bits;
    }

    /// Clears flag bits on an entity slot (AND-NOT operation).
    pub fn clear_flags(&mut self, index: u32, bits: u32) {
        self.flags[index as usize] &= !bits;
    }

    pub fn has_flags(&self, index: u32, bits: u32) -> bool {
        self.flags
            .get(index as usize)
            .is_some_and(|flags| flags & bits == bits)
    }

    /// Returns the alive entity at the given index, or `None` if the slot is
    /// empty.
    pub fn entity_at_index(&self, index: u32) -> Option<Entity> {
        let idx = index as usize;
        if idx < self.alive.len() && self.alive[idx] {
            Some(Entity::new(index, self.generations[idx]))
        } else {
            None
        }
    }

    /// Iterates over all currently alive entities in slot order.
    pub fn iter_alive(&self) -> impl Iterator<Item = Entity> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(idx, _)| Entity::new(idx as u32, self.generations[idx]))
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}
