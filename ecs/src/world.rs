use std::cell::{Ref, RefMut};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::Rc;
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use smallvec::SmallVec;

use crate::bus::EventBus;
use crate::commands::CommandBuffer;
use crate::component::{Component, ComponentHandle, ComponentLifeStage, ComponentSlot};
use crate::components::{MetaData, Transform};
use crate::config::EcsConfig;
use crate::entity::{Entity, EntityAllocator, EntityLifeStage};
use crate::error::EcsError;
use crate::event::{ComponentAdd, ComponentRemove, ComponentShutdown};
use crate::prototype::{DefaultPrototypeLoader, PrototypeLoader, PrototypeManager};
use crate::registry::{ComponentIndex, ComponentRegistry, RegistrationBuilder, RegistrationKind};
use crate::storage::ComponentStorage;

/// A broadcast waiting for the next event-queue drain.
pub(crate) type QueuedEvent = Box<dyn FnOnce(&mut World)>;

/// Entities, their components and the event bus that connects them.
///
/// Every entity carries a [`Transform`] and a [`MetaData`] from allocation
/// until deletion. Other components are attached with
/// [`add_component`](World::add_component) and removed in two phases: a
/// deferred removal hides the component and shuts it down immediately, and
/// [`tick`](World::tick) culls it from storage at the next tick boundary.
///
/// # Example
///
/// ```
/// use orrery_ecs::{Component, ComponentRegistry, EcsConfig, World};
///
/// struct Health(f32);
/// impl Component for Health {
///     const NAME: &'static str = "Health";
/// }
///
/// let mut registry = ComponentRegistry::new();
/// registry.register::<Health>();
/// let mut world = World::new(registry, EcsConfig::default());
///
/// let entity = world.spawn_entity(None).unwrap();
/// world.add_component(entity, Health(10.0)).unwrap();
/// assert_eq!(world.get_component::<Health>(entity).unwrap().0, 10.0);
///
/// assert!(world.remove_component::<Health>(entity));
/// assert!(!world.has_component::<Health>(entity));
/// world.tick();
/// ```
pub struct World {
    pub(crate) config: EcsConfig,
    registry: ComponentRegistry,
    pub(crate) entities: EntityAllocator,
    pub(crate) storage: ComponentStorage,
    pub(crate) bus: EventBus,
    /// Entities waiting for deletion at the next tick, in request order.
    pub(crate) deletion_queue: Vec<Entity>,
    /// Slot membership of `deletion_queue`.
    pub(crate) queued_for_deletion: FixedBitSet,
    commands: Arc<CommandBuffer>,
    pub(crate) prototypes: PrototypeManager,
    pub(crate) loader: Rc<dyn PrototypeLoader>,
    pub(crate) event_queue: VecDeque<QueuedEvent>,
    tick: u64,
    transform_index: ComponentIndex,
    metadata_index: ComponentIndex,
}

impl World {
    /// Creates a world over `registry`, registering [`Transform`] and
    /// [`MetaData`] if the registry does not have them yet.
    pub fn new(mut registry: ComponentRegistry, config: EcsConfig) -> Self {
        let transform_index = ensure_registered::<Transform>(&mut registry);
        let metadata_index = ensure_registered::<MetaData>(&mut registry);

        let mut storage = ComponentStorage::new(config.entity_capacity);
        storage.set_protected(transform_index, metadata_index);

        let mut world = Self {
            entities: EntityAllocator::with_capacity(config.entity_capacity),
            storage,
            bus: EventBus::new(config.entity_capacity),
            registry,
            deletion_queue: Vec::new(),
            queued_for_deletion: FixedBitSet::with_capacity(config.entity_capacity + 1),
            commands: Arc::new(CommandBuffer::new()),
            prototypes: PrototypeManager::new(),
            loader: Rc::new(DefaultPrototypeLoader),
            event_queue: VecDeque::new(),
            tick: 0,
            transform_index,
            metadata_index,
            config,
        };
        world.sync_registry();
        log::debug!(
            "World created with {} registered component types",
            world.registry.len()
        );
        world
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Registers another component type after the world was created.
    pub fn register_component<T: Component>(&mut self) -> RegistrationBuilder<'_, T> {
        self.registry.register::<T>()
    }

    /// Forwards pending registry changes to storage and the event bus.
    pub(crate) fn sync_registry(&mut self) {
        if !self.registry.has_pending_events() {
            return;
        }
        for event in self.registry.drain_events() {
            self.storage.on_registry_event(event);
            self.bus.on_registry_event(event);
        }
    }

    /// Number of completed ticks.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn transform_index(&self) -> ComponentIndex {
        self.transform_index
    }

    pub fn metadata_index(&self) -> ComponentIndex {
        self.metadata_index
    }

    pub fn prototypes(&self) -> &PrototypeManager {
        &self.prototypes
    }

    pub fn prototypes_mut(&mut self) -> &mut PrototypeManager {
        &mut self.prototypes
    }

    /// Replaces the collaborator that turns prototypes into components.
    pub fn set_prototype_loader(&mut self, loader: impl PrototypeLoader + 'static) {
        self.loader = Rc::new(loader);
    }

    // ---- Command buffer ----

    /// Shared handle to the world's command buffer. Commands queued through
    /// it run at the start of the next [`tick`](Self::tick).
    pub fn commands(&self) -> Arc<CommandBuffer> {
        Arc::clone(&self.commands)
    }

    /// Runs every queued command now.
    pub fn apply_commands(&mut self) {
        let commands = self.commands.drain();
        if !commands.is_empty() {
            log::trace!("Applying {} queued commands", commands.len());
        }
        for command in commands {
            command(self);
        }
    }

    // ---- Tick ----

    /// Advances the world by one tick.
    ///
    /// Phases run in a fixed order: queued commands, queued deletions,
    /// culling of removed components, then queued events.
    pub fn tick(&mut self) {
        self.apply_commands();
        self.process_deletion_queue();
        self.cull_removed_components();
        self.process_event_queue();
        self.tick += 1;
    }

    /// Physically removes every component that was removed with
    /// [`remove_component`](Self::remove_component) since the last cull.
    pub fn cull_removed_components(&mut self) {
        let culled = self.storage.take_cull_queue();
        if culled.is_empty() {
            return;
        }
        log::debug!("Culling {} removed components", culled.len());
        for slot in culled {
            // Already torn down with its entity
            if slot.stage() == ComponentLifeStage::Deleted {
                continue;
            }
            self.cull(&slot);
        }
    }

    // ---- Component access ----

    fn component_index<C: Component>(&self) -> Result<ComponentIndex, EcsError> {
        self.registry
            .index_of::<C>()
            .ok_or(EcsError::ComponentNotRegistered(C::NAME))
    }

    /// Looks up the live slot occupying `index` on `entity`.
    pub(crate) fn component_slot(
        &self,
        entity: Entity,
        index: ComponentIndex,
    ) -> Result<&ComponentHandle, EcsError> {
        if !self.entity_exists(entity) {
            return Err(EcsError::EntityNotFound(entity));
        }
        let component = self.registry.name(index);
        let slot = self
            .storage
            .get(entity.index(), index)
            .ok_or(EcsError::ComponentNotFound { entity, component })?;
        if slot.is_removed() {
            return Err(EcsError::ComponentDeleted { entity, component });
        }
        Ok(slot)
    }

    /// Borrows the `C` on `entity`.
    ///
    /// # Panics
    ///
    /// Panics if the component is currently mutably borrowed.
    pub fn get_component<C: Component>(&self, entity: Entity) -> Result<Ref<'_, C>, EcsError> {
        let slot = self.component_slot(entity, self.component_index::<C>()?)?;
        Ref::filter_map(slot.data.borrow(), |data| data.as_any().downcast_ref::<C>()).map_err(|_| {
            EcsError::ComponentNotFound {
                entity,
                component: C::NAME,
            }
        })
    }

    /// Mutably borrows the `C` on `entity`.
    ///
    /// # Panics
    ///
    /// Panics if the component is currently borrowed.
    pub fn get_component_mut<C: Component>(&self, entity: Entity) -> Result<RefMut<'_, C>, EcsError> {
        let slot = self.component_slot(entity, self.component_index::<C>()?)?;
        RefMut::filter_map(slot.data.borrow_mut(), |data| {
            data.as_any_mut().downcast_mut::<C>()
        })
        .map_err(|_| EcsError::ComponentNotFound {
            entity,
            component: C::NAME,
        })
    }

    /// Borrows the `C` on `entity` if it exists, is live and is not
    /// already borrowed.
    pub fn try_get_component<C: Component>(&self, entity: Entity) -> Option<Ref<'_, C>> {
        let index = self.registry.index_of::<C>()?;
        let slot = self.component_slot(entity, index).ok()?;
        let data = slot.data.try_borrow().ok()?;
        Ref::filter_map(data, |data| data.as_any().downcast_ref::<C>()).ok()
    }

    pub fn try_get_component_mut<C: Component>(&self, entity: Entity) -> Option<RefMut<'_, C>> {
        let index = self.registry.index_of::<C>()?;
        let slot = self.component_slot(entity, index).ok()?;
        let data = slot.data.try_borrow_mut().ok()?;
        RefMut::filter_map(data, |data| data.as_any_mut().downcast_mut::<C>()).ok()
    }

    /// Whether `entity` has a live `C`, or a live component satisfying the
    /// reference type `C`.
    pub fn has_component<C: 'static>(&self, entity: Entity) -> bool {
        self.registry
            .index_of::<C>()
            .is_some_and(|index| self.has_component_index(entity, index))
    }

    pub fn has_component_index(&self, entity: Entity, index: ComponentIndex) -> bool {
        self.entity_exists(entity) && self.storage.get_live(entity.index(), index).is_some()
    }

    /// Every live component of `entity`, in attach order.
    pub fn get_components(&self, entity: Entity) -> impl Iterator<Item = &ComponentHandle> + '_ {
        let owned = if self.entity_exists(entity) {
            self.storage.owned(entity.index())
        } else {
            &[]
        };
        owned.iter().filter(|slot| !slot.is_removed())
    }

    // ---- Add ----

    /// Attaches `component` to `entity`.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist or is terminating, or if any slot
    /// `C` occupies is already taken (see
    /// [`add_component_with`](Self::add_component_with)).
    pub fn add_component<C: Component>(&mut self, entity: Entity, component: C) -> Result<(), EcsError> {
        self.add_component_with(entity, component, false)
    }

    /// Attaches `component` to `entity`, replacing existing occupants of
    /// its slots when `overwrite` is set.
    ///
    /// The component's add, init and startup callbacks run according to how
    /// far the entity has progressed: a component added to a running entity
    /// ends up running too.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist or is terminating, if a slot is
    /// taken and `overwrite` is `false`, or if the transform or metadata
    /// would be replaced (regardless of `overwrite`).
    pub fn add_component_with<C: Component>(
        &mut self,
        entity: Entity,
        component: C,
        overwrite: bool,
    ) -> Result<(), EcsError> {
        self.sync_registry();
        let index = self.component_index::<C>()?;
        if self.registry.registration(index).kind != RegistrationKind::Component {
            return Err(EcsError::ComponentNotRegistered(C::NAME));
        }
        self.attach(ComponentSlot::new_handle(entity, index, component), overwrite);
        Ok(())
    }

    pub(crate) fn attach(&mut self, slot: ComponentHandle, overwrite: bool) {
        self.sync_registry();
        let entity = slot.owner();
        let name = self.registry.name(slot.index());
        let Some(stage) = self.entities.stage(entity) else {
            panic!("Cannot add component `{name}` to missing entity {entity}");
        };
        assert!(
            stage < EntityLifeStage::Terminating,
            "Cannot add component `{name}` to {entity} while it is {stage:?}"
        );

        let references = self.registry.reference_indices(slot.index()).to_vec();
        let mut displaced: SmallVec<[ComponentHandle; 2]> = SmallVec::new();
        for &reference in &references {
            let Some(occupant) = self.storage.get_live(entity.index(), reference) else {
                continue;
            };
            let occupant_name = self.registry.name(occupant.index());
            if self.storage.is_protected(reference) || self.storage.is_protected(occupant.index()) {
                panic!("Cannot overwrite mandatory component `{occupant_name}` on {entity}");
            }
            if !overwrite {
                panic!(
                    "Cannot add `{name}` to {entity}: `{occupant_name}` already occupies `{}`",
                    self.registry.name(reference)
                );
            }
            if !displaced.iter().any(|other| Rc::ptr_eq(other, occupant)) {
                displaced.push(Rc::clone(occupant));
            }
        }
        // Displaced components wait for the cull; the new slot replaces
        // their table entries in place
        for occupant in displaced {
            log::trace!(
                "Overwriting `{}` on {entity}",
                self.registry.name(occupant.index())
            );
            self.retire_component(occupant);
        }

        self.storage.insert(Rc::clone(&slot), &references);
        slot.advance(ComponentLifeStage::Added);
        self.bus.component_added(entity.index(), &references);
        log::trace!("Added `{name}` to {entity}");
        self.raise_component_event(&slot, ComponentAdd);

        // The add handler may have removed it or deleted the entity
        let Some(stage) = self.entities.stage(entity) else {
            return;
        };
        if stage >= EntityLifeStage::Initializing && stage < EntityLifeStage::Terminating {
            self.initialize_component(&slot);
            if stage >= EntityLifeStage::Initialized {
                self.start_component(&slot);
            }
        }
    }

    // ---- Remove ----

    /// Removes the `C` from `entity` at the next cull.
    ///
    /// The component disappears from lookups, queries and dispatch right
    /// away and its shutdown callback runs before this returns. Returns
    /// `false` if there was nothing live to remove.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist, or if `C` is the transform or
    /// metadata of an entity that is not being deleted.
    pub fn remove_component<C: 'static>(&mut self, entity: Entity) -> bool {
        let Some(slot) = self.removable_slot::<C>(entity) else {
            return false;
        };
        self.retire_component(slot);
        true
    }

    /// Removes the `C` from `entity` right away, bypassing the cull queue.
    ///
    /// Only safe when nothing is iterating the component's tables.
    pub fn remove_component_immediate<C: 'static>(&mut self, entity: Entity) -> bool {
        let Some(slot) = self.removable_slot::<C>(entity) else {
            return false;
        };
        if self.hide_component(&slot) {
            let raised = catch_unwind(AssertUnwindSafe(|| {
                self.raise_component_event(&slot, ComponentShutdown)
            }));
            if let Err(payload) = raised {
                self.cull(&slot);
                resume_unwind(payload);
            }
        }
        self.cull(&slot);
        true
    }

    fn removable_slot<C: 'static>(&self, entity: Entity) -> Option<ComponentHandle> {
        let stage = self
            .entities
            .stage(entity)
            .unwrap_or_else(|| panic!("Cannot remove component from missing entity {entity}"));
        let index = self.registry.index_of::<C>()?;
        let slot = self.storage.get(entity.index(), index)?;
        let name = self.registry.name(slot.index());
        if slot.is_removed() {
            log::trace!("`{name}` on {entity} is already removed");
            return None;
        }
        assert!(
            !self.storage.is_protected(slot.index()) || stage >= EntityLifeStage::Terminating,
            "Cannot remove mandatory component `{name}` from {entity}"
        );
        Some(Rc::clone(slot))
    }

    /// Hides a component and runs its shutdown callback.
    pub(crate) fn shutdown_component(&mut self, slot: &ComponentHandle) {
        if self.hide_component(slot) {
            self.raise_component_event(slot, ComponentShutdown);
        }
    }

    /// Hides a component, parks it for the next cull, then runs its
    /// shutdown callback. A panicking callback still leaves it queued.
    fn retire_component(&mut self, slot: ComponentHandle) {
        if slot.is_removed() {
            return;
        }
        let was_running = self.hide_component(&slot);
        self.storage.queue_cull(Rc::clone(&slot));
        if was_running {
            self.raise_component_event(&slot, ComponentShutdown);
        }
    }

    /// Marks a live component removed and drops its event edges. Returns
    /// whether it was running, i.e. owes a shutdown callback.
    fn hide_component(&mut self, slot: &ComponentHandle) -> bool {
        if slot.is_removed() {
            return false;
        }
        let was_running = slot.stage() == ComponentLifeStage::Running;
        slot.advance(ComponentLifeStage::Removing);
        let references = self.registry.reference_indices(slot.index()).to_vec();
        self.bus.component_removed(slot.owner().index(), &references);
        was_running
    }

    /// Raises the remove callback and takes a removed component out of
    /// storage.
    pub(crate) fn cull(&mut self, slot: &ComponentHandle) {
        self.raise_component_event(slot, ComponentRemove);
        if slot.stage() < ComponentLifeStage::Deleted {
            slot.advance(ComponentLifeStage::Deleted);
        }
        let references = self.registry.reference_indices(slot.index()).to_vec();
        self.storage.remove(slot, &references);
        log::trace!(
            "Removed `{}` from {}",
            self.registry.name(slot.index()),
            slot.owner()
        );
    }

    // ---- Mandatory components ----

    /// The transform of `entity`.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist.
    pub fn transform(&self, entity: Entity) -> Ref<'_, Transform> {
        self.get_component::<Transform>(entity)
            .unwrap_or_else(|err| panic!("Cannot read transform: {err}"))
    }

    /// The metadata of `entity`.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist.
    pub fn metadata(&self, entity: Entity) -> Ref<'_, MetaData> {
        self.get_component::<MetaData>(entity)
            .unwrap_or_else(|err| panic!("Cannot read metadata: {err}"))
    }

    /// Runs `f` on the metadata of `entity`, if it still has one.
    pub(crate) fn with_metadata<R>(&self, entity: Entity, f: impl FnOnce(&mut MetaData) -> R) -> Option<R> {
        let slot = self.storage.get(entity.index(), self.metadata_index)?;
        if slot.owner() != entity {
            return None;
        }
        let mut data = slot.data.try_borrow_mut().ok()?;
        let metadata = data.as_any_mut().downcast_mut::<MetaData>()?;
        Some(f(metadata))
    }

    /// Stamps `entity` as modified at the current tick.
    pub fn dirty(&self, entity: Entity) {
        let tick = self.tick;
        self.with_metadata(entity, |metadata| metadata.last_modified_tick = tick);
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new(ComponentRegistry::new(), EcsConfig::default())
    }
}

fn ensure_registered<T: Component + Default>(registry: &mut ComponentRegistry) -> ComponentIndex {
    match registry.index_of::<T>() {
        Some(index) if registry.registration(index).kind == RegistrationKind::Component => index,
        _ => registry.register::<T>().with_factory().index(),
    }
}
