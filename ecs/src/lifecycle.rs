//! Entity lifecycle: allocation, initialization, start, map init and the
//! recursive deletion cascade.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::Rc;

use crate::component::{ComponentHandle, ComponentLifeStage, ComponentSlot};
use crate::components::{MetaData, Transform};
use crate::entity::{Entity, EntityAllocator, EntityLifeStage};
use crate::error::EcsError;
use crate::event::{
    ComponentInit, ComponentRemove, ComponentStartup, EntityDeleted, EntityInitialized,
    EntityPausedEvent, EntityStarted, EntityTerminating, MapInitEvent,
};
use crate::world::World;

impl World {
    // ---- Allocation ----

    /// Reserves a handle, attaches a blank transform and metadata, then loads
    /// the components of `prototype` if one is given.
    ///
    /// The entity is left at [`EntityLifeStage::PreInit`]; see
    /// [`spawn_entity`](Self::spawn_entity) for the full sequence. If the
    /// prototype fails to load, the half-built entity is deleted again.
    pub fn allocate_entity(&mut self, prototype: Option<&str>) -> Result<Entity, EcsError> {
        let prototype = match prototype {
            Some(id) => Some(
                self.prototypes
                    .get(id)
                    .cloned()
                    .ok_or_else(|| EcsError::PrototypeNotFound(id.to_string()))?,
            ),
            None => None,
        };

        let entity = self.entities.allocate();
        let idx = entity.index();
        self.storage.on_entity_allocated(idx);
        self.bus.entity_created(idx);
        self.queued_for_deletion.grow(idx as usize + 1);

        let transform_index = self.transform_index();
        let metadata_index = self.metadata_index();
        self.attach(
            ComponentSlot::new_handle(entity, transform_index, Transform::default()),
            false,
        );
        let metadata = MetaData {
            name: prototype.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
            description: prototype
                .as_ref()
                .map(|p| p.description.clone())
                .unwrap_or_default(),
            prototype: prototype.as_ref().map(|p| p.id.clone()),
            last_modified_tick: self.current_tick(),
            ..MetaData::default()
        };
        self.attach(ComponentSlot::new_handle(entity, metadata_index, metadata), false);

        if let Some(prototype) = prototype {
            let loader = Rc::clone(&self.loader);
            if let Err(err) = loader.load_components(self, entity, &prototype) {
                log::error!(
                    "Failed to load prototype `{}` into {entity}: {err}",
                    prototype.id
                );
                self.delete_entity(entity);
                return Err(err);
            }
        }

        log::trace!("Allocated {}", self.describe(entity));
        Ok(entity)
    }

    /// Allocates, initializes and starts an entity.
    pub fn spawn_entity(&mut self, prototype: Option<&str>) -> Result<Entity, EcsError> {
        let entity = self.allocate_entity(prototype)?;
        self.initialize_components(entity);
        if self.entity_stage(entity) == Some(EntityLifeStage::Initialized) {
            self.start_components(entity);
        }
        Ok(entity)
    }

    // ---- Initialization ----

    /// Initializes every attached component in safe order and raises
    /// [`EntityInitialized`].
    ///
    /// Initializing a missing entity or one past
    /// [`EntityLifeStage::PreInit`] is a contract violation.
    pub fn initialize_components(&mut self, entity: Entity) {
        let Some(stage) = self.entity_stage(entity) else {
            self.contract_violation(format!("Cannot initialize missing entity {entity}"));
            return;
        };
        if stage != EntityLifeStage::PreInit {
            self.contract_violation(format!(
                "Cannot initialize {}: it is already {stage:?}",
                self.describe(entity)
            ));
            return;
        }

        self.set_stage(entity, EntityLifeStage::Initializing);
        for slot in self.storage.safe_order(entity.index()) {
            self.initialize_component(&slot);
            if self.entity_stage(entity) != Some(EntityLifeStage::Initializing) {
                log::debug!("{entity} left initialization early");
                return;
            }
        }

        for slot in self.storage.owned(entity.index()) {
            assert!(
                slot.is_removed() || slot.stage() >= ComponentLifeStage::Initialized,
                "Component `{}` on {entity} did not finish initializing",
                self.registry().name(slot.index())
            );
        }
        self.set_stage(entity, EntityLifeStage::Initialized);
        log::debug!("Initialized {}", self.describe(entity));
        self.raise_local_event(entity, EntityInitialized { entity }, true);
    }

    pub(crate) fn initialize_component(&mut self, slot: &ComponentHandle) {
        if slot.stage() != ComponentLifeStage::Added {
            return;
        }
        slot.advance(ComponentLifeStage::Initializing);
        self.raise_component_event(slot, ComponentInit);
        if !slot.is_removed() {
            slot.advance(ComponentLifeStage::Initialized);
        }
    }

    /// Starts every initialized component in safe order and raises
    /// [`EntityStarted`].
    pub fn start_components(&mut self, entity: Entity) {
        let Some(stage) = self.entity_stage(entity) else {
            self.contract_violation(format!("Cannot start missing entity {entity}"));
            return;
        };
        if !(EntityLifeStage::Initialized..EntityLifeStage::Terminating).contains(&stage) {
            self.contract_violation(format!(
                "Cannot start {} while it is {stage:?}",
                self.describe(entity)
            ));
            return;
        }

        for slot in self.storage.safe_order(entity.index()) {
            self.start_component(&slot);
            if !self.entity_exists(entity) {
                return;
            }
        }
        log::trace!("Started {}", self.describe(entity));
        self.raise_local_event(entity, EntityStarted { entity }, true);
    }

    pub(crate) fn start_component(&mut self, slot: &ComponentHandle) {
        if slot.stage() != ComponentLifeStage::Initialized {
            return;
        }
        self.raise_component_event(slot, ComponentStartup);
        if !slot.is_removed() {
            slot.advance(ComponentLifeStage::Running);
        }
    }

    /// Marks the entity as living in a world that has begun and raises
    /// [`MapInitEvent`] on it. Repeated calls do nothing.
    pub fn run_map_init(&mut self, entity: Entity) {
        match self.entity_stage(entity) {
            Some(EntityLifeStage::MapInitialized) => {}
            Some(EntityLifeStage::Initialized) => {
                self.set_stage(entity, EntityLifeStage::MapInitialized);
                self.raise_local_event(entity, MapInitEvent, false);
            }
            Some(stage) => self.contract_violation(format!(
                "Cannot run map init on {} while it is {stage:?}",
                self.describe(entity)
            )),
            None => self.contract_violation(format!("Cannot run map init on missing entity {entity}")),
        }
    }

    // ---- Deletion ----

    /// Deletes `entity` and all of its descendants.
    ///
    /// Runs two passes over the transform hierarchy. The flag pass marks
    /// every entity of the subtree terminating and raises
    /// [`EntityTerminating`] on each (children first) while the hierarchy is
    /// still intact. The destroy pass detaches the root from its parent,
    /// then tears down each entity children first: components shut down in
    /// reverse safe order, storage is released, [`EntityDeleted`] is
    /// broadcast and the handle is freed.
    ///
    /// Deleting a missing entity does nothing. Deleting an entity that is
    /// already terminating is a contract violation.
    ///
    /// If a handler panics (and the world is not exception tolerant), the
    /// rest of the subtree is freed without callbacks before the panic
    /// continues, so no half-deleted entities are left behind.
    pub fn delete_entity(&mut self, entity: Entity) {
        let Some(stage) = self.entity_stage(entity) else {
            log::trace!("Ignoring deletion of missing {entity}");
            return;
        };
        if stage >= EntityLifeStage::Terminating {
            self.contract_violation(format!(
                "Cannot delete {}: it is already {stage:?}",
                self.describe(entity)
            ));
            return;
        }

        log::debug!("Deleting {}", self.describe(entity));
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.flag_termination(entity);
            if self.parent(entity).is_some() {
                self.guarded(entity, "detach from parent", |world| world.set_parent(entity, None));
            }
            self.destroy_entity(entity);
        }));
        if let Err(payload) = result {
            log::error!(
                "Deletion of {entity} panicked: {}; freeing remaining entities",
                panic_message(payload.as_ref())
            );
            self.force_free_subtree(entity);
            resume_unwind(payload);
        }
    }

    fn flag_termination(&mut self, entity: Entity) {
        if self
            .entity_stage(entity)
            .is_none_or(|stage| stage >= EntityLifeStage::Terminating)
        {
            return;
        }
        self.set_stage(entity, EntityLifeStage::Terminating);
        for child in self.children(entity) {
            self.flag_termination(child);
        }
        let mut event = EntityTerminating { entity };
        self.guarded(entity, "EntityTerminating", |world| {
            world.raise_local_event_ref(entity, &mut event, true);
        });
    }

    fn destroy_entity(&mut self, entity: Entity) {
        if !self.entity_exists(entity) {
            return;
        }
        // Only the root raises a parent change; descendants unlink silently
        self.unlink_from_parent(entity);
        for child in self.children(entity) {
            self.destroy_entity(child);
        }

        let mut slots = self.storage.safe_order(entity.index());
        slots.reverse();
        for slot in &slots {
            self.guarded(entity, "component shutdown", |world| world.shutdown_component(slot));
        }
        for slot in &slots {
            if slot.stage() == ComponentLifeStage::Deleted {
                continue;
            }
            self.guarded(entity, "component removal", |world| {
                world.raise_component_event(slot, ComponentRemove);
            });
            slot.force_deleted();
        }

        self.set_stage(entity, EntityLifeStage::Deleted);
        self.storage.dispose_entity(entity.index());
        self.bus.entity_deleted(entity.index());
        self.guarded(entity, "EntityDeleted", |world| {
            world.raise_broadcast_event(EntityDeleted { entity });
        });
        self.free_handle(entity);
        log::trace!("Deleted {entity}");
    }

    /// Frees a subtree without raising anything. Used to finish a deletion
    /// a handler panicked out of.
    fn force_free_subtree(&mut self, entity: Entity) {
        if !self.entity_exists(entity) {
            return;
        }
        for child in self.try_children(entity) {
            self.force_free_subtree(child);
        }
        self.unlink_from_parent(entity);
        for slot in self.storage.dispose_entity(entity.index()) {
            slot.force_deleted();
        }
        self.bus.entity_deleted(entity.index());
        self.free_handle(entity);
    }

    fn free_handle(&mut self, entity: Entity) {
        let idx = entity.index();
        self.entities.clear_flags(idx, EntityAllocator::PAUSED);
        self.entities.deallocate(entity);
        self.queued_for_deletion.set(idx as usize, false);
    }

    /// Requests deletion at the next [`tick`](Self::tick). Requests for an
    /// entity that is already queued are ignored.
    pub fn queue_delete_entity(&mut self, entity: Entity) {
        if !self.entity_exists(entity) {
            log::trace!("Ignoring queued deletion of missing {entity}");
            return;
        }
        let idx = entity.index() as usize;
        self.queued_for_deletion.grow(idx + 1);
        if self.queued_for_deletion.put(idx) {
            log::trace!("{entity} is already queued for deletion");
            return;
        }
        self.deletion_queue.push(entity);
    }

    pub fn is_queued_for_deletion(&self, entity: Entity) -> bool {
        self.entity_exists(entity) && self.queued_for_deletion.contains(entity.index() as usize)
    }

    /// Deletes everything queued with
    /// [`queue_delete_entity`](Self::queue_delete_entity). Deletions queued
    /// while this runs wait for the next call.
    pub fn process_deletion_queue(&mut self) {
        let queued = std::mem::take(&mut self.deletion_queue);
        if !queued.is_empty() {
            log::debug!("Processing {} queued deletions", queued.len());
        }
        for entity in queued {
            let Some(stage) = self.entity_stage(entity) else {
                continue;
            };
            self.queued_for_deletion.set(entity.index() as usize, false);
            if stage < EntityLifeStage::Terminating {
                self.delete_entity(entity);
            }
        }
    }

    /// Deletes every root entity and with them the whole hierarchy.
    pub fn delete_all_entities(&mut self) {
        let roots: Vec<Entity> = self
            .entities()
            .filter(|&entity| self.parent(entity).is_none())
            .collect();
        for entity in roots {
            self.delete_entity(entity);
        }
    }

    // ---- Queries on entities ----

    /// Whether `entity` refers to a live entity. The sanctioned way to probe
    /// a handle that may be stale.
    pub fn entity_exists(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.count() as usize
    }

    /// Every live entity in slot order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter_alive()
    }

    pub fn entity_stage(&self, entity: Entity) -> Option<EntityLifeStage> {
        self.entities.stage(entity)
    }

    fn set_stage(&mut self, entity: Entity, stage: EntityLifeStage) {
        self.entities.advance_stage(entity, stage);
        self.with_metadata(entity, |metadata| metadata.life_stage = stage);
    }

    // ---- Metadata helpers ----

    pub fn is_paused(&self, entity: Entity) -> bool {
        self.entity_exists(entity) && self.entities.has_flags(entity.index(), EntityAllocator::PAUSED)
    }

    /// Pauses or resumes an entity and raises [`EntityPausedEvent`] when the
    /// state changes. Paused entities are skipped by queries unless asked
    /// otherwise.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not exist.
    pub fn set_paused(&mut self, entity: Entity, paused: bool) {
        assert!(
            self.entity_exists(entity),
            "Cannot change pause state of missing entity {entity}"
        );
        if self.is_paused(entity) == paused {
            return;
        }
        if paused {
            self.entities.set_flags(entity.index(), EntityAllocator::PAUSED);
        } else {
            self.entities.clear_flags(entity.index(), EntityAllocator::PAUSED);
        }
        self.with_metadata(entity, |metadata| metadata.paused = paused);
        self.raise_local_event(entity, EntityPausedEvent { entity, paused }, true);
    }

    pub fn entity_name(&self, entity: Entity) -> Option<String> {
        self.with_metadata(entity, |metadata| metadata.name.clone())
    }

    pub fn set_entity_name(&mut self, entity: Entity, name: impl Into<String>) {
        let name = name.into();
        self.with_metadata(entity, |metadata| metadata.name = name);
        self.dirty(entity);
    }

    pub fn set_entity_description(&mut self, entity: Entity, description: impl Into<String>) {
        let description = description.into();
        self.with_metadata(entity, |metadata| metadata.description = description);
        self.dirty(entity);
    }

    /// `Entity(idx@gen)` followed by the entity name, for log messages.
    pub(crate) fn describe(&self, entity: Entity) -> String {
        match self.entity_name(entity) {
            Some(name) if !name.is_empty() => format!("{entity} `{name}`"),
            _ => entity.to_string(),
        }
    }

    // ---- Failure policy ----

    /// Reports a lifecycle contract violation: a panic by default, a logged
    /// error when the world is exception tolerant.
    pub(crate) fn contract_violation(&self, message: String) {
        if self.config.exception_tolerant {
            log::error!("{message}");
        } else {
            panic!("{message}");
        }
    }

    /// Runs one step of a teardown. In exception-tolerant mode a panic in
    /// `f` is logged and the teardown carries on.
    pub(crate) fn guarded(&mut self, entity: Entity, what: &str, f: impl FnOnce(&mut World)) {
        if !self.config.exception_tolerant {
            f(self);
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(self))) {
            log::error!(
                "{what} failed on {}: {}",
                self.describe(entity),
                panic_message(payload.as_ref())
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::config::EcsConfig;
    use crate::registry::ComponentRegistry;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Probe;

    impl Component for Probe {
        const NAME: &'static str = "Probe";
    }

    fn world() -> World {
        let mut registry = ComponentRegistry::new();
        registry.register::<Probe>().with_factory();
        World::new(registry, EcsConfig::default())
    }

    #[test]
    fn first_entity_uses_first_handle() {
        let mut world = world();
        let entity = world.allocate_entity(None).unwrap();
        assert_eq!(entity, Entity::FIRST);
        assert_eq!(world.entity_stage(entity), Some(EntityLifeStage::PreInit));
        assert!(world.has_component::<Transform>(entity));
        assert!(world.has_component::<MetaData>(entity));
    }

    #[test]
    fn stages_progress_and_mirror_into_metadata() {
        let mut world = world();
        let entity = world.spawn_entity(None).unwrap();
        assert_eq!(world.entity_stage(entity), Some(EntityLifeStage::Initialized));
        world.run_map_init(entity);
        world.run_map_init(entity);
        assert_eq!(world.metadata(entity).life_stage(), EntityLifeStage::MapInitialized);
    }

    #[test]
    #[should_panic(expected = "it is already Initialized")]
    fn double_initialize_panics() {
        let mut world = world();
        let entity = world.spawn_entity(None).unwrap();
        world.initialize_components(entity);
    }

    #[test]
    fn double_initialize_is_logged_when_tolerant() {
        let mut registry = ComponentRegistry::new();
        registry.register::<Probe>();
        let mut world = World::new(registry, EcsConfig::tolerant());
        let entity = world.spawn_entity(None).unwrap();
        world.initialize_components(entity);
        assert_eq!(world.entity_stage(entity), Some(EntityLifeStage::Initialized));
    }

    #[test]
    fn components_init_in_safe_order() {
        let mut world = world();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = Rc::clone(&order);
        world.subscribe_local::<Transform, ComponentInit>(move |_, _, _, _| o.borrow_mut().push("transform"));
        let o = Rc::clone(&order);
        world.subscribe_local::<MetaData, ComponentInit>(move |_, _, _, _| o.borrow_mut().push("metadata"));
        let o = Rc::clone(&order);
        world.subscribe_local::<Probe, ComponentInit>(move |_, _, _, _| o.borrow_mut().push("probe"));

        let entity = world.allocate_entity(None).unwrap();
        world.add_component(entity, Probe).unwrap();
        world.initialize_components(entity);
        assert_eq!(*order.borrow(), vec!["transform", "metadata", "probe"]);
    }

    #[test]
    fn queue_delete_runs_once() {
        let mut world = world();
        let deleted = Rc::new(RefCell::new(0));
        let d = Rc::clone(&deleted);
        world.subscribe_broadcast::<EntityDeleted>(move |_, _| *d.borrow_mut() += 1);

        let entity = world.spawn_entity(None).unwrap();
        world.queue_delete_entity(entity);
        world.queue_delete_entity(entity);
        assert!(world.is_queued_for_deletion(entity));
        assert!(world.entity_exists(entity));

        world.tick();
        assert_eq!(*deleted.borrow(), 1);
        assert!(!world.entity_exists(entity));
    }

    #[test]
    fn deleting_missing_entity_is_silent() {
        let mut world = world();
        let entity = world.spawn_entity(None).unwrap();
        world.delete_entity(entity);
        world.delete_entity(entity);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    #[should_panic(expected = "it is already Terminating")]
    fn deleting_terminating_entity_panics() {
        let mut world = world();
        world.subscribe_local_ref::<Probe, EntityTerminating>(|world, entity, _, _| {
            world.delete_entity(entity);
        });
        let entity = world.spawn_entity(None).unwrap();
        world.add_component(entity, Probe).unwrap();
        world.delete_entity(entity);
    }

    #[test]
    fn panicking_teardown_still_frees_the_entity() {
        let mut world = world();
        world.subscribe_local::<Probe, ComponentRemove>(|_, _, _, _| panic!("remove hook failed"));
        let entity = world.spawn_entity(None).unwrap();
        world.add_component(entity, Probe).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| world.delete_entity(entity)));
        assert!(result.is_err());
        assert!(!world.entity_exists(entity));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn tolerant_teardown_continues_past_panics() {
        let mut registry = ComponentRegistry::new();
        registry.register::<Probe>();
        let mut world = World::new(registry, EcsConfig::tolerant());
        let deleted = Rc::new(RefCell::new(false));
        let d = Rc::clone(&deleted);
        world.subscribe_local::<Probe, ComponentRemove>(|_, _, _, _| panic!("remove hook failed"));
        world.subscribe_broadcast::<EntityDeleted>(move |_, _| *d.borrow_mut() = true);

        let entity = world.spawn_entity(None).unwrap();
        world.add_component(entity, Probe).unwrap();
        world.delete_entity(entity);
        assert!(*deleted.borrow());
        assert!(!world.entity_exists(entity));
    }

    #[test]
    fn pause_raises_event_once_per_change() {
        let mut world = world();
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = Rc::clone(&events);
        world.subscribe_broadcast::<EntityPausedEvent>(move |_, event| e.borrow_mut().push(event.paused));

        let entity = world.spawn_entity(None).unwrap();
        world.set_paused(entity, true);
        world.set_paused(entity, true);
        world.set_paused(entity, false);
        assert_eq!(*events.borrow(), vec![true, false]);
        assert!(!world.metadata(entity).paused());
    }

    #[test]
    fn names_show_up_in_descriptions() {
        let mut world = world();
        let entity = world.spawn_entity(None).unwrap();
        world.set_entity_name(entity, "crate");
        assert_eq!(world.entity_name(entity).as_deref(), Some("crate"));
        assert_eq!(world.describe(entity), format!("{entity} `crate`"));
    }
}
