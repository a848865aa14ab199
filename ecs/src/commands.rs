use parking_lot::Mutex;

use crate::component::Component;
use crate::entity::Entity;
use crate::world::World;

/// A boxed command closure that mutates the world.
pub(crate) type Command = Box<dyn FnOnce(&mut World) + Send>;

/// A boxed insert closure that attaches a component to a specific entity.
type InsertFn = Box<dyn FnOnce(&mut World, Entity) + Send>;

/// A thread-safe buffer for deferred world mutations.
///
/// The world itself is single-threaded. Code running elsewhere (or holding
/// only `&World`, such as a query loop) queues structural changes here; the
/// world applies them at the start of its next [`tick`](World::tick).
///
/// # Example
///
/// ```ignore
/// let commands = world.commands();
/// std::thread::spawn(move || {
///     commands.spawn_entity(None)
///         .with(Health(10.0))
///         .build();
/// });
///
/// world.tick();
/// ```
pub struct CommandBuffer {
    commands: Mutex<Vec<Command>>,
}

impl CommandBuffer {
    /// Creates a new empty command buffer.
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Queues a raw command closure.
    pub fn push(&self, cmd: impl FnOnce(&mut World) + Send + 'static) {
        self.commands.lock().push(Box::new(cmd));
    }

    /// Queues an entity deletion.
    pub fn delete_entity(&self, entity: Entity) {
        self.push(move |world| world.delete_entity(entity));
    }

    /// Queues a component attachment. Failures are logged.
    pub fn add_component<C: Component + Send>(&self, entity: Entity, component: C) {
        self.push(move |world| {
            if let Err(err) = world.add_component(entity, component) {
                log::error!("Queued add of `{}` to {entity} failed: {err}", C::NAME);
            }
        });
    }

    /// Queues a deferred component removal.
    pub fn remove_component<C: 'static>(&self, entity: Entity) {
        self.push(move |world| {
            world.remove_component::<C>(entity);
        });
    }

    /// Queues a reparenting.
    pub fn set_parent(&self, entity: Entity, parent: Option<Entity>) {
        self.push(move |world| world.set_parent(entity, parent));
    }

    /// Begins building a spawn command. The entity is allocated from
    /// `prototype`, given the extra components, then initialized and
    /// started, all in one command.
    pub fn spawn_entity(&self, prototype: Option<&str>) -> SpawnBuilder<'_> {
        SpawnBuilder {
            buffer: self,
            prototype: prototype.map(str::to_owned),
            inserts: Vec::new(),
        }
    }

    /// Drains all queued commands, returning them.
    pub fn drain(&self) -> Vec<Command> {
        std::mem::take(&mut *self.commands.lock())
    }

    /// Returns the number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    /// Returns whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for spawning an entity with extra components.
///
/// Created by [`CommandBuffer::spawn_entity`].
pub struct SpawnBuilder<'a> {
    buffer: &'a CommandBuffer,
    prototype: Option<String>,
    inserts: Vec<InsertFn>,
}

impl SpawnBuilder<'_> {
    /// Adds a component to the entity being built.
    pub fn with<C: Component + Send>(mut self, component: C) -> Self {
        self.inserts.push(Box::new(move |world, entity| {
            if let Err(err) = world.add_component(entity, component) {
                log::error!("Queued add of `{}` to {entity} failed: {err}", C::NAME);
            }
        }));
        self
    }

    /// Finalizes the builder, queuing the spawn command.
    pub fn build(self) {
        let prototype = self.prototype;
        let inserts = self.inserts;
        self.buffer.push(move |world| {
            let entity = match world.allocate_entity(prototype.as_deref()) {
                Ok(entity) => entity,
                Err(err) => {
                    log::error!("Queued spawn failed: {err}");
                    return;
                }
            };
            for insert_fn in inserts {
                insert_fn(world, entity);
            }
            world.initialize_components(entity);
            if world.entity_exists(entity) {
                world.start_components(entity);
            }
        });
    }
}
