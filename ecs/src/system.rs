use std::any::TypeId;

use crate::ordering::{OrderNode, topological_order};
use crate::world::World;

/// A system that drives part of the simulation once per tick.
///
/// Systems usually subscribe to events in [`initialize`](Self::initialize),
/// which runs before subscriptions are locked, and iterate query cursors in
/// [`update`](Self::update).
///
/// # Example
///
/// ```ignore
/// struct GravitySystem;
///
/// impl EntitySystem for GravitySystem {
///     fn update(&mut self, world: &mut World, frame_time: f32) {
///         let mut query = world.query::<(Write<Velocity>,)>();
///         while let Some((mut velocity,)) = query.next(world) {
///             velocity.y -= 9.81 * frame_time;
///         }
///     }
/// }
/// ```
pub trait EntitySystem: 'static {
    fn initialize(&mut self, _world: &mut World) {}

    fn update(&mut self, world: &mut World, frame_time: f32);

    fn shutdown(&mut self, _world: &mut World) {}
}

struct StoredSystem {
    system: Box<dyn EntitySystem>,
    type_id: TypeId,
    type_name: &'static str,
    after: Vec<TypeId>,
    before: Vec<TypeId>,
}

/// Handle returned by [`SystemManager::add`] for declaring ordering.
pub struct SystemRef<'a> {
    stored: &'a mut StoredSystem,
}

impl SystemRef<'_> {
    /// This system updates after system `S`.
    pub fn after<S: EntitySystem>(self) -> Self {
        self.stored.after.push(TypeId::of::<S>());
        self
    }

    /// This system updates before system `S`.
    pub fn before<S: EntitySystem>(self) -> Self {
        self.stored.before.push(TypeId::of::<S>());
        self
    }
}

/// Owns the entity systems and runs them in dependency order.
///
/// Systems without ordering constraints update in registration order.
/// Shutdown runs in the reverse of the update order.
#[derive(Default)]
pub struct SystemManager {
    systems: Vec<StoredSystem>,
    order: Vec<usize>,
    built: bool,
}

impl SystemManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a system instance.
    ///
    /// # Panics
    ///
    /// Panics if the order was already built, or if a system of the same
    /// type is registered.
    pub fn add<S: EntitySystem>(&mut self, system: S) -> SystemRef<'_> {
        assert!(!self.built, "Cannot add systems after build()");

        let type_id = TypeId::of::<S>();
        if self.contains::<S>() {
            panic!(
                "Duplicate system type: {} is already registered",
                std::any::type_name::<S>()
            );
        }

        self.systems.push(StoredSystem {
            system: Box::new(system),
            type_id,
            type_name: std::any::type_name::<S>(),
            after: Vec::new(),
            before: Vec::new(),
        });
        let index = self.systems.len() - 1;
        SystemRef {
            stored: &mut self.systems[index],
        }
    }

    pub fn contains<S: EntitySystem>(&self) -> bool {
        let type_id = TypeId::of::<S>();
        self.systems.iter().any(|s| s.type_id == type_id)
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Resolves the update order. Called implicitly by
    /// [`initialize`](Self::initialize); repeated calls do nothing.
    ///
    /// # Panics
    ///
    /// Panics if an `after`/`before` constraint names a system type that is
    /// not registered, or if the constraints form a cycle.
    pub fn build(&mut self) {
        if self.built {
            return;
        }

        for system in &self.systems {
            for (relation, deps) in [("after", &system.after), ("before", &system.before)] {
                for dep in deps {
                    if !self.systems.iter().any(|s| s.type_id == *dep) {
                        panic!(
                            "System '{}' declares {relation} a system type that is not registered (TypeId: {dep:?})",
                            system.type_name
                        );
                    }
                }
            }
        }

        let nodes: Vec<OrderNode<'_>> = self
            .systems
            .iter()
            .map(|s| OrderNode {
                marker: Some(s.type_id),
                before: &s.before,
                after: &s.after,
            })
            .collect();
        self.order = match topological_order(&nodes) {
            Ok(order) => order,
            Err(cycle) => {
                let names: Vec<&str> = cycle
                    .members
                    .iter()
                    .map(|&i| self.systems[i].type_name)
                    .collect();
                panic!(
                    "Dependency cycle detected among systems: [{}]",
                    names.join(", ")
                );
            }
        };
        self.built = true;
        log::debug!("System order: [{}]", self.system_names().join(", "));
    }

    /// Type names of the systems in update order. Registration order until
    /// the order is built.
    pub fn system_names(&self) -> Vec<&'static str> {
        if self.built {
            self.order.iter().map(|&i| self.systems[i].type_name).collect()
        } else {
            self.systems.iter().map(|s| s.type_name).collect()
        }
    }

    /// Builds the order and initializes every system in it.
    pub fn initialize(&mut self, world: &mut World) {
        self.build();
        for &i in &self.order {
            log::trace!("Initializing system {}", self.systems[i].type_name);
            self.systems[i].system.initialize(world);
        }
    }

    /// Updates every system once, in order.
    pub fn update(&mut self, world: &mut World, frame_time: f32) {
        debug_assert!(self.built, "SystemManager::update called before build()");
        for &i in &self.order {
            self.systems[i].system.update(world, frame_time);
        }
    }

    /// Shuts systems down in reverse update order.
    pub fn shutdown(&mut self, world: &mut World) {
        for &i in self.order.iter().rev() {
            log::trace!("Shutting down system {}", self.systems[i].type_name);
            self.systems[i].system.shutdown(world);
        }
    }
}
