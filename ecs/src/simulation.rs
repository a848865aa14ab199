//! Simulation root: owns the world and its systems and drives the tick loop.
//!
//! ```ignore
//! let mut simulation = Simulation::new(World::new(registry, config));
//! simulation.add_system(MovementSystem);
//! simulation.add_system(CollisionSystem).after::<MovementSystem>();
//!
//! simulation.startup();
//! while running {
//!     simulation.tick(1.0 / 60.0);
//! }
//! simulation.shutdown();
//! ```

use crate::entity::{Entity, EntityLifeStage};
use crate::system::{EntitySystem, SystemManager, SystemRef};
use crate::world::World;

pub struct Simulation {
    world: World,
    systems: SystemManager,
    running: bool,
}

impl Simulation {
    pub fn new(world: World) -> Self {
        Self {
            world,
            systems: SystemManager::new(),
            running: false,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn systems(&self) -> &SystemManager {
        &self.systems
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Registers a system. Systems can only be added before
    /// [`startup`](Self::startup).
    pub fn add_system<S: EntitySystem>(&mut self, system: S) -> SystemRef<'_> {
        self.systems.add(system)
    }

    /// Initializes every system, locks event subscriptions and runs map
    /// init on the entities that already exist.
    ///
    /// # Panics
    ///
    /// Panics when called twice, and on system ordering errors.
    pub fn startup(&mut self) {
        assert!(!self.running, "Simulation has already started");
        orrery_core::init();
        self.systems.initialize(&mut self.world);
        self.world.lock_subscriptions();

        let ready: Vec<Entity> = self
            .world
            .entities()
            .filter(|&entity| self.world.entity_stage(entity) == Some(EntityLifeStage::Initialized))
            .collect();
        for entity in ready {
            self.world.run_map_init(entity);
        }
        self.running = true;
        log::debug!(
            "Simulation started with {} systems and {} entities",
            self.systems.len(),
            self.world.entity_count()
        );
    }

    /// Updates every system once, then advances the world tick.
    pub fn tick(&mut self, frame_time: f32) {
        assert!(self.running, "Simulation::tick called before startup()");
        self.systems.update(&mut self.world, frame_time);
        self.world.tick();
    }

    /// Deletes every entity, then shuts the systems down in reverse order.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.world.delete_all_entities();
        self.systems.shutdown(&mut self.world);
        self.running = false;
        log::debug!("Simulation shut down at tick {}", self.world.current_tick());
    }

    /// Gives the world back, shutting down first if still running.
    pub fn into_world(mut self) -> World {
        self.shutdown();
        std::mem::take(&mut self.world)
    }
}
