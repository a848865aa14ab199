use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use orrery_core::math::Vec3;
use orrery_ecs::{
    AnyComponent, Component, ComponentLifeStage, ComponentRegistry, ComponentShutdown,
    ComponentState, EcsConfig, EcsError, EntParentChangedMessage, Entity, EntityDeleted,
    EntityLifeStage, EntitySystem, EntityTerminating, Event, Read, SessionId, Simulation,
    SubscriptionOrder, Transform, World, Write,
};

// ---------------------------------------------------------------------------
// Test types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Component)]
struct Health {
    current: f32,
}

#[derive(Debug, Default, Component)]
struct Velocity(Vec3);

#[derive(Default, Component)]
struct Physics;

#[derive(Default, Component)]
struct Renderer;

#[derive(Debug, Default, PartialEq, serde::Deserialize, Component)]
#[component(name = "Inventory")]
struct InventoryComponent {
    slots: u32,
}

#[derive(Debug, Default, Component)]
struct Replicated {
    value: u32,
}

impl Replicated {
    const NETWORK_ID: u16 = 7;
}

#[derive(Default, Component)]
struct Collider;

#[derive(Default, Component)]
struct Wall;

/// Capability shared by colliders and walls.
struct Solid;

#[derive(Event)]
struct Ping;

#[derive(Event)]
#[event(by_ref)]
struct Damage {
    amount: f32,
}

type Log = Rc<RefCell<Vec<String>>>;

fn registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register::<Health>();
    registry.register::<Velocity>();
    registry.register::<Physics>();
    registry.register::<Renderer>();
    registry.register::<InventoryComponent>().with_deserializer();
    registry.register::<Replicated>().network_id(Replicated::NETWORK_ID);
    registry
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn world() -> World {
    init_logging();
    World::new(registry(), EcsConfig::default())
}

fn tolerant_world() -> World {
    init_logging();
    World::new(registry(), EcsConfig::tolerant())
}

fn spawn(world: &mut World) -> Entity {
    world.spawn_entity(None).unwrap()
}

fn log_deletions(world: &mut World, log: &Log) {
    let l = Rc::clone(log);
    world.subscribe_broadcast_ref::<EntityTerminating>(move |_, event| {
        l.borrow_mut().push(format!("terminating {}", event.entity));
    });
    let l = Rc::clone(log);
    world.subscribe_broadcast::<EntityDeleted>(move |_, event| {
        l.borrow_mut().push(format!("deleted {}", event.entity));
    });
}

// ---------------------------------------------------------------------------
// Entity handles
// ---------------------------------------------------------------------------

#[test]
fn first_allocation_is_first_handle() {
    let mut world = world();
    let entity = spawn(&mut world);
    assert_eq!(entity, Entity::FIRST);
    assert!(!world.entity_exists(Entity::INVALID));
}

#[test]
fn stale_handles_do_not_alias_recycled_slots() {
    let mut world = world();
    let old = spawn(&mut world);
    world.delete_entity(old);
    let new = spawn(&mut world);

    assert_eq!(old.index(), new.index());
    assert_ne!(old, new);
    assert!(!world.entity_exists(old));
    assert!(world.entity_exists(new));
    assert!(matches!(
        world.get_component::<Transform>(old),
        Err(EcsError::EntityNotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Deletion cascade
// ---------------------------------------------------------------------------

#[test]
fn deletion_cascade_runs_children_first() {
    let mut world = world();
    let log = Log::default();
    log_deletions(&mut world, &log);

    let a = spawn(&mut world);
    let b = spawn(&mut world);
    world.set_parent(b, Some(a));
    world.delete_entity(a);

    assert_eq!(
        *log.borrow(),
        vec![
            format!("terminating {b}"),
            format!("terminating {a}"),
            format!("deleted {b}"),
            format!("deleted {a}"),
        ]
    );
    assert!(!world.entity_exists(a));
    assert!(!world.entity_exists(b));
}

#[test]
fn deleting_a_root_deletes_every_descendant() {
    let mut world = world();
    let deleted = Rc::new(RefCell::new(Vec::new()));
    let d = Rc::clone(&deleted);
    world.subscribe_broadcast::<EntityDeleted>(move |_, event| d.borrow_mut().push(event.entity));

    let root = spawn(&mut world);
    let mut children = Vec::new();
    for _ in 0..5 {
        let child = spawn(&mut world);
        world.set_parent(child, Some(root));
        let grandchild = spawn(&mut world);
        world.set_parent(grandchild, Some(child));
        children.push(child);
    }
    let survivor = spawn(&mut world);

    world.delete_entity(root);

    assert_eq!(deleted.borrow().len(), 11);
    assert_eq!(deleted.borrow().last(), Some(&root));
    assert_eq!(world.entity_count(), 1);
    assert!(world.entity_exists(survivor));
    assert!(world.children(survivor).is_empty());
    for child in children {
        assert!(!world.entity_exists(child));
    }
}

#[test]
fn deleting_a_parentless_root_raises_no_parent_changes() {
    let mut world = world();
    let changes = Rc::new(RefCell::new(Vec::new()));
    let c = Rc::clone(&changes);
    world.subscribe_broadcast::<EntParentChangedMessage>(move |_, message| {
        c.borrow_mut().push(message.entity)
    });

    let root = spawn(&mut world);
    for _ in 0..3 {
        let child = spawn(&mut world);
        world.set_parent(child, Some(root));
    }
    let first_child = world.children(root)[0];
    let grandchild = spawn(&mut world);
    world.set_parent(grandchild, Some(first_child));
    changes.borrow_mut().clear();

    world.delete_entity(root);
    assert!(changes.borrow().is_empty());
    assert_eq!(world.entity_count(), 0);
}

#[test]
fn deleting_a_child_leaves_no_dangling_reference_in_its_parent() {
    let mut world = world();
    let changes = Rc::new(RefCell::new(Vec::new()));
    let c = Rc::clone(&changes);
    world.subscribe_broadcast::<EntParentChangedMessage>(move |_, message| {
        c.borrow_mut().push((message.entity, message.old_parent, message.new_parent))
    });

    let parent = spawn(&mut world);
    let doomed = spawn(&mut world);
    let sibling = spawn(&mut world);
    let nephew = spawn(&mut world);
    world.set_parent(doomed, Some(parent));
    world.set_parent(sibling, Some(parent));
    world.set_parent(nephew, Some(doomed));
    changes.borrow_mut().clear();

    world.delete_entity(doomed);

    assert_eq!(world.children(parent), vec![sibling]);
    assert_eq!(world.parent(sibling), Some(parent));
    assert!(!world.entity_exists(nephew));
    // Only the deleted root is detached with a notification
    assert_eq!(*changes.borrow(), vec![(doomed, Some(parent), None)]);
}

#[test]
fn tolerant_teardown_of_a_hierarchy_survives_a_failing_child() {
    let mut world = tolerant_world();
    let log = Log::default();
    log_deletions(&mut world, &log);
    world.subscribe_local::<Health, ComponentShutdown>(|_, _, _, _| panic!("shutdown failed"));

    let parent = spawn(&mut world);
    let children: Vec<_> = (0..3)
        .map(|_| {
            let child = spawn(&mut world);
            world.set_parent(child, Some(parent));
            child
        })
        .collect();
    world
        .add_component(children[1], Health { current: 1.0 })
        .unwrap();

    world.delete_entity(parent);

    let deleted: Vec<_> = log
        .borrow()
        .iter()
        .filter(|line| line.starts_with("deleted"))
        .cloned()
        .collect();
    assert_eq!(
        deleted,
        vec![
            format!("deleted {}", children[0]),
            format!("deleted {}", children[1]),
            format!("deleted {}", children[2]),
            format!("deleted {parent}"),
        ]
    );
    assert_eq!(world.entity_count(), 0);
}

#[test]
fn components_shut_down_before_the_transform() {
    let mut world = world();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    world.subscribe_local::<Health, orrery_ecs::ComponentShutdown>(move |world, entity, _, _| {
        // The transform must still be readable while other components tear down
        s.borrow_mut().push(world.transform(entity).local_position());
    });

    let entity = spawn(&mut world);
    world.add_component(entity, Health { current: 1.0 }).unwrap();
    world.set_local_position(entity, Vec3::new(3.0, 0.0, 0.0));
    world.delete_entity(entity);

    assert_eq!(*seen.borrow(), vec![Vec3::new(3.0, 0.0, 0.0)]);
}

#[test]
fn queued_deletion_is_idempotent() {
    let mut world = world();
    let log = Log::default();
    log_deletions(&mut world, &log);

    let entity = spawn(&mut world);
    world.queue_delete_entity(entity);
    world.queue_delete_entity(entity);
    assert!(world.is_queued_for_deletion(entity));
    assert!(world.entity_exists(entity));

    world.tick();
    assert!(!world.entity_exists(entity));
    assert_eq!(log.borrow().len(), 2);

    // A stale request for a deleted entity is a no-op
    world.queue_delete_entity(entity);
    world.tick();
    assert_eq!(log.borrow().len(), 2);
}

#[test]
#[should_panic(expected = "already Terminating")]
fn deleting_a_terminating_entity_panics() {
    let mut world = world();
    world.subscribe_local_ref::<Health, EntityTerminating>(|world, entity, _, _| {
        world.delete_entity(entity);
    });
    let entity = spawn(&mut world);
    world.add_component(entity, Health::default()).unwrap();
    world.delete_entity(entity);
}

#[test]
fn panicking_teardown_still_frees_the_subtree() {
    let mut world = world();
    world.subscribe_local_ref::<Health, EntityTerminating>(|_, _, _, _| {
        panic!("handler failure");
    });

    let parent = spawn(&mut world);
    let child = spawn(&mut world);
    world.set_parent(child, Some(parent));
    world.add_component(child, Health::default()).unwrap();

    let result = catch_unwind(AssertUnwindSafe(|| world.delete_entity(parent)));
    assert!(result.is_err());
    assert!(!world.entity_exists(parent));
    assert!(!world.entity_exists(child));
    assert_eq!(world.entity_count(), 0);
}

#[test]
fn tolerant_world_logs_lifecycle_violations() {
    let mut world = tolerant_world();
    world.subscribe_local_ref::<Health, EntityTerminating>(|world, entity, _, _| {
        world.delete_entity(entity);
        panic!("handler failure");
    });

    let entity = spawn(&mut world);
    world.initialize_components(entity);
    world.add_component(entity, Health::default()).unwrap();
    world.delete_entity(entity);

    assert!(!world.entity_exists(entity));
}

// ---------------------------------------------------------------------------
// Component storage
// ---------------------------------------------------------------------------

#[test]
fn every_entity_has_transform_and_metadata() {
    let mut world = world();
    let entity = spawn(&mut world);
    assert!(world.has_component::<Transform>(entity));
    assert!(world.has_component::<orrery_ecs::MetaData>(entity));
    assert_eq!(world.get_components(entity).count(), 2);
    assert_eq!(world.metadata(entity).life_stage(), EntityLifeStage::Initialized);
}

#[test]
#[should_panic(expected = "Cannot overwrite mandatory component")]
fn overwriting_the_transform_panics() {
    let mut world = world();
    let entity = spawn(&mut world);
    let _ = world.add_component_with(entity, Transform::default(), true);
}

#[test]
#[should_panic(expected = "Cannot remove mandatory component")]
fn removing_the_transform_panics() {
    let mut world = world();
    let entity = spawn(&mut world);
    world.remove_component::<Transform>(entity);
}

#[test]
fn removed_components_are_invisible_until_culled() {
    let mut world = world();
    let entity = spawn(&mut world);
    world.add_component(entity, Health { current: 4.0 }).unwrap();

    assert!(world.remove_component::<Health>(entity));
    assert!(!world.has_component::<Health>(entity));
    assert!(matches!(
        world.get_component::<Health>(entity),
        Err(EcsError::ComponentDeleted { .. })
    ));

    world.tick();
    assert!(matches!(
        world.get_component::<Health>(entity),
        Err(EcsError::ComponentNotFound { .. })
    ));
    // The slot is free again
    world.add_component(entity, Health { current: 9.0 }).unwrap();
    assert_eq!(world.get_component::<Health>(entity).unwrap().current, 9.0);
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

#[test]
fn ordered_handlers_run_before_their_targets() {
    let mut world = world();
    let log = Log::default();

    let l = Rc::clone(&log);
    world.subscribe_local::<Renderer, Ping>(move |_, _, _, _| l.borrow_mut().push("renderer".into()));
    let l = Rc::clone(&log);
    world.subscribe_local_with::<Physics, Ping>(
        SubscriptionOrder::new().before::<Renderer>(),
        move |_, _, _, _| l.borrow_mut().push("physics".into()),
    );

    let entity = spawn(&mut world);
    world.add_component(entity, Renderer).unwrap();
    world.add_component(entity, Physics).unwrap();
    world.raise_local_event(entity, Ping, false);

    assert_eq!(*log.borrow(), vec!["physics", "renderer"]);
}

#[test]
fn local_dispatch_reaches_only_the_target_entity() {
    let mut world = world();
    let hits = Rc::new(RefCell::new(Vec::new()));
    let h = Rc::clone(&hits);
    world.subscribe_local::<Health, Ping>(move |_, entity, _, _| h.borrow_mut().push(entity));

    let a = spawn(&mut world);
    let b = spawn(&mut world);
    world.add_component(a, Health::default()).unwrap();
    world.add_component(b, Health::default()).unwrap();
    world.raise_local_event(b, Ping, false);

    assert_eq!(*hits.borrow(), vec![b]);
}

#[test]
fn by_ref_changes_are_visible_downstream_and_to_the_caller() {
    let mut world = world();
    world.subscribe_local_ref_with::<Physics, Damage>(
        SubscriptionOrder::new().before::<Health>(),
        |_, _, _, damage| damage.amount *= 2.0,
    );
    world.subscribe_local_ref::<Health, Damage>(|_, _, health, damage| {
        health.current -= damage.amount;
        damage.amount = 0.0;
    });
    let seen = Rc::new(RefCell::new(None));
    let s = Rc::clone(&seen);
    world.subscribe_broadcast_ref::<Damage>(move |_, damage| *s.borrow_mut() = Some(damage.amount));

    let entity = spawn(&mut world);
    world.add_component(entity, Health { current: 10.0 }).unwrap();
    world.add_component(entity, Physics).unwrap();

    let mut damage = Damage { amount: 3.0 };
    world.raise_local_event_ref(entity, &mut damage, true);

    assert_eq!(world.get_component::<Health>(entity).unwrap().current, 4.0);
    assert_eq!(damage.amount, 0.0);
    assert_eq!(*seen.borrow(), Some(0.0));
}

#[test]
#[should_panic(expected = "cannot be used with")]
fn by_value_subscription_to_by_ref_event_panics() {
    let mut world = world();
    world.subscribe_local::<Health, Damage>(|_, _, _, _| {});
}

#[test]
#[should_panic(expected = "cannot be used with")]
fn raising_by_ref_event_by_value_panics() {
    let mut world = world();
    let entity = spawn(&mut world);
    world.raise_local_event(entity, Damage { amount: 1.0 }, false);
}

#[test]
#[should_panic(expected = "Cannot subscribe after subscriptions have been locked")]
fn subscribing_after_lock_panics() {
    let mut world = world();
    world.lock_subscriptions();
    world.subscribe_broadcast::<Ping>(|_, _| {});
}

fn solid_world() -> World {
    let mut registry = registry();
    registry.register::<Collider>().reference::<Solid>();
    registry.register::<Wall>().reference::<Solid>();
    World::new(registry, EcsConfig::default())
}

#[test]
fn reference_subscriptions_reach_every_implementor() {
    let mut world = solid_world();
    let hits = Rc::new(RefCell::new(Vec::new()));
    let h = Rc::clone(&hits);
    world.subscribe_local_dyn::<Solid, Ping>(move |_, entity, component: &mut dyn AnyComponent, _| {
        h.borrow_mut().push((entity, component.component_name()))
    });

    let collider = spawn(&mut world);
    world.add_component(collider, Collider).unwrap();
    let wall = spawn(&mut world);
    world.add_component(wall, Wall).unwrap();
    let other = spawn(&mut world);
    world.add_component(other, Health::default()).unwrap();

    for entity in [collider, wall, other] {
        world.raise_local_event(entity, Ping, false);
    }
    assert!(world.has_component::<Solid>(wall));
    assert_eq!(*hits.borrow(), vec![(collider, "Collider"), (wall, "Wall")]);

    // Removal drops the edge
    world.remove_component::<Collider>(collider);
    world.raise_local_event(collider, Ping, false);
    assert_eq!(hits.borrow().len(), 2);
}

#[test]
fn typed_handlers_only_see_their_own_type_behind_a_shared_reference() {
    let mut registry = registry();
    registry.register::<Collider>().reference::<Physics>();
    let mut world = World::new(registry, EcsConfig::default());
    let hits = Rc::new(RefCell::new(Vec::new()));
    let h = Rc::clone(&hits);
    world.subscribe_local::<Physics, Ping>(move |_, entity, _, _| h.borrow_mut().push(entity));

    let collider = spawn(&mut world);
    world.add_component(collider, Collider).unwrap();
    let physics = spawn(&mut world);
    world.add_component(physics, Physics).unwrap();

    world.raise_local_event(collider, Ping, false);
    world.raise_local_event(physics, Ping, false);
    assert!(world.has_component::<Physics>(collider));
    assert_eq!(*hits.borrow(), vec![physics]);
}

#[test]
#[should_panic(expected = "only registered as a reference type")]
fn typed_subscription_to_a_reference_only_type_panics() {
    let mut registry = ComponentRegistry::new();
    registry.register::<Collider>().reference::<Velocity>();
    let mut world = World::new(registry, EcsConfig::default());
    world.subscribe_local::<Velocity, Ping>(|_, _, _, _| {});
}

#[test]
fn queued_events_wait_for_the_tick() {
    let mut world = world();
    let count = Rc::new(RefCell::new(0));
    let c = Rc::clone(&count);
    world.subscribe_broadcast::<Ping>(move |_, _| *c.borrow_mut() += 1);

    world.queue_event(Ping);
    world.queue_event(Ping);
    assert_eq!(*count.borrow(), 0);
    world.tick();
    assert_eq!(*count.borrow(), 2);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[test]
fn query_survives_deletion_requests_mid_iteration() {
    let mut world = world();
    for i in 0..10 {
        let entity = spawn(&mut world);
        world.add_component(entity, Health { current: i as f32 }).unwrap();
    }

    let mut query = world.query::<Read<Health>>();
    let mut visited = 0;
    while let Some((entity, health)) = query.next(&world) {
        drop(health);
        visited += 1;
        world.queue_delete_entity(entity);
    }
    assert_eq!(visited, 10);

    world.tick();
    assert_eq!(world.entity_count(), 0);
    query.restart();
    assert!(query.next(&world).is_none());
}

#[test]
fn query_writes_are_visible_to_later_reads() {
    let mut world = world();
    let entity = spawn(&mut world);
    world.add_component(entity, Health { current: 1.0 }).unwrap();
    world.add_component(entity, Velocity(Vec3::new(0.0, -1.0, 0.0))).unwrap();

    let mut query = world.query::<(Write<Health>, Read<Velocity>)>();
    for (_, (mut health, velocity)) in query.iter(&world) {
        health.current += velocity.0.y;
    }
    assert_eq!(world.get_component::<Health>(entity).unwrap().current, 0.0);
}

// ---------------------------------------------------------------------------
// Prototypes, commands and networking
// ---------------------------------------------------------------------------

#[test]
fn prototypes_resolve_registered_names() {
    let mut world = world();
    world
        .prototypes_mut()
        .load_ron_str(r#"[(id: "chest", name: "Chest", components: [(type: "Inventory", data: Some((slots: 12)))])]"#)
        .unwrap();

    let entity = world.spawn_entity(Some("chest")).unwrap();
    assert_eq!(
        *world.get_component::<InventoryComponent>(entity).unwrap(),
        InventoryComponent { slots: 12 }
    );
    assert_eq!(world.entity_name(entity).as_deref(), Some("Chest"));
}

#[test]
fn commands_from_another_thread_apply_on_tick() {
    let mut world = world();
    let target = spawn(&mut world);
    let commands = world.commands();

    std::thread::spawn(move || {
        commands.add_component(target, Health { current: 5.0 });
        commands.spawn_entity(None).with(Health { current: 1.0 }).build();
    })
    .join()
    .unwrap();

    assert!(!world.has_component::<Health>(target));
    world.tick();
    assert!(world.has_component::<Health>(target));
    assert_eq!(world.query::<Read<Health>>().count(&world), 2);
}

#[test]
fn network_state_requires_initialized_components() {
    let mut world = world();
    let entity = world.allocate_entity(None).unwrap();
    world.add_component(entity, Replicated { value: 3 }).unwrap();
    let index = world.registry().index_by_network_id(Replicated::NETWORK_ID).unwrap();

    assert!(matches!(
        world.get_component_state(entity, index, None),
        Err(EcsError::ComponentNotReady {
            stage: ComponentLifeStage::Added,
            ..
        })
    ));

    world.initialize_components(entity);
    assert_eq!(world.networked_components(entity), vec![(Replicated::NETWORK_ID, index)]);
    let state = world
        .get_component_state(entity, index, Some(SessionId(1)))
        .unwrap();
    assert!(state.is_none());

    world
        .handle_component_state(entity, index, &ComponentState::new(9u32))
        .unwrap();
    assert_eq!(world.get_component::<Replicated>(entity).unwrap().value, 3);
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

struct Regeneration;

impl EntitySystem for Regeneration {
    fn update(&mut self, world: &mut World, frame_time: f32) {
        let mut query = world.query::<Write<Health>>();
        while let Some((_, mut health)) = query.next(world) {
            health.current += frame_time;
        }
    }
}

#[test]
fn simulation_drives_systems_and_world() {
    let mut world = world();
    let entity = spawn(&mut world);
    world.add_component(entity, Health { current: 0.0 }).unwrap();

    let mut simulation = Simulation::new(world);
    simulation.add_system(Regeneration);
    simulation.startup();
    simulation.tick(0.5);
    simulation.tick(0.5);

    assert_eq!(simulation.world().current_tick(), 2);
    assert_eq!(
        simulation.world().get_component::<Health>(entity).unwrap().current,
        1.0
    );

    let world = simulation.into_world();
    assert_eq!(world.entity_count(), 0);
}
