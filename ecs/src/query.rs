//! Restartable query cursors over entities that carry a set of components.
//!
//! ```ignore
//! let mut query = world.query::<(Read<Position>, Write<Velocity>)>();
//! while let Some((entity, (position, mut velocity))) = query.next(&world) {
//!     velocity.y -= position.y * 0.1;
//! }
//!
//! // The same cursor can run again next tick
//! query.restart();
//! ```
//!
//! A cursor is a position in the smallest participating table, not a
//! snapshot. Stepping it never holds a borrow of the world between calls, so
//! code may take `&mut World` in between for
//! [`remove_component`](crate::World::remove_component) or
//! [`queue_delete_entity`](crate::World::queue_delete_entity). Both only
//! hide components while the tables stay put until the next cull. Adding
//! or immediately removing components of a type that is being iterated
//! while the cursor is live is not supported.
//!
//! An entity whose component is borrowed elsewhere (for instance by the
//! event handler running the query) is skipped for that step.

use std::any::TypeId;
use std::cell::{Ref, RefMut};
use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::component::{Component, ComponentHandle};
use crate::entity::Entity;
use crate::registry::ComponentIndex;
use crate::world::World;

/// Shared access to a `T` in a query.
pub struct Read<T: Component>(PhantomData<T>);

/// Exclusive access to a `T` in a query.
pub struct Write<T: Component>(PhantomData<T>);

/// Requires a live `T` (component or reference type) without borrowing it.
pub struct With<T: 'static>(PhantomData<T>);

/// Excludes entities that have a live `T`.
pub struct Without<T: 'static>(PhantomData<T>);

/// One element of a query tuple.
pub trait QueryParam {
    type Item<'w>;

    /// `false` for exclusion filters.
    const REQUIRED: bool = true;

    fn type_id() -> TypeId;

    /// Produces the item from the slot the entity has for this parameter's
    /// type, or `None` to skip the entity.
    fn fetch_slot<'w>(slot: Option<&'w ComponentHandle>) -> Option<Self::Item<'w>>;
}

impl<T: Component> QueryParam for Read<T> {
    type Item<'w> = Ref<'w, T>;

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn fetch_slot<'w>(slot: Option<&'w ComponentHandle>) -> Option<Ref<'w, T>> {
        let slot = slot?;
        let Ok(data) = slot.data.try_borrow() else {
            log::trace!("Query skips {}: {} is mutably borrowed", slot.owner(), T::NAME);
            return None;
        };
        Ref::filter_map(data, |data| data.as_any().downcast_ref::<T>()).ok()
    }
}

impl<T: Component> QueryParam for Write<T> {
    type Item<'w> = RefMut<'w, T>;

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn fetch_slot<'w>(slot: Option<&'w ComponentHandle>) -> Option<RefMut<'w, T>> {
        let slot = slot?;
        let Ok(data) = slot.data.try_borrow_mut() else {
            log::trace!("Query skips {}: {} is already borrowed", slot.owner(), T::NAME);
            return None;
        };
        RefMut::filter_map(data, |data| data.as_any_mut().downcast_mut::<T>()).ok()
    }
}

impl<T: 'static> QueryParam for With<T> {
    type Item<'w> = ();

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn fetch_slot<'w>(slot: Option<&'w ComponentHandle>) -> Option<()> {
        slot.map(|_| ())
    }
}

impl<T: 'static> QueryParam for Without<T> {
    type Item<'w> = ();
    const REQUIRED: bool = false;

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn fetch_slot<'w>(slot: Option<&'w ComponentHandle>) -> Option<()> {
        match slot {
            Some(_) => None,
            None => Some(()),
        }
    }
}

/// A query shape: a single [`Read`]/[`Write`] or a tuple of up to four
/// [`QueryParam`]s.
pub trait QueryTuple {
    type Item<'w>;

    fn params() -> SmallVec<[(TypeId, bool); 4]>;

    fn fetch<'w>(slots: &[Option<&'w ComponentHandle>]) -> Option<Self::Item<'w>>;
}

macro_rules! impl_single_query {
    ($($param:ident),*) => {
        $(
            impl<T: Component> QueryTuple for $param<T> {
                type Item<'w> = <$param<T> as QueryParam>::Item<'w>;

                fn params() -> SmallVec<[(TypeId, bool); 4]> {
                    smallvec::smallvec![(TypeId::of::<T>(), true)]
                }

                fn fetch<'w>(slots: &[Option<&'w ComponentHandle>]) -> Option<Self::Item<'w>> {
                    <$param<T> as QueryParam>::fetch_slot(*slots.first()?)
                }
            }
        )*
    };
}

impl_single_query!(Read, Write);

macro_rules! impl_query_tuple {
    ($($name:ident),+) => {
        impl<$($name: QueryParam),+> QueryTuple for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);

            fn params() -> SmallVec<[(TypeId, bool); 4]> {
                smallvec::smallvec![$(($name::type_id(), $name::REQUIRED)),+]
            }

            fn fetch<'w>(slots: &[Option<&'w ComponentHandle>]) -> Option<Self::Item<'w>> {
                let mut slots = slots.iter().copied();
                Some(($($name::fetch_slot(slots.next()?)?,)+))
            }
        }
    };
}

impl_query_tuple!(A);
impl_query_tuple!(A, B);
impl_query_tuple!(A, B, C);
impl_query_tuple!(A, B, C, D);

/// A restartable cursor over the entities matching `Q`.
///
/// Created with [`World::query`]. Removed components are never visited, nor
/// are paused entities unless [`include_paused`](Self::include_paused) is
/// set (the default comes from
/// [`EcsConfig::include_paused_in_queries`](crate::EcsConfig)).
pub struct Query<Q: QueryTuple> {
    /// Resolved index per parameter (`None` when the type was never
    /// registered) and whether it is required.
    params: SmallVec<[(Option<ComponentIndex>, bool); 4]>,
    driver: Option<ComponentIndex>,
    position: usize,
    include_paused: bool,
    _marker: PhantomData<fn() -> Q>,
}

impl<Q: QueryTuple> Query<Q> {
    fn new(world: &World) -> Self {
        let params = Q::params()
            .into_iter()
            .map(|(type_id, required)| (world.registry().index_of_type_id(type_id), required))
            .collect();
        Self {
            params,
            driver: None,
            position: 0,
            include_paused: world.config().include_paused_in_queries,
            _marker: PhantomData,
        }
    }

    /// Whether paused entities are visited.
    pub fn include_paused(mut self, include: bool) -> Self {
        self.include_paused = include;
        self
    }

    /// Rewinds the cursor to the first entity.
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// The required table with the fewest entries, or `None` if a required
    /// type is unregistered.
    fn pick_driver(&self, world: &World) -> Option<ComponentIndex> {
        let mut best: Option<(ComponentIndex, usize)> = None;
        for &(index, required) in &self.params {
            if !required {
                continue;
            }
            let index = index?;
            let len = world.storage.table_len(index);
            if best.is_none_or(|(_, best_len)| len < best_len) {
                best = Some((index, len));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Advances to the next matching entity.
    pub fn next<'w>(&mut self, world: &'w World) -> Option<(Entity, Q::Item<'w>)> {
        if self.position == 0 {
            self.driver = self.pick_driver(world);
        }
        let table = world.storage.table(self.driver?)?;
        while let Some((entity_index, _)) = table.get_dense(self.position) {
            self.position += 1;
            if let Some(item) = self.fetch(world, entity_index) {
                return Some(item);
            }
        }
        None
    }

    fn fetch<'w>(&self, world: &'w World, entity_index: u32) -> Option<(Entity, Q::Item<'w>)> {
        let entity = world.entities.entity_at_index(entity_index)?;
        if !self.include_paused && world.is_paused(entity) {
            return None;
        }
        let mut slots: SmallVec<[Option<&'w ComponentHandle>; 4]> = SmallVec::new();
        for &(index, required) in &self.params {
            let slot = index.and_then(|index| world.storage.get_live(entity_index, index));
            if required && slot.is_none() {
                return None;
            }
            slots.push(slot);
        }
        Some((entity, Q::fetch(&slots)?))
    }

    /// Borrowing iterator over the remaining matches.
    pub fn iter<'q, 'w>(&'q mut self, world: &'w World) -> QueryIter<'q, 'w, Q> {
        QueryIter { query: self, world }
    }

    /// Number of matching entities. Rewinds the cursor.
    pub fn count(&mut self, world: &World) -> usize {
        self.restart();
        let mut count = 0;
        while self.next(world).is_some() {
            count += 1;
        }
        self.restart();
        count
    }
}

/// Iterator adapter returned by [`Query::iter`].
pub struct QueryIter<'q, 'w, Q: QueryTuple> {
    query: &'q mut Query<Q>,
    world: &'w World,
}

impl<'w, Q: QueryTuple> Iterator for QueryIter<'_, 'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        self.query.next(self.world)
    }
}

impl World {
    /// Creates a cursor over the entities that have every required
    /// component of `Q`.
    pub fn query<Q: QueryTuple>(&self) -> Query<Q> {
        Query::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EcsConfig;
    use crate::registry::ComponentRegistry;

    #[derive(Debug, PartialEq)]
    struct Position(i32);
    impl Component for Position {
        const NAME: &'static str = "Position";
    }

    #[derive(Debug, PartialEq)]
    struct Velocity(i32);
    impl Component for Velocity {
        const NAME: &'static str = "Velocity";
    }

    struct Frozen;
    impl Component for Frozen {
        const NAME: &'static str = "Frozen";
    }

    struct NeverRegistered;
    impl Component for NeverRegistered {
        const NAME: &'static str = "NeverRegistered";
    }

    fn world() -> World {
        let mut registry = ComponentRegistry::new();
        registry.register::<Position>();
        registry.register::<Velocity>();
        registry.register::<Frozen>();
        World::new(registry, EcsConfig::default())
    }

    fn spawn(world: &mut World, position: i32, velocity: Option<i32>) -> Entity {
        let entity = world.spawn_entity(None).unwrap();
        world.add_component(entity, Position(position)).unwrap();
        if let Some(velocity) = velocity {
            world.add_component(entity, Velocity(velocity)).unwrap();
        }
        entity
    }

    #[test]
    fn single_component_query() {
        let mut world = world();
        spawn(&mut world, 1, None);
        spawn(&mut world, 2, Some(5));

        let mut query = world.query::<Read<Position>>();
        let mut values: Vec<_> = query.iter(&world).map(|(_, p)| p.0).collect();
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn tuple_query_intersects() {
        let mut world = world();
        spawn(&mut world, 1, None);
        let both = spawn(&mut world, 2, Some(5));

        let mut query = world.query::<(Read<Position>, Write<Velocity>)>();
        let mut seen = Vec::new();
        while let Some((entity, (position, mut velocity))) = query.next(&world) {
            velocity.0 += position.0;
            seen.push(entity);
        }
        assert_eq!(seen, vec![both]);
        assert_eq!(world.get_component::<Velocity>(both).unwrap().0, 7);
    }

    #[test]
    fn restart_yields_same_set() {
        let mut world = world();
        for i in 0..5 {
            spawn(&mut world, i, Some(i));
        }
        let mut query = world.query::<(Read<Position>, Read<Velocity>)>();
        let first: Vec<_> = query.iter(&world).map(|(e, _)| e).collect();
        assert!(query.next(&world).is_none());
        query.restart();
        let second: Vec<_> = query.iter(&world).map(|(e, _)| e).collect();
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
    }

    #[test]
    fn removed_components_are_skipped_mid_iteration() {
        let mut world = world();
        let a = spawn(&mut world, 1, None);
        let b = spawn(&mut world, 2, None);

        let mut query = world.query::<Read<Position>>();
        let (first, _) = query.next(&world).unwrap();
        let other = if first == a { b } else { a };
        world.remove_component::<Position>(other);
        assert!(query.next(&world).is_none());
        assert_eq!(query.count(&world), 1);
    }

    #[test]
    fn overwrite_mid_iteration_visits_every_entity_once() {
        let mut world = world();
        let entities: Vec<_> = (0..4).map(|i| spawn(&mut world, i, None)).collect();

        let mut query = world.query::<Read<Position>>();
        let (first, _) = query.next(&world).unwrap();
        world.add_component_with(first, Position(99), true).unwrap();

        let mut visited = vec![first];
        while let Some((entity, _)) = query.next(&world) {
            visited.push(entity);
        }
        visited.sort();
        let mut expected = entities.clone();
        expected.sort();
        assert_eq!(visited, expected);

        world.cull_removed_components();
        assert_eq!(world.query::<Read<Position>>().count(&world), 4);
        assert_eq!(world.get_component::<Position>(first).unwrap().0, 99);
    }

    #[test]
    fn handler_can_query_its_own_component_type() {
        use crate::event::Event;
        use std::cell::RefCell;
        use std::rc::Rc;

        struct Scan;
        impl Event for Scan {}

        let mut world = world();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        world.subscribe_local::<Position, Scan>(move |world, _, _, _| {
            let read = world.query::<Read<Position>>().count(world);
            let write = world.query::<Write<Position>>().count(world);
            s.borrow_mut().push((read, write));
        });
        let target = spawn(&mut world, 1, None);
        spawn(&mut world, 2, None);

        world.raise_local_event(target, Scan, false);
        // The handler's own component is borrowed and skipped
        assert_eq!(*seen.borrow(), vec![(1, 1)]);
    }

    #[test]
    fn paused_entities_are_skipped_by_default() {
        let mut world = world();
        let paused = spawn(&mut world, 1, None);
        spawn(&mut world, 2, None);
        world.set_paused(paused, true);

        assert_eq!(world.query::<Read<Position>>().count(&world), 1);
        assert_eq!(
            world.query::<Read<Position>>().include_paused(true).count(&world),
            2
        );
    }

    #[test]
    fn filters_apply() {
        let mut world = world();
        let frozen = spawn(&mut world, 1, None);
        spawn(&mut world, 2, None);
        world.add_component(frozen, Frozen).unwrap();

        assert_eq!(world.query::<(Read<Position>, With<Frozen>)>().count(&world), 1);
        assert_eq!(world.query::<(Read<Position>, Without<Frozen>)>().count(&world), 1);
    }

    #[test]
    fn unregistered_type_matches_nothing() {
        let mut world = world();
        spawn(&mut world, 1, None);
        assert_eq!(world.query::<(Read<Position>, Read<NeverRegistered>)>().count(&world), 0);
        assert_eq!(world.query::<(Read<Position>, Without<NeverRegistered>)>().count(&world), 1);
    }
}
