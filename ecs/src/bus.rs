//! Directed event bus.
//!
//! Subscriptions are keyed by (component index, event type). For each
//! entity the bus caches which of its component indices subscribe to which
//! event, updated as components come and go, so a raise only touches the
//! handlers that matter for that entity.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::component::{AnyComponent, Component, ComponentHandle};
use crate::entity::Entity;
use crate::event::{DispatchShape, Event, SubscriptionOrder};
use crate::ordering::{OrderNode, topological_order};
use crate::registry::{ComponentIndex, RegistrationKind, RegistryEvent};
use crate::world::World;

pub(crate) type LocalHandler = Rc<dyn Fn(&mut World, Entity, &mut dyn AnyComponent, &mut dyn Any)>;
pub(crate) type BroadcastHandler = Rc<dyn Fn(&mut World, &mut dyn Any)>;

/// Identifies a broadcast subscription for [`World::unsubscribe_broadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct EventInfo {
    name: &'static str,
    /// Any subscription for this event declares before/after constraints.
    ordered: bool,
}

struct LocalSubscription {
    component_type: TypeId,
    label: &'static str,
    /// Receives every component stored under the index, not only the
    /// index's own concrete type.
    dynamic: bool,
    handler: LocalHandler,
    order: SubscriptionOrder,
    registered: u64,
    sequence: u32,
}

struct BroadcastSubscription {
    id: SubscriptionId,
    handler: BroadcastHandler,
    order: SubscriptionOrder,
    sequence: u32,
}

/// Per entity: event type → component indices subscribed on that entity.
type EntityEventTable = HashMap<TypeId, SmallVec<[ComponentIndex; 4]>>;

pub(crate) struct EventBus {
    locked: bool,
    events: HashMap<TypeId, EventInfo>,
    /// Local subscriptions per component index.
    local: Vec<HashMap<TypeId, LocalSubscription>>,
    /// Component indices with a local subscription, per event type.
    subscribers: HashMap<TypeId, Vec<ComponentIndex>>,
    broadcast: HashMap<TypeId, Vec<BroadcastSubscription>>,
    entity_tables: Vec<Option<EntityEventTable>>,
    next_registration: u64,
}

impl EventBus {
    pub fn new(entity_capacity: usize) -> Self {
        Self {
            locked: false,
            events: HashMap::new(),
            local: Vec::new(),
            subscribers: HashMap::new(),
            broadcast: HashMap::new(),
            entity_tables: Vec::with_capacity(entity_capacity + 1),
            next_registration: 0,
        }
    }

    pub fn on_registry_event(&mut self, event: RegistryEvent) {
        let highest = match event {
            RegistryEvent::ComponentAdded(index) => index,
            RegistryEvent::ComponentReferenceAdded {
                component,
                reference,
            } => component.max(reference),
        };
        if highest.index() >= self.local.len() {
            self.local.resize_with(highest.index() + 1, HashMap::new);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub(crate) fn assert_unlocked(&self, action: &str) {
        assert!(
            !self.locked,
            "Cannot {action} after subscriptions have been locked"
        );
    }

    fn next_registration(&mut self) -> u64 {
        self.next_registration += 1;
        self.next_registration
    }

    fn register_event<E: Event>(&mut self) {
        self.events.entry(TypeId::of::<E>()).or_insert(EventInfo {
            name: std::any::type_name::<E>(),
            ordered: false,
        });
    }

    // ---- Subscription registry ----

    /// Subscribes the concrete component type `C`, stored at `index`.
    pub fn add_local<C: Component, E: Event>(
        &mut self,
        index: ComponentIndex,
        order: SubscriptionOrder,
        handler: LocalHandler,
    ) {
        self.insert_local::<E>(index, TypeId::of::<C>(), C::NAME, false, order, handler);
    }

    /// Subscribes every component stored at the reference index of `R`.
    pub fn add_local_dyn<R: 'static, E: Event>(
        &mut self,
        index: ComponentIndex,
        order: SubscriptionOrder,
        handler: LocalHandler,
    ) {
        let label = std::any::type_name::<R>();
        self.insert_local::<E>(index, TypeId::of::<R>(), label, true, order, handler);
    }

    fn insert_local<E: Event>(
        &mut self,
        index: ComponentIndex,
        component_type: TypeId,
        label: &'static str,
        dynamic: bool,
        order: SubscriptionOrder,
        handler: LocalHandler,
    ) {
        self.assert_unlocked("subscribe");
        self.register_event::<E>();
        let event = TypeId::of::<E>();
        if index.index() >= self.local.len() {
            self.local.resize_with(index.index() + 1, HashMap::new);
        }
        if self.local[index.index()].contains_key(&event) {
            panic!(
                "Duplicate subscription: `{label}` already handles `{}`",
                std::any::type_name::<E>()
            );
        }

        let registered = self.next_registration();
        self.local[index.index()].insert(
            event,
            LocalSubscription {
                component_type,
                label,
                dynamic,
                handler,
                order,
                registered,
                sequence: 0,
            },
        );
        self.subscribers.entry(event).or_default().push(index);
        self.recompute_order(event);
        log::trace!("Subscribed `{label}` to `{}`", std::any::type_name::<E>());
    }


    pub fn remove_local(&mut self, index: ComponentIndex, event: TypeId) -> bool {
        self.assert_unlocked("unsubscribe");
        let removed = self
            .local
            .get_mut(index.index())
            .and_then(|subs| subs.remove(&event))
            .is_some();
        if removed {
            if let Some(indices) = self.subscribers.get_mut(&event) {
                indices.retain(|&i| i != index);
            }
            for table in self.entity_tables.iter_mut().flatten() {
                remove_edge(table, event, index);
            }
            self.recompute_order(event);
        }
        removed
    }

    pub fn add_broadcast<E: Event>(
        &mut self,
        order: SubscriptionOrder,
        handler: BroadcastHandler,
    ) -> SubscriptionId {
        self.assert_unlocked("subscribe");
        self.register_event::<E>();
        let event = TypeId::of::<E>();
        let id = SubscriptionId(self.next_registration());
        self.broadcast
            .entry(event)
            .or_default()
            .push(BroadcastSubscription {
                id,
                handler,
                order,
                sequence: 0,
            });
        self.recompute_order(event);
        id
    }

    pub fn remove_broadcast(&mut self, event: TypeId, id: SubscriptionId) -> bool {
        self.assert_unlocked("unsubscribe");
        let Some(subs) = self.broadcast.get_mut(&event) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        let removed = subs.len() != before;
        if removed {
            self.recompute_order(event);
        }
        removed
    }

    /// Rebuilds the handler sequence for one event type.
    ///
    /// # Panics
    ///
    /// Panics if the before/after constraints form a cycle.
    fn recompute_order(&mut self, event: TypeId) {
        let mut locals: Vec<(ComponentIndex, u64)> = self
            .subscribers
            .get(&event)
            .into_iter()
            .flatten()
            .filter_map(|&index| {
                let sub = self.local[index.index()].get(&event)?;
                Some((index, sub.registered))
            })
            .collect();
        locals.sort_by_key(|&(_, registered)| registered);

        let broadcasts = self.broadcast.get(&event).map_or(&[][..], Vec::as_slice);

        let mut nodes = Vec::with_capacity(locals.len() + broadcasts.len());
        let mut labels = Vec::with_capacity(nodes.capacity());
        for &(index, _) in &locals {
            let sub = &self.local[index.index()][&event];
            nodes.push(OrderNode {
                marker: Some(sub.order.owner.unwrap_or(sub.component_type)),
                before: &sub.order.before,
                after: &sub.order.after,
            });
            labels.push(sub.label.to_string());
        }
        for sub in broadcasts {
            let order = &sub.order;
            nodes.push(OrderNode {
                marker: order.owner,
                before: &order.before,
                after: &order.after,
            });
            labels.push(format!("broadcast#{}", sub.id.0));
        }
        let ordered = locals
            .iter()
            .any(|&(index, _)| self.local[index.index()][&event].order.has_constraints())
            || broadcasts.iter().any(|sub| sub.order.has_constraints());

        let sequence = match topological_order(&nodes) {
            Ok(sequence) => sequence,
            Err(cycle) => {
                let name = self.events.get(&event).map_or("<unknown>", |info| info.name);
                let members: Vec<&str> = cycle.members.iter().map(|&i| labels[i].as_str()).collect();
                panic!("Subscription ordering cycle detected for event `{name}`: {members:?}");
            }
        };
        drop(nodes);

        let local_count = locals.len();
        for (position, node) in sequence.into_iter().enumerate() {
            if node < local_count {
                let index = locals[node].0;
                if let Some(sub) = self.local[index.index()].get_mut(&event) {
                    sub.sequence = position as u32;
                }
            } else if let Some(sub) = self
                .broadcast
                .get_mut(&event)
                .and_then(|subs| subs.get_mut(node - local_count))
            {
                sub.sequence = position as u32;
            }
        }

        if let Some(info) = self.events.get_mut(&event) {
            info.ordered = ordered;
        }
    }

    // ---- Entity event tables ----

    pub fn entity_created(&mut self, entity_index: u32) {
        let idx = entity_index as usize;
        if idx >= self.entity_tables.len() {
            self.entity_tables.resize_with(idx + 1, || None);
        }
        self.entity_tables[idx] = Some(HashMap::new());
    }

    pub fn entity_deleted(&mut self, entity_index: u32) {
        if let Some(table) = self.entity_tables.get_mut(entity_index as usize) {
            *table = None;
        }
    }

    /// Adds edges for every event the component's own index handles, and
    /// for the dynamic subscriptions of its reference indices. `references`
    /// ends with the component's own index.
    pub fn component_added(&mut self, entity_index: u32, references: &[ComponentIndex]) {
        let Some(Some(table)) = self.entity_tables.get_mut(entity_index as usize) else {
            return;
        };
        let own = references.last().copied();
        for &reference in references {
            let Some(subs) = self.local.get(reference.index()) else {
                continue;
            };
            for (&event, sub) in subs {
                if sub.dynamic || Some(reference) == own {
                    add_edge(table, event, reference);
                }
            }
        }
    }

    pub fn component_removed(&mut self, entity_index: u32, references: &[ComponentIndex]) {
        let Some(Some(table)) = self.entity_tables.get_mut(entity_index as usize) else {
            return;
        };
        for &reference in references {
            let Some(subs) = self.local.get(reference.index()) else {
                continue;
            };
            for event in subs.keys() {
                remove_edge(table, *event, reference);
            }
        }
    }

    /// Adds a single edge; used when a subscription arrives after entities
    /// already carry the component.
    pub fn add_entity_edge(&mut self, entity_index: u32, event: TypeId, index: ComponentIndex) {
        if let Some(Some(table)) = self.entity_tables.get_mut(entity_index as usize) {
            add_edge(table, event, index);
        }
    }

    #[cfg(test)]
    fn entity_subscribers(&self, entity_index: u32, event: TypeId) -> Vec<ComponentIndex> {
        self.entity_tables
            .get(entity_index as usize)
            .and_then(Option::as_ref)
            .and_then(|table| table.get(&event))
            .map(|indices| indices.to_vec())
            .unwrap_or_default()
    }

    // ---- Dispatch lookups ----

    /// Handlers for `event` on one entity, in dispatch order.
    pub fn local_handlers(
        &self,
        entity_index: u32,
        event: TypeId,
    ) -> SmallVec<[(ComponentIndex, LocalHandler); 4]> {
        let mut handlers: SmallVec<[(u32, ComponentIndex, LocalHandler); 4]> = SmallVec::new();
        let Some(Some(table)) = self.entity_tables.get(entity_index as usize) else {
            return SmallVec::new();
        };
        let Some(indices) = table.get(&event) else {
            return SmallVec::new();
        };
        for &index in indices {
            if let Some(sub) = self.local[index.index()].get(&event) {
                handlers.push((sub.sequence, index, Rc::clone(&sub.handler)));
            }
        }
        if self.events.get(&event).is_some_and(|info| info.ordered) {
            handlers.sort_by_key(|&(sequence, _, _)| sequence);
        }
        handlers
            .into_iter()
            .map(|(_, index, handler)| (index, handler))
            .collect()
    }

    /// The handler a component's own type registered for `event`.
    pub fn component_handler(&self, index: ComponentIndex, event: TypeId) -> Option<LocalHandler> {
        self.local
            .get(index.index())?
            .get(&event)
            .map(|sub| Rc::clone(&sub.handler))
    }

    pub fn broadcast_handlers(&self, event: TypeId) -> SmallVec<[BroadcastHandler; 4]> {
        let Some(subs) = self.broadcast.get(&event) else {
            return SmallVec::new();
        };
        let mut handlers: SmallVec<[(u32, BroadcastHandler); 4]> = subs
            .iter()
            .map(|sub| (sub.sequence, Rc::clone(&sub.handler)))
            .collect();
        if self.events.get(&event).is_some_and(|info| info.ordered) {
            handlers.sort_by_key(|&(sequence, _)| sequence);
        }
        handlers.into_iter().map(|(_, handler)| handler).collect()
    }
}

fn add_edge(table: &mut EntityEventTable, event: TypeId, index: ComponentIndex) {
    let indices = table.entry(event).or_default();
    if !indices.contains(&index) {
        indices.push(index);
    }
}

fn remove_edge(table: &mut EntityEventTable, event: TypeId, index: ComponentIndex) {
    if let Some(indices) = table.get_mut(&event) {
        indices.retain(|i| *i != index);
        if indices.is_empty() {
            table.remove(&event);
        }
    }
}

fn expect_shape<E: Event>(expected: DispatchShape, api: &str) {
    assert!(
        E::SHAPE == expected,
        "Event `{}` is dispatched {:?} and cannot be used with `{api}`",
        std::any::type_name::<E>(),
        E::SHAPE
    );
}

// ---------------------------------------------------------------------------
// World API
// ---------------------------------------------------------------------------

impl World {
    /// Subscribes a handler for a by-value event raised on entities that own
    /// a `C`.
    ///
    /// # Panics
    ///
    /// Panics if `E` is a by-reference event, if `C` already handles `E`,
    /// if subscriptions are locked, or if `C` is not registered.
    pub fn subscribe_local<C, E>(&mut self, handler: impl Fn(&mut World, Entity, &mut C, &E) + 'static)
    where
        C: Component,
        E: Event,
    {
        self.subscribe_local_with(SubscriptionOrder::default(), handler);
    }

    /// [`subscribe_local`](Self::subscribe_local) with ordering constraints.
    pub fn subscribe_local_with<C, E>(
        &mut self,
        order: SubscriptionOrder,
        handler: impl Fn(&mut World, Entity, &mut C, &E) + 'static,
    ) where
        C: Component,
        E: Event,
    {
        expect_shape::<E>(DispatchShape::ByValue, "subscribe_local");
        let erased: LocalHandler = Rc::new(
            move |world: &mut World, entity: Entity, component: &mut dyn AnyComponent, event: &mut dyn Any| {
                let received = component.component_name();
                let (Some(component), Some(event)) = (
                    component.as_any_mut().downcast_mut::<C>(),
                    event.downcast_ref::<E>(),
                ) else {
                    log::error!("Handler of `{}` for `{}` received `{received}`", C::NAME, std::any::type_name::<E>());
                    return;
                };
                handler(world, entity, component, event);
            },
        );
        self.add_local_subscription::<C, E>(order, erased);
    }

    /// Subscribes a handler for a by-reference event raised on entities
    /// that own a `C`.
    ///
    /// # Panics
    ///
    /// Panics if `E` is a by-value event, if `C` already handles `E`, if
    /// subscriptions are locked, or if `C` is not registered.
    pub fn subscribe_local_ref<C, E>(
        &mut self,
        handler: impl Fn(&mut World, Entity, &mut C, &mut E) + 'static,
    ) where
        C: Component,
        E: Event,
    {
        self.subscribe_local_ref_with(SubscriptionOrder::default(), handler);
    }

    /// [`subscribe_local_ref`](Self::subscribe_local_ref) with ordering constraints.
    pub fn subscribe_local_ref_with<C, E>(
        &mut self,
        order: SubscriptionOrder,
        handler: impl Fn(&mut World, Entity, &mut C, &mut E) + 'static,
    ) where
        C: Component,
        E: Event,
    {
        expect_shape::<E>(DispatchShape::ByRef, "subscribe_local_ref");
        let erased: LocalHandler = Rc::new(
            move |world: &mut World, entity: Entity, component: &mut dyn AnyComponent, event: &mut dyn Any| {
                let received = component.component_name();
                let (Some(component), Some(event)) = (
                    component.as_any_mut().downcast_mut::<C>(),
                    event.downcast_mut::<E>(),
                ) else {
                    log::error!("Handler of `{}` for `{}` received `{received}`", C::NAME, std::any::type_name::<E>());
                    return;
                };
                handler(world, entity, component, event);
            },
        );
        self.add_local_subscription::<C, E>(order, erased);
    }

    /// Subscribes a handler for a by-value event raised on entities that own
    /// any component satisfying the reference type `R` (or `R` itself). The
    /// handler receives the concrete component type-erased.
    ///
    /// # Panics
    ///
    /// Panics if `E` is a by-reference event, if `R` already handles `E`,
    /// if subscriptions are locked, or if `R` is not registered.
    pub fn subscribe_local_dyn<R, E>(
        &mut self,
        handler: impl Fn(&mut World, Entity, &mut dyn AnyComponent, &E) + 'static,
    ) where
        R: 'static,
        E: Event,
    {
        self.subscribe_local_dyn_with::<R, E>(SubscriptionOrder::default(), handler);
    }

    /// [`subscribe_local_dyn`](Self::subscribe_local_dyn) with ordering constraints.
    pub fn subscribe_local_dyn_with<R, E>(
        &mut self,
        order: SubscriptionOrder,
        handler: impl Fn(&mut World, Entity, &mut dyn AnyComponent, &E) + 'static,
    ) where
        R: 'static,
        E: Event,
    {
        expect_shape::<E>(DispatchShape::ByValue, "subscribe_local_dyn");
        let erased: LocalHandler = Rc::new(
            move |world: &mut World, entity: Entity, component: &mut dyn AnyComponent, event: &mut dyn Any| {
                if let Some(event) = event.downcast_ref::<E>() {
                    handler(world, entity, component, event);
                }
            },
        );
        self.add_dyn_subscription::<R, E>(order, erased);
    }

    /// By-reference counterpart of [`subscribe_local_dyn`](Self::subscribe_local_dyn).
    pub fn subscribe_local_dyn_ref<R, E>(
        &mut self,
        handler: impl Fn(&mut World, Entity, &mut dyn AnyComponent, &mut E) + 'static,
    ) where
        R: 'static,
        E: Event,
    {
        expect_shape::<E>(DispatchShape::ByRef, "subscribe_local_dyn_ref");
        let erased: LocalHandler = Rc::new(
            move |world: &mut World, entity: Entity, component: &mut dyn AnyComponent, event: &mut dyn Any| {
                if let Some(event) = event.downcast_mut::<E>() {
                    handler(world, entity, component, event);
                }
            },
        );
        self.add_dyn_subscription::<R, E>(SubscriptionOrder::default(), erased);
    }

    fn add_local_subscription<C: Component, E: Event>(
        &mut self,
        order: SubscriptionOrder,
        handler: LocalHandler,
    ) {
        self.sync_registry();
        let index = self
            .registry()
            .index_of::<C>()
            .unwrap_or_else(|| panic!("Cannot subscribe unregistered component `{}`", C::NAME));
        assert!(
            self.registry().registration(index).kind == RegistrationKind::Component,
            "`{}` is only registered as a reference type; subscribe with `subscribe_local_dyn`",
            C::NAME
        );
        self.bus.add_local::<C, E>(index, order, handler);
        self.add_existing_edges(index, TypeId::of::<E>(), false);
    }

    fn add_dyn_subscription<R: 'static, E: Event>(&mut self, order: SubscriptionOrder, handler: LocalHandler) {
        self.sync_registry();
        let index = self.registry().index_of::<R>().unwrap_or_else(|| {
            panic!(
                "Cannot subscribe unregistered reference type `{}`",
                std::any::type_name::<R>()
            )
        });
        self.bus.add_local_dyn::<R, E>(index, order, handler);
        self.add_existing_edges(index, TypeId::of::<E>(), true);
    }

    /// Entities created before a subscription need the new edge too.
    fn add_existing_edges(&mut self, index: ComponentIndex, event: TypeId, dynamic: bool) {
        let owners: Vec<u32> = self
            .storage
            .table(index)
            .map(|table| {
                table
                    .iter()
                    .filter(|(_, slot)| !slot.is_removed() && (dynamic || slot.index() == index))
                    .map(|(entity_index, _)| entity_index)
                    .collect()
            })
            .unwrap_or_default();
        for entity_index in owners {
            self.bus.add_entity_edge(entity_index, event, index);
        }
    }

    /// Removes the handler `C` (a component or reference type) registered
    /// for `E`. Returns `false` if there was none.
    ///
    /// # Panics
    ///
    /// Panics if subscriptions are locked.
    pub fn unsubscribe_local<C: 'static, E: Event>(&mut self) -> bool {
        self.bus.assert_unlocked("unsubscribe");
        let Some(index) = self.registry().index_of::<C>() else {
            return false;
        };
        self.bus.remove_local(index, TypeId::of::<E>())
    }

    /// Subscribes a handler for every raise of a by-value event that is
    /// broadcast.
    pub fn subscribe_broadcast<E: Event>(
        &mut self,
        handler: impl Fn(&mut World, &E) + 'static,
    ) -> SubscriptionId {
        self.subscribe_broadcast_with(SubscriptionOrder::default(), handler)
    }

    /// [`subscribe_broadcast`](Self::subscribe_broadcast) with ordering constraints.
    pub fn subscribe_broadcast_with<E: Event>(
        &mut self,
        order: SubscriptionOrder,
        handler: impl Fn(&mut World, &E) + 'static,
    ) -> SubscriptionId {
        expect_shape::<E>(DispatchShape::ByValue, "subscribe_broadcast");
        let erased: BroadcastHandler = Rc::new(move |world: &mut World, event: &mut dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(world, event);
            }
        });
        self.bus.add_broadcast::<E>(order, erased)
    }

    /// Subscribes a handler for every broadcast of a by-reference event.
    pub fn subscribe_broadcast_ref<E: Event>(
        &mut self,
        handler: impl Fn(&mut World, &mut E) + 'static,
    ) -> SubscriptionId {
        self.subscribe_broadcast_ref_with(SubscriptionOrder::default(), handler)
    }

    /// [`subscribe_broadcast_ref`](Self::subscribe_broadcast_ref) with ordering constraints.
    pub fn subscribe_broadcast_ref_with<E: Event>(
        &mut self,
        order: SubscriptionOrder,
        handler: impl Fn(&mut World, &mut E) + 'static,
    ) -> SubscriptionId {
        expect_shape::<E>(DispatchShape::ByRef, "subscribe_broadcast_ref");
        let erased: BroadcastHandler = Rc::new(move |world: &mut World, event: &mut dyn Any| {
            if let Some(event) = event.downcast_mut::<E>() {
                handler(world, event);
            }
        });
        self.bus.add_broadcast::<E>(order, erased)
    }

    /// Removes a broadcast subscription. Returns `false` if it was not found.
    pub fn unsubscribe_broadcast<E: Event>(&mut self, id: SubscriptionId) -> bool {
        self.bus.remove_broadcast(TypeId::of::<E>(), id)
    }

    /// Freezes the subscription registry. Later subscribe/unsubscribe calls
    /// panic.
    pub fn lock_subscriptions(&mut self) {
        self.bus.lock();
        log::debug!("Event subscriptions locked");
    }

    pub fn subscriptions_locked(&self) -> bool {
        self.bus.is_locked()
    }

    /// Raises a by-value event on `entity`, then on broadcast subscribers
    /// when `broadcast` is set.
    pub fn raise_local_event<E: Event>(&mut self, entity: Entity, mut event: E, broadcast: bool) {
        expect_shape::<E>(DispatchShape::ByValue, "raise_local_event");
        self.dispatch_local(entity, &mut event, broadcast);
    }

    /// Raises a by-reference event on `entity`. Handlers see each other's
    /// changes, and so does the caller afterwards.
    pub fn raise_local_event_ref<E: Event>(&mut self, entity: Entity, event: &mut E, broadcast: bool) {
        expect_shape::<E>(DispatchShape::ByRef, "raise_local_event_ref");
        self.dispatch_local(entity, event, broadcast);
    }

    pub fn raise_broadcast_event<E: Event>(&mut self, mut event: E) {
        expect_shape::<E>(DispatchShape::ByValue, "raise_broadcast_event");
        self.dispatch_broadcast(&mut event);
    }

    pub fn raise_broadcast_event_ref<E: Event>(&mut self, event: &mut E) {
        expect_shape::<E>(DispatchShape::ByRef, "raise_broadcast_event_ref");
        self.dispatch_broadcast(event);
    }

    /// Defers a broadcast until the event queue is drained by
    /// [`tick`](Self::tick).
    pub fn queue_event<E: Event>(&mut self, event: E) {
        self.event_queue.push_back(Box::new(move |world: &mut World| {
            let mut event = event;
            world.dispatch_broadcast(&mut event);
        }));
    }

    /// Runs every queued broadcast. Events queued by those handlers wait for
    /// the next drain.
    pub fn process_event_queue(&mut self) {
        let queued = std::mem::take(&mut self.event_queue);
        if !queued.is_empty() {
            log::trace!("Draining {} queued events", queued.len());
        }
        for raise in queued {
            raise(self);
        }
    }

    fn dispatch_local<E: Event>(&mut self, entity: Entity, event: &mut E, broadcast: bool) {
        if self.entity_exists(entity) {
            let handlers = self.bus.local_handlers(entity.index(), TypeId::of::<E>());
            for (index, handler) in handlers {
                let Some(slot) = self.storage.get_live(entity.index(), index).cloned() else {
                    continue;
                };
                self.invoke_local(&slot, &handler, &mut *event);
            }
        } else {
            log::trace!(
                "Skipping local dispatch of `{}` to missing {entity}",
                std::any::type_name::<E>()
            );
        }

        if broadcast {
            self.dispatch_broadcast(event);
        }
    }

    fn dispatch_broadcast<E: Event>(&mut self, event: &mut E) {
        for handler in self.bus.broadcast_handlers(TypeId::of::<E>()) {
            handler(self, &mut *event);
        }
    }

    /// Raises a lifecycle event on one component only.
    pub(crate) fn raise_component_event<E: Event>(&mut self, slot: &ComponentHandle, mut event: E) {
        if let Some(handler) = self.bus.component_handler(slot.index(), TypeId::of::<E>()) {
            self.invoke_local(slot, &handler, &mut event);
        }
    }

    fn invoke_local(&mut self, slot: &ComponentHandle, handler: &LocalHandler, event: &mut dyn Any) {
        let Ok(mut data) = slot.data.try_borrow_mut() else {
            log::warn!(
                "Skipping re-entrant dispatch to `{}` on {}: component is already borrowed",
                self.registry().name(slot.index()),
                slot.owner()
            );
            return;
        };
        handler(self, slot.owner(), &mut *data, event);
    }
}
