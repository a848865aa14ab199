//! Event types and the built-in lifecycle events.

use std::any::TypeId;

use crate::entity::Entity;

/// How handlers receive an event. Fixed per event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchShape {
    /// Handlers get `&E`; nothing one handler does is visible to the next.
    ByValue,
    /// Handlers get `&mut E`; changes carry over to later handlers and back
    /// to the raiser.
    ByRef,
}

/// Trait for anything that can be raised on the event bus.
///
/// Use `#[derive(Event)]`, adding `#[event(by_ref)]` for by-reference events.
pub trait Event: 'static {
    const SHAPE: DispatchShape = DispatchShape::ByValue;
}

/// Ordering constraints for a subscription.
///
/// Every subscription is identified by a marker type: the component type
/// for local subscriptions unless [`owner`](Self::owner) overrides it. Other
/// subscriptions to the same event then name that marker in
/// [`before`](Self::before) / [`after`](Self::after).
///
/// ```ignore
/// world.subscribe_local_with::<Physics, MoveEvent>(
///     SubscriptionOrder::new().before::<Renderer>(),
///     |world, entity, physics, event| { /* ... */ },
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOrder {
    pub(crate) owner: Option<TypeId>,
    pub(crate) before: Vec<TypeId>,
    pub(crate) after: Vec<TypeId>,
}

impl SubscriptionOrder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifies the subscription by `T` instead of the default marker.
    pub fn owner<T: 'static>(mut self) -> Self {
        self.owner = Some(TypeId::of::<T>());
        self
    }

    /// Runs before every subscription identified by `T`.
    pub fn before<T: 'static>(mut self) -> Self {
        self.before.push(TypeId::of::<T>());
        self
    }

    /// Runs after every subscription identified by `T`.
    pub fn after<T: 'static>(mut self) -> Self {
        self.after.push(TypeId::of::<T>());
        self
    }

    pub(crate) fn has_constraints(&self) -> bool {
        !self.before.is_empty() || !self.after.is_empty()
    }
}

// ---- Component lifecycle events (raised on the component's own type only) ----

/// Raised right after a component is attached.
#[derive(Debug, Clone, Copy)]
pub struct ComponentAdd;

/// Raised when a component initializes.
#[derive(Debug, Clone, Copy)]
pub struct ComponentInit;

/// Raised when a component starts running.
#[derive(Debug, Clone, Copy)]
pub struct ComponentStartup;

/// Raised when a running component is shut down, before it is culled.
#[derive(Debug, Clone, Copy)]
pub struct ComponentShutdown;

/// Raised just before a component leaves storage.
#[derive(Debug, Clone, Copy)]
pub struct ComponentRemove;

impl Event for ComponentAdd {}
impl Event for ComponentInit {}
impl Event for ComponentStartup {}
impl Event for ComponentShutdown {}
impl Event for ComponentRemove {}

// ---- Entity lifecycle events ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityInitialized {
    pub entity: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityStarted {
    pub entity: Entity,
}

/// Raised once per entity when the world it lives in has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInitEvent;

/// Raised on every entity of a deletion cascade while the hierarchy is
/// still intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityTerminating {
    pub entity: Entity,
}

/// Broadcast after an entity's components are gone, before its handle is
/// freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDeleted {
    pub entity: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityPausedEvent {
    pub entity: Entity,
    pub paused: bool,
}

impl Event for EntityInitialized {}
impl Event for EntityStarted {}
impl Event for MapInitEvent {}
impl Event for EntityDeleted {}
impl Event for EntityPausedEvent {}

impl Event for EntityTerminating {
    const SHAPE: DispatchShape = DispatchShape::ByRef;
}
