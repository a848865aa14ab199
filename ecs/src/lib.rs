//! # Orrery ECS
//!
//! Entity-component runtime for the Orrery simulation engine.
//!
//! ## Core Types
//!
//! - [`Entity`]: Generational entity handle
//! - [`World`]: Owns entities, component storage and the event bus
//! - [`ComponentRegistry`]: Explicitly constructed component type registry
//! - [`Component`] / [`Event`]: Traits (and derives) for user types
//!
//! ## Lifecycle
//!
//! Entities move through [`EntityLifeStage`]: allocate, initialize, start,
//! map init, then terminate and delete. Deleting an entity deletes its whole
//! transform subtree, children first. Components follow
//! [`ComponentLifeStage`] and are initialized in safe order: the
//! [`Transform`] first, [`MetaData`] second, everything else after.
//!
//! ## Events
//!
//! - Directed events go to the subscribed components of one entity, then
//!   optionally to broadcast subscribers.
//! - [`SubscriptionOrder`] declares `before`/`after` constraints.
//! - By-reference events ([`DispatchShape::ByRef`]) let handlers mutate the
//!   payload for later handlers and for the caller.
//!
//! ## Systems
//!
//! - [`Query`]: Restartable cursor over entities with a set of components
//! - [`EntitySystem`] / [`SystemManager`]: Ordered per-tick systems
//! - [`Simulation`]: Owns the world and systems, drives the tick
//! - [`CommandBuffer`]: Thread-safe deferred mutations
//!
//! See `DESIGN.md` at the repository root for architecture decisions.

extern crate self as orrery_ecs;

mod bus;
mod commands;
pub mod component;
pub mod components;
mod config;
mod entity;
mod error;
pub mod event;
mod hierarchy;
mod lifecycle;
mod network;
mod ordering;
mod prototype;
mod query;
mod registry;
mod simulation;
mod sparse_set;
mod storage;
mod system;
mod world;

pub use bus::SubscriptionId;
pub use commands::{CommandBuffer, SpawnBuilder};
pub use component::{AnyComponent, Component, ComponentHandle, ComponentLifeStage, ComponentSlot};
pub use components::{MetaData, Transform};
pub use config::EcsConfig;
pub use entity::{Entity, EntityLifeStage};
pub use error::EcsError;
pub use event::{
    ComponentAdd, ComponentInit, ComponentRemove, ComponentShutdown, ComponentStartup,
    DispatchShape, EntityDeleted, EntityInitialized, EntityPausedEvent, EntityStarted,
    EntityTerminating, Event, MapInitEvent, SubscriptionOrder,
};
pub use hierarchy::{
    AnchorStateChangedEvent, Descendants, EntParentChangedMessage, MoveEvent, RotateEvent,
};
pub use network::{ComponentState, SessionId};
pub use orrery_ecs_macro::{Component, Event};
pub use prototype::{
    ComponentData, DefaultPrototypeLoader, EntityPrototype, PrototypeLoader, PrototypeManager,
};
pub use query::{Query, QueryIter, QueryParam, QueryTuple, Read, With, Without, Write};
pub use registry::{
    ComponentIndex, ComponentRegistration, ComponentRegistry, RegistrationBuilder,
    RegistrationKind,
};
pub use simulation::Simulation;
pub use sparse_set::SparseSet;
pub use system::{EntitySystem, SystemManager, SystemRef};
pub use world::World;
