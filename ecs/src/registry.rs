//! Component type registry.
//!
//! Maps component type identities to dense [`ComponentIndex`] values. The
//! storage and the event bus index their per-type tables by this integer, so
//! the hot paths never hash a `TypeId`.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::component::{Component, ComponentHandle, ComponentSlot};
use crate::entity::Entity;
use crate::error::EcsError;

/// Dense index assigned to a registered component or reference type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentIndex(u32);

impl ComponentIndex {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Builds a blank component for the given owner.
pub(crate) type FactoryFn = fn(Entity, ComponentIndex) -> ComponentHandle;

/// Builds a component for the given owner from prototype data.
pub(crate) type DeserializeFn =
    fn(Entity, ComponentIndex, ron::Value) -> Result<ComponentHandle, EcsError>;

/// Whether an index belongs to an instantiable component type or only to a
/// capability other components declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Component,
    Reference,
}

/// Everything the registry knows about one index.
pub struct ComponentRegistration {
    pub name: &'static str,
    pub type_id: TypeId,
    pub index: ComponentIndex,
    pub kind: RegistrationKind,
    /// Indices this type satisfies. Always ends with `index` itself.
    pub references: Vec<ComponentIndex>,
    pub network_id: Option<u16>,
    pub(crate) factory: Option<FactoryFn>,
    pub(crate) deserialize: Option<DeserializeFn>,
}

/// Registry changes, consumed by storage and the event bus to size their
/// per-type tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    ComponentAdded(ComponentIndex),
    ComponentReferenceAdded {
        component: ComponentIndex,
        reference: ComponentIndex,
    },
}

/// Maps component types to dense indices and capability metadata.
///
/// Built once at startup by the simulation root and handed to the
/// [`World`](crate::World) that owns storage and the event bus.
///
/// # Example
///
/// ```
/// use orrery_ecs::{Component, ComponentRegistry};
///
/// struct Collider;
/// impl Component for Collider {
///     const NAME: &'static str = "Collider";
/// }
/// struct Physical;
///
/// let mut registry = ComponentRegistry::new();
/// let index = registry.register::<Collider>().reference::<Physical>().index();
/// let physical = registry.index_of::<Physical>().unwrap();
/// assert_eq!(registry.reference_indices(index), &[physical, index]);
/// ```
pub struct ComponentRegistry {
    registrations: Vec<ComponentRegistration>,
    by_type: HashMap<TypeId, ComponentIndex>,
    by_name: HashMap<&'static str, ComponentIndex>,
    by_network_id: HashMap<u16, ComponentIndex>,
    pending: Vec<RegistryEvent>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            by_type: HashMap::new(),
            by_name: HashMap::new(),
            by_network_id: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Registers a component type and returns a builder for its metadata.
    ///
    /// # Panics
    ///
    /// Panics if `T` is already registered as a component, or if another
    /// type already uses the name `T::NAME`.
    pub fn register<T: Component>(&mut self) -> RegistrationBuilder<'_, T> {
        let type_id = TypeId::of::<T>();

        let index = match self.by_type.get(&type_id).copied() {
            Some(existing) => {
                let registration = &mut self.registrations[existing.index()];
                if registration.kind == RegistrationKind::Component {
                    panic!("Duplicate component registration: {} is already registered", T::NAME);
                }
                // Previously seen only as a capability; promote it.
                registration.kind = RegistrationKind::Component;
                registration.name = T::NAME;
                existing
            }
            None => self.push(T::NAME, type_id, RegistrationKind::Component),
        };

        if let Some(&other) = self.by_name.get(T::NAME)
            && other != index
        {
            panic!(
                "Component name `{}` is already used by {}",
                T::NAME,
                std::any::type_name::<T>()
            );
        }
        self.by_name.insert(T::NAME, index);

        log::debug!("Registered component `{}` at index {}", T::NAME, index.0);
        RegistrationBuilder {
            registry: self,
            index,
            _marker: PhantomData,
        }
    }

    fn push(&mut self, name: &'static str, type_id: TypeId, kind: RegistrationKind) -> ComponentIndex {
        let index = ComponentIndex(self.registrations.len() as u32);
        self.registrations.push(ComponentRegistration {
            name,
            type_id,
            index,
            kind,
            references: vec![index],
            network_id: None,
            factory: None,
            deserialize: None,
        });
        self.by_type.insert(type_id, index);
        self.pending.push(RegistryEvent::ComponentAdded(index));
        index
    }

    /// Returns the index of a reference type, registering it as a capability
    /// on first use.
    fn reference_index<R: 'static>(&mut self) -> ComponentIndex {
        let type_id = TypeId::of::<R>();
        match self.by_type.get(&type_id) {
            Some(&index) => index,
            None => self.push(std::any::type_name::<R>(), type_id, RegistrationKind::Reference),
        }
    }

    fn add_reference(&mut self, component: ComponentIndex, reference: ComponentIndex) {
        let references = &mut self.registrations[component.index()].references;
        if references.contains(&reference) {
            return;
        }
        // Own index stays last
        let own = references.len() - 1;
        references.insert(own, reference);
        self.pending.push(RegistryEvent::ComponentReferenceAdded {
            component,
            reference,
        });
    }

    pub fn index_of<T: 'static>(&self) -> Option<ComponentIndex> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn index_of_type_id(&self, type_id: TypeId) -> Option<ComponentIndex> {
        self.by_type.get(&type_id).copied()
    }

    pub fn index_by_name(&self, name: &str) -> Option<ComponentIndex> {
        self.by_name.get(name).copied()
    }

    pub fn index_by_network_id(&self, network_id: u16) -> Option<ComponentIndex> {
        self.by_network_id.get(&network_id).copied()
    }

    /// Indices `index` satisfies, its own index last.
    pub fn reference_indices(&self, index: ComponentIndex) -> &[ComponentIndex] {
        &self.registrations[index.index()].references
    }

    pub fn registration(&self, index: ComponentIndex) -> &ComponentRegistration {
        &self.registrations[index.index()]
    }

    pub fn name(&self, index: ComponentIndex) -> &'static str {
        self.registrations[index.index()].name
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentRegistration> {
        self.registrations.iter()
    }

    /// Creates a blank instance of a registered component.
    pub(crate) fn create_blank(
        &self,
        owner: Entity,
        index: ComponentIndex,
    ) -> Result<ComponentHandle, EcsError> {
        let registration = self.registration(index);
        let factory = registration
            .factory
            .ok_or(EcsError::MissingFactory(registration.name))?;
        Ok(factory(owner, index))
    }

    /// Creates an instance of a registered component from prototype data.
    pub(crate) fn deserialize(
        &self,
        owner: Entity,
        index: ComponentIndex,
        data: ron::Value,
    ) -> Result<ComponentHandle, EcsError> {
        let registration = self.registration(index);
        let deserialize = registration
            .deserialize
            .ok_or(EcsError::MissingDeserializer(registration.name))?;
        deserialize(owner, index, data)
    }

    /// Takes the notifications produced since the last call.
    pub(crate) fn drain_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`ComponentRegistry::register`] for attaching
/// reference types, a network id and construction hooks.
pub struct RegistrationBuilder<'a, T: Component> {
    registry: &'a mut ComponentRegistry,
    index: ComponentIndex,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Component> RegistrationBuilder<'_, T> {
    /// Declares that `T` also satisfies the capability `R`.
    ///
    /// `R` is any `'static` marker type; lookups through `R`'s index find
    /// the `T` instance.
    pub fn reference<R: 'static>(self) -> Self {
        let reference = self.registry.reference_index::<R>();
        self.registry.add_reference(self.index, reference);
        self
    }

    /// Assigns the identifier the network layer uses for this type.
    ///
    /// # Panics
    ///
    /// Panics if another type already uses `network_id`.
    pub fn network_id(self, network_id: u16) -> Self {
        if let Some(&other) = self.registry.by_network_id.get(&network_id)
            && other != self.index
        {
            panic!(
                "Network id {network_id} is already used by `{}`",
                self.registry.name(other)
            );
        }
        self.registry.by_network_id.insert(network_id, self.index);
        self.registry.registrations[self.index.index()].network_id = Some(network_id);
        self
    }

    pub fn index(&self) -> ComponentIndex {
        self.index
    }
}

impl<T: Component + Default> RegistrationBuilder<'_, T> {
    /// Allows blank instances to be created by name (prototypes without data).
    pub fn with_factory(self) -> Self {
        fn blank<T: Component + Default>(owner: Entity, index: ComponentIndex) -> ComponentHandle {
            ComponentSlot::new_handle(owner, index, T::default())
        }
        self.registry.registrations[self.index.index()].factory = Some(blank::<T>);
        self
    }
}

impl<T: Component + DeserializeOwned> RegistrationBuilder<'_, T> {
    /// Allows instances to be built from prototype data.
    pub fn with_deserializer(self) -> Self {
        fn load<T: Component + DeserializeOwned>(
            owner: Entity,
            index: ComponentIndex,
            data: ron::Value,
        ) -> Result<ComponentHandle, EcsError> {
            let value: T = data.into_rust().map_err(|source| EcsError::Deserialize {
                component: T::NAME,
                source,
            })?;
            Ok(ComponentSlot::new_handle(owner, index, value))
        }
        self.registry.registrations[self.index.index()].deserialize = Some(load::<T>);
        self
    }
}
