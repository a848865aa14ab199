//! Entity prototypes: named component lists loaded from RON.
//!
//! ```ron
//! [
//!     (
//!         id: "crate",
//!         name: "Wooden crate",
//!         components: [
//!             (type: "Health", data: Some((current: 20.0, max: 20.0))),
//!             (type: "Pushable"),
//!         ],
//!     ),
//! ]
//! ```
//!
//! A component entry without data is built with the registered blank
//! factory; one with data goes through the registered deserializer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::EcsError;
use crate::world::World;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPrototype {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub components: Vec<ComponentData>,
}

/// One component entry of a prototype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentData {
    /// Registered component name.
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub data: Option<ron::Value>,
}

/// Prototypes by id.
#[derive(Debug, Default)]
pub struct PrototypeManager {
    prototypes: HashMap<String, EntityPrototype>,
}

impl PrototypeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prototype, replacing any previous one with the same id.
    pub fn insert(&mut self, prototype: EntityPrototype) {
        if let Some(previous) = self.prototypes.insert(prototype.id.clone(), prototype) {
            log::warn!("Prototype `{}` was replaced", previous.id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&EntityPrototype> {
        self.prototypes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.prototypes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityPrototype> {
        self.prototypes.values()
    }

    /// Parses a RON list of prototypes and adds them all. Returns how many
    /// were loaded.
    pub fn load_ron_str(&mut self, text: &str) -> Result<usize, EcsError> {
        let prototypes: Vec<EntityPrototype> = ron::from_str(text)?;
        let count = prototypes.len();
        for prototype in prototypes {
            self.insert(prototype);
        }
        log::debug!("Loaded {count} prototypes");
        Ok(count)
    }
}

/// Turns a prototype's component list into components on a freshly
/// allocated entity.
///
/// The entity already carries its transform and metadata when this runs.
pub trait PrototypeLoader {
    fn load_components(
        &self,
        world: &mut World,
        entity: Entity,
        prototype: &EntityPrototype,
    ) -> Result<(), EcsError>;
}

/// Builds each entry through the component registry.
pub struct DefaultPrototypeLoader;

impl PrototypeLoader for DefaultPrototypeLoader {
    fn load_components(
        &self,
        world: &mut World,
        entity: Entity,
        prototype: &EntityPrototype,
    ) -> Result<(), EcsError> {
        for component in &prototype.components {
            world.add_component_by_name(entity, &component.type_name, component.data.clone())?;
        }
        Ok(())
    }
}

impl World {
    /// Attaches a component identified by its registered name, built from
    /// `data` or, without data, from the blank factory.
    ///
    /// The transform and metadata cannot be added this way.
    pub fn add_component_by_name(
        &mut self,
        entity: Entity,
        name: &str,
        data: Option<ron::Value>,
    ) -> Result<(), EcsError> {
        let index = self
            .registry()
            .index_by_name(name)
            .ok_or_else(|| EcsError::UnknownComponentName(name.to_string()))?;
        if self.storage.is_protected(index) {
            return Err(EcsError::ProtectedComponent(self.registry().name(index)));
        }
        let slot = match data {
            Some(data) => self.registry().deserialize(entity, index, data)?,
            None => self.registry().create_blank(entity, index)?,
        };
        self.attach(slot, false);
        Ok(())
    }
}
