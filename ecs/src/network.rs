//! Hooks the network layer uses to snapshot and apply component state.
//!
//! Transport is out of scope; this module only moves opaque payloads in and
//! out of live components.

use std::any::Any;

use crate::component::ComponentLifeStage;
use crate::entity::Entity;
use crate::error::EcsError;
use crate::registry::ComponentIndex;
use crate::world::World;

/// Identifies a remote peer that state is being prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

/// Opaque component state snapshot.
pub struct ComponentState(Box<dyn Any + Send>);

impl ComponentState {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn into_inner<T: Any>(self) -> Result<T, Self> {
        self.0.downcast().map(|value| *value).map_err(Self)
    }
}

impl std::fmt::Debug for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ComponentState(..)")
    }
}

impl World {
    /// Snapshots one component for `recipient`.
    ///
    /// Returns `Ok(None)` for components that do not publish state.
    pub fn get_component_state(
        &self,
        entity: Entity,
        index: ComponentIndex,
        recipient: Option<SessionId>,
    ) -> Result<Option<ComponentState>, EcsError> {
        let slot = self.component_slot(entity, index)?;
        self.ensure_ready(entity, index, slot.stage())?;
        let data = slot.data.borrow();
        Ok(data.get_state_dyn(recipient))
    }

    /// Applies a snapshot to one component.
    pub fn handle_component_state(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        state: &ComponentState,
    ) -> Result<(), EcsError> {
        let slot = self.component_slot(entity, index)?.clone();
        self.ensure_ready(entity, index, slot.stage())?;
        let result = slot.data.borrow_mut().handle_state_dyn(state);
        if result.is_ok() {
            self.dirty(entity);
        }
        result
    }

    /// Live components of `entity` whose type has a network id, in attach
    /// order, paired with that id.
    pub fn networked_components(&self, entity: Entity) -> Vec<(u16, ComponentIndex)> {
        if !self.entity_exists(entity) {
            return Vec::new();
        }
        self.storage
            .owned(entity.index())
            .iter()
            .filter(|slot| !slot.is_removed())
            .filter_map(|slot| {
                let network_id = self.registry().registration(slot.index()).network_id?;
                Some((network_id, slot.index()))
            })
            .collect()
    }

    fn ensure_ready(
        &self,
        entity: Entity,
        index: ComponentIndex,
        stage: ComponentLifeStage,
    ) -> Result<(), EcsError> {
        if stage < ComponentLifeStage::Initialized {
            return Err(EcsError::ComponentNotReady {
                entity,
                component: self.registry().name(index),
                stage,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_downcasts_to_original_type() {
        let state = ComponentState::new(42u32);
        assert_eq!(state.downcast_ref::<u32>(), Some(&42));
        assert!(state.downcast_ref::<i64>().is_none());
        assert_eq!(state.into_inner::<u32>().ok(), Some(42));
    }
}
