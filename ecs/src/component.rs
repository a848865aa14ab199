//! Component traits and per-instance bookkeeping.
//!
//! The [`Component`] trait is what user types implement (usually through
//! `#[derive(Component)]`). Storage works with the object-safe
//! [`AnyComponent`] view, which every `Component` gets for free, wrapped in a
//! reference-counted [`ComponentSlot`] that also carries the owner, the
//! registered index and the instance life stage.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::EcsError;
use crate::network::{ComponentState, SessionId};
use crate::registry::ComponentIndex;

/// Trait for ECS components.
///
/// # Deriving
///
/// ```ignore
/// #[derive(Default, Component)]
/// struct Health {
///     current: f32,
///     max: f32,
/// }
/// ```
///
/// # Manual implementation
///
/// Networked components override the state hooks:
///
/// ```ignore
/// impl Component for Health {
///     const NAME: &'static str = "Health";
///
///     fn get_state(&self, _recipient: Option<SessionId>) -> Option<ComponentState> {
///         Some(ComponentState::new(self.current))
///     }
///
///     fn handle_state(&mut self, state: &ComponentState) -> Result<(), EcsError> {
///         self.current = *state.downcast_ref::<f32>().ok_or(EcsError::InvalidState(Self::NAME))?;
///         Ok(())
///     }
/// }
/// ```
pub trait Component: 'static {
    /// Registered name of the type (e.g. `"Transform"`). Prototypes refer to
    /// components by this name.
    const NAME: &'static str;

    /// Builds a state snapshot for `recipient` (`None` means every session).
    ///
    /// Only called once the component has reached
    /// [`ComponentLifeStage::Initialized`].
    fn get_state(&self, _recipient: Option<SessionId>) -> Option<ComponentState> {
        None
    }

    /// Applies a snapshot produced by [`get_state`](Self::get_state).
    fn handle_state(&mut self, _state: &ComponentState) -> Result<(), EcsError> {
        Ok(())
    }
}

/// Object-safe view of a [`Component`], implemented for every component type.
pub trait AnyComponent: Any {
    fn component_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn get_state_dyn(&self, recipient: Option<SessionId>) -> Option<ComponentState>;
    fn handle_state_dyn(&mut self, state: &ComponentState) -> Result<(), EcsError>;
}

impl<T: Component> AnyComponent for T {
    fn component_name(&self) -> &'static str {
        T::NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn get_state_dyn(&self, recipient: Option<SessionId>) -> Option<ComponentState> {
        self.get_state(recipient)
    }

    fn handle_state_dyn(&mut self, state: &ComponentState) -> Result<(), EcsError> {
        self.handle_state(state)
    }
}

/// Lifecycle stage of a single component instance. Strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ComponentLifeStage {
    PreAdd,
    Added,
    Initializing,
    Initialized,
    Running,
    Removing,
    Deleted,
}

/// A component instance together with its storage bookkeeping.
///
/// The same slot is shared by every per-type table the component occupies
/// (its own type plus each reference type), so marking it removed is
/// immediately visible through all of them.
pub struct ComponentSlot<T: ?Sized> {
    owner: Entity,
    index: ComponentIndex,
    stage: Cell<ComponentLifeStage>,
    pub(crate) data: RefCell<T>,
}

/// Shared handle to a type-erased component slot.
pub type ComponentHandle = Rc<ComponentSlot<dyn AnyComponent>>;

impl<T: Component> ComponentSlot<T> {
    pub(crate) fn new_handle(owner: Entity, index: ComponentIndex, value: T) -> ComponentHandle {
        Rc::new(ComponentSlot {
            owner,
            index,
            stage: Cell::new(ComponentLifeStage::PreAdd),
            data: RefCell::new(value),
        })
    }
}

impl<T: ?Sized> ComponentSlot<T> {
    /// The entity this component is attached to.
    pub fn owner(&self) -> Entity {
        self.owner
    }

    /// Registered index of the component's concrete type.
    pub fn index(&self) -> ComponentIndex {
        self.index
    }

    pub fn stage(&self) -> ComponentLifeStage {
        self.stage.get()
    }

    /// `true` once the component is shutting down or gone. Removed
    /// components are invisible to lookups, queries and dispatch.
    pub fn is_removed(&self) -> bool {
        self.stage.get() >= ComponentLifeStage::Removing
    }

    /// Borrows the component data.
    ///
    /// # Panics
    ///
    /// Panics if the data is currently mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, T> {
        self.data.borrow()
    }

    /// Mutably borrows the component data.
    ///
    /// # Panics
    ///
    /// Panics if the data is currently borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.data.borrow_mut()
    }

    /// # Panics
    ///
    /// Panics if `stage` does not come after the current stage.
    pub(crate) fn advance(&self, stage: ComponentLifeStage) {
        let current = self.stage.get();
        assert!(
            stage > current,
            "Component on {} cannot go from {current:?} to {stage:?}",
            self.owner
        );
        self.stage.set(stage);
    }

    /// Marks the slot deleted without the monotonic check. Used when a
    /// failed teardown is force-completed.
    pub(crate) fn force_deleted(&self) {
        self.stage.set(ComponentLifeStage::Deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker(u32);

    impl Component for Marker {
        const NAME: &'static str = "Marker";
    }

    #[test]
    fn slot_starts_pre_add() {
        let slot = ComponentSlot::new_handle(Entity::FIRST, ComponentIndex::new(3), Marker(1));
        assert_eq!(slot.stage(), ComponentLifeStage::PreAdd);
        assert_eq!(slot.owner(), Entity::FIRST);
        assert_eq!(slot.index(), ComponentIndex::new(3));
        assert!(!slot.is_removed());
    }

    #[test]
    fn stages_advance_and_flag_removal() {
        let slot = ComponentSlot::new_handle(Entity::FIRST, ComponentIndex::new(0), Marker(1));
        slot.advance(ComponentLifeStage::Added);
        slot.advance(ComponentLifeStage::Running);
        slot.advance(ComponentLifeStage::Removing);
        assert!(slot.is_removed());
    }

    #[test]
    #[should_panic(expected = "cannot go from")]
    fn stage_regression_panics() {
        let slot = ComponentSlot::new_handle(Entity::FIRST, ComponentIndex::new(0), Marker(1));
        slot.advance(ComponentLifeStage::Running);
        slot.advance(ComponentLifeStage::Added);
    }

    #[test]
    fn erased_access_downcasts() {
        let slot = ComponentSlot::new_handle(Entity::FIRST, ComponentIndex::new(0), Marker(7));
        let data = slot.data.borrow();
        assert_eq!(data.component_name(), "Marker");
        assert_eq!(data.as_any().downcast_ref::<Marker>().map(|m| m.0), Some(7));
    }
}
