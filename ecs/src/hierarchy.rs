//! Transform hierarchy operations.
//!
//! All mutations keep both sides of a parent/child link consistent: the
//! child's [`Transform::parent`] and the parent's ordered children list.
//!
//! # Usage
//!
//! ```ignore
//! world.set_parent(child, Some(parent));
//! world.set_local_position(child, Vec3::new(1.0, 0.0, 0.0));
//! let position = world.world_position(child);
//!
//! for entity in world.descendants(parent) {
//!     // depth-first, parents before their children
//! }
//! ```

use std::cell::RefMut;

use orrery_core::math::{Pose, Quat, Vec3};

use crate::components::Transform;
use crate::entity::Entity;
use crate::event::{DispatchShape, Event};
use crate::world::World;

/// Raised when a transform's local position is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveEvent {
    pub entity: Entity,
    pub old_position: Vec3,
    pub new_position: Vec3,
}

/// Raised when a transform's local rotation is set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotateEvent {
    pub entity: Entity,
    pub old_rotation: Quat,
    pub new_rotation: Quat,
}

/// Raised after an entity moved to another parent (or to the root).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntParentChangedMessage {
    pub entity: Entity,
    pub old_parent: Option<Entity>,
    pub new_parent: Option<Entity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorStateChangedEvent {
    pub entity: Entity,
    pub anchored: bool,
}

impl Event for MoveEvent {
    const SHAPE: DispatchShape = DispatchShape::ByRef;
}

impl Event for RotateEvent {
    const SHAPE: DispatchShape = DispatchShape::ByRef;
}

impl Event for EntParentChangedMessage {}

impl Event for AnchorStateChangedEvent {
    const SHAPE: DispatchShape = DispatchShape::ByRef;
}

impl World {
    fn transform_mut(&self, entity: Entity) -> RefMut<'_, Transform> {
        self.get_component_mut::<Transform>(entity)
            .unwrap_or_else(|err| panic!("Cannot modify transform: {err}"))
    }

    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.try_get_component::<Transform>(entity)?.parent
    }

    /// Children of `entity` in attach order. Empty for missing entities.
    pub fn children(&self, entity: Entity) -> Vec<Entity> {
        self.try_children(entity)
    }

    pub(crate) fn try_children(&self, entity: Entity) -> Vec<Entity> {
        self.try_get_component::<Transform>(entity)
            .map(|transform| transform.children.clone())
            .unwrap_or_default()
    }

    /// Depth-first iterator over every descendant of `entity`, parents
    /// before their children.
    pub fn descendants(&self, entity: Entity) -> Descendants<'_> {
        let mut stack = self.children(entity);
        stack.reverse();
        Descendants { world: self, stack }
    }

    /// Whether `ancestor` appears on the parent chain of `entity`.
    pub fn is_ancestor_of(&self, ancestor: Entity, entity: Entity) -> bool {
        let mut current = self.parent(entity);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent(parent);
        }
        false
    }

    /// Moves `entity` under `parent`, or to the root for `None`, and raises
    /// [`EntParentChangedMessage`]. Anchored entities are unanchored before
    /// they are attached to a parent.
    ///
    /// # Panics
    ///
    /// Panics if either entity does not exist, if `parent` is `entity`
    /// itself, or if `parent` is one of its descendants.
    pub fn set_parent(&mut self, entity: Entity, parent: Option<Entity>) {
        assert!(
            self.entity_exists(entity),
            "Cannot reparent missing entity {entity}"
        );
        if let Some(parent) = parent {
            assert_ne!(entity, parent, "Cannot set entity as its own parent: {entity}");
            assert!(
                self.entity_exists(parent),
                "Cannot parent {entity} to missing entity {parent}"
            );
            assert!(
                !self.is_ancestor_of(entity, parent),
                "Cannot parent {entity} to its own descendant {parent}"
            );
        }

        let old_parent = self.parent(entity);
        if old_parent == parent {
            return;
        }
        if parent.is_some() && self.transform(entity).anchored() {
            self.set_anchored(entity, false);
        }

        if let Some(old) = old_parent
            && let Some(mut transform) = self.try_get_component_mut::<Transform>(old)
        {
            transform.children.retain(|&child| child != entity);
        }
        if let Some(new) = parent {
            let mut transform = self.transform_mut(new);
            if !transform.children.contains(&entity) {
                transform.children.push(entity);
            }
        }
        self.transform_mut(entity).parent = parent;
        self.dirty(entity);

        log::trace!("{entity} parent changed: {old_parent:?} -> {parent:?}");
        self.raise_local_event(
            entity,
            EntParentChangedMessage {
                entity,
                old_parent,
                new_parent: parent,
            },
            true,
        );
    }

    /// Breaks the link to the parent without raising anything.
    pub(crate) fn unlink_from_parent(&mut self, entity: Entity) {
        let Some(mut transform) = self.try_get_component_mut::<Transform>(entity) else {
            return;
        };
        let Some(parent) = transform.parent.take() else {
            return;
        };
        drop(transform);
        if let Some(mut transform) = self.try_get_component_mut::<Transform>(parent) {
            transform.children.retain(|&child| child != entity);
        }
    }

    /// Sets the local position and raises [`MoveEvent`].
    pub fn set_local_position(&mut self, entity: Entity, position: Vec3) {
        let old_position = std::mem::replace(&mut self.transform_mut(entity).local_position, position);
        self.dirty(entity);
        let mut event = MoveEvent {
            entity,
            old_position,
            new_position: position,
        };
        self.raise_local_event_ref(entity, &mut event, true);
    }

    /// Sets the local rotation and raises [`RotateEvent`].
    pub fn set_local_rotation(&mut self, entity: Entity, rotation: Quat) {
        let old_rotation = std::mem::replace(&mut self.transform_mut(entity).local_rotation, rotation);
        self.dirty(entity);
        let mut event = RotateEvent {
            entity,
            old_rotation,
            new_rotation: rotation,
        };
        self.raise_local_event_ref(entity, &mut event, true);
    }

    /// Anchors or unanchors a transform. Anchoring detaches the entity from
    /// its parent first.
    pub fn set_anchored(&mut self, entity: Entity, anchored: bool) {
        if self.transform(entity).anchored() == anchored {
            return;
        }
        if anchored && self.parent(entity).is_some() {
            self.set_parent(entity, None);
        }
        self.transform_mut(entity).anchored = anchored;
        self.dirty(entity);
        let mut event = AnchorStateChangedEvent { entity, anchored };
        self.raise_local_event_ref(entity, &mut event, true);
    }

    /// Pose of `entity` in world space, composed through the parent chain.
    pub fn world_pose(&self, entity: Entity) -> Pose {
        let transform = self.transform(entity);
        let mut pose = transform.local_pose();
        let mut current = transform.parent();
        drop(transform);
        while let Some(parent) = current {
            let transform = self.transform(parent);
            pose = transform.local_pose().compose(&pose);
            current = transform.parent();
        }
        pose
    }

    pub fn world_position(&self, entity: Entity) -> Vec3 {
        self.world_pose(entity).position
    }

    pub fn world_rotation(&self, entity: Entity) -> Quat {
        self.world_pose(entity).rotation
    }
}

/// Iterator returned by [`World::descendants`].
pub struct Descendants<'w> {
    world: &'w World,
    stack: Vec<Entity>,
}

impl Iterator for Descendants<'_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        let entity = self.stack.pop()?;
        let children = self.world.children(entity);
        self.stack.extend(children.into_iter().rev());
        Some(entity)
    }
}
