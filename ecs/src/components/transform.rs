//! Mandatory spatial component.
//!
//! The hierarchy fields are private: parenting, anchoring and local pose
//! changes go through [`World`](crate::World) so that both sides of a
//! parent/child link stay consistent and the matching events are raised.

use orrery_core::math::{Pose, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// Local pose relative to the parent (or the world root) plus the links of
/// the transform hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, crate::Component)]
pub struct Transform {
    pub(crate) local_position: Vec3,
    pub(crate) local_rotation: Quat,
    pub(crate) parent: Option<Entity>,
    /// Children in attach order.
    pub(crate) children: Vec<Entity>,
    /// Anchored transforms are fixed to the world grid.
    pub(crate) anchored: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            local_position: Vec3::zeros(),
            local_rotation: Quat::identity(),
            parent: None,
            children: Vec::new(),
            anchored: false,
        }
    }
}

impl Transform {
    pub fn local_position(&self) -> Vec3 {
        self.local_position
    }

    pub fn local_rotation(&self) -> Quat {
        self.local_rotation
    }

    pub fn local_pose(&self) -> Pose {
        Pose::new(self.local_position, self.local_rotation)
    }

    pub fn parent(&self) -> Option<Entity> {
        self.parent
    }

    pub fn children(&self) -> &[Entity] {
        &self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn anchored(&self) -> bool {
        self.anchored
    }
}
