use serde::{Deserialize, Serialize};

use crate::entity::EntityLifeStage;

/// Mandatory per-entity bookkeeping.
///
/// `name` and `description` are free-form labels. The life stage and paused
/// flag mirror the values the world tracks for the entity and are updated
/// by the world only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, crate::Component)]
pub struct MetaData {
    pub name: String,
    pub description: String,
    /// Id of the prototype the entity was created from.
    pub prototype: Option<String>,
    /// Tick of the last [`World::dirty`](crate::World::dirty) call.
    pub last_modified_tick: u64,
    pub(crate) life_stage: EntityLifeStage,
    pub(crate) paused: bool,
}

impl Default for MetaData {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            prototype: None,
            last_modified_tick: 0,
            life_stage: EntityLifeStage::PreInit,
            paused: false,
        }
    }
}

impl MetaData {
    pub fn life_stage(&self) -> EntityLifeStage {
        self.life_stage
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// The name, or `fallback` when it is empty.
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.name.is_empty() {
            fallback
        } else {
            &self.name
        }
    }
}
