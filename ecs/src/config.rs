use serde::{Deserialize, Serialize};

use crate::error::EcsError;

/// Runtime configuration of a [`World`](crate::World).
///
/// Every field has a default, so a RON document only needs to list the
/// values it overrides:
///
/// ```
/// use orrery_ecs::EcsConfig;
///
/// let config = EcsConfig::from_ron_str("(exception_tolerant: true)").unwrap();
/// assert!(config.exception_tolerant);
/// assert_eq!(config.entity_capacity, 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsConfig {
    /// Downgrade lifecycle contract violations (double delete, double
    /// initialize, ...) and panics raised during teardown to logged errors.
    pub exception_tolerant: bool,
    /// Number of entity slots reserved up front.
    pub entity_capacity: usize,
    /// Whether new query cursors visit paused entities.
    pub include_paused_in_queries: bool,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            exception_tolerant: false,
            entity_capacity: 1024,
            include_paused_in_queries: false,
        }
    }
}

impl EcsConfig {
    /// Parses a configuration from RON text.
    pub fn from_ron_str(text: &str) -> Result<Self, EcsError> {
        Ok(ron::from_str(text)?)
    }

    /// Configuration with exception tolerance switched on.
    pub fn tolerant() -> Self {
        Self {
            exception_tolerant: true,
            ..Self::default()
        }
    }
}
