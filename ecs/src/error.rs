use thiserror::Error;

use crate::component::ComponentLifeStage;
use crate::entity::Entity;

/// Recoverable failures reported by the runtime.
///
/// Contract violations (wrong dispatch shape, subscribing after lock,
/// overwriting a protected component, ...) are caller bugs and panic instead.
#[derive(Debug, Error)]
pub enum EcsError {
    #[error("entity {0} does not exist")]
    EntityNotFound(Entity),

    #[error("component `{component}` not found on {entity}")]
    ComponentNotFound {
        entity: Entity,
        component: &'static str,
    },

    /// The component exists but is shutting down or waiting to be culled.
    #[error("component `{component}` on {entity} has been deleted")]
    ComponentDeleted {
        entity: Entity,
        component: &'static str,
    },

    #[error("component type `{0}` has never been registered")]
    ComponentNotRegistered(&'static str),

    #[error("no component registered under the name `{0}`")]
    UnknownComponentName(String),

    #[error("component `{0}` has no blank factory")]
    MissingFactory(&'static str),

    #[error("component `{0}` cannot be deserialized from prototype data")]
    MissingDeserializer(&'static str),

    #[error("component `{0}` is mandatory and cannot come from a prototype")]
    ProtectedComponent(&'static str),

    #[error("prototype `{0}` not found")]
    PrototypeNotFound(String),

    #[error("failed to deserialize component `{component}`: {source}")]
    Deserialize {
        component: &'static str,
        #[source]
        source: ron::Error,
    },

    #[error("failed to parse RON: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("component `{component}` on {entity} is not ready for state sync (stage {stage:?})")]
    ComponentNotReady {
        entity: Entity,
        component: &'static str,
        stage: ComponentLifeStage,
    },

    #[error("state payload does not match component `{0}`")]
    InvalidState(&'static str),
}
