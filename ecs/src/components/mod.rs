mod metadata;
mod transform;

pub use metadata::MetaData;
pub use transform::Transform;
