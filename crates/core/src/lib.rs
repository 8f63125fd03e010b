//! keel core types: resource descriptors, the typed/dynamic representation
//! abstraction and the error taxonomy shared by every other crate.

#![forbid(unsafe_code)]

pub mod columns;
mod descriptor;
mod dynamic;
mod error;
mod repr;

pub use descriptor::ResourceDescriptor;
pub use dynamic::{DynamicDoc, FieldPath, Segment};
pub use error::{Error, PathError, Result};
pub use repr::{Representation, Typed};

/// Delete propagation policy: how dependents (pods owned via the selector) are
/// cleaned up when their owner is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum Propagation {
    /// Owner stays visible (with a deletion timestamp) until dependents are gone.
    #[default]
    Foreground,
    /// Owner is removed immediately; dependents are garbage collected later.
    Background,
    /// Only the owner is removed.
    Orphan,
}

impl std::fmt::Display for Propagation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Propagation::Foreground => "Foreground",
            Propagation::Background => "Background",
            Propagation::Orphan => "Orphan",
        })
    }
}

pub mod prelude {
    pub use super::{DynamicDoc, Error, FieldPath, PathError, Propagation, Representation, ResourceDescriptor, Typed};
}
