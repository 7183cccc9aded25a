//! Core domain types for skiff.

pub mod digest;
pub mod reference;
pub mod spec;
pub mod stage;

// Re-exports
pub use digest::Digest;
pub use reference::{ImageRef, RefSet, TaggedRefs};
pub use spec::{BuildSpec, Cluster, ImageDependency, Substitution};
pub use stage::{ProgressEvent, StageStatus};
