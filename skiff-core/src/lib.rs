//! skiff core library
//!
//! Image build subsystem for the skiff development orchestrator: turns a
//! build spec into a tagged container image through a pluggable build
//! backend, streaming logs and stage progress to the caller.

pub mod backend;
pub mod builder;
pub mod config;
pub mod error;
pub mod observability;
pub mod paths;
pub mod sink;
pub mod types;

// Re-export commonly used items
pub use backend::{BuildBackend, EngineBackend};
pub use builder::{BuildJob, BuiltImage, ImageBuilder};
pub use config::Config;
pub use error::{BuildError, BuildFailure, Result};
pub use observability::init as init_observability;
pub use sink::{BuildSink, TracingSink};
pub use types::{BuildSpec, Cluster, Digest, ImageDependency, ImageRef, RefSet, TaggedRefs};
