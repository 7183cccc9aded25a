//! Image build pipeline.
//!
//! This module prepares build specs, transports the build context, decodes
//! the backend's output, recovers from known backend corruption, and derives
//! deterministic tags from content digests.

pub mod context;
pub mod decode;
pub mod image_builder;
pub mod prepare;
pub mod recovery;
pub mod sanitize;
pub mod tag;
pub mod trace;

pub use context::{EmptyFilter, PathFilter, PathSetFilter};
pub use decode::{BuildOutput, ProgressThrottle};
pub use image_builder::{BuildJob, BuiltImage, ImageBuilder, Invocation};
pub use prepare::prepare;
pub use recovery::{CorruptionSignatures, RecoveryPolicy};
pub use sanitize::sanitize;
pub use tag::{digest_matches_ref, tag_from_digest, TAG_PREFIX};
