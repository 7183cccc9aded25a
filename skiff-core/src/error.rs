//! Error types for skiff.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use crate::backend::BackendError;
use crate::types::StageStatus;
use thiserror::Error;

/// Result type alias for skiff operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Hint surfaced when the backend produced no usable build result.
pub const UNRESPONSIVE_HINT: &str =
    "Build backend is not responding. Maybe it is out of disk space? Try pruning unused images";

/// Main error type for the image build subsystem.
#[derive(Error, Debug)]
pub enum BuildError {
    // Preparation errors
    #[error("Missing image dependency: {name}")]
    UnresolvedDependency { name: String },

    #[error("Preparing build context: {reason}")]
    ContextPrepFailed { reason: String },

    // Backend request errors
    #[error("ImageBuild: {reason}")]
    BackendInvokeFailed { reason: String },

    #[error("Decoding build output: {reason}")]
    Decode { reason: String },

    /// Error text reported by the backend, already sanitized.
    #[error("{0}")]
    BackendReported(String),

    // Digest resolution errors
    #[error("Build output did not contain an image ID")]
    DigestNotFound,

    #[error("{}", UNRESPONSIVE_HINT)]
    BackendUnresponsive,

    #[error("Digest too short: {digest}")]
    DigestTooShort { digest: String },

    // Reference errors
    #[error("Invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Pushing image {reference:?}: {reason}")]
    PushFailed { reference: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Short machine-friendly name used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::UnresolvedDependency { .. } => "unresolved_dependency",
            BuildError::ContextPrepFailed { .. } => "context_prep_failed",
            BuildError::BackendInvokeFailed { .. } => "backend_invoke_failed",
            BuildError::Decode { .. } => "decode",
            BuildError::BackendReported(_) => "backend_reported",
            BuildError::DigestNotFound => "digest_not_found",
            BuildError::BackendUnresponsive => "backend_unresponsive",
            BuildError::DigestTooShort { .. } => "digest_too_short",
            BuildError::InvalidReference { .. } => "invalid_reference",
            BuildError::PushFailed { .. } => "push_failed",
            BuildError::InvalidConfig { .. } => "invalid_config",
            BuildError::Cancelled => "cancelled",
            BuildError::Backend(_) => "backend",
            BuildError::Io(_) => "io",
            BuildError::Other(_) => "other",
        }
    }
}

/// A failed build attempt together with the stages observed before it failed.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct BuildFailure {
    #[source]
    pub error: BuildError,
    pub stages: Vec<StageStatus>,
}

impl BuildFailure {
    pub fn new(error: BuildError, stages: Vec<StageStatus>) -> Self {
        Self { error, stages }
    }

    /// A failure that happened before any stage was reported.
    pub fn before_stages(error: BuildError) -> Self {
        Self { error, stages: Vec::new() }
    }
}

impl From<BuildError> for BuildFailure {
    fn from(error: BuildError) -> Self {
        Self::before_stages(error)
    }
}
