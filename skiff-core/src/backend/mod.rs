//! Build backend abstraction.
//!
//! skiff talks to a container engine through the `BuildBackend` trait:
//! - `EngineBackend`: Docker Engine HTTP API (streamed-archive builds)
//! - test doubles implement the trait directly
//!
//! Every streaming call returns a live [`ResponseBody`]. Dropping it closes the
//! underlying connection, so callers release it simply by letting it go out of
//! scope on every exit path.

pub mod engine;

pub use engine::EngineBackend;

use crate::builder::context::{ContextArchive, SyncedDir};
use crate::types::BuildSpec;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::AsyncRead;

/// A stream of JSON records returned by the backend.
pub type ResponseBody = Box<dyn AsyncRead + Send + Unpin>;

/// Which build engine generation the backend runs by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderVersion {
    /// Classic builder; reports digests through aux records or log text
    Legacy,
    /// Next-generation builder; reports progress through trace records
    BuildKit,
}

/// What a backend can do (for transport selection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub builder: BuilderVersion,
    /// Backend can pull context from registered sync directories
    pub fs_sync: bool,
}

impl BackendCapabilities {
    /// Whether filesystem-sync transport should be used for an attempt.
    pub fn use_fs_sync(&self, allow_modern: bool) -> bool {
        allow_modern && self.builder == BuilderVersion::BuildKit && self.fs_sync
    }
}

/// How the build context reaches the backend.
pub enum BuildContext {
    /// Tar stream produced concurrently with the request
    Archive(ContextArchive),
    /// Directories the backend pulls files from on demand
    Synced(Vec<SyncedDir>),
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildContext::Archive(_) => f.write_str("Archive"),
            BuildContext::Synced(dirs) => {
                f.debug_list().entries(dirs.iter().map(|d| d.name.as_str())).finish()
            }
        }
    }
}

/// A single image build request.
#[derive(Debug)]
pub struct BuildRequest {
    pub context: BuildContext,
    /// Dockerfile name within the context (or within the synced `dockerfile` dir)
    pub dockerfile: String,
    pub platform: Option<String>,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub target: Option<String>,
    pub pull: bool,
    pub cache_from: Vec<String>,
    pub network: Option<String>,
    /// Use the classic builder even if the backend prefers the next-generation one
    pub force_legacy: bool,
}

impl BuildRequest {
    /// Request options derived from a prepared spec.
    pub fn from_spec(
        spec: &BuildSpec,
        context: BuildContext,
        labels: BTreeMap<String, String>,
        force_legacy: bool,
    ) -> Self {
        Self {
            context,
            dockerfile: crate::builder::context::DOCKERFILE_NAME.to_string(),
            platform: spec.platform.clone(),
            build_args: spec.build_args.clone(),
            labels,
            target: spec.target.clone(),
            pull: spec.pull,
            cache_from: spec.cache_from.clone(),
            network: spec.network.clone(),
            force_legacy,
        }
    }
}

/// Result of inspecting an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInspect {
    /// Content ID, e.g. `sha256:...`
    pub id: String,
}

/// Errors raised by a backend implementation.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("No such image: {reference}")]
    NotFound { reference: String },

    #[error("Backend does not support {feature}")]
    Unsupported { feature: String },

    #[error("Cannot connect to build backend at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Backend API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid backend request: {reason}")]
    InvalidRequest { reason: String },
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

/// Container engine that can build, inspect, tag and push images.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Capabilities used to pick a context transport.
    async fn capabilities(&self) -> Result<BackendCapabilities, BackendError>;

    /// Start a build. The returned body streams JSON records until the build ends.
    async fn image_build(&self, request: BuildRequest) -> Result<ResponseBody, BackendError>;

    /// Look up an image by reference or short ID.
    async fn image_inspect(&self, reference: &str) -> Result<ImageInspect, BackendError>;

    /// Point `target` (name:tag) at the image identified by `source`.
    async fn image_tag(&self, source: &str, target: &str) -> Result<(), BackendError>;

    /// Push a tagged reference. The body must be drained to complete the push.
    async fn image_push(&self, reference: &str) -> Result<ResponseBody, BackendError>;

    /// Backend name (for logging/metrics).
    fn name(&self) -> &str;
}
