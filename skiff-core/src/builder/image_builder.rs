//! Image build orchestration.
//!
//! [`ImageBuilder`] ties the pipeline together:
//!
//! ```text
//! prepare ──► invoke (context streams concurrently) ──► decode ──► resolve digest ──► tag
//!                 ▲                                        │
//!                 └──── one legacy retry on corruption ◄───┘
//! ```

use crate::backend::{BackendCapabilities, BuildBackend, BuildContext, BuildRequest, ResponseBody};
use crate::builder::context::{
    to_synced_dirs, write_temp_dockerfile, ContextArchive, EmptyFilter, PathFilter,
};
use crate::builder::decode::{decode_output, resolve_build_output, BuildOutput};
use crate::builder::prepare::prepare;
use crate::builder::recovery::{CorruptionSignatures, RecoveryPolicy};
use crate::builder::sanitize::sanitize;
use crate::builder::tag::{tag_from_digest, tagged_refs};
use crate::error::{BuildError, BuildFailure, Result};
use crate::observability::metrics;
use crate::sink::BuildSink;
use crate::types::{
    BuildSpec, Cluster, Digest, ImageDependency, ImageRef, RefSet, StageStatus, TaggedRefs,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// One image to build, with everything the build depends on.
#[derive(Clone)]
pub struct BuildJob {
    pub spec: BuildSpec,
    pub refs: RefSet,
    pub cluster: Option<Cluster>,
    /// Dependency images by name, as referenced by `spec.image_deps`
    pub dependencies: HashMap<String, ImageDependency>,
    pub filter: Arc<dyn PathFilter>,
}

impl BuildJob {
    pub fn new(spec: BuildSpec, refs: RefSet) -> Self {
        Self {
            spec,
            refs,
            cluster: None,
            dependencies: HashMap::new(),
            filter: Arc::new(EmptyFilter),
        }
    }

    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_dependencies(mut self, dependencies: HashMap<String, ImageDependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn PathFilter>) -> Self {
        self.filter = filter;
        self
    }
}

/// A successfully built and tagged image.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub digest: Digest,
    pub refs: TaggedRefs,
    /// Stages of the final attempt only
    pub stages: Vec<StageStatus>,
}

/// A live build request.
///
/// Holds the materialized Dockerfile directory (sync transport) for as long
/// as the backend may still read from it.
pub struct Invocation {
    pub body: ResponseBody,
    dockerfile_dir: Option<TempDir>,
}

impl Invocation {
    /// Directory the Dockerfile was materialized in, if any.
    pub fn dockerfile_dir(&self) -> Option<&std::path::Path> {
        self.dockerfile_dir.as_ref().map(TempDir::path)
    }
}

/// Prefix every line with `prefix`, keeping a trailing newline.
fn indent(text: &str, prefix: &str) -> String {
    let body = text.strip_suffix('\n').unwrap_or(text);
    let mut out =
        body.split('\n').map(|line| format!("{}{}", prefix, line)).collect::<Vec<_>>().join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Builds, tags and pushes images through a [`BuildBackend`].
pub struct ImageBuilder {
    backend: Arc<dyn BuildBackend>,
    extra_labels: BTreeMap<String, String>,
    recovery: Arc<dyn RecoveryPolicy>,
}

impl ImageBuilder {
    pub fn new(backend: Arc<dyn BuildBackend>) -> Self {
        Self {
            backend,
            extra_labels: BTreeMap::new(),
            recovery: Arc::new(CorruptionSignatures::default()),
        }
    }

    /// Labels attached to every image this builder produces.
    pub fn with_extra_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.extra_labels = labels;
        self
    }

    pub fn with_recovery_policy(mut self, policy: Arc<dyn RecoveryPolicy>) -> Self {
        self.recovery = policy;
        self
    }

    /// Build `job`, then tag the result under every name in `job.refs`.
    ///
    /// A failed attempt whose error matches the recovery policy is retried
    /// exactly once on the legacy builder; the retry's outcome is final and its
    /// stages replace the first attempt's.
    #[instrument(skip_all, fields(image = %job.refs.local, backend = self.backend.name()))]
    pub async fn build_image(
        &self,
        job: &BuildJob,
        sink: Arc<dyn BuildSink>,
        cancel: &CancellationToken,
    ) -> std::result::Result<BuiltImage, BuildFailure> {
        let start = Instant::now();
        let result = self.run_build(job, sink, cancel).await;

        match &result {
            Ok(built) => {
                let elapsed = start.elapsed();
                metrics::record_build(elapsed.as_secs_f64(), self.backend.name());
                info!("Built {} in {:.2}s", built.refs.local, elapsed.as_secs_f64());
            }
            Err(failure) => {
                metrics::record_build_failure(failure.error.kind());
                warn!("Build of {} failed: {}", job.refs.local, failure.error);
            }
        }
        result
    }

    async fn run_build(
        &self,
        job: &BuildJob,
        sink: Arc<dyn BuildSink>,
        cancel: &CancellationToken,
    ) -> std::result::Result<BuiltImage, BuildFailure> {
        let spec = prepare(&job.spec, job.cluster.as_ref(), &job.dependencies)?;

        let platform_suffix =
            spec.platform.as_ref().map(|p| format!(" for platform {}", p)).unwrap_or_default();
        sink.log(&format!(
            "Building Dockerfile{}:\n{}\n",
            platform_suffix,
            indent(&spec.dockerfile_contents, "  ")
        ));

        let attempt = self.build_to_digest(&spec, job, sink.clone(), cancel, true).await;
        let (digest, stages) = match attempt {
            Err(failure) if self.recovery.is_corruption(&failure.error) => {
                warn!("Detected build backend corruption, retrying with the legacy builder");
                debug!("Corruption error: {}", failure.error);
                metrics::record_corruption_retry();
                sink.log("Detected build cache corruption. Rebuilding with the legacy builder\n");
                self.build_to_digest(&spec, job, sink.clone(), cancel, false).await?
            }
            other => other?,
        };

        let refs = match self.tag_refs(&job.refs, &digest).await {
            Ok(refs) => refs,
            Err(e) => return Err(BuildFailure::new(e, stages)),
        };
        Ok(BuiltImage { digest, refs, stages })
    }

    /// One build attempt: invoke, decode, resolve the digest.
    async fn build_to_digest(
        &self,
        spec: &BuildSpec,
        job: &BuildJob,
        sink: Arc<dyn BuildSink>,
        cancel: &CancellationToken,
        allow_modern: bool,
    ) -> std::result::Result<(Digest, Vec<StageStatus>), BuildFailure> {
        let invocation = self.invoke(spec, job.filter.clone(), sink.clone(), allow_modern).await?;

        // The temp Dockerfile dir outlives the decode loop; both drop at return
        let Invocation { body, dockerfile_dir: _dockerfile_dir } = invocation;
        let decoded = decode_output(body, sink.as_ref(), cancel).await?;

        let output = match resolve_build_output(&decoded.raw) {
            Ok(output) => output,
            Err(e) => return Err(BuildFailure::new(e, decoded.stages)),
        };

        let digest = match output {
            BuildOutput::Digest(digest) => digest,
            BuildOutput::ShortId(id) => {
                debug!("Resolving short image id {}", id);
                match self.backend.image_inspect(&id).await {
                    Ok(inspect) => Digest::new(inspect.id),
                    Err(e) => return Err(BuildFailure::new(e.into(), decoded.stages)),
                }
            }
        };
        Ok((digest, decoded.stages))
    }

    /// Issue exactly one build request for a prepared spec.
    ///
    /// Filesystem sync is used when `allow_modern` is set and the backend
    /// supports it; otherwise the context is streamed as an archive. With
    /// `allow_modern` unset the request forces the legacy builder.
    #[instrument(skip_all, fields(allow_modern = allow_modern))]
    pub async fn invoke(
        &self,
        spec: &BuildSpec,
        filter: Arc<dyn PathFilter>,
        sink: Arc<dyn BuildSink>,
        allow_modern: bool,
    ) -> Result<Invocation> {
        let caps: BackendCapabilities = self
            .backend
            .capabilities()
            .await
            .map_err(|e| BuildError::BackendInvokeFailed { reason: sanitize(&e.to_string()) })?;

        let (context, dockerfile_dir) = if caps.use_fs_sync(allow_modern) {
            let dir = write_temp_dockerfile(&spec.dockerfile_contents)?;
            let synced = to_synced_dirs(&spec.context, dir.path(), filter);
            (BuildContext::Synced(synced), Some(dir))
        } else {
            let archive = ContextArchive::spawn(
                spec.context.clone(),
                spec.dockerfile_contents.clone(),
                filter,
                sink,
            );
            (BuildContext::Archive(archive), None)
        };
        debug!(?context, builder = ?caps.builder, "Issuing build request");

        let request =
            BuildRequest::from_spec(spec, context, self.extra_labels.clone(), !allow_modern);
        let body = self
            .backend
            .image_build(request)
            .await
            .map_err(|e| BuildError::BackendInvokeFailed { reason: sanitize(&e.to_string()) })?;

        Ok(Invocation { body, dockerfile_dir })
    }

    /// Tag `digest` with its deterministic tag under every name in `refs`.
    ///
    /// Only the local name is tagged in the backend; the cluster name is what
    /// workloads reference after a push.
    #[instrument(skip(self))]
    pub async fn tag_refs(&self, refs: &RefSet, digest: &Digest) -> Result<TaggedRefs> {
        let tagged = tagged_refs(refs, digest)?;
        self.backend.image_tag(digest.as_str(), &tagged.local.to_string()).await?;
        debug!("Tagged {} as {}", digest, tagged.local);
        Ok(tagged)
    }

    /// Push a tagged reference, draining the backend's progress stream.
    #[instrument(skip(self, sink, cancel), fields(reference = %reference))]
    pub async fn push_image(
        &self,
        reference: &ImageRef,
        sink: &dyn BuildSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = reference.to_string();
        info!("Pushing {}", name);
        sink.log(&format!("Pushing {}\n", name));

        let result = match self.backend.image_push(&name).await {
            Ok(body) => self.drain_push(body, &name, sink, cancel).await,
            Err(e) => {
                Err(BuildError::PushFailed { reference: name.clone(), reason: e.to_string() })
            }
        };
        metrics::record_push(result.is_ok());
        result
    }

    async fn drain_push(
        &self,
        body: ResponseBody,
        name: &str,
        sink: &dyn BuildSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match decode_output(body, sink, cancel).await {
            Ok(_) => Ok(()),
            Err(failure) => match failure.error {
                BuildError::Cancelled => Err(BuildError::Cancelled),
                error => Err(BuildError::PushFailed {
                    reference: name.to_string(),
                    reason: error.to_string(),
                }),
            },
        }
    }

    /// Whether the backend has an image under `reference`.
    #[instrument(skip(self), fields(reference = %reference))]
    pub async fn image_exists(&self, reference: &ImageRef) -> Result<bool> {
        match self.backend.image_inspect(&reference.to_string()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The deploy reference for an existing image: its name tagged by content digest.
    #[instrument(skip(self))]
    pub async fn dump_image_deploy_ref(&self, reference: &str) -> Result<ImageRef> {
        let parsed = ImageRef::parse(reference)?;
        let inspect = self.backend.image_inspect(reference).await?;
        let tag = tag_from_digest(&Digest::new(inspect.id))?;
        parsed.with_tag(&tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indent() {
        assert_eq!(indent("FROM alpine\nRUN make", "  "), "  FROM alpine\n  RUN make");
        assert_eq!(indent("FROM alpine\n\nRUN make\n", "  "), "  FROM alpine\n  \n  RUN make\n");
        assert_eq!(indent("", "  "), "  ");
    }

    #[test]
    fn test_build_job_defaults() {
        let job = BuildJob::new(BuildSpec::default(), RefSet::local("app").unwrap());
        assert!(job.cluster.is_none());
        assert!(job.dependencies.is_empty());
        assert!(!job.filter.matches(std::path::Path::new("/anything")));
    }
}
