//! Build specifications produced by the config evaluator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything needed to run one image build.
///
/// A spec is built fresh for each build attempt and is not mutated once the
/// backend request has been issued; preparation returns a new value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSpec {
    /// Root of the build context on the local filesystem
    pub context: PathBuf,
    /// Contents of the Dockerfile (may differ from any file on disk)
    pub dockerfile_contents: String,
    /// Target platform, e.g. `linux/arm64`
    pub platform: Option<String>,
    /// Names of other images this build depends on, in declaration order
    pub image_deps: Vec<String>,
    /// Dependency references resolved by the preparer, in declaration order
    pub substitutions: Vec<Substitution>,
    /// Build arguments (ARG values)
    pub build_args: BTreeMap<String, String>,
    /// Target stage for multi-stage builds
    pub target: Option<String>,
    /// Always attempt to pull newer base images
    pub pull: bool,
    /// Images to consider as cache sources
    pub cache_from: Vec<String>,
    /// Network mode for RUN instructions
    pub network: Option<String>,
}

/// One dependency placeholder rewritten to a concrete image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    /// Dependency name
    pub name: String,
    /// Reference that appears in the Dockerfile
    pub selector: String,
    /// Resolved, pullable reference
    pub reference: String,
}

/// The build state of one dependency image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDependency {
    /// Reference that appears in dependent Dockerfiles (tag ignored when matching)
    pub selector: String,
    /// Reference of the built image, once it has been built
    pub image: Option<String>,
}

/// The cluster a build is destined for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    /// CPU architecture of the cluster's nodes, e.g. `amd64`
    pub arch: Option<String>,
}

impl Cluster {
    /// Platform string images for this cluster should be built for.
    pub fn platform(&self) -> Option<String> {
        self.arch.as_deref().filter(|a| !a.is_empty()).map(|arch| format!("linux/{}", arch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_platform() {
        let cluster = Cluster { name: "kind".to_string(), arch: Some("arm64".to_string()) };
        assert_eq!(cluster.platform(), Some("linux/arm64".to_string()));

        let cluster = Cluster { name: "kind".to_string(), arch: Some(String::new()) };
        assert_eq!(cluster.platform(), None);
    }

    #[test]
    fn test_spec_deserialize_defaults() {
        let spec: BuildSpec =
            serde_json::from_str(r#"{"context": "/src", "dockerfile_contents": "FROM alpine"}"#)
                .unwrap();
        assert_eq!(spec.context, PathBuf::from("/src"));
        assert!(spec.platform.is_none());
        assert!(spec.build_args.is_empty());
    }
}
