//! Image references and the name variants a build is tracked under.

use crate::error::{BuildError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Repository name: optional registry host (with port), then lowercase path components.
static NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9.-]*[a-zA-Z0-9])?(?::[0-9]+)?/)?[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$",
    )
    .expect("Invalid image name regex")
});

/// Tag: up to 128 word characters, dots and dashes, not starting with a dot or dash.
static TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("Invalid image tag regex"));

/// A parsed image reference: `name[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    name: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    /// Parse a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| BuildError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }

        // Handle digest references (image@sha256:...)
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; before it, it's a registry port
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => (&rest[..last_slash + i], Some(rest[last_slash + i + 1..].to_string())),
            None => (rest, None),
        };

        if !NAME_REGEX.is_match(name) {
            return Err(invalid("invalid repository name"));
        }
        if let Some(tag) = &tag {
            if !TAG_REGEX.is_match(tag) {
                return Err(invalid("invalid tag"));
            }
        }

        Ok(Self { name: name.to_string(), tag, digest })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Same repository with the given tag (any digest is dropped).
    pub fn with_tag(&self, tag: &str) -> Result<Self> {
        if !TAG_REGEX.is_match(tag) {
            return Err(BuildError::InvalidReference {
                reference: format!("{}:{}", self.name, tag),
                reason: "invalid tag".to_string(),
            });
        }
        Ok(Self { name: self.name.clone(), tag: Some(tag.to_string()), digest: None })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// The name variants a single image is tracked under.
///
/// `local` is what the build backend knows the image as; `cluster` is what
/// workloads in the cluster pull. Without a registry both are the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSet {
    pub local: ImageRef,
    pub cluster: ImageRef,
}

impl RefSet {
    /// A ref set for an image that never leaves the local backend.
    pub fn local(name: &str) -> Result<Self> {
        let local = ImageRef::parse(name)?;
        Ok(Self { cluster: local.clone(), local })
    }

    /// A ref set for an image pushed to `registry`.
    ///
    /// `cluster_registry` is the host the cluster reaches the same registry
    /// under, when it differs from the host used for pushing.
    pub fn with_registry(
        name: &str,
        registry: &str,
        cluster_registry: Option<&str>,
    ) -> Result<Self> {
        let local = ImageRef::parse(&format!("{}/{}", registry.trim_end_matches('/'), name))?;
        let cluster_host = cluster_registry.unwrap_or(registry).trim_end_matches('/');
        let cluster = ImageRef::parse(&format!("{}/{}", cluster_host, name))?;
        Ok(Self { local, cluster })
    }

    /// Apply one tag to every variant.
    pub fn add_tag_suffix(&self, tag: &str) -> Result<TaggedRefs> {
        Ok(TaggedRefs { local: self.local.with_tag(tag)?, cluster: self.cluster.with_tag(tag)? })
    }
}

/// Every tracked variant carrying the same deterministic tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedRefs {
    pub local: ImageRef,
    pub cluster: ImageRef,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let r = ImageRef::parse("nginx").unwrap();
        assert_eq!(r.name(), "nginx");
        assert_eq!(r.tag(), None);
    }

    #[test]
    fn test_parse_with_tag() {
        let r = ImageRef::parse("myorg/myapp:v1.0").unwrap();
        assert_eq!(r.name(), "myorg/myapp");
        assert_eq!(r.tag(), Some("v1.0"));
    }

    #[test]
    fn test_parse_registry_port() {
        let r = ImageRef::parse("localhost:5000/app").unwrap();
        assert_eq!(r.name(), "localhost:5000/app");
        assert_eq!(r.tag(), None);

        let r = ImageRef::parse("localhost:5000/app:dev").unwrap();
        assert_eq!(r.name(), "localhost:5000/app");
        assert_eq!(r.tag(), Some("dev"));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageRef::parse("app@sha256:abcd").unwrap();
        assert_eq!(r.name(), "app");
        assert_eq!(r.digest(), Some("sha256:abcd"));
        assert_eq!(r.to_string(), "app@sha256:abcd");
    }

    #[test]
    fn test_parse_rejects_uppercase_and_empty() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("MyApp").is_err());
        assert!(ImageRef::parse("app:-bad").is_err());
    }

    #[test]
    fn test_ref_set_with_registry() {
        let refs = RefSet::with_registry("app", "localhost:5000", Some("registry:5000")).unwrap();
        let tagged = refs.add_tag_suffix("skiff-0123456789abcdef").unwrap();
        assert_eq!(tagged.local.to_string(), "localhost:5000/app:skiff-0123456789abcdef");
        assert_eq!(tagged.cluster.to_string(), "registry:5000/app:skiff-0123456789abcdef");
    }

    #[test]
    fn test_add_tag_suffix_rejects_invalid_tag() {
        let refs = RefSet::local("app").unwrap();
        assert!(refs.add_tag_suffix("bad tag").is_err());
    }
}
