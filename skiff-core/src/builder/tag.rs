//! Deterministic image tags derived from content digests.
//!
//! A tag is `skiff-` followed by the first 16 hex characters of the digest, so
//! the same image always gets the same tag across restarts.

use crate::error::{BuildError, Result};
use crate::types::{Digest, ImageRef, RefSet, TaggedRefs};

/// Prefix of every tag skiff generates.
pub const TAG_PREFIX: &str = "skiff-";

/// Number of digest characters kept in a tag.
const TAG_HASH_LEN: usize = 16;

/// Derive the tag for `digest`.
pub fn tag_from_digest(digest: &Digest) -> Result<String> {
    let encoded = digest.encoded();
    if encoded.len() < TAG_HASH_LEN || !encoded.is_char_boundary(TAG_HASH_LEN) {
        return Err(BuildError::DigestTooShort { digest: encoded.to_string() });
    }
    Ok(format!("{}{}", TAG_PREFIX, &encoded[..TAG_HASH_LEN]))
}

/// Whether `reference` carries the tag derived from `digest`.
///
/// Tags are truncations, so this is a prefix check on the digest.
pub fn digest_matches_ref(reference: &ImageRef, digest: &Digest) -> bool {
    let Some(tag) = reference.tag() else {
        return false;
    };
    if tag.len() <= TAG_PREFIX.len() {
        return false;
    }
    match tag.get(TAG_PREFIX.len()..) {
        Some(suffix) => digest.encoded().starts_with(suffix),
        None => false,
    }
}

/// Apply the digest's tag to every variant in `refs`.
pub fn tagged_refs(refs: &RefSet, digest: &Digest) -> Result<TaggedRefs> {
    let tag = tag_from_digest(digest)?;
    refs.add_tag_suffix(&tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DIGEST: &str = "sha256:1234567890abcdef1234567890abcdef";

    #[test]
    fn test_tag_from_digest() {
        let tag = tag_from_digest(&Digest::new(DIGEST)).unwrap();
        assert_eq!(tag, "skiff-1234567890abcdef");
    }

    #[test]
    fn test_tag_from_short_digest() {
        let err = tag_from_digest(&Digest::new("sha256:1234")).unwrap_err();
        assert!(matches!(err, BuildError::DigestTooShort { .. }));
    }

    #[test]
    fn test_matches_round_trip() {
        let digest = Digest::new(DIGEST);
        let refs = RefSet::with_registry("app", "localhost:5000", None).unwrap();
        let tagged = tagged_refs(&refs, &digest).unwrap();
        assert!(digest_matches_ref(&tagged.local, &digest));
        assert!(digest_matches_ref(&tagged.cluster, &digest));
        assert!(!digest_matches_ref(&tagged.local, &Digest::new("sha256:ffffffffffffffffffff")));
    }

    #[test]
    fn test_matches_short_tag() {
        let digest = Digest::new(DIGEST);
        assert!(!digest_matches_ref(&ImageRef::parse("app:skiff-").unwrap(), &digest));
        assert!(!digest_matches_ref(&ImageRef::parse("app:latest").unwrap(), &digest));
        assert!(!digest_matches_ref(&ImageRef::parse("app").unwrap(), &digest));
    }

    proptest! {
        #[test]
        fn prop_tag_is_deterministic_and_prefixed(hex in "[0-9a-f]{16,64}") {
            let digest = Digest::new(format!("sha256:{}", hex));
            let tag = tag_from_digest(&digest).unwrap();
            prop_assert!(tag.starts_with(TAG_PREFIX));
            prop_assert_eq!(tag_from_digest(&digest).unwrap(), tag);
        }

        #[test]
        fn prop_short_digest_rejected(hex in "[0-9a-f]{0,15}") {
            let digest = Digest::new(format!("sha256:{}", hex));
            prop_assert!(tag_from_digest(&digest).is_err());
        }

        #[test]
        fn prop_tagged_local_ref_matches(hex in "[0-9a-f]{16,64}") {
            let digest = Digest::new(format!("sha256:{}", hex));
            let tagged = tagged_refs(&RefSet::local("app").unwrap(), &digest).unwrap();
            prop_assert!(digest_matches_ref(&tagged.local, &digest));
        }
    }
}
