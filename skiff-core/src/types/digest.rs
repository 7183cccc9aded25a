//! Content digests reported by the build backend.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An image content digest such as `sha256:4f1c...`.
///
/// Equality is exact string equality. The value is not validated on
/// construction because backends report IDs in whatever form they store them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Algorithm prefix (e.g. `sha256`), if present.
    pub fn algorithm(&self) -> Option<&str> {
        self.0.split_once(':').map(|(algo, _)| algo)
    }

    /// Hex-encoded portion after the algorithm prefix.
    pub fn encoded(&self) -> &str {
        match self.0.split_once(':') {
            Some((_, encoded)) => encoded,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_parts() {
        let digest = Digest::new("sha256:0123456789abcdef0123");
        assert_eq!(digest.algorithm(), Some("sha256"));
        assert_eq!(digest.encoded(), "0123456789abcdef0123");
    }

    #[test]
    fn test_digest_without_algorithm() {
        let digest = Digest::new("0123456789abcdef");
        assert_eq!(digest.algorithm(), None);
        assert_eq!(digest.encoded(), "0123456789abcdef");
    }
}
