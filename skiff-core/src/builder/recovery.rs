//! Retry policy for known transient backend corruption.
//!
//! The next-generation backend occasionally fails with a commit size
//! validation error in its content store, e.g.
//!
//! ```text
//! failed to load cache key: failed commit on ref "unknown-sha256:d8ad59...":
//! unexpected commit size 69764, expected 76810: failed precondition
//! ```
//!
//! Rebuilding with the classic builder sidesteps the broken store. Detection
//! is string matching on the backend's error text, so the signatures are data
//! and the policy is a trait.

use crate::error::BuildError;

/// Substring pairs that identify the commit-validation corruption.
pub const COMMIT_CORRUPTION: &[&str] = &["failed precondition", "failed commit on ref"];

/// Decides whether a failed attempt is retried on the legacy path.
pub trait RecoveryPolicy: Send + Sync {
    /// `true` if `error` is a known corruption that a legacy rebuild avoids.
    fn is_corruption(&self, error: &BuildError) -> bool;
}

/// Matches an error when every substring of any one signature is present.
#[derive(Debug, Clone)]
pub struct CorruptionSignatures {
    signatures: Vec<Vec<String>>,
}

impl CorruptionSignatures {
    pub fn new(signatures: Vec<Vec<String>>) -> Self {
        Self { signatures }
    }

    /// Add another signature.
    pub fn with_signature(mut self, needles: &[&str]) -> Self {
        self.signatures.push(needles.iter().map(|s| s.to_string()).collect());
        self
    }

    fn matches_text(&self, text: &str) -> bool {
        self.signatures
            .iter()
            .any(|sig| !sig.is_empty() && sig.iter().all(|needle| text.contains(needle.as_str())))
    }
}

impl Default for CorruptionSignatures {
    fn default() -> Self {
        Self::new(Vec::new()).with_signature(COMMIT_CORRUPTION)
    }
}

impl RecoveryPolicy for CorruptionSignatures {
    fn is_corruption(&self, error: &BuildError) -> bool {
        // Only failures the backend itself reported can carry the signature
        match error {
            BuildError::BackendReported(text) => self.matches_text(text),
            BuildError::BackendInvokeFailed { reason } | BuildError::Decode { reason } => {
                self.matches_text(reason)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_commit_corruption() {
        let policy = CorruptionSignatures::default();
        let err = BuildError::BackendReported(
            "failed to create LLB definition: failed commit on ref \"unknown-sha256:b72f\": \
             failed size validation: 80941 != 80929: failed precondition"
                .to_string(),
        );
        assert!(policy.is_corruption(&err));
    }

    #[test]
    fn test_requires_both_substrings() {
        let policy = CorruptionSignatures::default();
        assert!(!policy.is_corruption(&BuildError::BackendReported(
            "failed precondition".to_string()
        )));
        assert!(!policy.is_corruption(&BuildError::BackendReported(
            "failed commit on ref \"x\"".to_string()
        )));
    }

    #[test]
    fn test_ignores_local_errors() {
        let policy = CorruptionSignatures::default();
        let err = BuildError::ContextPrepFailed {
            reason: "failed precondition: failed commit on ref".to_string(),
        };
        assert!(!policy.is_corruption(&err));
    }

    #[test]
    fn test_extra_signature() {
        let policy = CorruptionSignatures::default().with_signature(&["snapshot", "missing parent"]);
        assert!(policy.is_corruption(&BuildError::BackendReported(
            "snapshot abc: missing parent layer".to_string()
        )));
    }
}
