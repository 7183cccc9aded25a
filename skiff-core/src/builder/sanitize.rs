//! Cleanup of backend error text.
//!
//! The next-generation backend wraps build failures in several layers of
//! internal context that mean nothing to someone who just wants an image.
//! These rules strip the wrappers and collapse known duplicated diagnostics.

use once_cell::sync::Lazy;
use regex::Regex;

/// Wrapper prefixes, stripped in this order.
const WRAPPER_PREFIXES: &[&str] = &[
    "failed to solve with frontend dockerfile.v0: ",
    "failed to solve with frontend gateway.v0: ",
    "rpc error: code = Unknown desc = ",
    "failed to build LLB: ",
];

/// Verbose diagnostics, each collapsed to its first capture group.
static CLEANUP_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // "runc did not terminate successfully" only repeats "executor failed running".
        // Older backends spell it "sucessfully".
        r"(executor failed running.*): runc did not terminate succ?essfully",
        // "failed to compute cache key: foo.txt not found: not found"
        r"failed to compute cache key: (.* not found): not found",
        r"failed to compute cache key: (?:failed to walk [^ ]+): lstat (?:/.*buildkit-[^/]*/)?(.*: no such file or directory)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid build error cleanup regex"))
    .collect()
});

/// One pass of prefix stripping and pattern collapsing.
fn clean_once(raw: &str) -> String {
    let mut text = raw;
    for prefix in WRAPPER_PREFIXES {
        text = text.strip_prefix(prefix).unwrap_or(text);
    }

    let mut text = text.to_string();
    for re in CLEANUP_PATTERNS.iter() {
        text = re.replace_all(&text, "${1}").into_owned();
    }
    text
}

/// Strip protocol boilerplate from a backend error message.
///
/// Passes repeat until the text stops changing, so sanitizing already
/// sanitized text is a no-op. Every pass either shortens the text or leaves
/// it unchanged, so this always terminates.
pub fn sanitize(raw: &str) -> String {
    let mut current = raw.to_string();
    loop {
        let next = clean_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_missing_file() {
        let raw = "failed to solve with frontend dockerfile.v0: rpc error: code = Unknown desc = failed to compute cache key: foo.txt not found: not found";
        assert_eq!(sanitize(raw), "foo.txt not found");
    }

    #[test]
    fn test_executor_failed() {
        let raw = "failed to solve with frontend dockerfile.v0: failed to build LLB: executor failed running [/bin/sh -c exit 1]: runc did not terminate sucessfully";
        assert_eq!(sanitize(raw), "executor failed running [/bin/sh -c exit 1]");

        let raw = "executor failed running [make]: runc did not terminate successfully";
        assert_eq!(sanitize(raw), "executor failed running [make]");
    }

    #[test]
    fn test_lstat_missing() {
        let raw = "failed to compute cache key: failed to walk /var/lib/docker/tmp/buildkit-mount123/src: lstat /var/lib/docker/tmp/buildkit-mount123/src/app: no such file or directory";
        assert_eq!(sanitize(raw), "src/app: no such file or directory");
    }

    #[test]
    fn test_unmatched_passthrough() {
        assert_eq!(sanitize("pull access denied for foo"), "pull access denied for foo");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_prefixes_in_unusual_order() {
        let raw = "rpc error: code = Unknown desc = failed to solve with frontend dockerfile.v0: boom";
        assert_eq!(sanitize(raw), "boom");
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(raw in ".{0,200}") {
            let once = sanitize(&raw);
            prop_assert_eq!(sanitize(&once), once);
        }

        #[test]
        fn prop_sanitize_idempotent_on_wrapped_text(
            prefix in prop::sample::select(WRAPPER_PREFIXES.to_vec()),
            body in "[a-z ./:]{0,60}",
        ) {
            let raw = format!("{}{}: runc did not terminate sucessfully", prefix, body);
            let once = sanitize(&raw);
            prop_assert_eq!(sanitize(&once), once);
        }
    }
}
