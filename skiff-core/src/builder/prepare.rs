//! Final build spec preparation.
//!
//! Fills in the cluster platform and points references to dependency images
//! at the concrete images built for them. No I/O happens here.

use crate::error::{BuildError, Result};
use crate::types::{BuildSpec, Cluster, ImageDependency, ImageRef, Substitution};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

static TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\S+").expect("Invalid dockerfile token regex"));

/// Resolve `spec` against the target cluster and already-built dependencies.
pub fn prepare(
    spec: &BuildSpec,
    cluster: Option<&Cluster>,
    deps: &HashMap<String, ImageDependency>,
) -> Result<BuildSpec> {
    let mut prepared = spec.clone();

    if prepared.platform.as_deref().map_or(true, str::is_empty) {
        prepared.platform = cluster.and_then(Cluster::platform);
    }

    prepared.substitutions.clear();
    for name in &spec.image_deps {
        let dep = deps
            .get(name)
            .ok_or_else(|| BuildError::UnresolvedDependency { name: name.clone() })?;
        let image = dep
            .image
            .as_deref()
            .ok_or_else(|| BuildError::UnresolvedDependency { name: name.clone() })?;

        let selector = ImageRef::parse(&dep.selector)?;
        ImageRef::parse(image)?;

        let (contents, replaced) =
            rewrite_dockerfile(&prepared.dockerfile_contents, selector.name(), image);
        debug!(dependency = %name, image, replaced, "Injected dependency image");

        prepared.dockerfile_contents = contents;
        prepared.substitutions.push(Substitution {
            name: name.clone(),
            selector: dep.selector.clone(),
            reference: image.to_string(),
        });
    }

    Ok(prepared)
}

/// Whether a Dockerfile image token names the `selector` repository.
fn names_repository(token: &str, selector: &str) -> bool {
    ImageRef::parse(token).map(|r| r.name() == selector).unwrap_or(false)
}

/// Rewrite `--mount=` options, replacing a matching `from=` value.
fn rewrite_mount(value: &str, selector: &str, image: &str) -> Option<String> {
    let mut changed = false;
    let options: Vec<String> = value
        .split(',')
        .map(|opt| match opt.strip_prefix("from=") {
            Some(from) if names_repository(from, selector) => {
                changed = true;
                format!("from={}", image)
            }
            _ => opt.to_string(),
        })
        .collect();
    changed.then(|| options.join(","))
}

/// Replacement for one token of an instruction, if it refers to the dependency.
fn rewrite_token(
    instruction: &str,
    token: &str,
    image_slot: bool,
    selector: &str,
    image: &str,
) -> Option<String> {
    if let Some(from) = token.strip_prefix("--from=") {
        return names_repository(from, selector).then(|| format!("--from={}", image));
    }
    if let Some(mount) = token.strip_prefix("--mount=") {
        return rewrite_mount(mount, selector, image).map(|m| format!("--mount={}", m));
    }
    if instruction == "FROM" && image_slot && names_repository(token, selector) {
        return Some(image.to_string());
    }
    None
}

/// Rewrite every reference to `selector` in `dockerfile`.
///
/// Returns the new contents and the number of replaced references. Spacing,
/// stage aliases and unrelated flags are preserved.
fn rewrite_dockerfile(dockerfile: &str, selector: &str, image: &str) -> (String, usize) {
    let mut replaced = 0;
    let mut out = String::with_capacity(dockerfile.len());

    for line in dockerfile.split_inclusive('\n') {
        let mut tokens = TOKEN_REGEX.find_iter(line);
        let instruction = match tokens.next() {
            Some(m) => m.as_str().to_ascii_uppercase(),
            None => {
                out.push_str(line);
                continue;
            }
        };
        if !matches!(instruction.as_str(), "FROM" | "COPY" | "ADD" | "RUN") {
            out.push_str(line);
            continue;
        }

        let mut cursor = 0;
        let mut image_slot = true;
        for token in tokens {
            let text = token.as_str();
            let is_flag = text.starts_with("--");
            let slot = image_slot && !is_flag;
            if let Some(new) = rewrite_token(&instruction, text, slot, selector, image) {
                out.push_str(&line[cursor..token.start()]);
                out.push_str(&new);
                cursor = token.end();
                replaced += 1;
            }
            // Only the first non-flag argument of FROM is an image
            if !is_flag {
                image_slot = false;
            }
        }
        out.push_str(&line[cursor..]);
    }

    (out, replaced)
}
