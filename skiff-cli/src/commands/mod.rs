//! CLI command implementations

pub mod build;
pub mod image;

pub use build::build;
pub use image::{deploy_ref, exists, push};

/// Parse a `KEY=VALUE` argument.
pub fn parse_key_val(arg: &str) -> anyhow::Result<(String, String)> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(anyhow::anyhow!("Invalid KEY=VALUE format: {}", arg)),
    }
}
