//! Push and inspection commands.

use crate::output::ConsoleSink;
use anyhow::{Context, Result};
use colored::Colorize;
use skiff_core::{ImageBuilder, ImageRef};
use tokio_util::sync::CancellationToken;

pub async fn push(builder: &ImageBuilder, reference: &str, cancel: &CancellationToken) -> Result<()> {
    let reference = ImageRef::parse(reference)?;
    builder.push_image(&reference, &ConsoleSink::new(), cancel).await?;
    println!("{} {}", "Pushed".green().bold(), reference);
    Ok(())
}

/// Reports whether the image exists; callers turn `false` into a failing exit code.
pub async fn exists(builder: &ImageBuilder, reference: &str) -> Result<bool> {
    let reference = ImageRef::parse(reference)?;
    let found = builder
        .image_exists(&reference)
        .await
        .with_context(|| format!("Failed to check if {} exists", reference))?;

    if found {
        println!("{} {}", reference, "exists".green());
    } else {
        println!("{} {}", reference, "not found".yellow());
    }
    Ok(found)
}

pub async fn deploy_ref(builder: &ImageBuilder, reference: &str) -> Result<()> {
    let deploy_ref = builder.dump_image_deploy_ref(reference).await?;
    println!("{}", deploy_ref);
    Ok(())
}
