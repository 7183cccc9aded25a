//! Build command implementation for skiff CLI.
//!
//! Builds an image from a Dockerfile, tags it by content digest and
//! optionally pushes it.

use super::parse_key_val;
use crate::output::{print_stages, ConsoleSink};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use skiff_core::builder::PathSetFilter;
use skiff_core::types::{BuildSpec, Cluster, ImageDependency, RefSet};
use skiff_core::{BuildJob, ImageBuilder};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Image name (e.g., "myapp")
    #[arg(short, long)]
    pub name: String,

    /// Dockerfile path, relative to the context
    #[arg(short = 'f', long, default_value = "Dockerfile")]
    pub file: PathBuf,

    /// Registry to tag (and push) the image under
    #[arg(long)]
    pub registry: Option<String>,

    /// Registry host as seen from inside the cluster, if different
    #[arg(long, requires = "registry")]
    pub cluster_registry: Option<String>,

    /// Target platform (e.g., "linux/arm64")
    #[arg(long)]
    pub platform: Option<String>,

    /// Cluster node architecture, used when --platform is not set
    #[arg(long)]
    pub arch: Option<String>,

    /// Build arguments (KEY=VALUE)
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Target build stage
    #[arg(long)]
    pub target: Option<String>,

    /// Always pull newer base images
    #[arg(long)]
    pub pull: bool,

    /// Images to use as cache sources
    #[arg(long)]
    pub cache_from: Vec<String>,

    /// Network mode for RUN instructions
    #[arg(long)]
    pub network: Option<String>,

    /// Paths to leave out of the build context
    #[arg(long)]
    pub exclude: Vec<PathBuf>,

    /// Built dependency image (SELECTOR=IMAGE)
    #[arg(long = "dep")]
    pub deps: Vec<String>,

    /// Push the image after building
    #[arg(long)]
    pub push: bool,
}

impl BuildArgs {
    fn to_job(&self) -> Result<BuildJob> {
        let context = self.context.canonicalize().with_context(|| {
            format!("Build context not found: {}", self.context.display())
        })?;

        let dockerfile_path = context.join(&self.file);
        let dockerfile_contents = std::fs::read_to_string(&dockerfile_path)
            .with_context(|| format!("Failed to read Dockerfile: {}", dockerfile_path.display()))?;

        let mut dependencies = HashMap::new();
        let mut image_deps = Vec::new();
        for dep in &self.deps {
            let (selector, image) = parse_key_val(dep)?;
            image_deps.push(selector.clone());
            dependencies.insert(selector.clone(), ImageDependency { selector, image: Some(image) });
        }

        let build_args = self
            .build_args
            .iter()
            .map(|a| parse_key_val(a))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let spec = BuildSpec {
            context: context.clone(),
            dockerfile_contents,
            platform: self.platform.clone(),
            image_deps,
            build_args,
            target: self.target.clone(),
            pull: self.pull,
            cache_from: self.cache_from.clone(),
            network: self.network.clone(),
            ..Default::default()
        };

        let refs = match &self.registry {
            Some(registry) => {
                RefSet::with_registry(&self.name, registry, self.cluster_registry.as_deref())?
            }
            None => RefSet::local(&self.name)?,
        };

        let mut job = BuildJob::new(spec, refs)
            .with_dependencies(dependencies)
            .with_filter(Arc::new(PathSetFilter::new(&context, &self.exclude)));
        if let Some(arch) = &self.arch {
            job = job.with_cluster(Cluster { name: "default".to_string(), arch: Some(arch.clone()) });
        }
        Ok(job)
    }
}

/// Builds an image and prints the resulting references.
pub async fn build(builder: &ImageBuilder, args: BuildArgs, cancel: &CancellationToken) -> Result<()> {
    let start = Instant::now();
    let job = args.to_job()?;

    println!("{} Building {}", "[1/2]".bold().blue(), job.refs.local.to_string().green());

    let sink = Arc::new(ConsoleSink::new());
    let built = match builder.build_image(&job, sink.clone(), cancel).await {
        Ok(built) => built,
        Err(failure) => {
            if !failure.stages.is_empty() {
                println!();
                print_stages(&failure.stages);
            }
            println!("{} {}", "Build failed:".red().bold(), failure.error);
            return Err(failure.error.into());
        }
    };

    println!();
    print_stages(&built.stages);
    println!(
        "{} Built {} in {:.1}s",
        "[2/2]".bold().blue(),
        built.refs.local.to_string().green(),
        start.elapsed().as_secs_f64()
    );
    if built.refs.cluster != built.refs.local {
        println!("      Cluster ref: {}", built.refs.cluster.to_string().cyan());
    }

    if args.push {
        builder.push_image(&built.refs.local, sink.as_ref(), cancel).await?;
        println!("{} {}", "Pushed".green().bold(), built.refs.local);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: BuildArgs,
    }

    #[test]
    fn test_build_args_to_job() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM base\n").unwrap();
        let context = dir.path().to_string_lossy().to_string();

        let cli = TestCli::parse_from([
            "test",
            &context,
            "--name",
            "app",
            "--registry",
            "localhost:5000",
            "--build-arg",
            "VERSION=1.2",
            "--dep",
            "base=base:skiff-0123456789abcdef",
            "--arch",
            "arm64",
            "--exclude",
            "node_modules",
        ]);
        let job = cli.args.to_job().unwrap();

        assert_eq!(job.spec.dockerfile_contents, "FROM base\n");
        assert_eq!(job.spec.build_args.get("VERSION").map(String::as_str), Some("1.2"));
        assert_eq!(job.spec.image_deps, vec!["base".to_string()]);
        assert_eq!(job.refs.local.to_string(), "localhost:5000/app");
        assert_eq!(job.cluster.and_then(|c| c.platform()), Some("linux/arm64".to_string()));
        assert!(job.filter.matches(&job.spec.context.join("node_modules/x.js")));
    }

    #[test]
    fn test_missing_dockerfile() {
        let dir = tempfile::TempDir::new().unwrap();
        let context = dir.path().to_string_lossy().to_string();
        let cli = TestCli::parse_from(["test", &context, "--name", "app"]);
        assert!(cli.args.to_job().is_err());
    }
}
