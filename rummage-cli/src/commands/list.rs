use std::io::{self, BufWriter};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use rummage::manifest::Platform;
use rummage::{Config, Format, ImageSource, SourceKind};
use tokio_util::sync::CancellationToken;

use crate::error::{self, RummageCliError};
use crate::utils;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Image reference (e.g. alpine:3.20), or a file path with --source archive
    pub image: String,

    /// Print extended file information, like ls -l or tar -tv
    #[arg(short, long)]
    pub long: bool,

    /// Image source: remote, daemon (Docker) or archive
    #[arg(short, long, default_value = "remote")]
    pub source: String,

    /// Cache layers when using the remote source
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub cache: bool,

    /// Layer cache directory [default: <user cache dir>/rummage]
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Platform to pick from a multi-platform image (os/arch[/variant])
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Show download progress on stderr
    #[arg(long)]
    pub progress: bool,
}

impl ListArgs {
    /// Environment defaults overridden by the command line.
    fn config(&self) -> error::Result<Config> {
        let mut config = Config::from_env();
        config.source = self.source.parse::<SourceKind>()?;
        config.long_output = self.long;
        config.platform = self.platform.clone();
        config.progress = self.progress;

        match (self.cache, &self.cache_dir) {
            (false, Some(_)) => {
                return Err(RummageCliError::Input(
                    "--cache-dir cannot be combined with --cache=false".to_string(),
                ));
            }
            (false, None) => config.cache_dir = None,
            (true, Some(dir)) => config.cache_dir = Some(dir.clone()),
            (true, None) => {
                if config.cache_dir.is_none() && config.source == SourceKind::Remote {
                    utils::print_warning("no user cache directory found, layers will not be cached");
                }
            }
        }

        Ok(config)
    }
}

pub async fn execute(args: ListArgs, cancel: &CancellationToken) -> Result<()> {
    let config = args.config()?;
    tracing::debug!(?config, "listing {}", args.image);

    let source = ImageSource::from_config(&config);
    let image = tokio::select! {
        image = source.resolve(&args.image) => image,
        _ = cancel.cancelled() => Err(rummage::Error::Cancelled),
    }
    .with_context(|| format!("Failed to get image {}", args.image))?;

    let sink = Format::from_long_flag(config.long_output).sink(BufWriter::new(io::stdout()));
    rummage::list_image(&image, sink, cancel, config.concurrent_downloads)
        .await
        .with_context(|| format!("Failed to list {}", image.name()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ListArgs,
    }

    fn parse(argv: &[&str]) -> ListArgs {
        Harness::parse_from(std::iter::once("rummage").chain(argv.iter().copied())).args
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["alpine"]);
        assert!(!args.long);
        assert!(args.cache);
        assert_eq!(args.source, "remote");

        let config = args.config().unwrap();
        assert_eq!(config.source, SourceKind::Remote);
        assert!(!config.long_output);
    }

    #[test]
    fn test_flags_override_config() {
        let args = parse(&[
            "-l",
            "-s",
            "tarball",
            "--cache=false",
            "--platform",
            "linux/arm64/v8",
            "image.tar",
        ]);
        let config = args.config().unwrap();
        assert!(config.long_output);
        assert_eq!(config.source, SourceKind::Archive);
        assert_eq!(config.cache_dir, None);
        assert_eq!(config.platform.unwrap().to_string(), "linux/arm64/v8");
    }

    #[test]
    fn test_explicit_cache_dir() {
        let args = parse(&["--cache-dir", "/tmp/layers", "alpine"]);
        assert_eq!(args.config().unwrap().cache_dir, Some(PathBuf::from("/tmp/layers")));
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let args = parse(&["--source", "ftp", "alpine"]);
        assert!(matches!(
            args.config(),
            Err(RummageCliError::Rummage(rummage::Error::SourceUnsupported(_)))
        ));
    }

    #[test]
    fn test_conflicting_cache_flags() {
        let args = parse(&["--cache=false", "--cache-dir", "/tmp/x", "alpine"]);
        assert!(matches!(args.config(), Err(RummageCliError::Input(_))));
    }
}
