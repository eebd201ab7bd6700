//! Images held by the local container daemon.
//!
//! The daemon is driven through its command-line client: `image inspect`
//! checks that the image exists, then `save` exports it to a temporary
//! archive which is read like any other archive.

use std::env;
use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;
use std::process::Output;

use tokio::process::Command;

use super::archive::open_archive;
use crate::error::{AcquisitionError, Result};
use crate::reference::ImageReference;
use crate::source::Image;

/// Names the daemon client binary; defaults to `docker`.
pub const DOCKER_ENV: &str = "RUMMAGE_DOCKER";

#[derive(Debug, Clone)]
pub struct DaemonSource {
    program: PathBuf,
}

impl DaemonSource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_env() -> Self {
        let program = env::var_os(DOCKER_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("docker"));
        Self::new(program)
    }

    pub async fn resolve(&self, reference: &str) -> Result<Image> {
        ImageReference::parse(reference)?;

        let inspect = self.run(["image", "inspect", reference]).await?;
        if !inspect.status.success() {
            return Err(AcquisitionError::NotFound(format!(
                "{reference}: {}",
                stderr_of(&inspect)
            ))
            .into());
        }

        let scratch = tempfile::Builder::new()
            .prefix("rummage-save-")
            .suffix(".tar")
            .tempfile()
            .map_err(AcquisitionError::Io)?
            .into_temp_path();

        tracing::debug!(reference, path = %scratch.display(), "exporting image from daemon");
        let save = self
            .run([OsStr::new("save"), OsStr::new("-o"), scratch.as_os_str(), OsStr::new(reference)])
            .await?;
        if !save.status.success() {
            return Err(AcquisitionError::Daemon(format!(
                "failed to save {reference}: {}",
                stderr_of(&save)
            ))
            .into());
        }

        let path = scratch.to_path_buf();
        let image = tokio::task::spawn_blocking(move || open_archive(&path))
            .await
            .map_err(|e| AcquisitionError::Io(io::Error::other(e)))??;
        Ok(image.with_scratch(scratch))
    }

    async fn run<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AcquisitionError::Daemon(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            })?;
        Ok(output)
    }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}
